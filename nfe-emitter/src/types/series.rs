//! Invoice numbering. Every `(series, number)` pair is used at most once per
//! issuer, so numbers come only from an [`InvoiceCounter`].

use async_trait::async_trait;
use serde::Serialize;
use std::{collections::HashMap, fmt};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::{tax_id::Cnpj, ValidationError};

pub const MAX_SERIES: u16 = 999;
pub const MAX_NUMBER: u32 = 999_999_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InvoiceSeries {
    series: u16,
    number: u32,
}

impl InvoiceSeries {
    pub fn new(series: u32, number: u64) -> Result<Self, ValidationError> {
        let series = u16::try_from(series)
            .ok()
            .filter(|series| *series <= MAX_SERIES)
            .ok_or(ValidationError::SeriesOutOfRange(series))?;
        let number = u32::try_from(number)
            .ok()
            .filter(|number| (1..=MAX_NUMBER).contains(number))
            .ok_or(ValidationError::NumberOutOfRange(number))?;

        Ok(Self { series, number })
    }

    pub fn series(&self) -> u16 {
        self.series
    }

    pub fn number(&self) -> u32 {
        self.number
    }
}

impl fmt::Display for InvoiceSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.series, self.number)
    }
}

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("No numbering is configured for issuer {0}")]
    UnknownIssuer(String),
    #[error("Series {0} has no numbers left")]
    Exhausted(u16),
    #[error("An error occurred within the counter. See counter logs.")]
    Internal,
}

/// Source of invoice numbers. Implementations must be atomic: two concurrent
/// calls for the same issuer never return the same pair, including across
/// processes for persistent implementations.
#[async_trait]
pub trait InvoiceCounter: Send + Sync {
    /// Reserve the next number in the issuer's current series.
    async fn next(&self, issuer: &Cnpj) -> Result<InvoiceSeries, CounterError>;
}

/// Process-local counter. Suitable for tests and single-instance tools only,
/// since its state is lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryInvoiceCounter {
    numbering: Mutex<HashMap<Cnpj, (u16, u32)>>,
}

impl InMemoryInvoiceCounter {
    /// Start numbering for `issuer` in `series`, so that the next number
    /// handed out is `last_number + 1`.
    pub fn starting_after(issuer: Cnpj, series: u16, last_number: u32) -> Self {
        Self {
            numbering: Mutex::new(HashMap::from([(issuer, (series, last_number))])),
        }
    }
}

#[async_trait]
impl InvoiceCounter for InMemoryInvoiceCounter {
    async fn next(&self, issuer: &Cnpj) -> Result<InvoiceSeries, CounterError> {
        let mut numbering = self.numbering.lock().await;
        let (series, last) = numbering
            .get_mut(issuer)
            .ok_or_else(|| CounterError::UnknownIssuer(issuer.to_string()))?;

        if *last >= MAX_NUMBER {
            return Err(CounterError::Exhausted(*series));
        }
        *last += 1;

        InvoiceSeries::new(u32::from(*series), u64::from(*last)).map_err(|_| CounterError::Internal)
    }
}
