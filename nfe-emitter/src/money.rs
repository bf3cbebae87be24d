//! Monetary amounts in BRL.
//!
//! All monetary values use [`rust_decimal::Decimal`]. Sale records carry
//! prices as free text in Brazilian notation (`R$ 1.234,56`), so parsing is
//! strict: anything that cannot be read exactly is an error and never
//! becomes zero.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("amount is empty")]
    Empty,
    #[error("amount is negative")]
    Negative,
    #[error("amount has more than two decimal places")]
    TooPrecise,
    #[error("amount is not a number")]
    Malformed,
    #[error("amount has more than {INTEGER_DIGITS} integer digits")]
    TooLarge,
}

/// Integer digits allowed by the layout's `TDec_1302` amounts.
pub const INTEGER_DIGITS: usize = 13;

/// A non-negative amount with at most two decimal places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Amount(Decimal);

impl Amount {
    pub const ZERO: Amount = Amount(Decimal::ZERO);

    /// Parses a price as it appears in sale records.
    ///
    /// Accepted forms: `R$ 120,00`, `1.234,56`, `120.50`, `1.234`, `99`.
    /// With a comma present, the comma is the decimal separator and dots
    /// group thousands. Without one, dots group thousands only when every
    /// group after the first has exactly three digits; otherwise a single dot
    /// is a decimal point.
    pub fn parse_brl(raw: &str) -> Result<Self, AmountError> {
        let cleaned: String = raw
            .trim()
            .trim_start_matches("R$")
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();

        if cleaned.is_empty() {
            return Err(AmountError::Empty);
        }
        if cleaned.starts_with('-') {
            return Err(AmountError::Negative);
        }

        let (integer, fraction) = match cleaned.split_once(',') {
            Some((integer, fraction)) => {
                if fraction.contains(',') || fraction.contains('.') {
                    return Err(AmountError::Malformed);
                }
                (join_thousands(integer)?, Some(fraction))
            }
            None => split_dotted(&cleaned)?,
        };

        if integer.is_empty() || !integer.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AmountError::Malformed);
        }
        if integer.trim_start_matches('0').len() > INTEGER_DIGITS {
            return Err(AmountError::TooLarge);
        }
        let fraction = fraction.unwrap_or("");
        if !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AmountError::Malformed);
        }
        if fraction.len() > 2 {
            return Err(AmountError::TooPrecise);
        }

        let text = if fraction.is_empty() {
            integer
        } else {
            format!("{integer}.{fraction}")
        };
        Decimal::from_str(&text)
            .map(Amount)
            .map_err(|_| AmountError::Malformed)
    }

    /// Reads a JSON number. The decimal text of the number is parsed, so no
    /// binary floating-point rounding is involved.
    pub fn from_json_number(number: &serde_json::Number) -> Result<Self, AmountError> {
        let text = number.to_string();
        if text.starts_with('-') {
            return Err(AmountError::Negative);
        }
        if text.contains(['e', 'E']) {
            return Err(AmountError::Malformed);
        }
        let integer = text.split('.').next().unwrap_or_default();
        if integer.trim_start_matches('0').len() > INTEGER_DIGITS {
            return Err(AmountError::TooLarge);
        }
        let value = Decimal::from_str(&text).map_err(|_| AmountError::Malformed)?;
        if value.normalize().scale() > 2 {
            return Err(AmountError::TooPrecise);
        }
        Ok(Amount(value))
    }

    pub fn checked_add(self, rhs: Amount) -> Result<Amount, AmountError> {
        self.0
            .checked_add(rhs.0)
            .ok_or(AmountError::TooLarge)
            .and_then(Amount::within_layout)
    }

    /// Line total for `quantity` units at this price.
    pub fn checked_mul(self, quantity: u32) -> Result<Amount, AmountError> {
        self.0
            .checked_mul(Decimal::from(quantity))
            .ok_or(AmountError::TooLarge)
            .and_then(Amount::within_layout)
    }

    pub fn checked_sum(amounts: impl IntoIterator<Item = Amount>) -> Result<Amount, AmountError> {
        amounts
            .into_iter()
            .try_fold(Amount::ZERO, Amount::checked_add)
    }

    fn within_layout(value: Decimal) -> Result<Amount, AmountError> {
        if value.abs() >= Decimal::from(10_i64.pow(INTEGER_DIGITS as u32)) {
            return Err(AmountError::TooLarge);
        }
        Ok(Amount(value))
    }

    pub fn decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

/// `1.234.567` -> `1234567`. Groups after the first must have three digits.
fn join_thousands(integer: &str) -> Result<String, AmountError> {
    let mut groups = integer.split('.');
    let mut joined = groups.next().unwrap_or_default().to_string();
    for group in groups {
        if group.len() != 3 {
            return Err(AmountError::Malformed);
        }
        joined.push_str(group);
    }
    Ok(joined)
}

fn split_dotted(text: &str) -> Result<(String, Option<&str>), AmountError> {
    let groups: Vec<&str> = text.split('.').collect();
    match groups.as_slice() {
        [integer] => Ok((integer.to_string(), None)),
        [_, rest @ ..] if rest.iter().all(|group| group.len() == 3) => {
            Ok((join_thousands(text)?, None))
        }
        [integer, fraction] => Ok((integer.to_string(), Some(fraction))),
        _ => Err(AmountError::Malformed),
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Amount::parse_brl(s)
    }
}

/// Always two decimal places, dot separator, as the XML layout requires.
impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut value = self.0.round_dp(2);
        value.rescale(2);
        write!(f, "{value}")
    }
}
