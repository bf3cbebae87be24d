use thiserror::Error;

use crate::{crypto::CryptoError, money::AmountError, response::ResponseError, xml::XmlError};

#[derive(Debug, Error)]
pub enum NfeEmitterError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Response(#[from] ResponseError),
    #[error(transparent)]
    Xml(#[from] XmlError),

    // TLS errors
    #[error("Invalid CA chain: {0}")]
    InvalidCaChain(String),

    // Wrapped errors
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

/// Input problems that must be fixed by the caller before an invoice can be
/// issued. None of these are worth retrying as-is.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Sale {reference} is not approved (status: {status})")]
    SaleNotApproved { reference: String, status: String },
    #[error("Sale {0} was not found")]
    SaleNotFound(String),
    #[error("Sale has no items")]
    NoItems,
    #[error("Recipient tax ID is missing")]
    MissingRecipientTaxId,
    #[error("Invalid CPF: {0}")]
    InvalidCpf(String),
    #[error("Invalid CNPJ: {0}")]
    InvalidCnpj(String),
    #[error("Item {item} ({name}) has an invalid price {raw:?}: {source}")]
    InvalidItemPrice {
        item: usize,
        name: String,
        raw: String,
        source: AmountError,
    },
    #[error("Item {item} ({name}) has an invalid quantity {quantity}")]
    InvalidItemQuantity {
        item: usize,
        name: String,
        quantity: u32,
    },
    #[error("Item {item} ({name}) total is out of range: {source}")]
    ItemTotalOutOfRange {
        item: usize,
        name: String,
        source: AmountError,
    },
    #[error("Document total must be greater than zero")]
    ZeroTotal,
    #[error("Document total is out of range: {0}")]
    TotalOutOfRange(AmountError),
    #[error("Declared totals do not match the sum of items (items: {items}, declared: {declared})")]
    TotalMismatch { items: String, declared: String },
    #[error("Series {0} is out of range (0-999)")]
    SeriesOutOfRange(u32),
    #[error("Invoice number {0} is out of range (1-999999999)")]
    NumberOutOfRange(u64),
    #[error("Invalid access key: {0}")]
    InvalidAccessKey(String),
    #[error("Field {field} is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ValidationError {
    pub(crate) fn field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}
