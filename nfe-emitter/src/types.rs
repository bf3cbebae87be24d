//! Domain types shared by the emitter crates.

pub mod environment;
pub mod issuer;
pub mod outcome;
pub mod sale;
pub mod series;

pub use environment::{Environment, Uf};
pub use issuer::{Address, IssuerProfile, ProductDefaults, TaxRegime, TaxRule};
pub use outcome::{AuthorizedDocument, ProtocolStamp, ReceiptNumber, TransmissionOutcome};
pub use sale::{
    Buyer, InMemorySaleSource, PaymentMethod, PriceInput, SaleItem, SaleRecord, SaleReference,
    SaleSource, SaleSourceError, SaleStatus,
};
pub use series::{CounterError, InMemoryInvoiceCounter, InvoiceCounter, InvoiceSeries};
