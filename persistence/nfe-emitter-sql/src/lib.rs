//! PostgreSQL implementation of [`InvoiceCounter`](nfe_emitter::types::InvoiceCounter).
//!
//! Numbers are reserved with a single `UPDATE ... RETURNING` on the issuer's
//! row, so concurrent emitters, in one process or many, never receive the
//! same `(series, number)`. Every reservation is also written to
//! `invoice_reservations`, which is the list of numbers to account for when
//! voiding unused ones. See `schema.sql` at the root of this crate.
//!
//! Queries are checked at runtime with `sqlx::query_as`, so building the
//! crate does not need a live database.
#![warn(unused_results)]
#![warn(future_incompatible)]
#![warn(unused)]
#![forbid(rustdoc::broken_intra_doc_links)]

mod api;
mod config;
mod error;

pub use api::PostgresInvoiceCounter;
pub use config::{Config, ConfigFile, IssuerNumbering};
pub use error::{ConfigError, PostgresError};
