//! Domain types, XML assembly, signing and response interpretation for the
//! Brazilian electronic invoice (NF-e, model 55, layout 4.00).
//!
//! This crate has no network code. It turns a sale into a signed invoice
//! document and turns tax-authority replies back into typed outcomes. The
//! transport and the emission state machine live in `nfe-emitter-client`.
#![warn(unused_results)]
#![warn(future_incompatible)]
#![warn(unused)]
#![forbid(rustdoc::broken_intra_doc_links)]

pub mod access_key;
pub mod constants;
pub mod crypto;
pub mod document;
pub mod error;
pub mod infrastructure;
pub mod money;
pub mod requests;
pub mod response;
pub mod signature;
pub mod soap;
pub mod tax_id;
pub mod types;
pub mod xml;

pub use error::{NfeEmitterError, ValidationError};
