//! Client for the state tax authorities' NF-e web services.
//!
//! [`NfeEmitterClient`] runs whole emissions: it reads the sale, builds and
//! signs the document, submits it over mutual TLS and follows the batch
//! until the authority settles it or the caller's limits run out.
#![warn(unused_results)]
#![warn(future_incompatible)]
#![warn(unused)]
#![forbid(rustdoc::broken_intra_doc_links)]

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod response;
pub mod transmission;
pub mod transport;

pub use api::{Emission, EmissionRequest, NextEmissionRequest};
pub use client::NfeEmitterClient;
pub use config::Config;
pub use error::{ErrorKind, NfeEmitterClientError};
pub use response::EmitterResponse;
pub use transmission::{EmissionControl, PollingPolicy};

pub type Result<T> = std::result::Result<T, NfeEmitterClientError>;
