use nfe_emitter::{
    crypto::CryptoError,
    response::ResponseError,
    soap::Service,
    types::{CounterError, Environment, SaleSourceError},
    NfeEmitterError, ValidationError,
};
use thiserror::Error;

use crate::transport::TransportError;

/// What the caller can do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Certificate, endpoints or other settings are wrong. Retrying will not
    /// help until configuration changes.
    Configuration,
    /// The sale cannot be invoiced as it is.
    Validation,
    /// A collaborator could not be reached. The caller decides whether and
    /// when to retry.
    Transport,
}

#[derive(Debug, Error)]
pub enum NfeEmitterClientError {
    #[error("No {service} endpoint is configured for {environment}")]
    MissingEndpoint {
        environment: Environment,
        service: Service,
    },
    #[error("No PKCS#12 bundle was configured or provided")]
    CertificateMissing,
    #[error("Certificate password variable {0} is not set")]
    CertificatePasswordMissing(String),
    #[error("Invalid polling settings: {0}")]
    InvalidPolling(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Wrapped errors
    #[error(transparent)]
    NfeEmitter(NfeEmitterError),
    #[error(transparent)]
    Counter(#[from] CounterError),
    #[error(transparent)]
    SaleSource(#[from] SaleSourceError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    InvalidUri(#[from] http::uri::InvalidUri),
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl NfeEmitterClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NfeEmitter(NfeEmitterError::Validation(_)) => ErrorKind::Validation,
            Self::NfeEmitter(NfeEmitterError::Response(_)) => ErrorKind::Transport,
            Self::SaleSource(SaleSourceError::Malformed { .. }) => ErrorKind::Validation,
            Self::SaleSource(SaleSourceError::Unavailable(_)) => ErrorKind::Transport,
            Self::Counter(CounterError::Internal) => ErrorKind::Transport,
            Self::Transport(_) => ErrorKind::Transport,
            Self::MissingEndpoint { .. }
            | Self::CertificateMissing
            | Self::CertificatePasswordMissing(_)
            | Self::InvalidPolling(_)
            | Self::InvalidConfig(_)
            | Self::NfeEmitter(_)
            | Self::Counter(_)
            | Self::Io(_)
            | Self::InvalidUri(_)
            | Self::Rustls(_)
            | Self::Toml(_) => ErrorKind::Configuration,
        }
    }
}

// Flatten the core crate's sub-errors so that `?` works on all of them.
impl From<NfeEmitterError> for NfeEmitterClientError {
    fn from(error: NfeEmitterError) -> Self {
        match error {
            NfeEmitterError::Io(error) => Self::Io(error),
            NfeEmitterError::Rustls(error) => Self::Rustls(error),
            _ => Self::NfeEmitter(error),
        }
    }
}

impl From<CryptoError> for NfeEmitterClientError {
    fn from(error: CryptoError) -> Self {
        Self::NfeEmitter(error.into())
    }
}

impl From<ValidationError> for NfeEmitterClientError {
    fn from(error: ValidationError) -> Self {
        Self::NfeEmitter(error.into())
    }
}

impl From<ResponseError> for NfeEmitterClientError {
    fn from(error: ResponseError) -> Self {
        Self::NfeEmitter(error.into())
    }
}
