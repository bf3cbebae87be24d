use nfe_emitter::types::CounterError;
use std::path::PathBuf;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum PostgresError {
    #[error("Gave up connecting to the database after {0} attempts")]
    ExceededMaxConnectionAttempts(u32),
    #[error("No numbering row for issuer {0}")]
    UnknownIssuer(String),
    #[error("Series {0} has no numbers left")]
    Exhausted(u16),
    #[error("Numbering row holds out-of-range values: {0}")]
    InvalidRow(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read database config {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error("{variable} is not set")]
    MissingCredential {
        variable: &'static str,
        source: std::env::VarError,
    },
    #[error("Invalid issuer numbering: {0}")]
    InvalidIssuer(String),
}

/// Only the outcomes a caller can act on keep their identity; database
/// failures are logged here and reported as internal.
impl From<PostgresError> for CounterError {
    fn from(error: PostgresError) -> Self {
        match error {
            PostgresError::UnknownIssuer(issuer) => Self::UnknownIssuer(issuer),
            PostgresError::Exhausted(series) => Self::Exhausted(series),
            other => {
                error!("Invoice counter failure: {other}");
                Self::Internal
            }
        }
    }
}
