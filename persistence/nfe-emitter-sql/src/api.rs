use crate::{Config, PostgresError};
use async_trait::async_trait;
use nfe_emitter::{
    tax_id::Cnpj,
    types::{series::MAX_NUMBER, CounterError, InvoiceCounter, InvoiceSeries},
};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{
    fmt::{Debug, Formatter},
    sync::Arc,
};
use time::OffsetDateTime;
use tracing::{debug, error, info, instrument, warn};

#[derive(Clone)]
pub struct PostgresInvoiceCounter {
    config: Arc<Config>,
    /// PgPool is already implemented in terms of an Arc. No need to wrap it.
    connection_pool: PgPool,
}

#[async_trait]
impl InvoiceCounter for PostgresInvoiceCounter {
    async fn next(&self, issuer: &Cnpj) -> Result<InvoiceSeries, CounterError> {
        Ok(self.next_impl(issuer).await?)
    }
}

impl Debug for PostgresInvoiceCounter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresInvoiceCounter")
            .field("uri", &self.config.redacted_uri())
            .finish()
    }
}

impl PostgresInvoiceCounter {
    /// Connect, retrying as configured, then create the numbering of every
    /// configured issuer that does not have one yet.
    #[instrument(err(Debug))]
    pub async fn connect(config: Config) -> Result<Self, PostgresError> {
        info!("Connecting to database");

        let mut attempts = 0;
        let connection_pool = loop {
            let result = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .acquire_timeout(config.connection_timeout)
                .connect(&config.uri())
                .await;

            match result {
                Ok(pool) => break pool,
                Err(e) if attempts < config.connection_retries => {
                    attempts += 1;
                    warn!(
                        attempts,
                        "Database connection failed: {e}. Retrying in {:?}",
                        config.connection_retry_delay
                    );
                    tokio::time::sleep(config.connection_retry_delay).await;
                }
                Err(e) => {
                    error!("Database connection failed: {e}");
                    return Err(PostgresError::ExceededMaxConnectionAttempts(attempts + 1));
                }
            }
        };

        let counter = PostgresInvoiceCounter {
            config: Arc::new(config),
            connection_pool,
        };
        for issuer in &counter.config.issuers {
            if counter
                .register_issuer(&issuer.cnpj, issuer.series, issuer.last_number)
                .await?
            {
                info!(issuer = %issuer.cnpj, series = issuer.series, "Created issuer numbering");
            }
        }
        Ok(counter)
    }

    /// Start numbering for `issuer` in `series`. The first number handed out
    /// is `last_number + 1`. Returns `false` when the issuer already had a
    /// numbering row, which is left untouched.
    #[instrument(skip(self), err(Debug), fields(issuer = %issuer))]
    pub async fn register_issuer(
        &self,
        issuer: &Cnpj,
        series: u16,
        last_number: u32,
    ) -> Result<bool, PostgresError> {
        let rows_affected = sqlx::query(
            "INSERT INTO invoice_numbering (issuer_cnpj, series, last_number) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (issuer_cnpj) DO NOTHING",
        )
        .bind(issuer.as_str())
        .bind(i16::try_from(series).map_err(|_| PostgresError::InvalidRow(format!("series {series}")))?)
        .bind(i32::try_from(last_number).map_err(|_| {
            PostgresError::InvalidRow(format!("last number {last_number}"))
        })?)
        .execute(&self.connection_pool)
        .await?
        .rows_affected();

        Ok(rows_affected == 1)
    }

    #[instrument(skip(self), err(Debug), fields(issuer = %issuer))]
    pub(crate) async fn next_impl(&self, issuer: &Cnpj) -> Result<InvoiceSeries, PostgresError> {
        debug!("Reserving invoice number");
        let mut transaction = self.connection_pool.begin().await?;

        // The row lock taken by UPDATE serializes concurrent reservations.
        let reserved: Option<(i16, i32)> = sqlx::query_as(
            "UPDATE invoice_numbering SET last_number = last_number + 1 \
             WHERE issuer_cnpj = $1 AND last_number < $2 \
             RETURNING series, last_number",
        )
        .bind(issuer.as_str())
        .bind(MAX_NUMBER as i32)
        .fetch_optional(&mut transaction)
        .await?;

        let (series, number) = match reserved {
            Some(row) => row,
            None => {
                let existing: Option<(i16,)> =
                    sqlx::query_as("SELECT series FROM invoice_numbering WHERE issuer_cnpj = $1")
                        .bind(issuer.as_str())
                        .fetch_optional(&mut transaction)
                        .await?;
                transaction.rollback().await?;
                return Err(match existing {
                    Some((series,)) => exhausted(series),
                    None => PostgresError::UnknownIssuer(issuer.to_string()),
                });
            }
        };

        let _ = sqlx::query(
            "INSERT INTO invoice_reservations (issuer_cnpj, series, number, reserved_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(issuer.as_str())
        .bind(series)
        .bind(number)
        .bind(OffsetDateTime::now_utc())
        .execute(&mut transaction)
        .await?;
        transaction.commit().await?;

        let series = reserved_series(series, number)?;
        info!(%series, "Reserved invoice number");
        Ok(series)
    }
}

/// The `(series, last_number)` pair returned by a reservation.
fn reserved_series(series: i16, number: i32) -> Result<InvoiceSeries, PostgresError> {
    let invalid = || PostgresError::InvalidRow(format!("series {series}, number {number}"));
    InvoiceSeries::new(
        u32::try_from(series).map_err(|_| invalid())?,
        u64::try_from(number).map_err(|_| invalid())?,
    )
    .map_err(|_| invalid())
}

fn exhausted(series: i16) -> PostgresError {
    match u16::try_from(series) {
        Ok(series) => PostgresError::Exhausted(series),
        Err(_) => PostgresError::InvalidRow(format!("series {series}")),
    }
}
