//! Public API of the emitter client.
//!
//! Every call returns an [`EmitterResponse`] whose metadata carries the
//! request ID attached to the call's log spans. Authority decisions,
//! including refusals, come back as data; errors are reserved for problems
//! the caller must fix or may retry (see [`ErrorKind`](crate::ErrorKind)).

mod emit;
mod reconcile;
mod status;

use nfe_emitter::{
    access_key::AccessKey,
    infrastructure::logging::record_field,
    response::{DocumentStatus, ServiceStatus},
    types::{Environment, InvoiceCounter, InvoiceSeries, ReceiptNumber, SaleReference, TransmissionOutcome},
};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::{transmission::EmissionControl, EmitterResponse, NfeEmitterClient, Result};

/// Emit the invoice for a sale with a number the caller already reserved.
#[derive(Debug, Clone)]
pub struct EmissionRequest {
    pub sale: SaleReference,
    pub series: InvoiceSeries,
    /// Defaults to the configured environment.
    pub environment: Option<Environment>,
    /// Stop waiting for the authority at this instant.
    pub deadline: Option<Instant>,
}

/// Emit the invoice for a sale with the next number from a counter.
#[derive(Debug, Clone)]
pub struct NextEmissionRequest {
    pub sale: SaleReference,
    pub environment: Option<Environment>,
    pub deadline: Option<Instant>,
}

/// Result of an emission. The signed document is returned whatever the
/// outcome, since reconciling an unsettled one starts from it.
#[derive(Debug, Clone, Serialize)]
pub struct Emission {
    pub access_key: AccessKey,
    pub series: InvoiceSeries,
    pub environment: Environment,
    pub signed_xml: String,
    pub outcome: TransmissionOutcome,
}

impl NfeEmitterClient {
    /// Build, sign and transmit the invoice for `request.sale`, then wait
    /// for the authority's decision.
    ///
    /// Cancelling `cancel` stops any wait in progress; the outcome then
    /// reports the receipt if one was obtained.
    ///
    /// Output: the [`Emission`], whose outcome tells whether the document was
    /// authorized. Errors mean nothing was transmitted.
    #[instrument(skip_all, err(Debug), fields(request_id, access_key, sale = %request.sale))]
    pub async fn emit_invoice(
        &self,
        request: EmissionRequest,
        cancel: CancellationToken,
    ) -> Result<EmitterResponse<Emission>> {
        let request_id = Uuid::new_v4();
        record_field("request_id", &request_id);

        let control = control(cancel, request.deadline);
        let sale = self.fetch_sale(&request.sale).await?;
        let session = self.open_session(self.environment_or_default(request.environment))?;
        let emission = self
            .handle_emission(&session, &sale, request.series, &control)
            .await?;
        Ok(EmitterResponse::new(emission, request_id))
    }

    /// Same as [`emit_invoice`](Self::emit_invoice), with the series and
    /// number reserved from `counter`. The sale is validated and the signing
    /// identity loaded first, so neither a sale that cannot be invoiced nor
    /// an unusable certificate uses up a number.
    #[instrument(skip_all, err(Debug), fields(request_id, access_key, sale = %request.sale))]
    pub async fn emit_next_invoice(
        &self,
        request: NextEmissionRequest,
        counter: &dyn InvoiceCounter,
        cancel: CancellationToken,
    ) -> Result<EmitterResponse<Emission>> {
        let request_id = Uuid::new_v4();
        record_field("request_id", &request_id);

        let control = control(cancel, request.deadline);
        let sale = self.fetch_sale(&request.sale).await?;
        let validated = self.document_builder().validate_sale(&sale)?;
        let session = self.open_session(self.environment_or_default(request.environment))?;
        let series = self.reserve_number(&validated, counter).await?;
        let emission = self
            .handle_emission(&session, &sale, series, &control)
            .await?;
        Ok(EmitterResponse::new(emission, request_id))
    }

    /// Resume polling a receipt returned by an earlier emission, e.g. after
    /// a [`Timeout`](TransmissionOutcome::Timeout) or a restart.
    ///
    /// `signed_xml` is the document as returned in [`Emission::signed_xml`].
    #[instrument(skip_all, err(Debug), fields(request_id, access_key, receipt = %receipt))]
    pub async fn poll_receipt(
        &self,
        signed_xml: &str,
        receipt: ReceiptNumber,
        cancel: CancellationToken,
    ) -> Result<EmitterResponse<TransmissionOutcome>> {
        let request_id = Uuid::new_v4();
        record_field("request_id", &request_id);

        let outcome = self
            .handle_poll_receipt(signed_xml, receipt, &EmissionControl::new(cancel))
            .await?;
        Ok(EmitterResponse::new(outcome, request_id))
    }

    /// Ask the authority what it knows about `access_key`.
    #[instrument(skip_all, err(Debug), fields(request_id, access_key = %access_key))]
    pub async fn query_protocol(
        &self,
        access_key: &AccessKey,
        environment: Option<Environment>,
    ) -> Result<EmitterResponse<DocumentStatus>> {
        let request_id = Uuid::new_v4();
        record_field("request_id", &request_id);

        let status = self
            .handle_protocol_query(access_key, self.environment_or_default(environment))
            .await?;
        Ok(EmitterResponse::new(status, request_id))
    }

    /// Settle an emission whose outcome required reconciliation, by querying
    /// the protocol of the signed document.
    ///
    /// Output: `Authorized` with the assembled `nfeProc` when the authority
    /// authorized it, `Rejected` with code `217` when it never received it,
    /// `Denied` when it denied it, `UnknownStatus` otherwise.
    #[instrument(skip_all, err(Debug), fields(request_id, access_key))]
    pub async fn reconcile(&self, signed_xml: &str) -> Result<EmitterResponse<TransmissionOutcome>> {
        let request_id = Uuid::new_v4();
        record_field("request_id", &request_id);

        let outcome = self.handle_reconcile(signed_xml).await?;
        Ok(EmitterResponse::new(outcome, request_id))
    }

    /// Check whether the authorization service is in operation.
    #[instrument(skip_all, err(Debug), fields(request_id))]
    pub async fn service_status(
        &self,
        environment: Option<Environment>,
    ) -> Result<EmitterResponse<ServiceStatus>> {
        let request_id = Uuid::new_v4();
        record_field("request_id", &request_id);

        let status = self
            .handle_service_status(self.environment_or_default(environment))
            .await?;
        Ok(EmitterResponse::new(status, request_id))
    }
}

fn control(cancel: CancellationToken, deadline: Option<Instant>) -> EmissionControl {
    let control = EmissionControl::new(cancel);
    match deadline {
        Some(deadline) => control.with_deadline(deadline),
        None => control,
    }
}
