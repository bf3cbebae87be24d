use nfe_emitter::{
    access_key::AccessKey,
    constants::STATUS_DOCUMENT_NOT_FOUND,
    infrastructure::logging::record_field,
    requests,
    response::{self, DocumentStatus, ProtocolReply},
    signature::SignedInvoice,
    soap::Service,
    types::{Environment, TransmissionOutcome},
};
use tracing::info;

use crate::{NfeEmitterClient, Result};

impl NfeEmitterClient {
    pub(crate) async fn handle_protocol_query(
        &self,
        access_key: &AccessKey,
        environment: Environment,
    ) -> Result<DocumentStatus> {
        let session = self.open_session(environment)?;
        let body = session
            .call(
                Service::ProtocolQuery,
                &requests::protocol_query(environment, access_key),
            )
            .await?;
        let status = response::interpret_protocol_query(&body, access_key)?;
        info!(?status, "Protocol query answered");
        Ok(status)
    }

    pub(crate) async fn handle_reconcile(&self, signed_xml: &str) -> Result<TransmissionOutcome> {
        let signed = SignedInvoice::from_xml(signed_xml)?;
        record_field("access_key", signed.access_key());

        let status = self
            .handle_protocol_query(signed.access_key(), signed.environment())
            .await?;
        Ok(settle(status, &signed))
    }
}

fn settle(status: DocumentStatus, signed: &SignedInvoice) -> TransmissionOutcome {
    match status {
        DocumentStatus::Authorized {
            stamp,
            protocol_xml,
        } => ProtocolReply::Authorized {
            stamp,
            protocol_xml,
        }
        .into_outcome(signed),
        DocumentStatus::Denied { stamp } => TransmissionOutcome::Denied {
            code: stamp.status_code.clone(),
            reason: stamp.reason.clone(),
            stamp,
        },
        DocumentStatus::NotFound { reason } => TransmissionOutcome::Rejected {
            code: STATUS_DOCUMENT_NOT_FOUND.to_string(),
            reason,
        },
        DocumentStatus::Rejected { code, reason } => TransmissionOutcome::Rejected { code, reason },
        // Authorized once and cancelled since: there is nothing to archive.
        DocumentStatus::Cancelled { code, reason } => TransmissionOutcome::UnknownStatus {
            code: Some(code),
            reason: Some(reason),
            raw: String::new(),
        },
        DocumentStatus::Unknown { code, reason, raw } => {
            TransmissionOutcome::UnknownStatus { code, reason, raw }
        }
    }
}
