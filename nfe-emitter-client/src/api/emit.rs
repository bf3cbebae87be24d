use nfe_emitter::{
    document::{BuildRequest, DocumentBuilder, ValidatedSale},
    infrastructure::logging::record_field,
    requests::BatchId,
    signature::{SignatureEngine, SignedInvoice},
    types::{InvoiceCounter, InvoiceSeries, ReceiptNumber, SaleRecord, TransmissionOutcome},
};
use rand::rngs::OsRng;
use time::OffsetDateTime;
use tracing::info;

use crate::{
    api::Emission,
    client::Session,
    transmission::{EmissionControl, Transmission},
    NfeEmitterClient, Result,
};

impl NfeEmitterClient {
    pub(crate) fn document_builder(&self) -> DocumentBuilder<'_> {
        let config = self.config();
        DocumentBuilder::new(&config.issuer, &config.products, &config.tax)
    }

    /// Draw the next number for a sale that already passed validation.
    pub(crate) async fn reserve_number(
        &self,
        sale: &ValidatedSale<'_>,
        counter: &dyn InvoiceCounter,
    ) -> Result<InvoiceSeries> {
        let series = counter.next(&self.config().issuer.cnpj).await?;
        info!(%series, total = %sale.total(), "Reserved invoice number");
        Ok(series)
    }

    pub(crate) async fn handle_emission(
        &self,
        session: &Session<'_>,
        sale: &SaleRecord,
        series: InvoiceSeries,
        control: &EmissionControl,
    ) -> Result<Emission> {
        let environment = session.environment;
        let unsigned = self.document_builder().build(
            &BuildRequest {
                sale,
                series,
                environment,
                issued_at: OffsetDateTime::now_utc(),
            },
            &mut OsRng,
        )?;
        record_field("access_key", unsigned.access_key());

        let signed = SignatureEngine::new(self.config().signature_algorithm)
            .sign(&unsigned, &session.identity)?;

        let outcome = self
            .transmission(session)?
            .transmit(&signed, BatchId::random(&mut OsRng), control)
            .await;
        info!(%outcome, "Emission finished");

        Ok(Emission {
            access_key: signed.access_key().clone(),
            series: signed.series(),
            environment: signed.environment(),
            signed_xml: signed.xml().to_string(),
            outcome,
        })
    }

    pub(crate) async fn handle_poll_receipt(
        &self,
        signed_xml: &str,
        receipt: ReceiptNumber,
        control: &EmissionControl,
    ) -> Result<TransmissionOutcome> {
        let signed = SignedInvoice::from_xml(signed_xml)?;
        record_field("access_key", signed.access_key());

        let session = self.open_session(signed.environment())?;
        let outcome = self
            .transmission(&session)?
            .poll(&signed, receipt, None, control)
            .await;
        info!(%outcome, "Polling finished");
        Ok(outcome)
    }

    fn transmission<'a>(&'a self, session: &'a Session<'a>) -> Result<Transmission<'a>> {
        let config = self.config();
        Transmission::new(
            session.transport.as_ref(),
            session.endpoints,
            session.environment,
            &config.polling,
            config.synchronous,
        )
    }
}
