mod common;

use common::{
    scripted_client, test_config, ScriptedConnector, ScriptedTransport, Step, PKCS12_PASSWORD,
};
use nfe_emitter::{
    response::DocumentStatus,
    signature::verify_signed_xml,
    soap::Service,
    types::{
        InMemoryInvoiceCounter, InMemorySaleSource, InvoiceSeries, ReceiptNumber,
        TransmissionOutcome,
    },
};
use nfe_emitter_client::{
    identity::{Password, Pkcs12BytesSource},
    EmissionRequest, ErrorKind, NextEmissionRequest, NfeEmitterClient,
};
use std::{str::FromStr, sync::Arc, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const RECEIPT: &str = "291000012345678";

fn request(number: u64) -> EmissionRequest {
    EmissionRequest {
        sale: "pedido-0042".into(),
        series: InvoiceSeries::new(1, number).unwrap(),
        environment: None,
        deadline: None,
    }
}

#[tokio::test(start_paused = true)]
async fn synchronous_authorization() {
    let (client, transport) = scripted_client(test_config(), [Step::Reply("authorization_authorized.xml")]);

    let emission = client
        .emit_invoice(request(42), CancellationToken::new())
        .await
        .unwrap()
        .data;

    assert_eq!(emission.series.number(), 42);
    assert!(verify_signed_xml(&emission.signed_xml, None).is_ok());
    match &emission.outcome {
        TransmissionOutcome::Authorized(document) => {
            assert_eq!(document.protocol_number(), Some("129240000012345"));
            assert_eq!(&document.stamp.access_key, &emission.access_key);
            assert!(document.nfe_proc.contains(&emission.signed_xml));
            assert!(document.parse_nfe_proc().is_ok());
        }
        other => panic!("expected authorization, got {other:?}"),
    }
    assert_eq!(transport.calls(), vec![Service::Authorization]);
}

#[tokio::test(start_paused = true)]
async fn rejection_keeps_authority_reason() {
    let (client, _) = scripted_client(test_config(), [Step::Reply("authorization_rejected_document.xml")]);

    let outcome = client
        .emit_invoice(request(42), CancellationToken::new())
        .await
        .unwrap()
        .data
        .outcome;

    assert_eq!(
        outcome,
        TransmissionOutcome::Rejected {
            code: "539".to_string(),
            reason: "Rejeicao: Duplicidade de NF-e, com diferenca na Chave de Acesso".to_string(),
        }
    );
    assert!(!outcome.requires_reconciliation());
}

#[tokio::test(start_paused = true)]
async fn batch_rejection() {
    let (client, _) = scripted_client(test_config(), [Step::Reply("authorization_rejected_batch.xml")]);

    let outcome = client
        .emit_invoice(request(42), CancellationToken::new())
        .await
        .unwrap()
        .data
        .outcome;

    assert_eq!(outcome.status_code(), Some("225"));
    assert!(matches!(outcome, TransmissionOutcome::Rejected { .. }));
}

#[tokio::test(start_paused = true)]
async fn polling_stops_at_terminal_reply() {
    let (client, transport) = scripted_client(
        test_config(),
        [
            Step::Reply("authorization_received.xml"),
            Step::Reply("receipt_processing.xml"),
            Step::Reply("receipt_processing.xml"),
            Step::Reply("receipt_processing.xml"),
            Step::Reply("receipt_authorized.xml"),
        ],
    );

    let started = Instant::now();
    let outcome = client
        .emit_invoice(request(42), CancellationToken::new())
        .await
        .unwrap()
        .data
        .outcome;

    assert!(outcome.is_authorized());
    assert_eq!(transport.remaining_steps(), 0);
    assert_eq!(
        transport.calls(),
        vec![
            Service::Authorization,
            Service::ReceiptQuery,
            Service::ReceiptQuery,
            Service::ReceiptQuery,
            Service::ReceiptQuery,
        ]
    );
    // 1s + 2s + 4s + 4s of backoff
    assert!(started.elapsed() >= Duration::from_secs(11));
}

#[tokio::test(start_paused = true)]
async fn denial_after_polling() {
    let (client, _) = scripted_client(
        test_config(),
        [
            Step::Reply("authorization_received.xml"),
            Step::Reply("receipt_denied.xml"),
        ],
    );

    let outcome = client
        .emit_invoice(request(42), CancellationToken::new())
        .await
        .unwrap()
        .data
        .outcome;

    match outcome {
        TransmissionOutcome::Denied { code, stamp, .. } => {
            assert_eq!(code, "302");
            assert_eq!(stamp.protocol_number.as_deref(), Some("129240000012346"));
        }
        other => panic!("expected denial, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn endless_processing_times_out() {
    let (client, transport) = scripted_client(
        test_config(),
        [
            Step::Reply("authorization_received.xml"),
            Step::Reply("receipt_processing.xml"),
            Step::Reply("receipt_processing.xml"),
            Step::Reply("receipt_processing.xml"),
            Step::Reply("receipt_processing.xml"),
        ],
    );

    let outcome = client
        .emit_invoice(request(42), CancellationToken::new())
        .await
        .unwrap()
        .data
        .outcome;

    assert_eq!(
        outcome,
        TransmissionOutcome::Timeout {
            receipt: ReceiptNumber::new(RECEIPT),
            attempts: 4,
        }
    );
    assert!(outcome.requires_reconciliation());
    assert_eq!(transport.remaining_steps(), 0);
}

#[tokio::test(start_paused = true)]
async fn interrupted_polling_resumes_from_receipt() {
    let (client, _) = scripted_client(
        test_config(),
        [
            Step::Reply("authorization_received.xml"),
            Step::Reply("receipt_processing.xml"),
            Step::Reply("receipt_processing.xml"),
            Step::Reply("receipt_processing.xml"),
            Step::Reply("receipt_processing.xml"),
            Step::Reply("receipt_authorized.xml"),
        ],
    );

    let emission = client
        .emit_invoice(request(42), CancellationToken::new())
        .await
        .unwrap()
        .data;
    let receipt = emission.outcome.receipt().cloned().unwrap();

    let outcome = client
        .poll_receipt(&emission.signed_xml, receipt, CancellationToken::new())
        .await
        .unwrap()
        .data;
    assert!(outcome.is_authorized());
}

#[tokio::test(start_paused = true)]
async fn zero_attempts_returns_pending() {
    let mut config = test_config();
    config.polling.max_attempts = 0;
    let (client, transport) = scripted_client(config, [Step::Reply("authorization_received.xml")]);

    let outcome = client
        .emit_invoice(request(42), CancellationToken::new())
        .await
        .unwrap()
        .data
        .outcome;

    assert_eq!(
        outcome,
        TransmissionOutcome::Pending {
            receipt: ReceiptNumber::new(RECEIPT)
        }
    );
    assert_eq!(transport.calls(), vec![Service::Authorization]);
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_submission() {
    let (client, _) = scripted_client(test_config(), [Step::Hang]);
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    let _handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        canceller.cancel();
    });

    let outcome = client
        .emit_invoice(request(42), cancel)
        .await
        .unwrap()
        .data
        .outcome;
    assert_eq!(outcome, TransmissionOutcome::Cancelled { receipt: None });
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_backoff_keeps_receipt() {
    let (client, transport) = scripted_client(
        test_config(),
        [
            Step::Reply("authorization_received.xml"),
            Step::Reply("receipt_processing.xml"),
        ],
    );
    let cancel = CancellationToken::new();

    // The first poll happens after 1s, the second would after 3s.
    let canceller = cancel.clone();
    let _handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        canceller.cancel();
    });

    let outcome = client
        .emit_invoice(request(42), cancel)
        .await
        .unwrap()
        .data
        .outcome;
    assert_eq!(
        outcome,
        TransmissionOutcome::Cancelled {
            receipt: Some(ReceiptNumber::new(RECEIPT))
        }
    );
    assert_eq!(transport.calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn deadline_ends_polling() {
    let (client, _) = scripted_client(
        test_config(),
        [
            Step::Reply("authorization_received.xml"),
            Step::Reply("receipt_processing.xml"),
        ],
    );

    let mut request = request(42);
    request.deadline = Some(Instant::now() + Duration::from_millis(2500));
    let outcome = client
        .emit_invoice(request, CancellationToken::new())
        .await
        .unwrap()
        .data
        .outcome;

    assert_eq!(
        outcome,
        TransmissionOutcome::Timeout {
            receipt: ReceiptNumber::new(RECEIPT),
            attempts: 1,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn transport_failures_are_not_retried() {
    let (client, transport) = scripted_client(test_config(), [Step::Fail]);
    let outcome = client
        .emit_invoice(request(42), CancellationToken::new())
        .await
        .unwrap()
        .data
        .outcome;
    assert!(matches!(
        outcome,
        TransmissionOutcome::TransportError { receipt: None, .. }
    ));
    assert!(outcome.requires_reconciliation());
    assert_eq!(transport.calls().len(), 1);

    let (client, _) = scripted_client(
        test_config(),
        [Step::Reply("authorization_received.xml"), Step::Fail],
    );
    let outcome = client
        .emit_invoice(request(42), CancellationToken::new())
        .await
        .unwrap()
        .data
        .outcome;
    assert_eq!(outcome.receipt(), Some(&ReceiptNumber::new(RECEIPT)));
    assert!(matches!(outcome, TransmissionOutcome::TransportError { .. }));
}

#[tokio::test(start_paused = true)]
async fn unsettled_emission_is_reconciled() {
    let (client, _) = scripted_client(
        test_config(),
        [Step::Fail, Step::Reply("protocol_authorized.xml")],
    );

    let emission = client
        .emit_invoice(request(42), CancellationToken::new())
        .await
        .unwrap()
        .data;
    assert!(emission.outcome.requires_reconciliation());

    let outcome = client.reconcile(&emission.signed_xml).await.unwrap().data;
    assert!(outcome.is_authorized());
}

#[tokio::test(start_paused = true)]
async fn protocol_query_reports_unknown_document() {
    let (client, transport) = scripted_client(
        test_config(),
        [Step::Fail, Step::Reply("protocol_not_found.xml")],
    );
    let emission = client
        .emit_invoice(request(42), CancellationToken::new())
        .await
        .unwrap()
        .data;

    let status = client
        .query_protocol(&emission.access_key, None)
        .await
        .unwrap()
        .data;
    assert!(matches!(status, DocumentStatus::NotFound { .. }));
    assert_eq!(
        transport.calls(),
        vec![Service::Authorization, Service::ProtocolQuery]
    );
}

#[tokio::test(start_paused = true)]
async fn service_status_is_reported() {
    let (client, transport) = scripted_client(test_config(), [Step::Reply("status_in_operation.xml")]);

    let status = client.service_status(None).await.unwrap().data;
    assert!(status.in_operation);
    assert_eq!(status.code, "107");
    assert_eq!(status.average_wait, Some(Duration::from_secs(1)));
    assert_eq!(transport.calls(), vec![Service::StatusService]);
}

#[tokio::test(start_paused = true)]
async fn invalid_sale_does_not_use_a_number() {
    let (client, transport) = scripted_client(test_config(), [Step::Reply("authorization_authorized.xml")]);
    let counter =
        InMemoryInvoiceCounter::starting_after(client.config().issuer.cnpj.clone(), 1, 41);

    let error = client
        .emit_next_invoice(
            NextEmissionRequest {
                sale: "pedido-0043".into(),
                environment: None,
                deadline: None,
            },
            &counter,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Validation);
    assert!(transport.calls().is_empty());

    let emission = client
        .emit_next_invoice(
            NextEmissionRequest {
                sale: "pedido-0042".into(),
                environment: None,
                deadline: None,
            },
            &counter,
            CancellationToken::new(),
        )
        .await
        .unwrap()
        .data;
    assert_eq!(emission.series, InvoiceSeries::new(1, 42).unwrap());
    assert!(emission.outcome.is_authorized());
}

#[tokio::test(start_paused = true)]
async fn unknown_sale_is_a_validation_error() {
    let (client, transport) = scripted_client(test_config(), []);
    let mut request = request(42);
    request.sale = "pedido-9999".into();

    let error = client
        .emit_invoice(request, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Validation);
    assert!(transport.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn wrong_certificate_password_is_a_configuration_error() {
    let transport = ScriptedTransport::new([]);
    let client = NfeEmitterClient::new(
        test_config(),
        Arc::new(Pkcs12BytesSource::new(
            common::identity_bundle(),
            Password::from_str(&format!("{PKCS12_PASSWORD}-wrong")).unwrap(),
        )),
        Arc::new(InMemorySaleSource::new([common::test_sale()])),
    )
    .with_connector(Arc::new(ScriptedConnector(transport.clone())));

    let error = client
        .emit_invoice(request(42), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Configuration);
    assert!(transport.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unusable_certificate_does_not_use_a_number() {
    let locked = NfeEmitterClient::new(
        test_config(),
        Arc::new(Pkcs12BytesSource::new(
            common::identity_bundle(),
            Password::from_str(&format!("{PKCS12_PASSWORD}-wrong")).unwrap(),
        )),
        Arc::new(InMemorySaleSource::new([common::test_sale()])),
    )
    .with_connector(Arc::new(ScriptedConnector(ScriptedTransport::new([]))));
    let counter =
        InMemoryInvoiceCounter::starting_after(locked.config().issuer.cnpj.clone(), 1, 41);
    let next_request = || NextEmissionRequest {
        sale: "pedido-0042".into(),
        environment: None,
        deadline: None,
    };

    let error = locked
        .emit_next_invoice(next_request(), &counter, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Configuration);

    let (client, _transport) =
        scripted_client(test_config(), [Step::Reply("authorization_authorized.xml")]);
    let emission = client
        .emit_next_invoice(next_request(), &counter, CancellationToken::new())
        .await
        .unwrap()
        .data;
    assert_eq!(emission.series, InvoiceSeries::new(1, 42).unwrap());
}

#[tokio::test(start_paused = true)]
async fn transport_is_released_after_emission() {
    let (client, transport) =
        scripted_client(test_config(), [Step::Reply("authorization_authorized.xml")]);
    let held_by_client = Arc::strong_count(&transport);

    let emission = client
        .emit_invoice(request(42), CancellationToken::new())
        .await
        .unwrap()
        .data;
    assert!(emission.outcome.is_authorized());
    assert_eq!(transport.calls().len(), 1);
    assert_eq!(Arc::strong_count(&transport), held_by_client);
}
