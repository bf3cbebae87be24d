//! HTTP plumbing for the SOAP web services.
//!
//! The authorities authenticate the issuer by the TLS client certificate,
//! which must be the same e-CNPJ certificate that signs the documents. A
//! transport is therefore bound to one [`SigningIdentity`].

use async_trait::async_trait;
use http::{header::CONTENT_TYPE, Request, Uri};
use hyper::{client::HttpConnector, Body, Client};
use hyper_rustls::HttpsConnector;
use nfe_emitter::{crypto::SigningIdentity, infrastructure::logging::truncate_for_log, soap::Service};
use rustls::{Certificate, ClientConfig, PrivateKey};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, instrument, trace};

use crate::{Config, Result};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("No response within {0:?}")]
    Timeout(Duration),
    #[error("HTTP status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("Response body is not UTF-8: {0}")]
    Body(String),

    // Wrapped errors
    #[error(transparent)]
    Http(#[from] hyper::Error),
    #[error(transparent)]
    Request(#[from] http::Error),
}

/// One SOAP call: the envelope and where it goes.
#[derive(Debug, Clone)]
pub struct SoapRequest {
    pub service: Service,
    pub endpoint: Uri,
    pub envelope: String,
}

/// Sends envelopes and returns the raw reply. A reply that carries a SOAP
/// envelope is returned even with an error status, since faults arrive as
/// HTTP 500.
#[async_trait]
pub trait SoapTransport: Send + Sync {
    async fn call(&self, request: &SoapRequest) -> std::result::Result<String, TransportError>;
}

/// Opens transports authenticated as a given issuer.
pub trait TransportConnector: Send + Sync {
    fn connect(&self, identity: &SigningIdentity, config: &Config) -> Result<Arc<dyn SoapTransport>>;
}

/// Connects with the issuer's certificate as TLS client certificate.
#[derive(Debug, Clone, Copy, Default)]
pub struct MutualTlsConnector;

impl TransportConnector for MutualTlsConnector {
    /// rustls keeps its own copy of the private key, which is not zeroized.
    /// The copy lives in the returned transport, so callers open one per
    /// operation and drop it when the operation ends.
    fn connect(&self, identity: &SigningIdentity, config: &Config) -> Result<Arc<dyn SoapTransport>> {
        let tls_config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(config.tls_roots.clone())
            .with_single_cert(
                vec![Certificate(identity.certificate_der().to_vec())],
                PrivateKey(identity.private_key_der().to_vec()),
            )?;

        Ok(Arc::new(HttpsTransport::new(
            tls_config,
            config.polling.request_timeout,
        )))
    }
}

#[derive(Debug, Clone)]
pub struct HttpsTransport {
    client: Client<HttpsConnector<HttpConnector>>,
    request_timeout: Duration,
}

impl HttpsTransport {
    pub fn new(tls_config: ClientConfig, request_timeout: Duration) -> Self {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_only()
            .enable_http1()
            .build();

        Self {
            client: Client::builder().build(connector),
            request_timeout,
        }
    }

    async fn send(&self, request: &SoapRequest) -> std::result::Result<String, TransportError> {
        let http_request = Request::post(request.endpoint.clone())
            .header(CONTENT_TYPE, request.service.content_type())
            .body(Body::from(request.envelope.clone()))?;

        let response = self.client.request(http_request).await?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await?;
        let body = String::from_utf8(bytes.to_vec())
            .map_err(|e| TransportError::Body(e.to_string()))?;

        if !status.is_success() && !body.contains("Envelope") {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                body: truncate_for_log(&body, 256),
            });
        }
        debug!(status = status.as_u16(), "Received reply");
        Ok(body)
    }
}

#[async_trait]
impl SoapTransport for HttpsTransport {
    #[instrument(skip_all, err(Debug), fields(service = %request.service, endpoint = %request.endpoint))]
    async fn call(&self, request: &SoapRequest) -> std::result::Result<String, TransportError> {
        trace!(envelope = %truncate_for_log(&request.envelope, 512), "Sending envelope");
        tokio::time::timeout(self.request_timeout, self.send(request))
            .await
            .map_err(|_| TransportError::Timeout(self.request_timeout))?
    }
}
