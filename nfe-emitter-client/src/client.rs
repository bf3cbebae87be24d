use nfe_emitter::{
    crypto::SigningIdentity,
    soap::{self, Service},
    types::{Environment, SaleRecord, SaleReference, SaleSource},
    ValidationError,
};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{instrument, warn};

use crate::{
    config::{self, Config, EndpointSet},
    identity::{certificate_matches_issuer, IdentitySource},
    transport::{MutualTlsConnector, SoapRequest, SoapTransport, TransportConnector},
    Result,
};

/// Handle for emitting invoices on behalf of one issuer.
///
/// The handle holds configuration and collaborators only. Nothing is kept
/// between calls: the signing identity is loaded at the start of each call
/// and dropped, zeroized, at its end. Share it across tasks with `Arc` or by
/// reference.
#[derive(Clone)]
pub struct NfeEmitterClient {
    config: Arc<Config>,
    identities: Arc<dyn IdentitySource>,
    sales: Arc<dyn SaleSource>,
    connector: Arc<dyn TransportConnector>,
}

impl std::fmt::Debug for NfeEmitterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NfeEmitterClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// What one call needs to talk to the authority.
pub(crate) struct Session<'a> {
    pub(crate) identity: SigningIdentity,
    pub(crate) transport: Arc<dyn SoapTransport>,
    pub(crate) environment: Environment,
    pub(crate) endpoints: &'a EndpointSet,
}

impl Session<'_> {
    /// One request/reply exchange with `service`, outside of any emission.
    pub(crate) async fn call(&self, service: Service, message_xml: &str) -> Result<String> {
        let request = SoapRequest {
            service,
            endpoint: self.endpoints.uri(service, self.environment)?.clone(),
            envelope: soap::envelope(service, message_xml),
        };
        Ok(self.transport.call(&request).await?)
    }
}

impl NfeEmitterClient {
    pub fn new(
        config: Config,
        identities: Arc<dyn IdentitySource>,
        sales: Arc<dyn SaleSource>,
    ) -> Self {
        config::warn_on_suspicious_settings(&config);
        Self {
            config: Arc::new(config),
            identities,
            sales,
            connector: Arc::new(MutualTlsConnector),
        }
    }

    /// Replace how transports are opened, e.g. to route calls through a
    /// proxy or to script the authority's replies.
    pub fn with_connector(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn environment_or_default(&self, environment: Option<Environment>) -> Environment {
        environment.unwrap_or(self.config.environment)
    }

    /// Load the signing identity and open a transport authenticated with it.
    #[instrument(skip(self), err(Debug))]
    pub(crate) fn open_session(&self, environment: Environment) -> Result<Session<'_>> {
        let endpoints = self.config.endpoints.for_environment(environment)?;

        let identity = self.identities.load()?;
        identity.ensure_valid_at(OffsetDateTime::now_utc())?;
        if !certificate_matches_issuer(&identity, self.config.issuer.cnpj.as_str()) {
            warn!(
                subject = identity.subject(),
                "Certificate subject does not mention the issuer's CNPJ"
            );
        }

        let transport = self.connector.connect(&identity, &self.config)?;
        Ok(Session {
            identity,
            transport,
            environment,
            endpoints,
        })
    }

    pub(crate) async fn fetch_sale(&self, reference: &SaleReference) -> Result<SaleRecord> {
        Ok(self
            .sales
            .fetch_sale(reference)
            .await?
            .ok_or_else(|| ValidationError::SaleNotFound(reference.to_string()))?)
    }
}
