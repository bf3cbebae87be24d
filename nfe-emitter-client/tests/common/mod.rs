//! Shared setup for the emission tests: a client wired to a scripted
//! authority instead of the network.

#![allow(dead_code)]

use async_trait::async_trait;
use nfe_emitter::{
    crypto::SigningIdentity,
    soap::Service,
    types::{InMemorySaleSource, SaleRecord},
};
use nfe_emitter_client::{
    config::ConfigFile,
    identity::{Password, Pkcs12BytesSource},
    transport::{SoapRequest, SoapTransport, TransportConnector, TransportError},
    Config, NfeEmitterClient,
};
use std::{
    collections::VecDeque,
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};

pub const PKCS12_PASSWORD: &str = "test1234";

pub fn fixtures_dir() -> String {
    format!("{}/../fixtures", env!("CARGO_MANIFEST_DIR"))
}

/// What the scripted authority does on the next call.
#[derive(Debug, Clone)]
pub enum Step {
    /// Reply with a canned response from `fixtures/responses`.
    Reply(&'static str),
    /// Fail the call as the network would.
    Fail,
    /// Never answer.
    Hang,
}

/// Plays [`Step`]s in order and records the services called.
///
/// Canned responses use `{access_key}` and `{digest_value}` placeholders,
/// filled in from the last document or key seen in a request.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<Service>>,
    seen: Mutex<Seen>,
}

#[derive(Debug, Default)]
struct Seen {
    access_key: String,
    digest_value: String,
}

impl ScriptedTransport {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<Service> {
        self.calls.lock().unwrap().clone()
    }

    pub fn remaining_steps(&self) -> usize {
        self.steps.lock().unwrap().len()
    }

    fn remember(&self, envelope: &str) {
        let mut seen = self.seen.lock().unwrap();
        if let Some(key) = between(envelope, "Id=\"NFe", "\"") {
            seen.access_key = key.to_string();
        } else if let Some(key) = between(envelope, "<chNFe>", "</chNFe>") {
            seen.access_key = key.to_string();
        }
        if let Some(digest) = between(envelope, "<DigestValue>", "</DigestValue>") {
            seen.digest_value = digest.to_string();
        }
    }

    fn fill(&self, name: &str) -> String {
        let template = std::fs::read_to_string(format!("{}/responses/{name}", fixtures_dir()))
            .unwrap_or_else(|e| panic!("missing fixture {name}: {e}"));
        let seen = self.seen.lock().unwrap();
        template
            .replace("{access_key}", &seen.access_key)
            .replace("{digest_value}", &seen.digest_value)
    }
}

fn between<'a>(text: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = text.find(start)? + start.len();
    let to = text[from..].find(end)? + from;
    Some(&text[from..to])
}

#[async_trait]
impl SoapTransport for ScriptedTransport {
    async fn call(&self, request: &SoapRequest) -> Result<String, TransportError> {
        self.calls.lock().unwrap().push(request.service);
        self.remember(&request.envelope);

        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected {} call", request.service));
        match step {
            Step::Reply(name) => Ok(self.fill(name)),
            Step::Fail => Err(TransportError::HttpStatus {
                status: 502,
                body: "Bad Gateway".to_string(),
            }),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
                Err(TransportError::Timeout(Duration::from_secs(24 * 60 * 60)))
            }
        }
    }
}

pub struct ScriptedConnector(pub Arc<ScriptedTransport>);

impl TransportConnector for ScriptedConnector {
    fn connect(
        &self,
        _identity: &SigningIdentity,
        _config: &Config,
    ) -> nfe_emitter_client::Result<Arc<dyn SoapTransport>> {
        Ok(self.0.clone())
    }
}

pub fn config_toml() -> String {
    format!(
        r#"
        environment = "homologation"
        synchronous = true

        [issuer]
        cnpj = "12345678000195"
        legal_name = "LIVRARIA RIO NILO LTDA"
        trade_name = "Rio Nilo Livros"
        state_registration = "123456789"
        tax_regime = "normal"

        [issuer.address]
        street = "Avenida Sete de Setembro"
        number = "1000"
        district = "Centro"
        municipality_code = "2927408"
        municipality = "Salvador"
        uf = "BA"
        postal_code = "40060001"

        [endpoints.homologation]
        authorization = "https://hnfe.sefaz.ba.gov.br/webservices/NFeAutorizacao4/NFeAutorizacao4.asmx"
        receipt = "https://hnfe.sefaz.ba.gov.br/webservices/NFeRetAutorizacao4/NFeRetAutorizacao4.asmx"
        protocol_query = "https://hnfe.sefaz.ba.gov.br/webservices/NFeConsultaProtocolo4/NFeConsultaProtocolo4.asmx"
        status = "https://hnfe.sefaz.ba.gov.br/webservices/NFeStatusServico4/NFeStatusServico4.asmx"

        [tls]
        ca_chain = "{}/cert.pem"

        [certificate]

        [polling]
        initial_delay = "1s"
        max_interval = "4s"
        backoff_multiplier = 2.0
        max_attempts = 4
        request_timeout = "10s"
        "#,
        fixtures_dir()
    )
}

pub fn test_config() -> Config {
    Config::from_config_file(ConfigFile::from_str(&config_toml()).unwrap()).unwrap()
}

pub fn test_sale() -> SaleRecord {
    serde_json::from_str(
        r#"{
            "reference": "pedido-0042",
            "status": "approved",
            "buyer": {
                "name": "Maria Souza",
                "tax_id": "123.456.789-09",
                "email": "maria@example.com"
            },
            "items": [
                { "name": "Dom Casmurro", "price": "R$ 59,90" },
                { "name": "Vidas Secas", "price": 42.5, "quantity": 2 }
            ],
            "payment": "pix"
        }"#,
    )
    .unwrap()
}

pub fn unpaid_sale() -> SaleRecord {
    let mut sale = test_sale();
    sale.reference = "pedido-0043".into();
    sale.status = nfe_emitter::types::SaleStatus::Pending;
    sale
}

pub fn identity_bundle() -> Vec<u8> {
    std::fs::read(format!("{}/identity.p12", fixtures_dir())).unwrap()
}

/// A client whose authority follows `steps`.
pub fn scripted_client(config: Config, steps: impl IntoIterator<Item = Step>) -> (NfeEmitterClient, Arc<ScriptedTransport>) {
    let transport = ScriptedTransport::new(steps);
    let identities = Arc::new(Pkcs12BytesSource::new(
        identity_bundle(),
        Password::from_str(PKCS12_PASSWORD).unwrap(),
    ));
    let sales = Arc::new(InMemorySaleSource::new([test_sale(), unpaid_sale()]));
    let client = NfeEmitterClient::new(config, identities, sales)
        .with_connector(Arc::new(ScriptedConnector(transport.clone())));
    (client, transport)
}
