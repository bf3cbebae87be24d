use http::Uri;
use nfe_emitter::{
    crypto::SignatureAlgorithm,
    infrastructure::pem_utils,
    soap::Service,
    types::{Environment, IssuerProfile, ProductDefaults, TaxRule},
};
use rustls::RootCertStore;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tracing::{warn, Level};

use crate::{
    identity::{IdentitySource, Password, Pkcs12BytesSource, Pkcs12FileSource},
    transmission::PollingPolicy,
    NfeEmitterClientError,
};

/// Client configuration with all fields ready to use.
#[derive(Clone)]
pub struct Config {
    /// Environment used when a request does not name one.
    pub environment: Environment,
    pub issuer: IssuerProfile,
    pub products: ProductDefaults,
    pub tax: TaxRule,
    pub endpoints: Endpoints,
    /// Roots trusted for the authority's TLS certificates.
    pub tls_roots: RootCertStore,
    pub certificate: CertificateConfig,
    pub signature_algorithm: SignatureAlgorithm,
    pub polling: PollingPolicy,
    /// Ask for synchronous processing (`indSinc=1`).
    pub synchronous: bool,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_file(config_path: impl AsRef<Path>) -> Result<Self, NfeEmitterClientError> {
        let config_string = std::fs::read_to_string(&config_path)?;
        let config_file = ConfigFile::from_str(&config_string)?;
        Self::from_config_file(config_file)
    }

    pub fn from_config_file(config: ConfigFile) -> Result<Self, NfeEmitterClientError> {
        config.issuer.validate()?;
        config.tax.validate()?;
        config.polling.validate()?;
        config.endpoints.validate()?;
        // Fail at startup rather than on the first emission.
        let _ = config.endpoints.for_environment(config.environment)?;

        let tls_roots = pem_utils::root_store(&pem_utils::read_certificates(&config.tls.ca_chain)?)?;

        Ok(Self {
            environment: config.environment,
            issuer: config.issuer,
            products: config.products,
            tax: config.tax,
            endpoints: config.endpoints,
            tls_roots,
            certificate: config.certificate,
            signature_algorithm: config.signature_algorithm,
            polling: config.polling,
            synchronous: config.synchronous,
            logging: config.logging,
        })
    }

    /// The issuer's certificate source. A bundle passed in `pkcs12_bytes`
    /// takes precedence over the configured file. The password is always
    /// read from the environment variable named in the configuration.
    pub fn identity_source(
        &self,
        pkcs12_bytes: Option<Vec<u8>>,
    ) -> Result<Arc<dyn IdentitySource>, NfeEmitterClientError> {
        let password_env = &self.certificate.password_env;
        match (pkcs12_bytes, &self.certificate.pkcs12) {
            (Some(bytes), _) => Ok(Arc::new(Pkcs12BytesSource::new(
                bytes,
                Password::from_env(password_env)?,
            ))),
            (None, Some(path)) => Ok(Arc::new(Pkcs12FileSource::new(path, password_env))),
            (None, None) => Err(NfeEmitterClientError::CertificateMissing),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("environment", &self.environment)
            .field("issuer", &self.issuer.cnpj)
            .field("endpoints", &self.endpoints)
            .field("tls_roots", &format!("{} certificates", self.tls_roots.len()))
            .field("certificate", &self.certificate)
            .field("signature_algorithm", &self.signature_algorithm)
            .field("polling", &self.polling)
            .field("synchronous", &self.synchronous)
            .finish()
    }
}

/// Client configuration file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
#[non_exhaustive]
pub struct ConfigFile {
    pub environment: Environment,
    #[serde(default = "default_synchronous")]
    pub synchronous: bool,
    #[serde(default)]
    pub signature_algorithm: SignatureAlgorithm,
    pub issuer: IssuerProfile,
    #[serde(default)]
    pub products: ProductDefaults,
    #[serde(default)]
    pub tax: TaxRule,
    pub endpoints: Endpoints,
    pub tls: TlsConfig,
    pub certificate: CertificateConfig,
    #[serde(default)]
    pub polling: PollingPolicy,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_synchronous() -> bool {
    true
}

impl FromStr for ConfigFile {
    type Err = NfeEmitterClientError;

    fn from_str(config_string: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(config_string)?)
    }
}

/// Web service addresses, per environment. Every state (or the virtual
/// authority serving it) publishes its own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct Endpoints {
    pub production: Option<EndpointSet>,
    pub homologation: Option<EndpointSet>,
}

impl Endpoints {
    pub fn for_environment(
        &self,
        environment: Environment,
    ) -> Result<&EndpointSet, NfeEmitterClientError> {
        let set = match environment {
            Environment::Production => self.production.as_ref(),
            Environment::Homologation => self.homologation.as_ref(),
        };
        set.ok_or(NfeEmitterClientError::MissingEndpoint {
            environment,
            service: Service::Authorization,
        })
    }

    fn validate(&self) -> Result<(), NfeEmitterClientError> {
        for set in self.production.iter().chain(self.homologation.iter()) {
            for uri in set.all() {
                if uri.scheme_str() != Some("https") {
                    return Err(NfeEmitterClientError::InvalidConfig(format!(
                        "endpoint {uri} does not use https"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct EndpointSet {
    #[serde_as(as = "DisplayFromStr")]
    pub authorization: Uri,
    #[serde_as(as = "DisplayFromStr")]
    pub receipt: Uri,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub protocol_query: Option<Uri>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub status: Option<Uri>,
}

impl EndpointSet {
    /// Address of `service`. Only authorization and receipt endpoints are
    /// required; the query services are optional.
    pub fn uri(
        &self,
        service: Service,
        environment: Environment,
    ) -> Result<&Uri, NfeEmitterClientError> {
        let uri = match service {
            Service::Authorization => Some(&self.authorization),
            Service::ReceiptQuery => Some(&self.receipt),
            Service::ProtocolQuery => self.protocol_query.as_ref(),
            Service::StatusService => self.status.as_ref(),
        };
        uri.ok_or(NfeEmitterClientError::MissingEndpoint {
            environment,
            service,
        })
    }

    fn all(&self) -> impl Iterator<Item = &Uri> {
        [Some(&self.authorization), Some(&self.receipt)]
            .into_iter()
            .chain([self.protocol_query.as_ref(), self.status.as_ref()])
            .flatten()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct TlsConfig {
    /// PEM file with the roots that sign the authority's certificates.
    pub ca_chain: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct CertificateConfig {
    /// The bundle can be provided as a file or passed to
    /// [`Config::identity_source`].
    pub pkcs12: Option<PathBuf>,
    /// Environment variable holding the bundle's password.
    #[serde(default = "default_password_env")]
    pub password_env: String,
}

impl CertificateConfig {
    pub const DEFAULT_PASSWORD_ENV: &'static str = "NFE_CERTIFICATE_PASSWORD";
}

fn default_password_env() -> String {
    CertificateConfig::DEFAULT_PASSWORD_ENV.to_string()
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct LoggingConfig {
    #[serde_as(as = "DisplayFromStr")]
    pub stdout_log_level: Level,
    pub log_files: Option<LoggingFileConfig>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout_log_level: Level::INFO,
            log_files: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct LoggingFileConfig {
    pub emitter_logs_file_name: PathBuf,
    pub all_logs_file_name: PathBuf,
}

/// Warn about settings that are legal but probably unintended.
pub(crate) fn warn_on_suspicious_settings(config: &Config) {
    if config.environment == Environment::Production && config.endpoints.homologation.is_some() {
        warn!("Production is the default environment but homologation endpoints are configured");
    }
    if config.signature_algorithm != SignatureAlgorithm::RsaSha1 {
        warn!(
            "Signing with {}; most authorities only accept rsa-sha1",
            config.signature_algorithm
        );
    }
}
