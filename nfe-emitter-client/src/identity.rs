//! Where the issuer's signing certificate comes from.

use nfe_emitter::crypto::SigningIdentity;
use std::{fmt, path::PathBuf, str::FromStr};
use tracing::{debug, instrument};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{NfeEmitterClientError, Result};

#[derive(Default, Zeroize, ZeroizeOnDrop)]
pub struct Password(String);

impl FromStr for Password {
    type Err = NfeEmitterClientError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Password(s.to_string()))
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

impl Password {
    /// Read the password from the environment variable `name`.
    pub fn from_env(name: &str) -> Result<Self> {
        std::env::var(name)
            .map(Password)
            .map_err(|_| NfeEmitterClientError::CertificatePasswordMissing(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Produces the issuer's signing identity. Called once per emission, so
/// implementations pick up a renewed certificate without a restart.
pub trait IdentitySource: Send + Sync {
    fn load(&self) -> Result<SigningIdentity>;
}

/// A PKCS#12 file on disk, protected by a password held in an environment
/// variable.
#[derive(Debug, Clone)]
pub struct Pkcs12FileSource {
    path: PathBuf,
    password_env: String,
}

impl Pkcs12FileSource {
    pub fn new(path: impl Into<PathBuf>, password_env: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            password_env: password_env.into(),
        }
    }
}

impl IdentitySource for Pkcs12FileSource {
    #[instrument(skip_all, err(Debug), fields(path = %self.path.display()))]
    fn load(&self) -> Result<SigningIdentity> {
        let bundle = Zeroizing::new(std::fs::read(&self.path)?);
        let password = Password::from_env(&self.password_env)?;
        let identity = SigningIdentity::from_pkcs12(&bundle, password.as_str())?;
        debug!(subject = identity.subject(), "Loaded signing certificate");
        Ok(identity)
    }
}

/// A PKCS#12 bundle handed over in memory, e.g. fetched from a secret store.
pub struct Pkcs12BytesSource {
    bundle: Zeroizing<Vec<u8>>,
    password: Password,
}

impl Pkcs12BytesSource {
    pub fn new(bundle: Vec<u8>, password: Password) -> Self {
        Self {
            bundle: Zeroizing::new(bundle),
            password,
        }
    }
}

impl fmt::Debug for Pkcs12BytesSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs12BytesSource")
            .field("bundle", &format!("{} bytes", self.bundle.len()))
            .finish()
    }
}

impl IdentitySource for Pkcs12BytesSource {
    fn load(&self) -> Result<SigningIdentity> {
        Ok(SigningIdentity::from_pkcs12(
            &self.bundle,
            self.password.as_str(),
        )?)
    }
}

/// Check that the certificate was issued to `cnpj`. e-CNPJ certificates carry
/// the CNPJ after a colon in the subject's common name.
pub(crate) fn certificate_matches_issuer(identity: &SigningIdentity, cnpj: &str) -> bool {
    identity.subject().contains(cnpj)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PKCS12_PASSWORD: &str = "test1234";

    fn bundle() -> Vec<u8> {
        std::fs::read(format!(
            "{}/../fixtures/identity.p12",
            env!("CARGO_MANIFEST_DIR")
        ))
        .unwrap()
    }

    #[test]
    fn password_gets_zeroized() -> Result<()> {
        let password_bytes = b"test";
        let password = Password::from_str("test")?;
        let ptr = password.0.as_ptr();

        drop(password);

        let after_drop = unsafe { core::slice::from_raw_parts(ptr, 4) };
        assert_ne!(password_bytes, after_drop);
        Ok(())
    }

    #[test]
    fn password_is_not_printed() {
        let password = Password::from_str("hunter2").unwrap();
        assert!(!format!("{password:?}").contains("hunter2"));
    }

    #[test]
    fn bytes_source_loads_identity() {
        let source = Pkcs12BytesSource::new(bundle(), Password::from_str(PKCS12_PASSWORD).unwrap());
        let identity = source.load().unwrap();
        assert!(!identity.certificate_der().is_empty());

        let wrong = Pkcs12BytesSource::new(bundle(), Password::from_str("nope").unwrap());
        assert!(matches!(
            wrong.load(),
            Err(NfeEmitterClientError::NfeEmitter(_))
        ));
    }

    #[test]
    fn file_source_needs_password_variable() {
        let source = Pkcs12FileSource::new(
            format!("{}/../fixtures/identity.p12", env!("CARGO_MANIFEST_DIR")),
            "NFE_EMITTER_TEST_UNSET_PASSWORD_VARIABLE",
        );
        assert!(matches!(
            source.load(),
            Err(NfeEmitterClientError::CertificatePasswordMissing(_))
        ));
    }
}
