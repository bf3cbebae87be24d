use base64::{engine::general_purpose::STANDARD, Engine as _};
use rsa::{
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    RsaPrivateKey, RsaPublicKey,
};
use std::fmt;
use time::OffsetDateTime;
use tracing::{info, instrument};
use x509_cert::{
    der::{Decode, Encode},
    Certificate,
};
use zeroize::Zeroizing;

use super::CryptoError;

/// The issuer's A1 certificate and its RSA private key.
///
/// Loaded once per emission, used to sign the document and as the TLS client
/// certificate for the same emission, then dropped. Key material is zeroized
/// on drop and is never written anywhere.
pub struct SigningIdentity {
    private_key: RsaPrivateKey,
    private_key_der: Zeroizing<Vec<u8>>,
    certificate_der: Vec<u8>,
    subject: String,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl SigningIdentity {
    /// Decode a PKCS#12 bundle. When the bundle carries a chain, the
    /// certificate whose public key matches the private key is used.
    #[instrument(skip_all, err(Debug))]
    pub fn from_pkcs12(bundle: &[u8], password: &str) -> Result<Self, CryptoError> {
        let pfx = p12::PFX::parse(bundle).map_err(|e| CryptoError::Pkcs12(format!("{e:?}")))?;
        if !pfx.verify_mac(password) {
            return Err(CryptoError::WrongPassword);
        }

        let mut keys = pfx
            .key_bags(password)
            .map_err(|e| CryptoError::Pkcs12(format!("{e:?}")))?;
        let certificates = pfx
            .cert_x509_bags(password)
            .map_err(|e| CryptoError::Pkcs12(format!("{e:?}")))?;

        if keys.is_empty() {
            return Err(CryptoError::MissingPrivateKey);
        }
        let key_der = Zeroizing::new(keys.swap_remove(0));
        for mut other in keys {
            zeroize::Zeroize::zeroize(&mut other);
        }

        let private_key = RsaPrivateKey::from_pkcs8_der(&key_der)
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        let public_key = private_key.to_public_key();

        let certificate_der = certificates
            .into_iter()
            .find(|der| {
                public_key_from_certificate(der)
                    .map(|candidate| candidate == public_key)
                    .unwrap_or(false)
            })
            .ok_or(CryptoError::MissingCertificate)?;

        let identity = Self::assemble(private_key, key_der, certificate_der)?;
        info!("Loaded signing identity {}", identity.subject);
        Ok(identity)
    }

    /// Build an identity from an unencrypted PKCS#8 key and a DER certificate.
    pub fn from_der(private_key_pkcs8: &[u8], certificate: &[u8]) -> Result<Self, CryptoError> {
        let key_der = Zeroizing::new(private_key_pkcs8.to_vec());
        let private_key = RsaPrivateKey::from_pkcs8_der(&key_der)
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;

        if public_key_from_certificate(certificate)? != private_key.to_public_key() {
            return Err(CryptoError::MissingCertificate);
        }

        Self::assemble(private_key, key_der, certificate.to_vec())
    }

    fn assemble(
        private_key: RsaPrivateKey,
        private_key_der: Zeroizing<Vec<u8>>,
        certificate_der: Vec<u8>,
    ) -> Result<Self, CryptoError> {
        let certificate = Certificate::from_der(&certificate_der)
            .map_err(|e| CryptoError::InvalidCertificate(e.to_string()))?;
        let validity = &certificate.tbs_certificate.validity;

        Ok(Self {
            private_key,
            private_key_der,
            subject: certificate.tbs_certificate.subject.to_string(),
            not_before: unix_time(validity.not_before.to_unix_duration())?,
            not_after: unix_time(validity.not_after.to_unix_duration())?,
            certificate_der,
        })
    }

    /// Refuse certificates outside their validity window. The authority
    /// rejects documents signed with them anyway.
    pub fn ensure_valid_at(&self, at: OffsetDateTime) -> Result<(), CryptoError> {
        if at < self.not_before {
            return Err(CryptoError::CertificateNotYetValid {
                subject: self.subject.clone(),
                not_before: self.not_before,
            });
        }
        if at > self.not_after {
            return Err(CryptoError::CertificateExpired {
                subject: self.subject.clone(),
                not_after: self.not_after,
            });
        }
        Ok(())
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    /// Certificate as carried in `X509Certificate`.
    pub fn certificate_base64(&self) -> String {
        STANDARD.encode(&self.certificate_der)
    }

    /// PKCS#8 DER of the private key, for the TLS client configuration.
    pub fn private_key_der(&self) -> &[u8] {
        &self.private_key_der
    }

    pub(crate) fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.private_key.to_public_key()
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }
}

impl fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("subject", &self.subject)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// RSA public key carried by a DER certificate.
pub fn public_key_from_certificate(certificate: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    let certificate = Certificate::from_der(certificate)
        .map_err(|e| CryptoError::InvalidCertificate(e.to_string()))?;
    let spki = certificate
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| CryptoError::InvalidCertificate(e.to_string()))?;
    RsaPublicKey::from_public_key_der(&spki)
        .map_err(|e| CryptoError::InvalidCertificate(format!("not an RSA key: {e}")))
}

fn unix_time(since_epoch: std::time::Duration) -> Result<OffsetDateTime, CryptoError> {
    let seconds = i64::try_from(since_epoch.as_secs())
        .map_err(|_| CryptoError::InvalidCertificate("validity out of range".to_string()))?;
    OffsetDateTime::from_unix_timestamp(seconds)
        .map_err(|e| CryptoError::InvalidCertificate(e.to_string()))
}
