//! Signing identities and the RSA algorithm pairs used by XML-DSig.

use rsa::{
    pkcs1v15::{Signature, SigningKey, VerifyingKey},
    signature::{SignatureEncoding, Signer, Verifier},
    RsaPrivateKey, RsaPublicKey,
};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use strum::{Display, EnumString};
use thiserror::Error;
use time::OffsetDateTime;

pub(crate) mod identity;

pub use identity::{public_key_from_certificate, SigningIdentity};

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Could not decode PKCS#12 bundle: {0}")]
    Pkcs12(String),
    #[error("Wrong PKCS#12 password")]
    WrongPassword,
    #[error("PKCS#12 bundle has no private key")]
    MissingPrivateKey,
    #[error("No certificate in the bundle matches the private key")]
    MissingCertificate,
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),
    #[error("Certificate {subject} expired at {not_after}")]
    CertificateExpired {
        subject: String,
        not_after: OffsetDateTime,
    },
    #[error("Certificate {subject} is not valid before {not_before}")]
    CertificateNotYetValid {
        subject: String,
        not_before: OffsetDateTime,
    },
    #[error("Signing failed: {0}")]
    SigningFailed(String),
    #[error("Unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("Signature is missing or malformed: {0}")]
    MalformedSignature(String),
    #[error("Digest does not match the signed content")]
    DigestMismatch,
    #[error("Signature value does not verify")]
    InvalidSignature,
}

/// RSA PKCS#1 v1.5 signature with its matching digest. NF-e 4.00 mandates
/// RSA-SHA1; RSA-SHA256 is accepted by some authorities and is selected only
/// when configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum SignatureAlgorithm {
    #[serde(rename = "rsa-sha1")]
    #[strum(serialize = "rsa-sha1")]
    RsaSha1,
    #[serde(rename = "rsa-sha256")]
    #[strum(serialize = "rsa-sha256")]
    RsaSha256,
}

impl Default for SignatureAlgorithm {
    fn default() -> Self {
        SignatureAlgorithm::RsaSha1
    }
}

impl SignatureAlgorithm {
    pub fn signature_method(self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaSha1 => "http://www.w3.org/2000/09/xmldsig#rsa-sha1",
            SignatureAlgorithm::RsaSha256 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
        }
    }

    pub fn digest_method(self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaSha1 => "http://www.w3.org/2000/09/xmldsig#sha1",
            SignatureAlgorithm::RsaSha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
        }
    }

    /// Identify the algorithm pair named in a `SignedInfo`. Mixed pairs are
    /// refused.
    pub fn from_methods(signature_method: &str, digest_method: &str) -> Result<Self, CryptoError> {
        [SignatureAlgorithm::RsaSha1, SignatureAlgorithm::RsaSha256]
            .into_iter()
            .find(|algorithm| {
                algorithm.signature_method() == signature_method
                    && algorithm.digest_method() == digest_method
            })
            .ok_or_else(|| {
                CryptoError::UnsupportedAlgorithm(format!("{signature_method} / {digest_method}"))
            })
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            SignatureAlgorithm::RsaSha1 => Sha1::digest(data).to_vec(),
            SignatureAlgorithm::RsaSha256 => Sha256::digest(data).to_vec(),
        }
    }

    pub fn sign(self, key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let signature = match self {
            SignatureAlgorithm::RsaSha1 => SigningKey::<Sha1>::new(key.clone())
                .try_sign(data)
                .map(|signature| signature.to_vec()),
            SignatureAlgorithm::RsaSha256 => SigningKey::<Sha256>::new(key.clone())
                .try_sign(data)
                .map(|signature| signature.to_vec()),
        };
        signature.map_err(|e| CryptoError::SigningFailed(e.to_string()))
    }

    pub fn verify(
        self,
        key: &RsaPublicKey,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        let signature =
            Signature::try_from(signature).map_err(|_| CryptoError::InvalidSignature)?;
        let verified = match self {
            SignatureAlgorithm::RsaSha1 => {
                VerifyingKey::<Sha1>::new(key.clone()).verify(data, &signature)
            }
            SignatureAlgorithm::RsaSha256 => {
                VerifyingKey::<Sha256>::new(key.clone()).verify(data, &signature)
            }
        };
        verified.map_err(|_| CryptoError::InvalidSignature)
    }
}
