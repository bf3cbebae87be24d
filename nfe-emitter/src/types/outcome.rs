use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{
    access_key::AccessKey,
    constants::{LAYOUT_VERSION, NFE_NAMESPACE},
    response::ResponseError,
    signature::SignedInvoice,
    xml::Element,
};

/// `nRec` returned by the authority when a batch is accepted for
/// asynchronous processing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptNumber(String);

impl ReceiptNumber {
    pub fn new(receipt: impl Into<String>) -> Self {
        Self(receipt.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The authority's verdict on one document, as read from `infProt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolStamp {
    pub access_key: AccessKey,
    /// `nProt`. Absent on some rejections.
    pub protocol_number: Option<String>,
    /// `dhRecbto`, as sent by the authority.
    pub received_at: Option<String>,
    /// `digVal`: the digest the authority computed over `infNFe`.
    pub digest_value: Option<String>,
    /// `verAplic`
    pub application_version: Option<String>,
    pub status_code: String,
    pub reason: String,
}

/// An authorized invoice and its archival form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedDocument {
    pub stamp: ProtocolStamp,
    /// The signed `NFe` exactly as transmitted.
    pub signed_xml: String,
    /// The authority's `protNFe`, in canonical form.
    pub protocol_xml: String,
    /// `nfeProc`: signed document plus protocol. This is the legally valid
    /// artifact that has to be archived.
    pub nfe_proc: String,
}

impl AuthorizedDocument {
    /// Pair the signed document with its protocol. The protocol must name the
    /// same access key and, when the authority reports one, the same digest.
    pub fn assemble(
        signed: &SignedInvoice,
        stamp: ProtocolStamp,
        protocol_xml: String,
    ) -> Result<Self, ResponseError> {
        if &stamp.access_key != signed.access_key() {
            return Err(ResponseError::ProtocolMismatch(format!(
                "protocol is for {}, document is {}",
                stamp.access_key,
                signed.access_key()
            )));
        }
        if let Some(digest) = &stamp.digest_value {
            if digest != signed.digest_value() {
                return Err(ResponseError::ProtocolMismatch(format!(
                    "protocol digest {digest} does not match document digest {}",
                    signed.digest_value()
                )));
            }
        }

        let nfe_proc = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><nfeProc xmlns="{NFE_NAMESPACE}" versao="{LAYOUT_VERSION}">{}{}</nfeProc>"#,
            signed.xml(),
            protocol_xml
        );

        Ok(Self {
            stamp,
            signed_xml: signed.xml().to_string(),
            protocol_xml,
            nfe_proc,
        })
    }

    /// `nProt`, always present on an authorization.
    pub fn protocol_number(&self) -> Option<&str> {
        self.stamp.protocol_number.as_deref()
    }

    /// Re-read the archival artifact. Useful to check a stored `nfeProc`.
    pub fn parse_nfe_proc(&self) -> Result<Element, ResponseError> {
        Element::parse(&self.nfe_proc).map_err(ResponseError::NotXml)
    }
}

/// Final result of one emission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransmissionOutcome {
    Authorized(AuthorizedDocument),
    /// The document or its batch was refused. Nothing was registered, the
    /// number may be reused only after it is voided (inutilização).
    Rejected { code: String, reason: String },
    /// The authority registered the document but denied its use.
    Denied {
        code: String,
        reason: String,
        stamp: ProtocolStamp,
    },
    /// Accepted for processing; the caller asked not to wait.
    Pending { receipt: ReceiptNumber },
    /// The request may or may not have reached the authority.
    TransportError {
        detail: String,
        receipt: Option<ReceiptNumber>,
    },
    /// Still processing after the last allowed poll.
    Timeout {
        receipt: ReceiptNumber,
        attempts: u32,
    },
    Cancelled { receipt: Option<ReceiptNumber> },
    UnknownStatus {
        code: Option<String>,
        reason: Option<String>,
        raw: String,
    },
}

impl TransmissionOutcome {
    pub fn is_authorized(&self) -> bool {
        matches!(self, TransmissionOutcome::Authorized(_))
    }

    /// True when the document's fate is unknown. A protocol query by access
    /// key has to settle it before the same sale is submitted again.
    pub fn requires_reconciliation(&self) -> bool {
        matches!(
            self,
            TransmissionOutcome::Pending { .. }
                | TransmissionOutcome::TransportError { .. }
                | TransmissionOutcome::Timeout { .. }
                | TransmissionOutcome::Cancelled { .. }
                | TransmissionOutcome::UnknownStatus { .. }
        )
    }

    /// `cStat` that produced this outcome, when there was one.
    pub fn status_code(&self) -> Option<&str> {
        match self {
            TransmissionOutcome::Authorized(document) => Some(&document.stamp.status_code),
            TransmissionOutcome::Rejected { code, .. }
            | TransmissionOutcome::Denied { code, .. } => Some(code),
            TransmissionOutcome::UnknownStatus { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn receipt(&self) -> Option<&ReceiptNumber> {
        match self {
            TransmissionOutcome::Pending { receipt } | TransmissionOutcome::Timeout { receipt, .. } => {
                Some(receipt)
            }
            TransmissionOutcome::TransportError { receipt, .. }
            | TransmissionOutcome::Cancelled { receipt } => receipt.as_ref(),
            _ => None,
        }
    }
}

impl fmt::Display for TransmissionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransmissionOutcome::Authorized(document) => write!(
                f,
                "authorized, protocol {}",
                document.protocol_number().unwrap_or("?")
            ),
            TransmissionOutcome::Rejected { code, reason } => write!(f, "rejected {code}: {reason}"),
            TransmissionOutcome::Denied { code, reason, .. } => write!(f, "denied {code}: {reason}"),
            TransmissionOutcome::Pending { receipt } => write!(f, "pending, receipt {receipt}"),
            TransmissionOutcome::TransportError { detail, .. } => write!(f, "transport error: {detail}"),
            TransmissionOutcome::Timeout { receipt, attempts } => {
                write!(f, "timed out after {attempts} polls, receipt {receipt}")
            }
            TransmissionOutcome::Cancelled { .. } => f.write_str("cancelled"),
            TransmissionOutcome::UnknownStatus { code, reason, .. } => write!(
                f,
                "unknown status {}: {}",
                code.as_deref().unwrap_or("-"),
                reason.as_deref().unwrap_or("-")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::{identity::tests::test_identity, SignatureAlgorithm},
        document::tests::build_test_invoice,
        signature::{verify_signed_xml, SignatureEngine},
        types::Environment,
    };

    fn signed() -> SignedInvoice {
        SignatureEngine::new(SignatureAlgorithm::RsaSha1)
            .sign(&build_test_invoice(Environment::Homologation), &test_identity())
            .unwrap()
    }

    fn stamp_for(signed: &SignedInvoice) -> ProtocolStamp {
        ProtocolStamp {
            access_key: signed.access_key().clone(),
            protocol_number: Some("129240000012345".to_string()),
            received_at: Some("2024-05-14T10:30:05-03:00".to_string()),
            digest_value: Some(signed.digest_value().to_string()),
            application_version: Some("SVRS202405141030".to_string()),
            status_code: "100".to_string(),
            reason: "Autorizado o uso da NF-e".to_string(),
        }
    }

    #[test]
    fn nfe_proc_wraps_document_and_protocol() {
        let signed = signed();
        let protocol_xml = format!(
            r#"<protNFe versao="4.00"><infProt><chNFe>{}</chNFe></infProt></protNFe>"#,
            signed.access_key()
        );
        let document =
            AuthorizedDocument::assemble(&signed, stamp_for(&signed), protocol_xml).unwrap();

        let root = document.parse_nfe_proc().unwrap();
        assert_eq!(root.name(), "nfeProc");
        let names: Vec<&str> = root.child_elements().map(Element::name).collect();
        assert_eq!(names, ["NFe", "protNFe"]);
        assert_eq!(document.protocol_number(), Some("129240000012345"));

        // The archived document still carries a valid signature.
        let verified = verify_signed_xml(&document.nfe_proc, None).unwrap();
        assert_eq!(verified.access_key, document.stamp.access_key);
    }

    #[test]
    fn mismatched_protocol_is_refused() {
        let signed = signed();

        let mut stamp = stamp_for(&signed);
        stamp.digest_value = Some("AAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string());
        assert!(matches!(
            AuthorizedDocument::assemble(&signed, stamp, String::new()),
            Err(ResponseError::ProtocolMismatch(_))
        ));

        let mut stamp = stamp_for(&signed);
        stamp.access_key = "29240512345678000195550010000000421123456789".parse().unwrap();
        assert!(matches!(
            AuthorizedDocument::assemble(&signed, stamp, String::new()),
            Err(ResponseError::ProtocolMismatch(_))
        ));
    }

    #[test]
    fn reconciliation_is_required_only_when_fate_is_unknown() {
        let receipt = ReceiptNumber::new("291000012345678");
        let rejected = TransmissionOutcome::Rejected {
            code: "539".to_string(),
            reason: "Duplicidade de NF-e".to_string(),
        };
        assert!(!rejected.requires_reconciliation());
        assert_eq!(rejected.status_code(), Some("539"));

        let timeout = TransmissionOutcome::Timeout {
            receipt: receipt.clone(),
            attempts: 5,
        };
        assert!(timeout.requires_reconciliation());
        assert_eq!(timeout.receipt(), Some(&receipt));
        assert!(TransmissionOutcome::Cancelled { receipt: None }.requires_reconciliation());
        assert!(TransmissionOutcome::TransportError {
            detail: "connection reset".to_string(),
            receipt: None
        }
        .requires_reconciliation());
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let outcome = TransmissionOutcome::Rejected {
            code: "225".to_string(),
            reason: "Rejeicao: Falha no Schema XML".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "rejected");
        assert_eq!(json["code"], "225");
    }
}
