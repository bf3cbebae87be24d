//! Interpretation of authority replies.
//!
//! Every reply goes through the same steps: strip the SOAP envelope, decode
//! the expected `ret*` element into its typed shape, then map `cStat` to a
//! verdict. Codes are grouped as follows:
//!
//! | `cStat`              | meaning                                   |
//! |----------------------|-------------------------------------------|
//! | 100, 150             | authorized                                |
//! | 110, 301, 302, 303   | denied (registered, use not allowed)      |
//! | 103                  | batch received, poll the receipt          |
//! | 104                  | batch processed, protocol attached        |
//! | 105                  | batch still processing                    |
//! | other 201 to 999     | rejected                                  |
//! | anything else        | unknown, reconcile by protocol query      |

use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    access_key::AccessKey,
    constants::{
        STATUS_BATCH_PROCESSED, STATUS_BATCH_PROCESSING, STATUS_BATCH_RECEIVED,
        STATUS_DOCUMENT_NOT_FOUND, STATUS_SERVICE_IN_OPERATION,
    },
    signature::SignedInvoice,
    soap::{extract_payload, Service},
    types::{AuthorizedDocument, ProtocolStamp, ReceiptNumber, TransmissionOutcome},
    xml::{Element, XmlError},
};

pub mod schema;

use schema::{ProtNFe, RetConsReciNFe, RetConsSitNFe, RetConsStatServ, RetEnviNFe};

#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("Response is not well-formed XML: {0}")]
    NotXml(XmlError),
    #[error("Response is not a SOAP envelope")]
    NotSoapEnvelope,
    #[error("SOAP envelope has no body")]
    MissingBody,
    #[error("SOAP fault {code}: {reason}")]
    Fault { code: String, reason: String },
    #[error("Response has no {0} element")]
    MissingElement(&'static str),
    #[error("Response does not match the expected schema: {0}")]
    Schema(String),
    #[error("Protocol does not belong to the transmitted document: {0}")]
    ProtocolMismatch(String),
}

/// How a `cStat` is treated, independent of the service that returned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Authorized,
    Denied,
    Rejected,
    Other,
}

pub fn classify_code(code: &str) -> StatusClass {
    match code.trim() {
        "100" | "150" => StatusClass::Authorized,
        "110" | "301" | "302" | "303" => StatusClass::Denied,
        other => match other.parse::<u16>() {
            Ok(201..=999) => StatusClass::Rejected,
            _ => StatusClass::Other,
        },
    }
}

/// Verdict on one document, read from a `protNFe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolReply {
    Authorized {
        stamp: ProtocolStamp,
        protocol_xml: String,
    },
    Denied {
        stamp: ProtocolStamp,
        protocol_xml: String,
    },
    Rejected {
        code: String,
        reason: String,
    },
    Unknown {
        code: Option<String>,
        reason: Option<String>,
        raw: String,
    },
}

impl ProtocolReply {
    /// Final outcome for `signed`. An authorization whose protocol does not
    /// match the transmitted document is not trusted.
    pub fn into_outcome(self, signed: &SignedInvoice) -> TransmissionOutcome {
        match self {
            ProtocolReply::Authorized {
                stamp,
                protocol_xml,
            } => {
                let code = stamp.status_code.clone();
                let reason = stamp.reason.clone();
                match AuthorizedDocument::assemble(signed, stamp, protocol_xml.clone()) {
                    Ok(document) => TransmissionOutcome::Authorized(document),
                    Err(e) => {
                        warn!("Authorization protocol refused: {e}");
                        TransmissionOutcome::UnknownStatus {
                            code: Some(code),
                            reason: Some(reason),
                            raw: protocol_xml,
                        }
                    }
                }
            }
            ProtocolReply::Denied { stamp, .. } => TransmissionOutcome::Denied {
                code: stamp.status_code.clone(),
                reason: stamp.reason.clone(),
                stamp,
            },
            ProtocolReply::Rejected { code, reason } => {
                TransmissionOutcome::Rejected { code, reason }
            }
            ProtocolReply::Unknown { code, reason, raw } => {
                TransmissionOutcome::UnknownStatus { code, reason, raw }
            }
        }
    }
}

/// Reply to `enviNFe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionReply {
    /// `104`: processed synchronously.
    Processed(ProtocolReply),
    /// `103`: poll `receipt`, no sooner than `average_wait`.
    Received {
        receipt: ReceiptNumber,
        average_wait: Option<Duration>,
    },
    /// The whole batch was refused; no document was registered.
    BatchRejected { code: String, reason: String },
    Unknown {
        code: Option<String>,
        reason: Option<String>,
        raw: String,
    },
}

/// Reply to `consReciNFe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptReply {
    /// `105`
    Processing { average_wait: Option<Duration> },
    Processed(ProtocolReply),
    BatchRejected { code: String, reason: String },
    Unknown {
        code: Option<String>,
        reason: Option<String>,
        raw: String,
    },
}

/// Reply to `consSitNFe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentStatus {
    Authorized {
        stamp: ProtocolStamp,
        protocol_xml: String,
    },
    Denied {
        stamp: ProtocolStamp,
    },
    /// Authorized and later cancelled (`101`, `135`, `155`).
    Cancelled { code: String, reason: String },
    /// `217`: the authority has no record of the key.
    NotFound { reason: String },
    Rejected { code: String, reason: String },
    Unknown {
        code: Option<String>,
        reason: Option<String>,
        raw: String,
    },
}

/// Reply to `consStatServ`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub code: String,
    pub reason: String,
    pub in_operation: bool,
    pub average_wait: Option<Duration>,
    /// `dhRetorno`: expected return when the service is down.
    pub returns_at: Option<String>,
    pub observation: Option<String>,
}

pub fn interpret_submission(
    response: &str,
    access_key: &AccessKey,
) -> Result<SubmissionReply, ResponseError> {
    let payload = extract_payload(response, Service::Authorization)?;
    let reply: RetEnviNFe = decode(&payload)?;
    debug!(status = %reply.status_code, reason = %reply.reason, "Authorization reply");

    let status = reply.status_code.trim().to_string();
    Ok(match status.as_str() {
        STATUS_BATCH_RECEIVED => match reply.receipt {
            Some(receipt) => SubmissionReply::Received {
                receipt: ReceiptNumber::new(receipt.receipt.trim()),
                average_wait: seconds(receipt.average_wait.as_deref()),
            },
            None => SubmissionReply::Unknown {
                code: Some(reply.status_code),
                reason: Some("batch received without a receipt number".to_string()),
                raw: payload.to_xml(),
            },
        },
        STATUS_BATCH_PROCESSED => match reply.protocol {
            Some(protocol) => SubmissionReply::Processed(classify_protocol(
                &protocol,
                protocol_element(&payload, access_key),
                access_key,
            )),
            None => SubmissionReply::Unknown {
                code: Some(reply.status_code),
                reason: Some("batch processed without a protocol".to_string()),
                raw: payload.to_xml(),
            },
        },
        _ if classify_code(&status) == StatusClass::Rejected => SubmissionReply::BatchRejected {
            code: reply.status_code,
            reason: reply.reason,
        },
        _ => SubmissionReply::Unknown {
            code: Some(reply.status_code),
            reason: Some(reply.reason),
            raw: payload.to_xml(),
        },
    })
}

pub fn interpret_receipt(
    response: &str,
    access_key: &AccessKey,
) -> Result<ReceiptReply, ResponseError> {
    let payload = extract_payload(response, Service::ReceiptQuery)?;
    let reply: RetConsReciNFe = decode(&payload)?;
    debug!(status = %reply.status_code, reason = %reply.reason, "Receipt reply");

    let status = reply.status_code.trim().to_string();
    Ok(match status.as_str() {
        STATUS_BATCH_PROCESSING => ReceiptReply::Processing {
            average_wait: seconds(reply.average_wait.as_deref()),
        },
        STATUS_BATCH_PROCESSED => {
            let ours = reply
                .protocols
                .iter()
                .find(|protocol| protocol.info.access_key.trim() == access_key.as_str());
            match ours {
                Some(protocol) => ReceiptReply::Processed(classify_protocol(
                    protocol,
                    protocol_element(&payload, access_key),
                    access_key,
                )),
                None => ReceiptReply::Unknown {
                    code: Some(reply.status_code),
                    reason: Some(format!("batch processed without a protocol for {access_key}")),
                    raw: payload.to_xml(),
                },
            }
        }
        _ if classify_code(&status) == StatusClass::Rejected => ReceiptReply::BatchRejected {
            code: reply.status_code,
            reason: reply.reason,
        },
        _ => ReceiptReply::Unknown {
            code: Some(reply.status_code),
            reason: Some(reply.reason),
            raw: payload.to_xml(),
        },
    })
}

pub fn interpret_protocol_query(
    response: &str,
    access_key: &AccessKey,
) -> Result<DocumentStatus, ResponseError> {
    let payload = extract_payload(response, Service::ProtocolQuery)?;
    let reply: RetConsSitNFe = decode(&payload)?;
    debug!(status = %reply.status_code, reason = %reply.reason, "Protocol query reply");

    let status = reply.status_code.trim().to_string();
    if status == STATUS_DOCUMENT_NOT_FOUND {
        return Ok(DocumentStatus::NotFound {
            reason: reply.reason,
        });
    }
    if matches!(status.as_str(), "101" | "135" | "155") {
        return Ok(DocumentStatus::Cancelled {
            code: reply.status_code,
            reason: reply.reason,
        });
    }

    let unknown = |reason: String| DocumentStatus::Unknown {
        code: Some(reply.status_code.clone()),
        reason: Some(reason),
        raw: payload.to_xml(),
    };

    Ok(match classify_code(&status) {
        StatusClass::Authorized | StatusClass::Denied => match &reply.protocol {
            Some(protocol) => {
                match classify_protocol(protocol, protocol_element(&payload, access_key), access_key)
                {
                    ProtocolReply::Authorized {
                        stamp,
                        protocol_xml,
                    } => DocumentStatus::Authorized {
                        stamp,
                        protocol_xml,
                    },
                    ProtocolReply::Denied { stamp, .. } => DocumentStatus::Denied { stamp },
                    ProtocolReply::Rejected { code, reason } => {
                        DocumentStatus::Rejected { code, reason }
                    }
                    ProtocolReply::Unknown { code, reason, raw } => {
                        DocumentStatus::Unknown { code, reason, raw }
                    }
                }
            }
            None => unknown(format!("{} without a protocol", reply.reason)),
        },
        StatusClass::Rejected => DocumentStatus::Rejected {
            code: reply.status_code.clone(),
            reason: reply.reason.clone(),
        },
        StatusClass::Other => unknown(reply.reason.clone()),
    })
}

pub fn interpret_status(response: &str) -> Result<ServiceStatus, ResponseError> {
    let payload = extract_payload(response, Service::StatusService)?;
    let reply: RetConsStatServ = decode(&payload)?;

    Ok(ServiceStatus {
        in_operation: reply.status_code.trim() == STATUS_SERVICE_IN_OPERATION,
        average_wait: seconds(reply.average_wait.as_deref()),
        code: reply.status_code,
        reason: reply.reason,
        returns_at: reply.returns_at,
        observation: reply.observation,
    })
}

/// Classify one `protNFe`. `element` is the same protocol as found in the
/// reply tree; its canonical form is what gets archived.
pub fn classify_protocol(
    protocol: &ProtNFe,
    element: Option<&Element>,
    access_key: &AccessKey,
) -> ProtocolReply {
    let info = &protocol.info;
    let raw = element.map(protocol_xml).unwrap_or_default();
    let unknown = |reason: String| ProtocolReply::Unknown {
        code: Some(info.status_code.clone()),
        reason: Some(reason),
        raw: raw.clone(),
    };

    let key: AccessKey = match info.access_key.trim().parse() {
        Ok(key) => key,
        Err(_) => return unknown(format!("protocol carries an invalid key: {}", info.reason)),
    };
    if &key != access_key {
        return unknown(format!("protocol is for {key}, expected {access_key}"));
    }

    let stamp = || ProtocolStamp {
        access_key: key.clone(),
        protocol_number: non_empty(&info.protocol_number),
        received_at: non_empty(&info.received_at),
        digest_value: non_empty(&info.digest_value),
        application_version: non_empty(&info.application_version),
        status_code: info.status_code.trim().to_string(),
        reason: info.reason.clone(),
    };

    match classify_code(&info.status_code) {
        StatusClass::Authorized if element.is_some() => ProtocolReply::Authorized {
            stamp: stamp(),
            protocol_xml: raw.clone(),
        },
        StatusClass::Authorized => unknown("protocol element could not be located".to_string()),
        StatusClass::Denied => ProtocolReply::Denied {
            stamp: stamp(),
            protocol_xml: raw.clone(),
        },
        StatusClass::Rejected => ProtocolReply::Rejected {
            code: info.status_code.trim().to_string(),
            reason: info.reason.clone(),
        },
        StatusClass::Other => unknown(info.reason.clone()),
    }
}

/// `protNFe` for `access_key` anywhere below `payload`.
fn protocol_element<'a>(payload: &'a Element, access_key: &AccessKey) -> Option<&'a Element> {
    fn search<'a>(element: &'a Element, key: &str, found: &mut Option<&'a Element>) {
        if found.is_some() {
            return;
        }
        if element.local_name() == "protNFe" {
            let matches = element
                .child("infProt")
                .and_then(|info| info.child_text("chNFe"))
                .map_or(false, |text| text.trim() == key);
            if matches {
                *found = Some(element);
            }
            return;
        }
        for child in element.child_elements() {
            search(child, key, found);
        }
    }

    let mut found = None;
    search(payload, access_key.as_str(), &mut found);
    found
}

/// Canonical `protNFe`, prefixes removed so that it can sit inside `nfeProc`
/// under the default namespace.
fn protocol_xml(element: &Element) -> String {
    element.without_prefixes().to_xml()
}

fn decode<T: DeserializeOwned>(payload: &Element) -> Result<T, ResponseError> {
    quick_xml::de::from_str(&payload.without_prefixes().to_xml())
        .map_err(|e| ResponseError::Schema(format!("{}: {e}", payload.local_name())))
}

fn seconds(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
