//! Serde shapes of the authority's `ret*` messages. Only the fields the
//! emitter acts on are declared; anything else in a reply is ignored, but a
//! missing mandatory field fails the decode.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RetEnviNFe {
    #[serde(rename = "tpAmb")]
    pub environment: String,
    #[serde(rename = "verAplic", default)]
    pub application_version: Option<String>,
    #[serde(rename = "cStat")]
    pub status_code: String,
    #[serde(rename = "xMotivo")]
    pub reason: String,
    #[serde(rename = "dhRecbto", default)]
    pub received_at: Option<String>,
    #[serde(rename = "infRec", default)]
    pub receipt: Option<InfRec>,
    #[serde(rename = "protNFe", default)]
    pub protocol: Option<ProtNFe>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfRec {
    #[serde(rename = "nRec")]
    pub receipt: String,
    /// Average processing time in seconds.
    #[serde(rename = "tMed", default)]
    pub average_wait: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetConsReciNFe {
    #[serde(rename = "tpAmb")]
    pub environment: String,
    #[serde(rename = "nRec", default)]
    pub receipt: Option<String>,
    #[serde(rename = "cStat")]
    pub status_code: String,
    #[serde(rename = "xMotivo")]
    pub reason: String,
    #[serde(rename = "tMed", default)]
    pub average_wait: Option<String>,
    #[serde(rename = "protNFe", default)]
    pub protocols: Vec<ProtNFe>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtNFe {
    #[serde(rename = "@versao", default)]
    pub version: Option<String>,
    #[serde(rename = "infProt")]
    pub info: InfProt,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfProt {
    #[serde(rename = "tpAmb")]
    pub environment: String,
    #[serde(rename = "verAplic", default)]
    pub application_version: Option<String>,
    #[serde(rename = "chNFe")]
    pub access_key: String,
    #[serde(rename = "dhRecbto", default)]
    pub received_at: Option<String>,
    #[serde(rename = "nProt", default)]
    pub protocol_number: Option<String>,
    #[serde(rename = "digVal", default)]
    pub digest_value: Option<String>,
    #[serde(rename = "cStat")]
    pub status_code: String,
    #[serde(rename = "xMotivo")]
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetConsSitNFe {
    #[serde(rename = "tpAmb")]
    pub environment: String,
    #[serde(rename = "cStat")]
    pub status_code: String,
    #[serde(rename = "xMotivo")]
    pub reason: String,
    #[serde(rename = "chNFe", default)]
    pub access_key: Option<String>,
    #[serde(rename = "protNFe", default)]
    pub protocol: Option<ProtNFe>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetConsStatServ {
    #[serde(rename = "tpAmb")]
    pub environment: String,
    #[serde(rename = "verAplic", default)]
    pub application_version: Option<String>,
    #[serde(rename = "cStat")]
    pub status_code: String,
    #[serde(rename = "xMotivo")]
    pub reason: String,
    #[serde(rename = "cUF", default)]
    pub uf: Option<String>,
    #[serde(rename = "dhRecbto", default)]
    pub received_at: Option<String>,
    #[serde(rename = "tMed", default)]
    pub average_wait: Option<String>,
    #[serde(rename = "dhRetorno", default)]
    pub returns_at: Option<String>,
    #[serde(rename = "xObs", default)]
    pub observation: Option<String>,
}
