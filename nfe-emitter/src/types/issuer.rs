//! Issuer identity and the per-issuer defaults used when building documents.
//! All of these come from configuration.

use serde::{Deserialize, Serialize};

use crate::{tax_id::Cnpj, types::Uf, ValidationError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct IssuerProfile {
    pub cnpj: Cnpj,
    pub legal_name: String,
    pub trade_name: Option<String>,
    /// State registration (`IE`).
    pub state_registration: String,
    pub tax_regime: TaxRegime,
    pub address: Address,
    /// Nature of the operation (`natOp`).
    #[serde(default = "default_operation_nature")]
    pub operation_nature: String,
    /// Offset applied to `dhEmi`. Most of the country is on UTC-3.
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct Address {
    pub street: String,
    pub number: String,
    pub complement: Option<String>,
    pub district: String,
    /// 7-digit IBGE municipality code.
    pub municipality_code: String,
    pub municipality: String,
    pub uf: Uf,
    pub postal_code: String,
    pub phone: Option<String>,
}

/// Code of the tax regime (`CRT`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaxRegime {
    SimplesNacional,
    SimplesNacionalExcessRevenue,
    Normal,
}

impl TaxRegime {
    pub fn code(self) -> u8 {
        match self {
            TaxRegime::SimplesNacional => 1,
            TaxRegime::SimplesNacionalExcessRevenue => 2,
            TaxRegime::Normal => 3,
        }
    }

    /// Simples Nacional issuers report ICMS with a CSOSN instead of a CST.
    pub fn uses_csosn(self) -> bool {
        matches!(self, TaxRegime::SimplesNacional)
    }
}

/// Fallbacks for product fields that sale items usually do not carry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct ProductDefaults {
    pub ncm: String,
    pub cfop: String,
    pub unit: String,
}

impl Default for ProductDefaults {
    /// Printed books, sold inside the issuer's state.
    fn default() -> Self {
        Self {
            ncm: "49019900".to_string(),
            cfop: "5102".to_string(),
            unit: "UN".to_string(),
        }
    }
}

/// Tax situation applied to every item. Only zero-rated situations are
/// supported; the default is the exempt/untaxed combination used for books.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct TaxRule {
    /// Goods origin (`orig`), 0 for domestic.
    pub origin: u8,
    pub icms_cst: String,
    pub icms_csosn: String,
    pub pis_cst: String,
    pub cofins_cst: String,
}

impl Default for TaxRule {
    fn default() -> Self {
        Self {
            origin: 0,
            icms_cst: "40".to_string(),
            icms_csosn: "102".to_string(),
            pis_cst: "07".to_string(),
            cofins_cst: "07".to_string(),
        }
    }
}

const ZERO_RATED_ICMS_CST: [&str; 3] = ["40", "41", "50"];
const ZERO_RATED_CSOSN: [&str; 4] = ["102", "103", "300", "400"];
const NON_TAXED_PIS_COFINS_CST: [&str; 6] = ["04", "05", "06", "07", "08", "09"];

impl TaxRule {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.origin > 8 {
            return Err(ValidationError::field("tax.origin", "must be 0-8"));
        }
        if !ZERO_RATED_ICMS_CST.contains(&self.icms_cst.as_str()) {
            return Err(ValidationError::field(
                "tax.icms_cst",
                format!("unsupported CST {}", self.icms_cst),
            ));
        }
        if !ZERO_RATED_CSOSN.contains(&self.icms_csosn.as_str()) {
            return Err(ValidationError::field(
                "tax.icms_csosn",
                format!("unsupported CSOSN {}", self.icms_csosn),
            ));
        }
        for (field, cst) in [
            ("tax.pis_cst", &self.pis_cst),
            ("tax.cofins_cst", &self.cofins_cst),
        ] {
            if !NON_TAXED_PIS_COFINS_CST.contains(&cst.as_str()) {
                return Err(ValidationError::field(field, format!("unsupported CST {cst}")));
            }
        }
        Ok(())
    }
}

impl IssuerProfile {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.legal_name.trim().is_empty() {
            return Err(ValidationError::field("issuer.legal_name", "is empty"));
        }
        if self.state_registration.trim().is_empty() {
            return Err(ValidationError::field(
                "issuer.state_registration",
                "is empty",
            ));
        }
        if !is_digits(&self.address.municipality_code, 7) {
            return Err(ValidationError::field(
                "issuer.address.municipality_code",
                "must have 7 digits",
            ));
        }
        if !is_digits(&self.address.postal_code, 8) {
            return Err(ValidationError::field(
                "issuer.address.postal_code",
                "must have 8 digits",
            ));
        }
        if !(-5..=-2).contains(&self.utc_offset_hours) {
            return Err(ValidationError::field(
                "issuer.utc_offset_hours",
                "must be between -5 and -2",
            ));
        }
        Ok(())
    }
}

fn is_digits(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_digit())
}

fn default_operation_nature() -> String {
    "Venda de mercadoria".to_string()
}

fn default_utc_offset_hours() -> i8 {
    -3
}
