//! The 44-digit access key (`chave de acesso`) that identifies an NF-e.
//!
//! Layout, left to right:
//!
//! | field  | digits | meaning                          |
//! |--------|--------|----------------------------------|
//! | cUF    | 2      | IBGE code of the issuer's state  |
//! | AAMM   | 4      | year and month of emission       |
//! | CNPJ   | 14     | issuer                           |
//! | mod    | 2      | document model (55)              |
//! | serie  | 3      | series                           |
//! | nNF    | 9      | invoice number                   |
//! | tpEmis | 1      | emission type                    |
//! | cNF    | 8      | random numeric code              |
//! | cDV    | 1      | modulo-11 check digit            |

use rand::{CryptoRng, Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use time::OffsetDateTime;

use crate::{
    constants::DOCUMENT_ID_PREFIX,
    tax_id::Cnpj,
    types::{InvoiceSeries, Uf},
    ValidationError,
};

pub const ACCESS_KEY_LEN: usize = 44;
const NONCE_LIMIT: u32 = 100_000_000;

/// Everything the key is derived from except the random code.
#[derive(Debug, Clone)]
pub struct AccessKeyParams<'a> {
    pub uf: Uf,
    pub issued_at: OffsetDateTime,
    pub issuer: &'a Cnpj,
    pub model: u8,
    pub series: InvoiceSeries,
    pub emission_type: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccessKey(String);

impl AccessKey {
    /// Derive a key with a fresh random code drawn from `rng`. The code is
    /// never equal to the invoice number, which the authority refuses.
    pub fn generate(
        params: &AccessKeyParams<'_>,
        rng: &mut (impl CryptoRng + RngCore),
    ) -> Result<Self, ValidationError> {
        let number = params.series.number();
        let nonce = loop {
            let candidate = rng.gen_range(0..NONCE_LIMIT);
            if candidate != number {
                break candidate;
            }
        };
        Self::compose(params, nonce)
    }

    /// Derive a key with an explicit random code.
    pub fn compose(params: &AccessKeyParams<'_>, nonce: u32) -> Result<Self, ValidationError> {
        if nonce >= NONCE_LIMIT {
            return Err(ValidationError::field("cNF", "must have at most 8 digits"));
        }
        if nonce == params.series.number() {
            return Err(ValidationError::field(
                "cNF",
                "must differ from the invoice number",
            ));
        }
        if params.model > 99 {
            return Err(ValidationError::field("mod", "must have 2 digits"));
        }
        if !(1..=9).contains(&params.emission_type) {
            return Err(ValidationError::field("tpEmis", "must be 1-9"));
        }

        let body = format!(
            "{:02}{:02}{:02}{}{:02}{:03}{:09}{}{:08}",
            params.uf.ibge_code(),
            params.issued_at.year() % 100,
            u8::from(params.issued_at.month()),
            params.issuer.as_str(),
            params.model,
            params.series.series(),
            params.series.number(),
            params.emission_type,
            nonce,
        );
        debug_assert_eq!(body.len(), ACCESS_KEY_LEN - 1);

        let digit = check_digit(&body);
        Ok(AccessKey(format!("{body}{digit}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value of the `Id` attribute of `infNFe`.
    pub fn document_id(&self) -> String {
        format!("{DOCUMENT_ID_PREFIX}{}", self.0)
    }

    /// Random numeric code (`cNF`).
    pub fn nonce(&self) -> &str {
        &self.0[35..43]
    }

    /// Check digit (`cDV`).
    pub fn check_digit(&self) -> u8 {
        self.0.as_bytes()[43] - b'0'
    }

    pub fn uf_code(&self) -> &str {
        &self.0[..2]
    }

    pub fn issuer_cnpj(&self) -> &str {
        &self.0[6..20]
    }

    pub fn series(&self) -> &str {
        &self.0[22..25]
    }

    pub fn number(&self) -> &str {
        &self.0[25..34]
    }
}

/// Modulo-11 check digit over `digits`, with weights 2 through 9 applied
/// cyclically starting from the rightmost digit. Remainders 0 and 1 map to
/// digit 0.
pub fn check_digit(digits: &str) -> u8 {
    let sum: u32 = digits
        .bytes()
        .rev()
        .zip((2..=9).cycle())
        .map(|(digit, weight)| u32::from(digit - b'0') * weight)
        .sum();
    match sum % 11 {
        0 | 1 => 0,
        remainder => (11 - remainder) as u8,
    }
}

impl FromStr for AccessKey {
    type Err = ValidationError;

    /// Accepts a key with or without the `NFe` prefix used in `Id`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches(DOCUMENT_ID_PREFIX);
        if digits.len() != ACCESS_KEY_LEN || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ValidationError::InvalidAccessKey(format!(
                "{s:?} is not 44 digits"
            )));
        }

        let expected = check_digit(&digits[..ACCESS_KEY_LEN - 1]);
        if digits.as_bytes()[ACCESS_KEY_LEN - 1] - b'0' != expected {
            return Err(ValidationError::InvalidAccessKey(format!(
                "{s:?} has a wrong check digit"
            )));
        }

        Ok(AccessKey(digits.to_string()))
    }
}

impl TryFrom<String> for AccessKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AccessKey> for String {
    fn from(key: AccessKey) -> Self {
        key.0
    }
}

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
