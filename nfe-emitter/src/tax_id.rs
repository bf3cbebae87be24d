//! Brazilian taxpayer identifiers (CPF for individuals, CNPJ for companies).
//!
//! Both carry two modulo-11 check digits. Values are accepted with or without
//! the usual punctuation (`123.456.789-09`, `12.345.678/0001-95`) and stored
//! as bare digits.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::ValidationError;

/// A validated 14-digit CNPJ.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cnpj(String);

/// A validated 11-digit CPF.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cpf(String);

/// Recipient identifier. Which variant is used decides the XML tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaxId {
    Cpf(Cpf),
    Cnpj(Cnpj),
}

impl Cnpj {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Cpf {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TaxId {
    /// Tag name used for this identifier inside `dest`.
    pub fn tag(&self) -> &'static str {
        match self {
            TaxId::Cpf(_) => "CPF",
            TaxId::Cnpj(_) => "CNPJ",
        }
    }

    pub fn digits(&self) -> &str {
        match self {
            TaxId::Cpf(cpf) => cpf.as_str(),
            TaxId::Cnpj(cnpj) => cnpj.as_str(),
        }
    }
}

impl FromStr for Cnpj {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = strip_punctuation(s).ok_or_else(|| ValidationError::InvalidCnpj(s.into()))?;
        if digits.len() != 14 || all_same(&digits) {
            return Err(ValidationError::InvalidCnpj(s.into()));
        }

        let values = to_values(&digits);
        let first = cnpj_digit(&values[..12]);
        let second = cnpj_digit(&values[..13]);
        if values[12] != first || values[13] != second {
            return Err(ValidationError::InvalidCnpj(s.into()));
        }

        Ok(Cnpj(digits))
    }
}

impl FromStr for Cpf {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = strip_punctuation(s).ok_or_else(|| ValidationError::InvalidCpf(s.into()))?;
        if digits.len() != 11 || all_same(&digits) {
            return Err(ValidationError::InvalidCpf(s.into()));
        }

        let values = to_values(&digits);
        let first = cpf_digit(&values[..9]);
        let second = cpf_digit(&values[..10]);
        if values[9] != first || values[10] != second {
            return Err(ValidationError::InvalidCpf(s.into()));
        }

        Ok(Cpf(digits))
    }
}

impl FromStr for TaxId {
    type Err = ValidationError;

    /// Picks CPF or CNPJ by the number of digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match strip_punctuation(s).map(|digits| digits.len()) {
            Some(11) => Ok(TaxId::Cpf(s.parse()?)),
            Some(14) => Ok(TaxId::Cnpj(s.parse()?)),
            _ => Err(ValidationError::field(
                "tax_id",
                format!("{s:?} is neither a CPF nor a CNPJ"),
            )),
        }
    }
}

impl TryFrom<String> for Cnpj {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cnpj> for String {
    fn from(cnpj: Cnpj) -> Self {
        cnpj.0
    }
}

impl TryFrom<String> for Cpf {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cpf> for String {
    fn from(cpf: Cpf) -> Self {
        cpf.0
    }
}

impl fmt::Display for Cnpj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for Cpf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn strip_punctuation(s: &str) -> Option<String> {
    let mut digits = String::with_capacity(s.len());
    for c in s.trim().chars() {
        match c {
            '0'..='9' => digits.push(c),
            '.' | '/' | '-' | ' ' => {}
            _ => return None,
        }
    }
    Some(digits)
}

fn all_same(digits: &str) -> bool {
    let bytes = digits.as_bytes();
    bytes.iter().all(|b| *b == bytes[0])
}

fn to_values(digits: &str) -> Vec<u32> {
    digits.bytes().map(|b| u32::from(b - b'0')).collect()
}

/// CNPJ weights run 2..=9 cyclically from the rightmost digit.
fn cnpj_digit(values: &[u32]) -> u32 {
    let sum: u32 = values
        .iter()
        .rev()
        .zip((2..=9).cycle())
        .map(|(value, weight)| value * weight)
        .sum();
    match sum % 11 {
        0 | 1 => 0,
        remainder => 11 - remainder,
    }
}

/// CPF weights run 2, 3, ... from the rightmost digit without wrapping.
fn cpf_digit(values: &[u32]) -> u32 {
    let sum: u32 = values
        .iter()
        .rev()
        .zip(2..)
        .map(|(value, weight)| value * weight)
        .sum();
    match (sum * 10) % 11 {
        10 => 0,
        digit => digit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_cnpj_with_and_without_punctuation() {
        let bare: Cnpj = "12345678000195".parse().unwrap();
        let formatted: Cnpj = "12.345.678/0001-95".parse().unwrap();
        assert_eq!(bare, formatted);
        assert_eq!(bare.as_str(), "12345678000195");
    }

    #[test]
    fn rejects_cnpj_with_wrong_check_digit() {
        assert!("12345678000196".parse::<Cnpj>().is_err());
        assert!("12345678000105".parse::<Cnpj>().is_err());
    }

    #[test]
    fn rejects_repeated_digits() {
        assert!("11111111111111".parse::<Cnpj>().is_err());
        assert!("00000000000".parse::<Cpf>().is_err());
    }

    #[test]
    fn accepts_valid_cpf() {
        let cpf: Cpf = "123.456.789-09".parse().unwrap();
        assert_eq!(cpf.as_str(), "12345678909");
    }

    #[test]
    fn rejects_cpf_with_wrong_check_digit() {
        assert!("12345678900".parse::<Cpf>().is_err());
        assert!("1234567890".parse::<Cpf>().is_err());
        assert!("1234567890a".parse::<Cpf>().is_err());
    }

    #[test]
    fn tax_id_picks_variant_by_length() {
        let cpf: TaxId = "12345678909".parse().unwrap();
        assert_eq!(cpf.tag(), "CPF");

        let cnpj: TaxId = "12345678000195".parse().unwrap();
        assert_eq!(cnpj.tag(), "CNPJ");
        assert_eq!(cnpj.digits(), "12345678000195");

        assert!("123".parse::<TaxId>().is_err());
    }

    #[test]
    fn cnpj_deserializes_through_validation() {
        let cnpj: Cnpj = serde_json::from_str("\"12.345.678/0001-95\"").unwrap();
        assert_eq!(cnpj.as_str(), "12345678000195");
        assert!(serde_json::from_str::<Cnpj>("\"12345678000100\"").is_err());
    }
}
