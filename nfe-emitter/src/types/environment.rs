use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Which authority environment a document is issued in (`tpAmb`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Environment {
    Production,
    Homologation,
}

impl Environment {
    /// `tpAmb` code.
    pub fn code(self) -> u8 {
        match self {
            Environment::Production => 1,
            Environment::Homologation => 2,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "1" => Some(Environment::Production),
            "2" => Some(Environment::Homologation),
            _ => None,
        }
    }
}

/// Brazilian federative units with their IBGE codes, which appear as `cUF`
/// and as the first two digits of every access key.
#[allow(clippy::upper_case_acronyms)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[repr(u8)]
pub enum Uf {
    RO = 11,
    AC = 12,
    AM = 13,
    RR = 14,
    PA = 15,
    AP = 16,
    TO = 17,
    MA = 21,
    PI = 22,
    CE = 23,
    RN = 24,
    PB = 25,
    PE = 26,
    AL = 27,
    SE = 28,
    BA = 29,
    MG = 31,
    ES = 32,
    RJ = 33,
    SP = 35,
    PR = 41,
    SC = 42,
    RS = 43,
    MS = 50,
    MT = 51,
    GO = 52,
    DF = 53,
}

impl Uf {
    pub fn ibge_code(self) -> u8 {
        self as u8
    }

    pub fn from_ibge_code(code: u8) -> Option<Self> {
        use strum::IntoEnumIterator;
        Uf::iter().find(|uf| uf.ibge_code() == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn uf_codes_round_trip() {
        assert_eq!(Uf::BA.ibge_code(), 29);
        assert_eq!(Uf::from_str("SP").unwrap().ibge_code(), 35);
        assert_eq!(Uf::from_ibge_code(53), Some(Uf::DF));
        assert_eq!(Uf::from_ibge_code(30), None);
    }

    #[test]
    fn environment_codes() {
        assert_eq!(Environment::Homologation.code(), 2);
        assert_eq!(Environment::from_code("1"), Some(Environment::Production));
        assert_eq!(
            Environment::from_str("homologation").unwrap(),
            Environment::Homologation
        );
    }
}
