//! Security Identifier Types
//!
//! Bond identifiers as they appear in worksheet rows. The market-data
//! service keys every stream by FIGI, so CUSIP and ISIN identifiers are
//! resolved to a [`Figi`] before a subscription key is formed.
//!
//! # Formats
//!
//! - **FIGI**: 12 characters, upper-case alphanumeric, `G` in third position
//!   (e.g. `BBG000BLNNH6`)
//! - **CUSIP**: 9 characters, upper-case alphanumeric (e.g. `912828YK0`)
//! - **ISIN**: 2-letter country code, 9 alphanumerics, 1 check digit
//!   (e.g. `US912828YK04`)

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

/// Identifier validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    /// The cell was empty or whitespace only.
    #[error("identifier is empty")]
    Empty,

    /// The value does not match the identifier format.
    #[error("malformed {kind} identifier: {value}")]
    Malformed {
        /// Identifier type the value was checked against.
        kind: IdentifierType,
        /// The offending value (normalised).
        value: String,
    },
}

// =============================================================================
// Identifier Type
// =============================================================================

/// Identifier scheme configured for a worksheet's identifier column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierType {
    /// Financial Instrument Global Identifier.
    Figi,
    /// Committee on Uniform Securities Identification Procedures number.
    Cusip,
    /// International Securities Identification Number.
    Isin,
}

impl IdentifierType {
    /// All identifier types, in configuration lookup order.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Figi, Self::Cusip, Self::Isin]
    }

    /// Lower-case wire/configuration name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Figi => "figi",
            Self::Cusip => "cusip",
            Self::Isin => "isin",
        }
    }

    /// Check whether a normalised value matches this scheme's format.
    #[must_use]
    pub fn matches_format(&self, value: &str) -> bool {
        let bytes = value.as_bytes();
        let upper_alnum = |b: &u8| b.is_ascii_uppercase() || b.is_ascii_digit();

        match self {
            Self::Figi => bytes.len() == 12 && bytes.iter().all(upper_alnum) && bytes[2] == b'G',
            Self::Cusip => bytes.len() == 9 && bytes.iter().all(upper_alnum),
            Self::Isin => {
                bytes.len() == 12
                    && bytes[..2].iter().all(u8::is_ascii_uppercase)
                    && bytes[2..11].iter().all(upper_alnum)
                    && bytes[11].is_ascii_digit()
            }
        }
    }
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Figi => "FIGI",
            Self::Cusip => "CUSIP",
            Self::Isin => "ISIN",
        })
    }
}

// =============================================================================
// Identifier
// =============================================================================

/// A validated, upper-cased security identifier tagged with its scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier {
    kind: IdentifierType,
    value: String,
}

impl Identifier {
    /// Validate a raw cell value against the given scheme.
    ///
    /// The value is trimmed and upper-cased before the format check.
    ///
    /// # Errors
    ///
    /// Returns [`IdentifierError`] if the value is empty or malformed.
    pub fn parse(kind: IdentifierType, raw: &str) -> Result<Self, IdentifierError> {
        let value = raw.trim().to_uppercase();
        if value.is_empty() {
            return Err(IdentifierError::Empty);
        }
        if !kind.matches_format(&value) {
            return Err(IdentifierError::Malformed { kind, value });
        }
        Ok(Self { kind, value })
    }

    /// The identifier scheme.
    #[must_use]
    pub const fn kind(&self) -> IdentifierType {
        self.kind
    }

    /// The normalised identifier value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// The FIGI, when this identifier already is one.
    #[must_use]
    pub fn as_figi(&self) -> Option<Figi> {
        (self.kind == IdentifierType::Figi).then(|| Figi(self.value.clone()))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.kind, self.value)
    }
}

// =============================================================================
// FIGI
// =============================================================================

/// A FIGI, the instrument identity used on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Figi(String);

impl Figi {
    /// Parse and validate a FIGI.
    ///
    /// # Errors
    ///
    /// Returns [`IdentifierError`] if the value is empty or malformed.
    pub fn parse(raw: &str) -> Result<Self, IdentifierError> {
        Identifier::parse(IdentifierType::Figi, raw).map(|id| Self(id.value))
    }

    /// The FIGI string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Figi {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Figi> for String {
    fn from(figi: Figi) -> Self {
        figi.0
    }
}

impl fmt::Display for Figi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(IdentifierType::Figi, "BBG000BLNNH6" ; "figi")]
    #[test_case(IdentifierType::Figi, " bbg000blnnh6 " ; "figi lower case padded")]
    #[test_case(IdentifierType::Cusip, "912828YK0" ; "cusip")]
    #[test_case(IdentifierType::Isin, "US912828YK04" ; "isin")]
    fn accepts_well_formed(kind: IdentifierType, raw: &str) {
        let id = Identifier::parse(kind, raw).unwrap();
        assert_eq!(id.kind(), kind);
        assert_eq!(id.value(), raw.trim().to_uppercase());
    }

    #[test_case(IdentifierType::Figi, "BBX000BLNNH6" ; "figi without G")]
    #[test_case(IdentifierType::Figi, "BBG000BLNNH" ; "figi too short")]
    #[test_case(IdentifierType::Cusip, "912828YK" ; "cusip too short")]
    #[test_case(IdentifierType::Cusip, "912828-K0" ; "cusip punctuation")]
    #[test_case(IdentifierType::Isin, "1S912828YK04" ; "isin numeric country")]
    #[test_case(IdentifierType::Isin, "US912828YK0X" ; "isin letter check digit")]
    fn rejects_malformed(kind: IdentifierType, raw: &str) {
        let err = Identifier::parse(kind, raw).unwrap_err();
        assert!(matches!(err, IdentifierError::Malformed { .. }));
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(
            Identifier::parse(IdentifierType::Cusip, "   "),
            Err(IdentifierError::Empty)
        );
    }

    #[test]
    fn only_figi_identifiers_convert_directly() {
        let figi = Identifier::parse(IdentifierType::Figi, "BBG000BLNNH6").unwrap();
        let cusip = Identifier::parse(IdentifierType::Cusip, "912828YK0").unwrap();

        assert_eq!(figi.as_figi().unwrap().as_str(), "BBG000BLNNH6");
        assert!(cusip.as_figi().is_none());
    }

    #[test]
    fn figi_serde_validates() {
        let figi: Figi = serde_json::from_str("\"BBG000BLNNH6\"").unwrap();
        assert_eq!(figi.to_string(), "BBG000BLNNH6");
        assert!(serde_json::from_str::<Figi>("\"nope\"").is_err());
    }
}
