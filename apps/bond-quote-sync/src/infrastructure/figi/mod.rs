//! Bond Reference Directory
//!
//! Resolves CUSIP and ISIN identifiers to FIGI using the bond reference
//! file published alongside the market-data service: a JSON array of
//! `{"F": figi, "C": cusip, "I": isin}` entries.
//!
//! Entries without a valid FIGI are skipped. Lookups are case-insensitive.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::application::ports::IdentifierResolver;
use crate::domain::instrument::{Figi, Identifier, IdentifierType};

/// Directory load failures.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// The directory file could not be read.
    #[error("FIGI directory I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The directory is not a JSON array of entries.
    #[error("FIGI directory JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct DirectoryEntry {
    #[serde(rename = "F", default)]
    figi: Option<String>,
    #[serde(rename = "C", default)]
    cusip: Option<String>,
    #[serde(rename = "I", default)]
    isin: Option<String>,
}

/// In-memory CUSIP/ISIN → FIGI index.
#[derive(Debug, Clone, Default)]
pub struct FigiDirectory {
    by_cusip: HashMap<String, Figi>,
    by_isin: HashMap<String, Figi>,
}

impl FigiDirectory {
    /// Empty directory; only FIGI identifiers resolve.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a directory file.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, DirectoryError> {
        let raw = std::fs::read_to_string(path)?;
        let directory = Self::from_json(&raw)?;
        tracing::info!(
            path = %path.display(),
            cusips = directory.by_cusip.len(),
            isins = directory.by_isin.len(),
            "FIGI directory loaded"
        );
        Ok(directory)
    }

    /// Parse directory JSON.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Json`] if the document is not an array of
    /// entries.
    pub fn from_json(raw: &str) -> Result<Self, DirectoryError> {
        let entries: Vec<DirectoryEntry> = serde_json::from_str(raw)?;
        let mut directory = Self::new();
        let mut skipped = 0usize;

        for entry in entries {
            let Some(figi) = entry.figi.as_deref().and_then(|f| Figi::parse(f).ok()) else {
                skipped += 1;
                continue;
            };
            if let Some(cusip) = normalise(entry.cusip.as_deref()) {
                directory.by_cusip.insert(cusip, figi.clone());
            }
            if let Some(isin) = normalise(entry.isin.as_deref()) {
                directory.by_isin.insert(isin, figi);
            }
        }

        if skipped > 0 {
            tracing::debug!(skipped, "FIGI directory entries without a valid FIGI");
        }
        Ok(directory)
    }

    /// Number of identifiers indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_cusip.len() + self.by_isin.len()
    }

    /// Whether nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdentifierResolver for FigiDirectory {
    fn resolve(&self, identifier: &Identifier) -> Option<Figi> {
        let index = match identifier.kind() {
            IdentifierType::Figi => return identifier.as_figi(),
            IdentifierType::Cusip => &self.by_cusip,
            IdentifierType::Isin => &self.by_isin,
        };
        let figi = index.get(identifier.value()).cloned();
        if figi.is_none() {
            tracing::debug!(identifier = %identifier, "No FIGI for identifier");
        }
        figi
    }
}

fn normalise(raw: Option<&str>) -> Option<String> {
    raw.map(|v| v.trim().to_uppercase()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    const DIRECTORY: &str = r#"[
        {"F": "BBG000BLNNH6", "C": "912828yk0", "I": "US912828YK04"},
        {"F": "BBG00ABCDEF1", "C": "037833AK6"},
        {"F": "", "C": "000000000"},
        {"C": "111111111"}
    ]"#;

    #[test_case(IdentifierType::Cusip, "912828YK0", Some("BBG000BLNNH6") ; "cusip")]
    #[test_case(IdentifierType::Cusip, "037833ak6", Some("BBG00ABCDEF1") ; "lower case cusip")]
    #[test_case(IdentifierType::Isin, "US912828YK04", Some("BBG000BLNNH6") ; "isin")]
    #[test_case(IdentifierType::Figi, "BBG0000XXXX1", Some("BBG0000XXXX1") ; "figi passes through")]
    #[test_case(IdentifierType::Cusip, "000000000", None ; "entry without figi")]
    #[test_case(IdentifierType::Isin, "US0378331005", None ; "unknown isin")]
    fn resolves(kind: IdentifierType, raw: &str, expected: Option<&str>) {
        let directory = FigiDirectory::from_json(DIRECTORY).unwrap();
        let identifier = Identifier::parse(kind, raw).unwrap();
        assert_eq!(
            directory.resolve(&identifier).as_ref().map(Figi::as_str),
            expected
        );
    }

    #[test]
    fn counts_indexed_identifiers() {
        let directory = FigiDirectory::from_json(DIRECTORY).unwrap();
        assert_eq!(directory.len(), 3);
        assert!(FigiDirectory::new().is_empty());
    }

    #[test]
    fn rejects_non_array_documents() {
        assert!(matches!(
            FigiDirectory::from_json(r#"{"F":"BBG000BLNNH6"}"#),
            Err(DirectoryError::Json(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bond_data.json");
        std::fs::write(&path, DIRECTORY).unwrap();

        let directory = FigiDirectory::load(&path).unwrap();
        assert_eq!(directory.len(), 3);
        assert!(matches!(
            FigiDirectory::load(&dir.path().join("missing.json")),
            Err(DirectoryError::Io(_))
        ));
    }
}
