//! Configuration Store Port (Driven Port)
//!
//! Persistence for per-worksheet column mappings. The stored document is a
//! JSON object keyed by worksheet name:
//!
//! ```json
//! {"Sheet1": {"input_parameters": {"figi": "A", "side": "B", "quantity": "C",
//!             "rfq_label": "D", "ats": "E"}}}
//! ```

use std::collections::BTreeMap;

use crate::domain::worksheet::WorksheetConfig;

/// Worksheet name → configuration.
pub type WorkbookConfig = BTreeMap<String, WorksheetConfig>;

/// Configuration persistence failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Reading or writing the backing file failed.
    #[error("Configuration store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stored document is not valid configuration JSON.
    #[error("Configuration store JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Port for loading and saving worksheet configuration.
#[cfg_attr(test, mockall::automock)]
pub trait ConfigStore: Send {
    /// Load every persisted worksheet configuration.
    ///
    /// A store that has never been written returns an empty map.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backing store cannot be read or parsed.
    fn load(&self) -> Result<WorkbookConfig, StoreError>;

    /// Replace the persisted configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backing store cannot be written.
    fn save(&mut self, config: &WorkbookConfig) -> Result<(), StoreError>;
}
