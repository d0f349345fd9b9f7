//! Configuration Store Adapters
//!
//! [`ConfigStore`] implementations: a JSON file on disk for the binary and
//! an in-memory map for tests and embedding hosts that persist elsewhere.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::application::ports::{ConfigStore, StoreError, WorkbookConfig};

// =============================================================================
// JSON File Store
// =============================================================================

/// Persists worksheet configuration as one JSON document.
#[derive(Debug, Clone)]
pub struct JsonFileConfigStore {
    path: PathBuf,
}

impl JsonFileConfigStore {
    /// Store backed by `path`. The file need not exist yet.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl ConfigStore for JsonFileConfigStore {
    fn load(&self) -> Result<WorkbookConfig, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "No stored configuration");
                return Ok(WorkbookConfig::new());
            }
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(WorkbookConfig::new());
        }
        let config: WorkbookConfig = serde_json::from_str(&raw)?;
        tracing::debug!(
            path = %self.path.display(),
            sheets = config.len(),
            "Loaded stored configuration"
        );
        Ok(config)
    }

    fn save(&mut self, config: &WorkbookConfig) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(config)?;
        let staging = self.staging_path();
        fs::write(&staging, json)?;
        fs::rename(&staging, &self.path)?;
        tracing::debug!(
            path = %self.path.display(),
            sheets = config.len(),
            "Saved configuration"
        );
        Ok(())
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// Keeps configuration in memory only.
#[derive(Debug, Clone, Default)]
pub struct InMemoryConfigStore {
    config: WorkbookConfig,
    saves: usize,
}

impl InMemoryConfigStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with existing configuration.
    #[must_use]
    pub const fn with_config(config: WorkbookConfig) -> Self {
        Self { config, saves: 0 }
    }

    /// Current contents.
    #[must_use]
    pub const fn config(&self) -> &WorkbookConfig {
        &self.config
    }

    /// Number of successful saves.
    #[must_use]
    pub const fn save_count(&self) -> usize {
        self.saves
    }
}

impl ConfigStore for InMemoryConfigStore {
    fn load(&self) -> Result<WorkbookConfig, StoreError> {
        Ok(self.config.clone())
    }

    fn save(&mut self, config: &WorkbookConfig) -> Result<(), StoreError> {
        self.config = config.clone();
        self.saves += 1;
        Ok(())
    }
}
