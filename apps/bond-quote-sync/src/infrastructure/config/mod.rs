//! Configuration Module
//!
//! Configuration loading for the quote sync service.

mod settings;

pub use settings::{
    ConfigError, DEFAULT_CONFIG_PATH, EngineSettings, StorageSettings, StreamSettings,
    SyncConfig,
};
