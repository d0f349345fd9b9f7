#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Bond Quote Sync - Live Spreadsheet Quote Engine
//!
//! Streams bond quotes from the Deep MM market-data service into
//! spreadsheet cells. Each configured worksheet row names an instrument,
//! side, quantity, quote label and ATS flag; the engine subscribes to the
//! matching streams and writes every update to the row's output cell.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure types and rules
//!   - `instrument`: FIGI/CUSIP/ISIN identifiers
//!   - `quote`: Quote requests, updates and their enumerations
//!   - `worksheet`: Column mapping, cell addressing, row parsing
//!   - `subscription`: Subscription keys, routing table, live ledger
//!   - `session`: Connection state machine
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Workbook host, quote stream, config store, identifier resolver
//!   - `services`: The engine coordinator and event dispatcher
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `deepmm`: WebSocket client (auth, heartbeat, reconnect, codec)
//!   - `workbook`: JSON-snapshot workbook host
//!   - `store`: Configuration persistence
//!   - `figi`: Identifier directory
//!   - `config`, `metrics`, `telemetry`: Ambient services
//!
//! # Data Flow
//!
//! ```text
//! edit / login ─► row parser ─► key builder ─► ledger diff ─► subscribe/unsubscribe
//!                                                                   │
//! cell writes ◄── dispatcher ◄── event queue (drained on tick) ◄── Deep MM WS
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core quote-sync types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::instrument::{Figi, Identifier, IdentifierType};
pub use domain::quote::{Ats, Quantity, QuoteLabel, QuoteUpdate, Side};
pub use domain::session::{ConnectionState, ConnectionStatus, SessionId};
pub use domain::subscription::{Destination, SubscriptionKey, SubscriptionTable};
pub use domain::worksheet::{CellRef, CellValue, ColumnRef, InputParameters, WorksheetConfig};

// Ports
pub use application::ports::{
    CellWrite, ConfigStore, Credentials, HostError, IdentifierResolver, Notice, QuoteStreamPort,
    WorkbookHost,
};

// Engine
pub use application::services::{EngineConfig, EngineError, QuoteSyncEngine, TickReport};

// Infrastructure config
pub use infrastructure::config::{ConfigError, SyncConfig};

// Adapters
pub use infrastructure::deepmm::{DeepMmStreamConnector, StreamClientConfig};
pub use infrastructure::figi::FigiDirectory;
pub use infrastructure::store::{InMemoryConfigStore, JsonFileConfigStore};
pub use infrastructure::workbook::InMemoryWorkbook;

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
