//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `WorkbookHost`: Spreadsheet host (cell reads/writes, status, notices)
//! - `QuoteStreamPort`: Connection task for the market-data stream
//! - `ConfigStore`: Persistence for worksheet column mappings
//! - `IdentifierResolver`: CUSIP/ISIN → FIGI lookup

mod config_store_port;
mod identifier_port;
mod quote_stream_port;
mod workbook_port;

#[cfg(test)]
pub use config_store_port::MockConfigStore;
pub use config_store_port::{ConfigStore, StoreError, WorkbookConfig};
pub use identifier_port::{FigiOnlyResolver, IdentifierResolver};
pub use quote_stream_port::{
    Credentials, QuoteStreamPort, StreamChannels, StreamEvent, SubscriptionAction,
    SubscriptionCommand,
};
#[cfg(test)]
pub use workbook_port::MockWorkbookHost;
pub use workbook_port::{CellWrite, HostError, Notice, WorkbookHost};
