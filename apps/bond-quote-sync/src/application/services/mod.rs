//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `QuoteSyncEngine`: Worksheet configuration, subscriptions, session
//!   lifecycle and the event drain loop
//! - `EventDispatcher`: Routes quote updates to destination cells

mod dispatcher;
mod engine;

pub use dispatcher::{DispatchOutcome, EventDispatcher};
pub use engine::{EngineConfig, EngineError, QuoteSyncEngine, TickReport};
