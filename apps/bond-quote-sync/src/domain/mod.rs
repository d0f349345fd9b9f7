//! Domain Layer - Core quote-sync types and business rules.
//!
//! Pure types with no I/O: identifiers, quote requests and updates,
//! worksheet layout and row parsing, subscription keys and routing, and the
//! connection session state machine.

/// Security identifiers (FIGI, CUSIP, ISIN).
pub mod instrument;

/// Quote requests, inbound quote updates and their enumerations.
pub mod quote;

/// Connection session state machine.
pub mod session;

/// Subscription keys, routing table and live ledger.
pub mod subscription;

/// Column mapping, cell addressing and the row parser.
pub mod worksheet;
