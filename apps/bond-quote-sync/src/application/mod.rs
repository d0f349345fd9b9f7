//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (workbook host, quote stream, etc.).
pub mod ports;

/// Application services for worksheet sync and quote dispatch.
pub mod services;
