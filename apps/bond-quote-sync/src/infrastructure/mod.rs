//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Configuration loading from the environment.
pub mod config;

/// Deep MM WebSocket quote stream adapter.
pub mod deepmm;

/// CUSIP/ISIN → FIGI reference directory.
pub mod figi;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Worksheet configuration persistence.
pub mod store;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// JSON-snapshot workbook host.
pub mod workbook;
