//! Prometheus Metrics Module
//!
//! Exposes engine metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Quotes**: Quotes received, cells written, events dropped by reason
//! - **Rows**: Rows rejected during worksheet scans
//! - **Connection**: Connection state, reconnects, protocol errors
//! - **Subscriptions**: Live subscription count
//!
//! # Integration
//!
//! When a port is configured, metrics are served at `/metrics` by the
//! exporter's own HTTP listener.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// With a non-zero `port` the exporter's HTTP listener serves `/metrics`
/// (must be called inside a Tokio runtime) and no handle is returned. With
/// `0` the recorder is installed without a listener and the returned handle
/// renders metrics on demand. Later calls are no-ops.
///
/// # Errors
///
/// Returns [`BuildError`] if the recorder or listener cannot be installed.
pub fn init_metrics(port: u16) -> Result<Option<PrometheusHandle>, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let builder = PrometheusBuilder::new();
    let handle = if port == 0 {
        Some(builder.install_recorder()?)
    } else {
        builder
            .with_http_listener(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
            .install()?;
        None
    };

    register_metrics();
    let _ = PROMETHEUS_HANDLE.set(handle.clone());
    Ok(handle)
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized or are served by
/// the HTTP listener.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned().flatten()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Quote flow
    describe_counter!(
        "quote_sync_quotes_received_total",
        "Total quote updates received from the market-data stream"
    );
    describe_counter!(
        "quote_sync_cell_writes_total",
        "Total cells written with quote values"
    );
    describe_counter!(
        "quote_sync_events_dropped_total",
        "Total quote events or writes dropped, by reason"
    );

    // Worksheet scans
    describe_counter!(
        "quote_sync_rows_rejected_total",
        "Total worksheet rows skipped during scans"
    );

    // Connection
    describe_gauge!(
        "quote_sync_connection_state",
        "Connection state (0=disconnected 1=connecting 2=authenticating 3=connected 4=reconnecting 5=logged_out)"
    );
    describe_counter!(
        "quote_sync_reconnects_total",
        "Total reconnection attempts"
    );
    describe_counter!(
        "quote_sync_protocol_errors_total",
        "Total protocol errors by type"
    );

    // Subscriptions
    describe_gauge!(
        "quote_sync_live_subscriptions",
        "Number of acknowledged subscriptions"
    );

    // Latency
    describe_histogram!(
        "quote_sync_tick_seconds",
        "Time spent in one engine tick"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Reasons an event or write is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No destination wants the key (late event).
    NoRoute,
    /// The host could not write the cell.
    HostError,
    /// The event queue was full.
    QueueFull,
    /// Pending events flushed by logout or configuration clear.
    Flushed,
    /// Event carried no values.
    Empty,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::NoRoute => "no_route",
            Self::HostError => "host_error",
            Self::QueueFull => "queue_full",
            Self::Flushed => "flushed",
            Self::Empty => "empty",
        }
    }
}

/// Record a quote update received from the stream.
pub fn record_quote_received() {
    counter!("quote_sync_quotes_received_total").increment(1);
}

/// Record cells written.
pub fn record_cell_writes(count: u64) {
    counter!("quote_sync_cell_writes_total").increment(count);
}

/// Record dropped events or writes.
pub fn record_dropped(reason: DropReason, count: u64) {
    counter!(
        "quote_sync_events_dropped_total",
        "reason" => reason.as_str()
    )
    .increment(count);
}

/// Record rows rejected during a worksheet scan.
pub fn record_rows_rejected(count: u64) {
    counter!("quote_sync_rows_rejected_total").increment(count);
}

/// Update the connection-state gauge.
pub fn set_connection_state(value: f64) {
    gauge!("quote_sync_connection_state").set(value);
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!("quote_sync_reconnects_total").increment(1);
}

/// Record a protocol error.
pub fn record_protocol_error(error_type: &str) {
    counter!(
        "quote_sync_protocol_errors_total",
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Update the live subscription count.
#[allow(clippy::cast_precision_loss)]
pub fn set_live_subscriptions(count: usize) {
    gauge!("quote_sync_live_subscriptions").set(count as f64);
}

/// Record the duration of one engine tick.
pub fn record_tick_duration(duration: Duration) {
    histogram!("quote_sync_tick_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
