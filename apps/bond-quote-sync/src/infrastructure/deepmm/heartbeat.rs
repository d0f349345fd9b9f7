//! Heartbeat Monitor
//!
//! Keeps the stream connection honest: a ping goes out every interval, and
//! a connection that has been silent for longer than the timeout since the
//! last ping is declared dead.
//!
//! Any inbound frame counts as traffic (pong, quote, ack or a server
//! heartbeat message).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Heartbeat timing.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// Silence tolerated after a ping.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            timeout: Duration::from_secs(40),
        }
    }
}

/// Events emitted by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping now.
    SendPing,
    /// The connection went silent.
    Timeout,
}

/// Traffic bookkeeping shared with the socket loop.
#[derive(Debug)]
pub struct HeartbeatState {
    last_traffic: RwLock<Instant>,
    ping_outstanding: AtomicBool,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Fresh state; the clock starts now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_traffic: RwLock::new(Instant::now()),
            ping_outstanding: AtomicBool::new(false),
        }
    }

    /// Any inbound frame arrived.
    pub fn record_traffic(&self) {
        *self.last_traffic.write() = Instant::now();
        self.ping_outstanding.store(false, Ordering::SeqCst);
    }

    /// A ping was written.
    pub fn mark_ping_sent(&self) {
        self.ping_outstanding.store(true, Ordering::SeqCst);
    }

    /// Whether a ping has gone unanswered.
    #[must_use]
    pub fn is_ping_outstanding(&self) -> bool {
        self.ping_outstanding.load(Ordering::SeqCst)
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn silence(&self) -> Duration {
        self.last_traffic.read().elapsed()
    }
}

/// Periodic ping/timeout driver for one connection.
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatMonitor {
    /// Create a monitor.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled or a timeout is reported.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; the socket was just opened.
        interval.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat monitor cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let event = self.evaluate();
                    if self.event_tx.send(event).await.is_err() {
                        break;
                    }
                    if event == HeartbeatEvent::Timeout {
                        break;
                    }
                }
            }
        }
    }

    fn evaluate(&self) -> HeartbeatEvent {
        let silence = self.state.silence();
        if self.state.is_ping_outstanding() && silence > self.config.timeout {
            tracing::warn!(
                silence_ms = u64::try_from(silence.as_millis()).unwrap_or(u64::MAX),
                timeout_ms = u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX),
                "Heartbeat timeout"
            );
            HeartbeatEvent::Timeout
        } else {
            HeartbeatEvent::SendPing
        }
    }
}
