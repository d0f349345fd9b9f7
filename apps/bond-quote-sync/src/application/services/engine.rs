//! Quote Sync Engine
//!
//! The coordinator behind every host-visible operation. It owns the
//! per-worksheet configuration, the subscription routing table and the
//! current login session, and it is the only component that touches the
//! workbook.
//!
//! # Threading
//!
//! The engine runs on one thread of control. The connection task runs in
//! the background and talks to the engine only through channels:
//! subscription commands go out on an unbounded channel and stream events
//! come back on a bounded queue that [`QuoteSyncEngine::tick`] drains.
//! Worksheet edits are debounced and rescanned on a later tick.
//!
//! # Table swaps
//!
//! Rescans build a fresh [`SubscriptionTable`] and swap it in whole behind an
//! `Arc`; a dispatch always works on one complete snapshot.
//!
//! # Idle sessions
//!
//! A logged-in session with no configured worksheet has nothing to stream.
//! Clearing the last worksheet cancels the connection task (including any
//! pending connect or backoff) and leaves the session `Disconnected` with its
//! credentials kept; configuring a worksheet again starts a fresh connection.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::dispatcher::{DispatchOutcome, EventDispatcher};
use crate::application::ports::{
    CellWrite, ConfigStore, Credentials, HostError, IdentifierResolver, Notice, QuoteStreamPort,
    StoreError, StreamChannels, StreamEvent, SubscriptionAction, SubscriptionCommand,
    WorkbookConfig, WorkbookHost,
};
use crate::domain::session::{ConnectionSession, ConnectionState, ConnectionStatus, SessionId};
use crate::domain::subscription::{SheetContext, SubscriptionChanges, SubscriptionTable, build};
use crate::domain::worksheet::{
    CellRef, CellValue, ColumnMapping, ConfigurationError, RegionColumns, WorksheetConfig,
    output_headers, parse_rows,
};
use crate::infrastructure::metrics::{self, DropReason};

// =============================================================================
// Configuration and Errors
// =============================================================================

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Quiet period after an edit before the worksheet is rescanned.
    pub edit_debounce: Duration,
    /// Capacity of the stream event queue.
    pub event_queue_capacity: usize,
    /// Interval between ticks in [`QuoteSyncEngine::run`].
    pub tick_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            edit_debounce: Duration::from_secs(1),
            event_queue_capacity: 4096,
            tick_interval: Duration::from_millis(100),
        }
    }
}

/// Engine operation failures.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The host has no worksheet by that name.
    #[error("worksheet not found: {0}")]
    UnknownSheet(String),

    /// The worksheet has no saved configuration.
    #[error("worksheet not configured: {0}")]
    NotConfigured(String),

    /// The column mapping is unusable.
    #[error("configuration error on {sheet}: {source}")]
    Configuration {
        /// Worksheet.
        sheet: String,
        /// Validation failure.
        #[source]
        source: ConfigurationError,
    },

    /// Configuration could not be persisted or loaded.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A session is already active.
    #[error("already logged in")]
    AlreadyLoggedIn,
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Worksheets rescanned.
    pub rescanned: usize,
    /// Stream events processed.
    pub events: usize,
    /// Cells written.
    pub cells_written: usize,
}

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug)]
struct SheetState {
    config: WorksheetConfig,
    mapping: Option<ColumnMapping>,
    table: SubscriptionTable,
}

impl SheetState {
    fn new(config: WorksheetConfig) -> Self {
        let mapping = config.resolve().ok();
        Self {
            config,
            mapping,
            table: SubscriptionTable::new(),
        }
    }
}

#[derive(Debug)]
struct ActiveSession {
    session: ConnectionSession,
    credentials: Credentials,
    cancel: CancellationToken,
    commands: mpsc::UnboundedSender<SubscriptionCommand>,
    events: mpsc::Receiver<StreamEvent>,
    task: JoinHandle<()>,
    failure_notified: bool,
    /// Connection task stopped because no worksheet is configured.
    idle: bool,
}

impl ActiveSession {
    fn send(&self, changes: SubscriptionChanges) {
        let generation = self.session.generation();
        for (action, keys) in [
            (SubscriptionAction::Unsubscribe, changes.unsubscribe),
            (SubscriptionAction::Subscribe, changes.subscribe),
        ] {
            if keys.is_empty() {
                continue;
            }
            tracing::debug!(
                session = self.session.id(),
                generation,
                ?action,
                count = keys.len(),
                "Sending subscription batch"
            );
            let command = SubscriptionCommand {
                generation,
                action,
                keys: keys.into_iter().collect(),
            };
            if self.commands.send(command).is_err() {
                tracing::warn!(session = self.session.id(), "Connection task gone, batch dropped");
            }
        }
    }
}

/// Whether the drain loop should keep going after an event.
enum Flow {
    Continue,
    SessionEnded,
}

// =============================================================================
// Engine
// =============================================================================

/// Coordinator for worksheet configuration, subscriptions and dispatch.
pub struct QuoteSyncEngine {
    host: Box<dyn WorkbookHost>,
    store: Box<dyn ConfigStore>,
    resolver: Arc<dyn IdentifierResolver>,
    stream: Arc<dyn QuoteStreamPort>,
    config: EngineConfig,
    dispatcher: EventDispatcher,
    sheets: BTreeMap<String, SheetState>,
    table: RwLock<Arc<SubscriptionTable>>,
    pending_rescans: HashMap<String, Instant>,
    active: Option<ActiveSession>,
    next_session_id: SessionId,
    status: ConnectionStatus,
}

impl std::fmt::Debug for QuoteSyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuoteSyncEngine")
            .field("sheets", &self.sheets.keys().collect::<Vec<_>>())
            .field("keys", &self.table.read().len())
            .field("session", &self.active.as_ref().map(|a| a.session.id()))
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl QuoteSyncEngine {
    /// Create an engine with no configuration loaded and no session.
    #[must_use]
    pub fn new(
        host: Box<dyn WorkbookHost>,
        store: Box<dyn ConfigStore>,
        resolver: Arc<dyn IdentifierResolver>,
        stream: Arc<dyn QuoteStreamPort>,
        config: EngineConfig,
    ) -> Self {
        Self {
            host,
            store,
            resolver,
            stream,
            config,
            dispatcher: EventDispatcher::new(),
            sheets: BTreeMap::new(),
            table: RwLock::new(Arc::new(SubscriptionTable::new())),
            pending_rescans: HashMap::new(),
            active: None,
            next_session_id: 1,
            status: ConnectionStatus::Disconnected,
        }
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    /// Load persisted worksheet configuration and scan every configured sheet.
    ///
    /// Sheets whose mapping is invalid are reported with a notice and left
    /// inactive; other sheets are unaffected.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the store cannot be read.
    pub fn load_configuration(&mut self) -> Result<usize, EngineError> {
        let persisted = self.store.load()?;
        tracing::info!(sheets = persisted.len(), "Loaded worksheet configuration");

        self.sheets = persisted
            .into_iter()
            .map(|(sheet, config)| (sheet, SheetState::new(config)))
            .collect();

        let names: Vec<String> = self.sheets.keys().cloned().collect();
        for sheet in &names {
            self.report_invalid_mapping(sheet);
            self.write_headers(sheet);
            self.rescan_sheet(sheet);
        }
        self.rebuild_table();
        self.fit_session_to_sheets();
        self.sync_subscriptions();
        Ok(names.len())
    }

    /// Save a worksheet's column mapping and start streaming its rows.
    ///
    /// # Errors
    ///
    /// - [`EngineError::UnknownSheet`] if the host has no such worksheet
    /// - [`EngineError::Configuration`] if the mapping is invalid (a notice is
    ///   also raised)
    /// - [`EngineError::Store`] if persisting fails
    pub fn configure_worksheet(
        &mut self,
        sheet: &str,
        config: WorksheetConfig,
    ) -> Result<ColumnMapping, EngineError> {
        if !self.host.has_sheet(sheet) {
            return Err(EngineError::UnknownSheet(sheet.to_string()));
        }

        let mapping = match config.resolve() {
            Ok(mapping) => mapping,
            Err(source) => {
                tracing::warn!(sheet, error = %source, "Rejected worksheet configuration");
                self.host.notify(Notice::ConfigurationError {
                    sheet: sheet.to_string(),
                    message: source.to_string(),
                });
                return Err(EngineError::Configuration {
                    sheet: sheet.to_string(),
                    source,
                });
            }
        };

        self.persist_with(sheet, Some(&config))?;
        self.sheets
            .insert(sheet.to_string(), SheetState::new(config));
        tracing::info!(
            sheet,
            identifier = %mapping.identifier_type,
            first_row = mapping.first_row,
            output = %mapping.output,
            "Worksheet configured"
        );

        self.pending_rescans.remove(sheet);
        self.write_headers(sheet);
        self.rescan_sheet(sheet);
        self.rebuild_table();
        self.fit_session_to_sheets();
        self.sync_subscriptions();
        Ok(mapping)
    }

    /// Remove a worksheet's configuration.
    ///
    /// Queued quote events are flushed without being written, and the
    /// worksheet's keys are unsubscribed if no other worksheet wants them.
    /// Clearing the last configured worksheet also stops the connection
    /// task, cancelling any connect attempt or backoff in flight.
    ///
    /// Nothing changes unless the store accepts the new configuration.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotConfigured`] if the worksheet had no configuration
    /// - [`EngineError::Store`] if persisting fails
    pub fn clear_configuration(&mut self, sheet: &str) -> Result<(), EngineError> {
        if !self.sheets.contains_key(sheet) {
            return Err(EngineError::NotConfigured(sheet.to_string()));
        }
        self.persist_with(sheet, None)?;
        self.sheets.remove(sheet);
        self.pending_rescans.remove(sheet);
        tracing::info!(sheet, "Worksheet configuration cleared");

        self.rebuild_table();
        self.flush_events();
        self.sync_subscriptions();
        self.fit_session_to_sheets();
        Ok(())
    }

    /// Start tracking a worksheet the host just added or opened.
    ///
    /// Returns `true` if a saved configuration exists for it and it was
    /// scanned.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownSheet`] if the host has no such worksheet.
    pub fn add_worksheet(&mut self, sheet: &str) -> Result<bool, EngineError> {
        if !self.host.has_sheet(sheet) {
            return Err(EngineError::UnknownSheet(sheet.to_string()));
        }
        if !self.sheets.contains_key(sheet) {
            tracing::debug!(sheet, "Worksheet added without configuration");
            return Ok(false);
        }

        self.report_invalid_mapping(sheet);
        self.write_headers(sheet);
        self.rescan_sheet(sheet);
        self.rebuild_table();
        self.sync_subscriptions();
        Ok(true)
    }

    /// A cell changed on the host.
    ///
    /// Edits inside a configured input region schedule a debounced rescan of
    /// that worksheet. Returns whether a rescan was scheduled.
    pub fn on_cell_change(&mut self, sheet: &str, cell: CellRef) -> bool {
        self.on_cell_change_at(sheet, cell, Instant::now())
    }

    /// [`Self::on_cell_change`] with an explicit clock.
    pub fn on_cell_change_at(&mut self, sheet: &str, cell: CellRef, now: Instant) -> bool {
        let covered = self
            .sheets
            .get(sheet)
            .and_then(|state| state.mapping)
            .is_some_and(|mapping| mapping.covers(cell));
        if covered {
            self.pending_rescans
                .insert(sheet.to_string(), now + self.config.edit_debounce);
        }
        covered
    }

    // -------------------------------------------------------------------------
    // Session
    // -------------------------------------------------------------------------

    /// Start a login session and its connection task.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyLoggedIn`] if a session is active.
    pub fn login(&mut self, credentials: Credentials) -> Result<SessionId, EngineError> {
        if self.active.is_some() {
            return Err(EngineError::AlreadyLoggedIn);
        }

        tracing::info!(email = credentials.email(), "Logging in");
        Ok(self.start_session(credentials))
    }

    /// End the session: cancel the connection task, flush queued events and
    /// forget live subscriptions. No-op without a session.
    pub fn logout(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };

        active.cancel.cancel();
        active.events.close();
        let mut flushed = 0u64;
        while let Ok(event) = active.events.try_recv() {
            if matches!(event, StreamEvent::Quote(_)) {
                flushed += 1;
            }
        }
        if flushed > 0 {
            metrics::record_dropped(DropReason::Flushed, flushed);
        }

        if let Err(e) = active.session.transition(ConnectionState::LoggedOut) {
            tracing::warn!(error = %e, "Unexpected state at logout");
        }
        tracing::info!(session = active.session.id(), flushed, "Logged out");

        metrics::set_connection_state(ConnectionState::LoggedOut.gauge_value());
        metrics::set_live_subscriptions(0);
        self.set_status(ConnectionStatus::Disconnected);
    }

    // -------------------------------------------------------------------------
    // Tick
    // -------------------------------------------------------------------------

    /// Run due rescans and drain the event queue.
    pub fn tick(&mut self) -> TickReport {
        self.tick_at(Instant::now())
    }

    /// [`Self::tick`] with an explicit clock.
    pub fn tick_at(&mut self, now: Instant) -> TickReport {
        let started = Instant::now();
        let mut report = TickReport::default();

        let due: Vec<String> = self
            .pending_rescans
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(sheet, _)| sheet.clone())
            .collect();
        if !due.is_empty() {
            for sheet in &due {
                self.pending_rescans.remove(sheet);
                self.rescan_sheet(sheet);
            }
            self.rebuild_table();
            self.sync_subscriptions();
            report.rescanned = due.len();
        }

        for _ in 0..self.config.event_queue_capacity.max(1) {
            let Some(active) = self.active.as_mut() else {
                break;
            };
            let Ok(event) = active.events.try_recv() else {
                break;
            };
            report.events += 1;

            let (flow, outcome) = self.handle_event(event);
            report.cells_written += outcome.written;
            if matches!(flow, Flow::SessionEnded) {
                break;
            }
        }

        metrics::record_tick_duration(started.elapsed());
        report
    }

    /// Tick on an interval until `cancel` fires.
    pub async fn run(&mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Engine loop stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.tick();
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Current routing table snapshot.
    #[must_use]
    pub fn table_snapshot(&self) -> Arc<SubscriptionTable> {
        Arc::clone(&self.table.read())
    }

    /// Connection state of the active session.
    #[must_use]
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.active.as_ref().map(|a| a.session.state())
    }

    /// Last status pushed to the host.
    #[must_use]
    pub const fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Number of acknowledged subscriptions on the active session.
    #[must_use]
    pub fn live_subscription_count(&self) -> usize {
        self.active
            .as_ref()
            .map_or(0, |a| a.session.ledger().live_count())
    }

    /// Connection generation of the active session.
    #[must_use]
    pub fn generation(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.session.generation())
    }

    /// Names of configured worksheets.
    #[must_use]
    pub fn configured_sheets(&self) -> Vec<String> {
        self.sheets.keys().cloned().collect()
    }

    /// Whether the connection task of the active session has exited.
    #[must_use]
    pub fn connection_task_finished(&self) -> Option<bool> {
        self.active.as_ref().map(|a| a.task.is_finished())
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn start_session(&mut self, credentials: Credentials) -> SessionId {
        let id = self.next_session_id;
        self.next_session_id += 1;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(self.config.event_queue_capacity.max(1));
        let cancel = CancellationToken::new();

        let task = self.stream.start(
            id,
            credentials.clone(),
            StreamChannels {
                commands: command_rx,
                events: event_tx,
            },
            cancel.clone(),
        );
        tracing::debug!(session = id, "Connection task started");

        self.active = Some(ActiveSession {
            session: ConnectionSession::new(id),
            credentials,
            cancel,
            commands: command_tx,
            events: event_rx,
            task,
            failure_notified: false,
            idle: false,
        });
        id
    }

    /// Stop the connection task when no worksheet is configured and start a
    /// new one once a worksheet is.
    fn fit_session_to_sheets(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        match (self.sheets.is_empty(), active.idle) {
            (true, false) => {
                active.cancel.cancel();
                active.events.close();
                let mut flushed = 0u64;
                while let Ok(event) = active.events.try_recv() {
                    if matches!(event, StreamEvent::Quote(_)) {
                        flushed += 1;
                    }
                }
                if flushed > 0 {
                    metrics::record_dropped(DropReason::Flushed, flushed);
                }

                if let Err(e) = active.session.transition(ConnectionState::Disconnected) {
                    tracing::warn!(error = %e, "Unexpected state when going idle");
                }
                active.session.ledger_mut().clear();
                active.idle = true;
                tracing::info!(
                    session = active.session.id(),
                    "No configured worksheets, connection stopped"
                );

                metrics::set_connection_state(ConnectionState::Disconnected.gauge_value());
                metrics::set_live_subscriptions(0);
                self.set_status(ConnectionStatus::Disconnected);
            }
            (false, true) => {
                let credentials = active.credentials.clone();
                let previous = active.session.id();
                let id = self.start_session(credentials);
                tracing::info!(previous, session = id, "Worksheet configured, reconnecting");
            }
            _ => {}
        }
    }

    /// Label the output block above the first data row. Best effort.
    fn write_headers(&mut self, sheet: &str) {
        let Some(mapping) = self.sheets.get(sheet).and_then(|s| s.mapping) else {
            return;
        };
        let Some(row) = mapping.header_row() else {
            return;
        };

        for (offset, header) in (0u32..).zip(output_headers()) {
            let Some(cell) = mapping.output_cell(row).right(offset) else {
                break;
            };
            let write = CellWrite {
                value: CellValue::Text(header),
                timestamp: None,
                number_format: None,
            };
            if let Err(e) = self.host.write_cell(sheet, cell, write) {
                tracing::warn!(sheet, cell = %cell, error = %e, "Header write failed");
                return;
            }
        }
    }

    fn handle_event(&mut self, event: StreamEvent) -> (Flow, DispatchOutcome) {
        let mut outcome = DispatchOutcome::default();
        let Some(active) = self.active.as_mut() else {
            return (Flow::SessionEnded, outcome);
        };

        match event {
            StreamEvent::State(state) => {
                if state == ConnectionState::Reconnecting {
                    metrics::record_reconnect();
                }
                if let Err(e) = active.session.transition(state) {
                    tracing::warn!(error = %e, "Ignoring state change");
                }
                metrics::set_connection_state(active.session.state().gauge_value());
                let status = active.session.state().status();
                self.set_status(status);
            }

            StreamEvent::SessionReady { token, generation } => {
                if let Err(e) = active.session.authenticated(token, generation) {
                    tracing::warn!(error = %e, "Session ready in unexpected state");
                    return (Flow::Continue, outcome);
                }
                active.failure_notified = false;

                let table = Arc::clone(&self.table.read());
                let changes = active.session.ledger_mut().session_ready(table.keys());
                tracing::info!(
                    session = active.session.id(),
                    generation,
                    keys = changes.subscribe.len(),
                    "Session ready, resubscribing"
                );
                active.send(changes);

                metrics::set_connection_state(ConnectionState::Connected.gauge_value());
                self.set_status(ConnectionStatus::Connected);
            }

            StreamEvent::Subscribed { keys } => {
                let orphans = active.session.ledger_mut().on_subscribed(&keys);
                if !orphans.is_empty() && active.session.is_connected() {
                    tracing::debug!(count = orphans.len(), "Unsubscribing keys no longer wanted");
                    active.send(SubscriptionChanges::unsubscribe_only(orphans));
                }
                metrics::set_live_subscriptions(active.session.ledger().live_count());
            }

            StreamEvent::Rejected { keys, reason } => {
                let removed = active.session.ledger_mut().on_rejected(&keys);
                tracing::warn!(count = keys.len(), removed, reason = %reason, "Subscription rejected");
                metrics::record_protocol_error("nack");
            }

            StreamEvent::Unsubscribed { keys } => {
                tracing::debug!(count = keys.len(), "Unsubscribe acknowledged");
            }

            StreamEvent::Quote(update) => {
                metrics::record_quote_received();
                active.session.record_heartbeat(Instant::now());
                let table = Arc::clone(&self.table.read());
                outcome = self
                    .dispatcher
                    .dispatch(&table, &update, self.host.as_mut());
            }

            StreamEvent::Heartbeat => {
                active.session.record_heartbeat(Instant::now());
            }

            StreamEvent::AuthRejected { reason } => {
                tracing::error!(session = active.session.id(), reason = %reason, "Authentication rejected");
                if let Err(e) = active.session.transition(ConnectionState::Disconnected) {
                    tracing::warn!(error = %e, "Unexpected state at auth rejection");
                }
                active.cancel.cancel();
                self.active = None;
                self.host.notify(Notice::AuthRejected { reason });
                metrics::set_connection_state(ConnectionState::Disconnected.gauge_value());
                metrics::set_live_subscriptions(0);
                self.set_status(ConnectionStatus::Disconnected);
                return (Flow::SessionEnded, outcome);
            }

            StreamEvent::PersistentFailure { attempts } => {
                if !active.failure_notified {
                    active.failure_notified = true;
                    tracing::error!(attempts, "Connection keeps failing, still retrying");
                    self.host
                        .notify(Notice::PersistentConnectionFailure { attempts });
                }
            }

            StreamEvent::ProtocolError { message } => {
                tracing::warn!(message = %message, "Protocol error");
                metrics::record_protocol_error("decode");
            }
        }

        (Flow::Continue, outcome)
    }

    /// Drop queued quotes; apply queued control events so session state
    /// stays consistent.
    fn flush_events(&mut self) {
        let mut flushed = 0u64;
        loop {
            let Some(active) = self.active.as_mut() else {
                break;
            };
            let Ok(event) = active.events.try_recv() else {
                break;
            };
            if matches!(event, StreamEvent::Quote(_)) {
                flushed += 1;
                continue;
            }
            if matches!(self.handle_event(event).0, Flow::SessionEnded) {
                break;
            }
        }
        if flushed > 0 {
            tracing::debug!(flushed, "Flushed queued quotes");
            metrics::record_dropped(DropReason::Flushed, flushed);
        }
    }

    fn sync_subscriptions(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if !active.session.is_connected() {
            return;
        }

        let table = Arc::clone(&self.table.read());
        let changes = active.session.ledger_mut().reconcile(table.keys());
        if changes.is_empty() {
            return;
        }
        tracing::info!(
            subscribe = changes.subscribe.len(),
            unsubscribe = changes.unsubscribe.len(),
            "Reconciling subscriptions"
        );
        active.send(changes);
    }

    fn rebuild_table(&self) {
        let merged = SubscriptionTable::merged(self.sheets.values().map(|s| &s.table));
        tracing::debug!(
            keys = merged.len(),
            destinations = merged.destination_count(),
            "Routing table rebuilt"
        );
        *self.table.write() = Arc::new(merged);
    }

    fn rescan_sheet(&mut self, sheet: &str) {
        let Some(mapping) = self.sheets.get(sheet).and_then(|s| s.mapping) else {
            return;
        };

        let table = match read_region(self.host.as_ref(), sheet, &mapping) {
            Ok(region) => {
                let outcome = parse_rows(&mapping, &region);
                let resolver = Arc::clone(&self.resolver);
                let built = build(
                    &outcome.requests,
                    SheetContext {
                        sheet,
                        mapping: &mapping,
                    },
                    |id| resolver.resolve(id),
                );

                let skipped = outcome.rejected.len() + built.unresolved.len();
                if skipped > 0 {
                    metrics::record_rows_rejected(skipped as u64);
                    self.host.notify(Notice::RowsSkipped {
                        sheet: sheet.to_string(),
                        count: skipped,
                    });
                }
                tracing::info!(
                    sheet,
                    rows = outcome.requests.len(),
                    skipped,
                    keys = built.table.len(),
                    "Worksheet scanned"
                );
                built.table
            }
            Err(e) => {
                tracing::warn!(sheet, error = %e, "Worksheet unavailable, no subscriptions");
                SubscriptionTable::new()
            }
        };

        if let Some(state) = self.sheets.get_mut(sheet) {
            state.table = table;
        }
    }

    fn report_invalid_mapping(&mut self, sheet: &str) {
        let Some(state) = self.sheets.get(sheet) else {
            return;
        };
        if let Err(e) = state.config.resolve() {
            tracing::warn!(sheet, error = %e, "Saved configuration is invalid");
            self.host.notify(Notice::ConfigurationError {
                sheet: sheet.to_string(),
                message: e.to_string(),
            });
        }
    }

    /// Save the configuration as it would be with `sheet` set to `config`
    /// (or removed). In-memory state is untouched.
    fn persist_with(
        &mut self,
        sheet: &str,
        config: Option<&WorksheetConfig>,
    ) -> Result<(), StoreError> {
        let mut snapshot: WorkbookConfig = self
            .sheets
            .iter()
            .map(|(sheet, state)| (sheet.clone(), state.config.clone()))
            .collect();
        match config {
            Some(config) => snapshot.insert(sheet.to_string(), config.clone()),
            None => snapshot.remove(sheet),
        };
        self.store.save(&snapshot)
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            tracing::info!(%status, "Connection status");
            self.status = status;
            self.host.set_connection_status(status);
        }
    }
}

impl Drop for QuoteSyncEngine {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.cancel.cancel();
        }
    }
}

fn read_region(
    host: &dyn WorkbookHost,
    sheet: &str,
    mapping: &ColumnMapping,
) -> Result<RegionColumns, HostError> {
    let last_row = host.used_row_count(sheet)?;
    if last_row < mapping.first_row {
        return Ok(RegionColumns::default());
    }

    let read = |column| host.read_column(sheet, column, mapping.first_row, last_row);
    Ok(RegionColumns {
        identifier: read(mapping.identifier)?,
        side: read(mapping.side)?,
        quantity: read(mapping.quantity)?,
        label: read(mapping.label)?,
        ats: read(mapping.ats)?,
    })
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::application::ports::{FigiOnlyResolver, MockConfigStore, MockWorkbookHost};
    use crate::domain::instrument::Figi;
    use crate::domain::quote::{Ats, Quantity, QuoteLabel, Side};
    use crate::domain::session::SessionToken;
    use crate::domain::subscription::SubscriptionKey;
    use crate::domain::worksheet::{ColumnRef, InputParameters};

    #[derive(Default)]
    struct CapturingStream {
        channels: Mutex<Option<StreamChannels>>,
        started: Mutex<Vec<(SessionId, CancellationToken)>>,
    }

    impl QuoteStreamPort for CapturingStream {
        fn start(
            &self,
            session: SessionId,
            _credentials: Credentials,
            channels: StreamChannels,
            cancel: CancellationToken,
        ) -> JoinHandle<()> {
            *self.channels.lock() = Some(channels);
            self.started.lock().push((session, cancel.clone()));
            tokio::spawn(async move { cancel.cancelled().await })
        }
    }

    fn figi_config() -> WorksheetConfig {
        WorksheetConfig {
            input_parameters: InputParameters {
                figi: Some("A".into()),
                side: Some("B".into()),
                quantity: Some("C".into()),
                rfq_label: Some("D".into()),
                ats: Some("E".into()),
                ..InputParameters::default()
            },
            ..WorksheetConfig::default()
        }
    }

    fn empty_sheet_host() -> MockWorkbookHost {
        let mut host = MockWorkbookHost::new();
        host.expect_has_sheet().returning(|sheet| sheet == "Quotes");
        host.expect_used_row_count().returning(|_| Ok(1));
        host.expect_set_connection_status().returning(|_| ());
        host.expect_write_cell().returning(|_, _, _| Ok(()));
        host
    }

    fn failing_store() -> MockConfigStore {
        let mut store = MockConfigStore::new();
        let mut saves = 0;
        store.expect_save().returning(move |_| {
            saves += 1;
            if saves == 1 {
                Ok(())
            } else {
                Err(StoreError::Io(std::io::Error::other("disk full")))
            }
        });
        store
    }

    fn sorted_keys(table: &SubscriptionTable) -> Vec<SubscriptionKey> {
        let mut keys: Vec<SubscriptionKey> = table.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn one_row_host() -> MockWorkbookHost {
        let mut host = MockWorkbookHost::new();
        host.expect_has_sheet().returning(|_| true);
        host.expect_used_row_count().returning(|_| Ok(2));
        host.expect_read_column()
            .returning(|_, column, _, _| {
                let value = match column.letters().as_str() {
                    "A" => CellValue::Text("BBG000BLNNH6".into()),
                    "B" => CellValue::Text("bid".into()),
                    "C" => CellValue::Number(1_000_000.0),
                    "D" => CellValue::Text("price".into()),
                    _ => CellValue::Text("N".into()),
                };
                Ok(vec![value])
            });
        host.expect_set_connection_status().returning(|_| ());
        host.expect_write_cell().returning(|_, _, _| Ok(()));
        host
    }

    fn saving_store() -> MockConfigStore {
        let mut store = MockConfigStore::new();
        store.expect_save().returning(|_| Ok(()));
        store
    }

    fn engine(
        host: MockWorkbookHost,
        store: MockConfigStore,
        stream: Arc<CapturingStream>,
    ) -> QuoteSyncEngine {
        QuoteSyncEngine::new(
            Box::new(host),
            Box::new(store),
            Arc::new(FigiOnlyResolver),
            stream,
            EngineConfig::default(),
        )
    }

    fn key() -> SubscriptionKey {
        SubscriptionKey {
            figi: Figi::parse("BBG000BLNNH6").unwrap(),
            side: Side::Bid,
            quantity: Quantity::new(1_000_000).unwrap(),
            label: QuoteLabel::Price,
            ats: Ats::No,
        }
    }

    #[test]
    fn configure_unknown_sheet_is_rejected_without_saving() {
        let mut store = MockConfigStore::new();
        store.expect_save().times(0);
        let mut engine = engine(empty_sheet_host(), store, Arc::default());

        let result = engine.configure_worksheet("Missing", figi_config());

        assert!(matches!(result, Err(EngineError::UnknownSheet(name)) if name == "Missing"));
        assert!(engine.configured_sheets().is_empty());
    }

    #[test]
    fn invalid_mapping_raises_a_notice() {
        let mut host = empty_sheet_host();
        host.expect_notify()
            .times(1)
            .withf(|notice| matches!(notice, Notice::ConfigurationError { sheet, .. } if sheet == "Quotes"))
            .returning(|_| ());
        let mut store = MockConfigStore::new();
        store.expect_save().times(0);
        let mut engine = engine(host, store, Arc::default());

        let mut config = figi_config();
        config.input_parameters.cusip = Some("F".into());
        let result = engine.configure_worksheet("Quotes", config);

        assert!(matches!(
            result,
            Err(EngineError::Configuration {
                source: ConfigurationError::AmbiguousIdentifier(_),
                ..
            })
        ));
    }

    #[test]
    fn configure_persists_the_whole_workbook() {
        let mut store = MockConfigStore::new();
        store
            .expect_save()
            .times(1)
            .withf(|saved| saved.len() == 1 && saved.contains_key("Quotes"))
            .returning(|_| Ok(()));
        let mut engine = engine(empty_sheet_host(), store, Arc::default());

        let mapping = engine.configure_worksheet("Quotes", figi_config()).unwrap();

        assert_eq!(mapping.output, ColumnRef::parse("G").unwrap());
        assert_eq!(engine.configured_sheets(), vec!["Quotes".to_string()]);
    }

    #[test]
    fn edits_outside_the_input_region_are_ignored() {
        let mut engine = engine(empty_sheet_host(), saving_store(), Arc::default());
        engine.configure_worksheet("Quotes", figi_config()).unwrap();

        let output_cell = CellRef::new(5, ColumnRef::parse("G").unwrap());
        let header_cell = CellRef::new(1, ColumnRef::parse("A").unwrap());
        let input_cell = CellRef::new(5, ColumnRef::parse("C").unwrap());

        assert!(!engine.on_cell_change("Quotes", output_cell));
        assert!(!engine.on_cell_change("Quotes", header_cell));
        assert!(!engine.on_cell_change("Other", input_cell));
        assert!(engine.on_cell_change("Quotes", input_cell));
    }

    #[test]
    fn rescans_wait_for_the_debounce_window() {
        let mut engine = engine(empty_sheet_host(), saving_store(), Arc::default());
        engine.configure_worksheet("Quotes", figi_config()).unwrap();

        let edited = Instant::now();
        let cell = CellRef::new(3, ColumnRef::parse("A").unwrap());
        assert!(engine.on_cell_change_at("Quotes", cell, edited));

        let early = engine.tick_at(edited + Duration::from_millis(500));
        assert_eq!(early.rescanned, 0);

        // A second edit pushes the deadline out.
        engine.on_cell_change_at("Quotes", cell, edited + Duration::from_millis(900));
        let still_early = engine.tick_at(edited + Duration::from_millis(1_500));
        assert_eq!(still_early.rescanned, 0);

        let due = engine.tick_at(edited + Duration::from_millis(1_900));
        assert_eq!(due.rescanned, 1);

        let idle = engine.tick_at(edited + Duration::from_secs(5));
        assert_eq!(idle.rescanned, 0);
    }

    #[test]
    fn clearing_an_unconfigured_sheet_fails() {
        let mut engine = engine(empty_sheet_host(), saving_store(), Arc::default());
        assert!(matches!(
            engine.clear_configuration("Quotes"),
            Err(EngineError::NotConfigured(_))
        ));
    }

    #[test]
    fn load_configuration_reports_invalid_sheets() {
        let mut store = MockConfigStore::new();
        store.expect_load().returning(|| {
            let mut broken = figi_config();
            broken.input_parameters.side = None;
            Ok(WorkbookConfig::from([
                ("Quotes".to_string(), figi_config()),
                ("Broken".to_string(), broken),
            ]))
        });
        let mut host = empty_sheet_host();
        host.expect_notify()
            .times(1)
            .withf(|notice| matches!(notice, Notice::ConfigurationError { sheet, .. } if sheet == "Broken"))
            .returning(|_| ());
        let mut engine = engine(host, store, Arc::default());

        assert_eq!(engine.load_configuration().unwrap(), 2);
        assert_eq!(engine.configured_sheets().len(), 2);
    }

    #[tokio::test]
    async fn second_login_is_rejected() {
        let stream = Arc::new(CapturingStream::default());
        let mut engine = engine(empty_sheet_host(), saving_store(), Arc::clone(&stream));

        let first = engine
            .login(Credentials::new("a@b.c".into(), "pw".into()))
            .unwrap();
        let second = engine.login(Credentials::new("a@b.c".into(), "pw".into()));

        assert_eq!(first, 1);
        assert!(matches!(second, Err(EngineError::AlreadyLoggedIn)));
        assert_eq!(engine.connection_state(), Some(ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn orphaned_acks_are_unsubscribed() {
        let stream = Arc::new(CapturingStream::default());
        let mut engine = engine(empty_sheet_host(), saving_store(), Arc::clone(&stream));
        engine
            .login(Credentials::new("a@b.c".into(), "pw".into()))
            .unwrap();
        let mut channels = stream.channels.lock().take().unwrap();

        for event in [
            StreamEvent::State(ConnectionState::Connecting),
            StreamEvent::State(ConnectionState::Authenticating),
            StreamEvent::SessionReady {
                token: SessionToken::new("t".into()),
                generation: 1,
            },
            StreamEvent::Subscribed { keys: vec![key()] },
        ] {
            channels.events.send(event).await.unwrap();
        }
        let report = engine.tick();

        assert_eq!(report.events, 4);
        assert_eq!(engine.status(), ConnectionStatus::Connected);
        let command = channels.commands.try_recv().unwrap();
        assert_eq!(command.action, SubscriptionAction::Unsubscribe);
        assert_eq!(command.generation, 1);
        assert_eq!(command.keys, vec![key()]);
        assert_eq!(engine.live_subscription_count(), 0);
    }

    #[tokio::test]
    async fn auth_rejection_ends_the_session() {
        let stream = Arc::new(CapturingStream::default());
        let mut host = empty_sheet_host();
        host.expect_notify()
            .times(1)
            .withf(|notice| matches!(notice, Notice::AuthRejected { .. }))
            .returning(|_| ());
        let mut engine = engine(host, saving_store(), Arc::clone(&stream));
        engine
            .login(Credentials::new("a@b.c".into(), "bad".into()))
            .unwrap();
        let channels = stream.channels.lock().take().unwrap();

        channels
            .events
            .send(StreamEvent::State(ConnectionState::Connecting))
            .await
            .unwrap();
        channels
            .events
            .send(StreamEvent::AuthRejected {
                reason: "invalid credentials".into(),
            })
            .await
            .unwrap();
        engine.tick();

        assert_eq!(engine.connection_state(), None);
        assert_eq!(engine.status(), ConnectionStatus::Disconnected);
        assert!(engine.login(Credentials::new("a@b.c".into(), "good".into())).is_ok());
    }

    #[tokio::test]
    async fn persistent_failure_notifies_once() {
        let stream = Arc::new(CapturingStream::default());
        let mut host = empty_sheet_host();
        host.expect_notify()
            .times(1)
            .withf(|notice| matches!(notice, Notice::PersistentConnectionFailure { attempts: 5 }))
            .returning(|_| ());
        let mut engine = engine(host, saving_store(), Arc::clone(&stream));
        engine
            .login(Credentials::new("a@b.c".into(), "pw".into()))
            .unwrap();
        let channels = stream.channels.lock().take().unwrap();

        for attempts in [5, 6, 7] {
            channels
                .events
                .send(StreamEvent::PersistentFailure { attempts })
                .await
                .unwrap();
        }
        engine.tick();
    }

    #[test]
    fn configure_labels_the_output_block() {
        let mut host = MockWorkbookHost::new();
        host.expect_has_sheet().returning(|_| true);
        host.expect_used_row_count().returning(|_| Ok(1));
        host.expect_write_cell()
            .times(1)
            .withf(|sheet, cell, write| {
                sheet == "Quotes"
                    && cell.to_string() == "G1"
                    && write.value == CellValue::Text("Inference".into())
            })
            .returning(|_, _, _| Ok(()));
        host.expect_write_cell()
            .times(19)
            .withf(|_, cell, write| {
                let level = cell.column.index() - ColumnRef::parse("G").unwrap().index();
                cell.row == 1 && write.value == CellValue::Text(format!("{}%", level * 5))
            })
            .returning(|_, _, _| Ok(()));
        let mut engine = engine(host, saving_store(), Arc::default());

        engine.configure_worksheet("Quotes", figi_config()).unwrap();
    }

    #[test]
    fn rejected_save_leaves_configuration_untouched() {
        let mut engine = engine(one_row_host(), failing_store(), Arc::default());
        engine.configure_worksheet("Quotes", figi_config()).unwrap();
        let before = sorted_keys(&engine.table_snapshot());
        assert_eq!(before, vec![key()]);

        let cleared = engine.clear_configuration("Quotes");
        assert!(matches!(cleared, Err(EngineError::Store(_))));
        assert_eq!(engine.configured_sheets(), vec!["Quotes".to_string()]);
        assert_eq!(sorted_keys(&engine.table_snapshot()), before);

        let mut moved = figi_config();
        moved.output_column = Some("K".into());
        let reconfigured = engine.configure_worksheet("Other", moved);
        assert!(matches!(reconfigured, Err(EngineError::Store(_))));
        assert_eq!(engine.configured_sheets(), vec!["Quotes".to_string()]);
        assert_eq!(sorted_keys(&engine.table_snapshot()), before);

        // Edits still reach the surviving mapping.
        let input = CellRef::new(2, ColumnRef::parse("A").unwrap());
        assert!(engine.on_cell_change("Quotes", input));
        assert!(!engine.on_cell_change("Other", input));
    }

    #[tokio::test]
    async fn rejected_clear_keeps_live_subscriptions() {
        let stream = Arc::new(CapturingStream::default());
        let mut engine = engine(one_row_host(), failing_store(), Arc::clone(&stream));
        engine.configure_worksheet("Quotes", figi_config()).unwrap();
        engine
            .login(Credentials::new("a@b.c".into(), "pw".into()))
            .unwrap();
        let mut channels = stream.channels.lock().take().unwrap();

        for event in [
            StreamEvent::State(ConnectionState::Connecting),
            StreamEvent::State(ConnectionState::Authenticating),
            StreamEvent::SessionReady {
                token: SessionToken::new("t".into()),
                generation: 1,
            },
            StreamEvent::Subscribed { keys: vec![key()] },
        ] {
            channels.events.send(event).await.unwrap();
        }
        engine.tick();
        let subscribe = channels.commands.try_recv().unwrap();
        assert_eq!(subscribe.action, SubscriptionAction::Subscribe);

        assert!(engine.clear_configuration("Quotes").is_err());

        assert!(channels.commands.try_recv().is_err());
        assert_eq!(engine.live_subscription_count(), 1);
        assert_eq!(engine.connection_state(), Some(ConnectionState::Connected));
    }

    #[tokio::test]
    async fn clearing_the_last_sheet_stops_connecting() {
        let stream = Arc::new(CapturingStream::default());
        let mut engine = engine(empty_sheet_host(), saving_store(), Arc::clone(&stream));
        engine.configure_worksheet("Quotes", figi_config()).unwrap();
        engine
            .login(Credentials::new("a@b.c".into(), "pw".into()))
            .unwrap();
        let channels = stream.channels.lock().take().unwrap();

        // Mid-backoff: the first attempt failed and a retry is pending.
        for state in [ConnectionState::Connecting, ConnectionState::Reconnecting] {
            channels.events.send(StreamEvent::State(state)).await.unwrap();
        }
        engine.tick();
        assert_eq!(engine.connection_state(), Some(ConnectionState::Reconnecting));

        engine.clear_configuration("Quotes").unwrap();

        let (first, cancel) = stream.started.lock()[0].clone();
        assert_eq!(first, 1);
        assert!(cancel.is_cancelled());
        assert_eq!(engine.connection_state(), Some(ConnectionState::Disconnected));
        assert_eq!(engine.status(), ConnectionStatus::Disconnected);

        // Further ticks leave it idle.
        engine.tick();
        assert_eq!(stream.started.lock().len(), 1);

        // Configuring again starts a fresh connection with the kept credentials.
        engine.configure_worksheet("Quotes", figi_config()).unwrap();
        let started = stream.started.lock().clone();
        assert_eq!(started.len(), 2);
        assert_eq!(started[1].0, 2);
        assert!(!started[1].1.is_cancelled());
        assert!(stream.channels.lock().is_some());
        assert!(matches!(
            engine.login(Credentials::new("a@b.c".into(), "pw".into())),
            Err(EngineError::AlreadyLoggedIn)
        ));
    }

    #[tokio::test]
    async fn clearing_one_of_two_sheets_keeps_the_connection() {
        let stream = Arc::new(CapturingStream::default());
        let mut engine = engine(one_row_host(), saving_store(), Arc::clone(&stream));
        engine.configure_worksheet("Quotes", figi_config()).unwrap();
        engine.configure_worksheet("Archive", figi_config()).unwrap();
        engine
            .login(Credentials::new("a@b.c".into(), "pw".into()))
            .unwrap();

        engine.clear_configuration("Archive").unwrap();

        let started = stream.started.lock().clone();
        assert_eq!(started.len(), 1);
        assert!(!started[0].1.is_cancelled());
        assert_eq!(engine.connection_state(), Some(ConnectionState::Disconnected));
        assert_eq!(sorted_keys(&engine.table_snapshot()), vec![key()]);
    }
}
