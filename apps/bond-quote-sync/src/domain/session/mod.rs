//! Connection Session
//!
//! One authenticated streaming session: its connection state machine, the
//! session token, heartbeat bookkeeping and the live subscription ledger.
//!
//! # State machine
//!
//! ```text
//! Disconnected -> Connecting -> Authenticating -> Connected
//!      ^              |               |               |
//!      |              v               v               v
//!      +-------- Reconnecting <-------+---------------+
//!
//! any state --logout--> LoggedOut (terminal)
//! ```
//!
//! Auth rejection goes `Authenticating -> Disconnected` and is not retried.

use std::fmt;
use std::time::Instant;

use thiserror::Error;

use super::subscription::ledger::SubscriptionLedger;

// =============================================================================
// Connection State
// =============================================================================

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection and no retry scheduled.
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Transport open, waiting for the server to accept credentials.
    Authenticating,
    /// Authenticated and streaming.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// Session ended by explicit logout.
    LoggedOut,
}

impl ConnectionState {
    /// Whether moving to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        use ConnectionState::{
            Authenticating, Connected, Connecting, Disconnected, LoggedOut, Reconnecting,
        };
        matches!(
            (self, next),
            (Disconnected | Reconnecting, Connecting)
                | (Connecting, Authenticating | Reconnecting | Disconnected)
                | (Authenticating, Connected | Disconnected | Reconnecting)
                | (Connected, Reconnecting | Disconnected)
                | (Reconnecting, Disconnected)
                | (
                    Disconnected | Connecting | Authenticating | Connected | Reconnecting,
                    LoggedOut
                )
        )
    }

    /// Host-facing status indicator for this state.
    #[must_use]
    pub const fn status(&self) -> ConnectionStatus {
        match self {
            Self::Connected => ConnectionStatus::Connected,
            Self::Connecting | Self::Authenticating | Self::Reconnecting => {
                ConnectionStatus::Reconnecting
            }
            Self::Disconnected | Self::LoggedOut => ConnectionStatus::Disconnected,
        }
    }

    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::LoggedOut => "logged_out",
        }
    }

    /// Numeric code for the connection-state gauge.
    #[must_use]
    pub const fn gauge_value(&self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Authenticating => 2.0,
            Self::Connected => 3.0,
            Self::Reconnecting => 4.0,
            Self::LoggedOut => 5.0,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status indicator shown by the host, independent of credential validity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// Streaming.
    Connected,
    /// Not connected and not trying.
    Disconnected,
    /// Connecting or waiting to retry.
    Reconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
            Self::Reconnecting => "Reconnecting",
        })
    }
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid connection transition {from} -> {to}")]
pub struct InvalidTransition {
    /// Current state.
    pub from: ConnectionState,
    /// Requested state.
    pub to: ConnectionState,
}

// =============================================================================
// Session Token
// =============================================================================

/// Token issued by the server on successful authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    /// Wrap a token string.
    #[must_use]
    pub const fn new(token: String) -> Self {
        Self(token)
    }

    /// The raw token, for the wire only.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken([REDACTED])")
    }
}

// =============================================================================
// Connection Session
// =============================================================================

/// Identifier of a login session.
pub type SessionId = u64;

/// Owned state of one login session.
///
/// Survives transient disconnects; dropped on logout or auth rejection.
#[derive(Debug)]
pub struct ConnectionSession {
    id: SessionId,
    state: ConnectionState,
    token: Option<SessionToken>,
    generation: u64,
    last_heartbeat: Option<Instant>,
    ledger: SubscriptionLedger,
}

impl ConnectionSession {
    /// Start a session in `Disconnected`.
    #[must_use]
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            state: ConnectionState::Disconnected,
            token: None,
            generation: 0,
            last_heartbeat: None,
            ledger: SubscriptionLedger::new(),
        }
    }

    /// Session identifier.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Current connection state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the session is authenticated and streaming.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Current connection generation (0 before the first authentication).
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Session token of the current generation.
    #[must_use]
    pub const fn token(&self) -> Option<&SessionToken> {
        self.token.as_ref()
    }

    /// Last time any inbound traffic was seen.
    #[must_use]
    pub const fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat
    }

    /// Live subscription ledger.
    #[must_use]
    pub const fn ledger(&self) -> &SubscriptionLedger {
        &self.ledger
    }

    /// Mutable live subscription ledger.
    pub fn ledger_mut(&mut self) -> &mut SubscriptionLedger {
        &mut self.ledger
    }

    /// Apply a state change.
    ///
    /// Leaving `Connected` marks every live subscription stale and drops the
    /// token. Entering `LoggedOut` clears the ledger.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] if the move is not allowed; the state is
    /// left unchanged.
    pub fn transition(&mut self, next: ConnectionState) -> Result<(), InvalidTransition> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        if self.state == ConnectionState::Connected {
            self.ledger.mark_all_stale();
            self.token = None;
        }
        if next == ConnectionState::LoggedOut {
            self.ledger.clear();
            self.token = None;
        }

        tracing::debug!(session = self.id, from = %self.state, to = %next, "Connection state changed");
        self.state = next;
        Ok(())
    }

    /// Server accepted credentials on a new connection generation.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] if the session cannot enter `Connected`.
    pub fn authenticated(
        &mut self,
        token: SessionToken,
        generation: u64,
    ) -> Result<(), InvalidTransition> {
        self.transition(ConnectionState::Connected)?;
        self.token = Some(token);
        self.generation = generation;
        self.last_heartbeat = Some(Instant::now());
        Ok(())
    }

    /// Record inbound traffic.
    pub fn record_heartbeat(&mut self, at: Instant) {
        self.last_heartbeat = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::instrument::Figi;
    use crate::domain::quote::{Ats, Quantity, QuoteLabel, Side};
    use crate::domain::subscription::SubscriptionKey;
    use crate::domain::subscription::ledger::LiveState;

    fn key() -> SubscriptionKey {
        SubscriptionKey {
            figi: Figi::parse("BBG000BLNNH6").unwrap(),
            side: Side::Bid,
            quantity: Quantity::new(1_000_000).unwrap(),
            label: QuoteLabel::Price,
            ats: Ats::Yes,
        }
    }

    fn walk_to_connected(session: &mut ConnectionSession) {
        session.transition(ConnectionState::Connecting).unwrap();
        session.transition(ConnectionState::Authenticating).unwrap();
        session
            .authenticated(SessionToken::new("tok".into()), 1)
            .unwrap();
    }

    #[test]
    fn happy_path_reaches_connected() {
        let mut session = ConnectionSession::new(7);
        walk_to_connected(&mut session);

        assert!(session.is_connected());
        assert_eq!(session.generation(), 1);
        assert_eq!(session.token().unwrap().expose(), "tok");
        assert!(session.last_heartbeat().is_some());
        assert_eq!(session.state().status(), ConnectionStatus::Connected);
    }

    #[test]
    fn skipping_authentication_is_rejected() {
        let mut session = ConnectionSession::new(1);
        session.transition(ConnectionState::Connecting).unwrap();

        let err = session.transition(ConnectionState::Connected).unwrap_err();

        assert_eq!(err.from, ConnectionState::Connecting);
        assert_eq!(session.state(), ConnectionState::Connecting);
    }

    #[test]
    fn drop_marks_subscriptions_stale_and_invalidates_token() {
        let mut session = ConnectionSession::new(1);
        walk_to_connected(&mut session);
        session.ledger_mut().reconcile(&[key()]);
        session.ledger_mut().on_subscribed(&[key()]);

        session.transition(ConnectionState::Reconnecting).unwrap();

        assert_eq!(session.ledger().state(&key()), Some(LiveState::Stale));
        assert!(session.token().is_none());
        assert_eq!(session.state().status(), ConnectionStatus::Reconnecting);
    }

    #[test]
    fn logout_is_terminal_and_clears_ledger() {
        let mut session = ConnectionSession::new(1);
        walk_to_connected(&mut session);
        session.ledger_mut().reconcile(&[key()]);

        session.transition(ConnectionState::LoggedOut).unwrap();

        assert!(session.ledger().is_empty());
        assert!(!ConnectionState::LoggedOut.can_transition_to(ConnectionState::Connecting));
        assert_eq!(session.state().status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn auth_rejection_goes_to_disconnected() {
        assert!(ConnectionState::Authenticating.can_transition_to(ConnectionState::Disconnected));
        assert!(!ConnectionState::Disconnected.can_transition_to(ConnectionState::Connected));
    }

    #[test]
    fn token_debug_is_redacted() {
        let token = SessionToken::new("secret-token".into());
        assert!(!format!("{token:?}").contains("secret"));
    }
}
