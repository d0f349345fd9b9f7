//! Quote Stream Port (Driven Port)
//!
//! Contract between the engine and the connection manager that owns the
//! streaming socket. The engine never touches the socket: it sends
//! [`SubscriptionCommand`]s and drains [`StreamEvent`]s.
//!
//! ```text
//! Engine ──SubscriptionCommand (unbounded)──► Connection task ──► socket
//! Engine ◄──StreamEvent (bounded queue)────── Connection task ◄── socket
//! ```

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::quote::QuoteUpdate;
use crate::domain::session::{ConnectionState, SessionId, SessionToken};
use crate::domain::subscription::SubscriptionKey;

// =============================================================================
// Credentials
// =============================================================================

/// Login credentials for the market-data service.
#[derive(Clone)]
pub struct Credentials {
    email: String,
    password: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(email: String, password: String) -> Self {
        Self { email, password }
    }

    /// Get the login email.
    #[must_use]
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Get the password.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Commands and Events
// =============================================================================

/// Direction of a subscription command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    /// Start streaming the keys.
    Subscribe,
    /// Stop streaming the keys.
    Unsubscribe,
}

/// A batch of keys to (un)subscribe on a specific connection generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionCommand {
    /// Generation the command was issued for; older generations are dropped.
    pub generation: u64,
    /// Subscribe or unsubscribe.
    pub action: SubscriptionAction,
    /// Keys in the batch.
    pub keys: Vec<SubscriptionKey>,
}

/// Events emitted by the connection task.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Connection state changed.
    State(ConnectionState),

    /// Authentication succeeded on a new connection generation.
    SessionReady {
        /// Token issued by the server.
        token: SessionToken,
        /// New generation number.
        generation: u64,
    },

    /// Server acknowledged subscriptions.
    Subscribed {
        /// Acknowledged keys.
        keys: Vec<SubscriptionKey>,
    },

    /// Server rejected subscriptions.
    Rejected {
        /// Rejected keys.
        keys: Vec<SubscriptionKey>,
        /// Server message.
        reason: String,
    },

    /// Server confirmed unsubscriptions.
    Unsubscribed {
        /// Removed keys.
        keys: Vec<SubscriptionKey>,
    },

    /// A quote arrived.
    Quote(QuoteUpdate),

    /// Inbound heartbeat traffic.
    Heartbeat,

    /// Credentials were rejected; the task has stopped.
    AuthRejected {
        /// Server message.
        reason: String,
    },

    /// Consecutive reconnect failures reached the notification threshold.
    PersistentFailure {
        /// Consecutive failed attempts.
        attempts: u32,
    },

    /// A frame could not be decoded or was unexpected.
    ProtocolError {
        /// Description.
        message: String,
    },
}

/// Channel ends handed to a connection task.
#[derive(Debug)]
pub struct StreamChannels {
    /// Commands from the engine.
    pub commands: mpsc::UnboundedReceiver<SubscriptionCommand>,
    /// Events to the engine.
    pub events: mpsc::Sender<StreamEvent>,
}

/// Port that starts a connection task for a login session.
pub trait QuoteStreamPort: Send + Sync {
    /// Spawn the connection task.
    ///
    /// The task runs until `cancel` fires or authentication is rejected.
    fn start(
        &self,
        session: SessionId,
        credentials: Credentials,
        channels: StreamChannels,
        cancel: CancellationToken,
    ) -> JoinHandle<()>;
}
