//! Deep MM WebSocket Authentication
//!
//! # Authentication Flow
//!
//! 1. Connect to the WebSocket endpoint
//! 2. Send `{"action":"auth","email":"...","password":"..."}`
//! 3. Receive `{"type":"authenticated","token":"..."}` or an error
//!
//! The token is attached to every subscription request on that connection.
//! A new connection authenticates again and receives a new token. A live
//! connection repeats the request periodically and switches to the token in
//! the reply.
//!
//! # Error Codes
//!
//! - 402: Authentication failed (invalid credentials); retrying cannot succeed
//!
//! Any other code is a server error.

use std::time::Duration;

use thiserror::Error;

use super::messages::{AuthRequest, AuthenticatedMessage, ErrorMessage};
use crate::application::ports::Credentials;
use crate::domain::session::SessionToken;

// =============================================================================
// Constants
// =============================================================================

/// Time allowed between socket open and the `authenticated` reply.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Server code for refused credentials.
pub const INVALID_CREDENTIALS: i32 = 402;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during authentication.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Credentials rejected.
    #[error("authentication failed: {0}")]
    InvalidCredentials(String),

    /// No reply within [`AUTH_TIMEOUT`].
    #[error("authentication timeout: no reply within {} seconds", AUTH_TIMEOUT.as_secs())]
    Timeout,

    /// Server accepted but sent an empty token.
    #[error("authentication reply carried no token")]
    MissingToken,

    /// Any other server error during authentication.
    #[error("server error ({code}): {message}")]
    ServerError {
        /// Error code from server
        code: i32,
        /// Error message from server
        message: String,
    },
}

impl AuthError {
    /// Whether the credentials themselves were refused.
    #[must_use]
    pub const fn is_credential_rejection(&self) -> bool {
        matches!(self, Self::InvalidCredentials(_))
    }

    /// Message suitable for a user notice.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::InvalidCredentials(msg) if !msg.is_empty() => msg.clone(),
            _ => self.to_string(),
        }
    }
}

impl From<&ErrorMessage> for AuthError {
    fn from(err: &ErrorMessage) -> Self {
        match err.code {
            INVALID_CREDENTIALS => Self::InvalidCredentials(err.msg.clone()),
            code => Self::ServerError {
                code,
                message: err.msg.clone(),
            },
        }
    }
}

// =============================================================================
// Handler
// =============================================================================

/// Builds auth requests for one session and interprets the replies.
#[derive(Debug)]
pub struct AuthHandler {
    credentials: Credentials,
}

impl AuthHandler {
    /// Create a handler for a session's credentials.
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    /// Build the auth request.
    #[must_use]
    pub fn create_auth_request(&self) -> AuthRequest {
        AuthRequest::new(
            self.credentials.email().to_string(),
            self.credentials.password().to_string(),
        )
    }

    /// Process an `authenticated` reply.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingToken`] if the token is blank.
    pub fn on_authenticated(&self, msg: AuthenticatedMessage) -> Result<SessionToken, AuthError> {
        if msg.token.trim().is_empty() {
            return Err(AuthError::MissingToken);
        }
        Ok(SessionToken::new(msg.token))
    }
}
