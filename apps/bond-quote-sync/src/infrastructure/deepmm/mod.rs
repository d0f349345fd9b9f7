//! Deep MM WebSocket Adapter
//!
//! Implements the quote stream port against the Deep MM market-data
//! service: authentication, batched subscriptions, quote pushes,
//! heartbeats and reconnection with backoff (JSON codec).

pub mod auth;
pub mod client;
pub mod codec;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;

pub use auth::{AUTH_TIMEOUT, AuthError, AuthHandler};
pub use client::{
    CONNECT_TIMEOUT, DEFAULT_STREAM_URL, DEFAULT_TOKEN_REFRESH, DeepMmStreamConnector,
    StreamClientConfig, StreamClientError,
};
pub use codec::{CodecError, JsonCodec};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, HeartbeatState};
pub use messages::{InferenceItem, ServerMessage};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
