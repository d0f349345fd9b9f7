//! Quote Stream Client
//!
//! Owns the WebSocket connection for one login session and implements the
//! [`QuoteStreamPort`] the engine drives.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting ─► Authenticating ─► Connected ─┐
//!     ▲               │                      │ transport error, heartbeat
//!     │               │ 402                  │ timeout, protocol errors
//!     │               ▼                      ▼
//!     │          AuthRejected (stop)    Reconnecting ── backoff ──┐
//!     └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Each successful authentication starts a new connection generation.
//! Commands tagged with an older generation are discarded so nothing queued
//! before a drop is sent on the new connection.
//!
//! # Token refresh
//!
//! While connected, the auth request is repeated every
//! [`StreamClientConfig::token_refresh`]. The token in the reply replaces the
//! one attached to later subscription batches; the generation and the live
//! subscriptions are unaffected.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::auth::{AUTH_TIMEOUT, AuthError, AuthHandler};
use super::codec::{CodecError, JsonCodec};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, HeartbeatState};
use super::messages::{HeartbeatReply, InferenceItem, ServerMessage};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{
    Credentials, QuoteStreamPort, StreamChannels, StreamEvent, SubscriptionCommand,
};
use crate::domain::quote::QuoteUpdate;
use crate::domain::session::{ConnectionState, SessionId, SessionToken};
use crate::infrastructure::metrics::{self, DropReason};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Default stream endpoint.
pub const DEFAULT_STREAM_URL: &str = "wss://staging1.deepmm.com";

/// Time allowed for the TCP/TLS/WebSocket handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default period between token refreshes on a live connection.
pub const DEFAULT_TOKEN_REFRESH: Duration = Duration::from_secs(55 * 60);

// =============================================================================
// Error Type
// =============================================================================

/// Reasons a connection ends.
#[derive(Debug, thiserror::Error)]
pub enum StreamClientError {
    /// Handshake did not finish within [`CONNECT_TIMEOUT`].
    #[error("connect timeout")]
    ConnectTimeout,

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// No traffic after a ping.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// Too many consecutive protocol errors.
    #[error("{0} consecutive protocol errors")]
    TooManyProtocolErrors(u32),

    /// Server closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// The engine dropped its end of a channel.
    #[error("engine channel closed")]
    EngineGone,
}

// =============================================================================
// Configuration
// =============================================================================

/// Connection settings shared by every session.
#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    /// WebSocket URL.
    pub url: String,
    /// Backoff schedule.
    pub reconnect: ReconnectConfig,
    /// Heartbeat timing.
    pub heartbeat: HeartbeatConfig,
    /// Consecutive protocol errors tolerated before reconnecting.
    pub max_protocol_errors: u32,
    /// Period between auth requests on a live connection.
    pub token_refresh: Duration,
}

impl Default for StreamClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_STREAM_URL.to_string(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            max_protocol_errors: 10,
            token_refresh: DEFAULT_TOKEN_REFRESH,
        }
    }
}

// =============================================================================
// Port Adapter
// =============================================================================

/// Starts one connection task per login session.
#[derive(Debug, Clone)]
pub struct DeepMmStreamConnector {
    config: StreamClientConfig,
}

impl DeepMmStreamConnector {
    /// Create a connector.
    #[must_use]
    pub const fn new(config: StreamClientConfig) -> Self {
        Self { config }
    }
}

impl QuoteStreamPort for DeepMmStreamConnector {
    fn start(
        &self,
        session: SessionId,
        credentials: Credentials,
        channels: StreamChannels,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let client = StreamClient {
            config: self.config.clone(),
            session,
            auth: AuthHandler::new(credentials),
            events: channels.events,
            cancel,
            codec: JsonCodec::new(),
            generation: 0,
        };
        tokio::spawn(client.run(channels.commands))
    }
}

// =============================================================================
// Stream Client
// =============================================================================

/// Connection loop for one login session.
struct StreamClient {
    config: StreamClientConfig,
    session: SessionId,
    auth: AuthHandler,
    events: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    codec: JsonCodec,
    generation: u64,
}

impl StreamClient {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SubscriptionCommand>) {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if self
                .emit(StreamEvent::State(ConnectionState::Connecting))
                .await
                .is_err()
            {
                break;
            }

            let error = match self.connect_and_run(&mut commands, &mut policy).await {
                Ok(()) | Err(StreamClientError::EngineGone) => break,
                Err(StreamClientError::Auth(e)) if e.is_credential_rejection() => {
                    tracing::error!(session = self.session, error = %e, "Credentials rejected");
                    let _ = self
                        .emit(StreamEvent::AuthRejected { reason: e.reason() })
                        .await;
                    break;
                }
                Err(e) => e,
            };

            tracing::warn!(session = self.session, error = %error, "Quote stream connection lost");
            if self
                .emit(StreamEvent::State(ConnectionState::Reconnecting))
                .await
                .is_err()
            {
                break;
            }

            let Some(delay) = policy.next_delay() else {
                tracing::error!(session = self.session, "Reconnect attempts exhausted");
                let _ = self
                    .emit(StreamEvent::State(ConnectionState::Disconnected))
                    .await;
                break;
            };
            let attempt = policy.attempt_count();
            if policy.crossed_notify_threshold()
                && self
                    .emit(StreamEvent::PersistentFailure { attempts: attempt })
                    .await
                    .is_err()
            {
                break;
            }

            tracing::info!(
                session = self.session,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting to quote stream"
            );
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(session = self.session, "Quote stream task stopped");
    }

    /// One connection from handshake to teardown. `Ok` means cancelled.
    async fn connect_and_run(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<SubscriptionCommand>,
        policy: &mut ReconnectPolicy,
    ) -> Result<(), StreamClientError> {
        tracing::info!(session = self.session, url = %self.config.url, "Connecting to quote stream");

        let connect = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(self.config.url.as_str()),
        );
        let ws_stream = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            result = connect => {
                let (stream, _response) = result.map_err(|_| StreamClientError::ConnectTimeout)??;
                stream
            }
        };
        let (mut write, mut read) = ws_stream.split();

        self.emit(StreamEvent::State(ConnectionState::Authenticating))
            .await?;
        let Some(token) = self.authenticate(&mut write, &mut read).await? else {
            return Ok(());
        };

        policy.reset();
        self.generation += 1;
        tracing::info!(
            session = self.session,
            generation = self.generation,
            "Quote stream authenticated"
        );
        self.emit(StreamEvent::SessionReady {
            token: token.clone(),
            generation: self.generation,
        })
        .await?;

        let heartbeat_state = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(8);
        let heartbeat_cancel = self.cancel.child_token();
        tokio::spawn(
            HeartbeatMonitor::new(
                self.config.heartbeat.clone(),
                Arc::clone(&heartbeat_state),
                heartbeat_tx,
                heartbeat_cancel.clone(),
            )
            .run(),
        );

        let period = self.config.token_refresh.max(Duration::from_millis(1));
        let mut refresh = tokio::time::interval_at(Instant::now() + period, period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut link = Link {
            write: &mut write,
            read: &mut read,
            token,
            heartbeat: &heartbeat_state,
            protocol_errors: 0,
        };
        let result = self
            .pump(&mut link, commands, &mut heartbeat_rx, &mut refresh)
            .await;
        heartbeat_cancel.cancel();

        if result.is_ok() {
            let _ = write.send(Message::Close(None)).await;
        }
        result
    }

    async fn authenticate(
        &self,
        write: &mut WsWrite,
        read: &mut WsRead,
    ) -> Result<Option<SessionToken>, StreamClientError> {
        self.send_auth_request(write).await?;

        let deadline = tokio::time::sleep(AUTH_TIMEOUT);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(None),
                () = &mut deadline => return Err(AuthError::Timeout.into()),
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => match self.codec.decode(&text)? {
                        ServerMessage::Authenticated(msg) => {
                            return Ok(Some(self.auth.on_authenticated(msg)?));
                        }
                        ServerMessage::Error(err) => return Err(AuthError::from(&err).into()),
                        ServerMessage::Heartbeat => self.reply_heartbeat(write).await?,
                        other => tracing::debug!(?other, "Ignoring frame before authentication"),
                    },
                    Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(StreamClientError::ConnectionClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
    }

    async fn pump(
        &self,
        link: &mut Link<'_>,
        commands: &mut mpsc::UnboundedReceiver<SubscriptionCommand>,
        heartbeat_rx: &mut mpsc::Receiver<HeartbeatEvent>,
        refresh: &mut tokio::time::Interval,
    ) -> Result<(), StreamClientError> {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                _ = refresh.tick() => {
                    tracing::debug!(session = self.session, "Refreshing session token");
                    self.send_auth_request(link.write).await?;
                }
                event = heartbeat_rx.recv() => match event {
                    Some(HeartbeatEvent::SendPing) => {
                        link.heartbeat.mark_ping_sent();
                        link.write.send(Message::Ping(Vec::<u8>::new().into())).await?;
                    }
                    Some(HeartbeatEvent::Timeout) => return Err(StreamClientError::HeartbeatTimeout),
                    None => return Err(StreamClientError::ConnectionClosed),
                },
                command = commands.recv() => match command {
                    Some(command) => self.send_command(link, command).await?,
                    None => return Err(StreamClientError::EngineGone),
                },
                frame = link.read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        link.heartbeat.record_traffic();
                        self.handle_text(link, &text).await?;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        link.heartbeat.record_traffic();
                        link.write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(session = self.session, ?frame, "Server sent close frame");
                        return Err(StreamClientError::ConnectionClosed);
                    }
                    Some(Ok(_)) => link.heartbeat.record_traffic(),
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(StreamClientError::ConnectionClosed),
                },
            }
        }
    }

    async fn send_command(
        &self,
        link: &mut Link<'_>,
        command: SubscriptionCommand,
    ) -> Result<(), StreamClientError> {
        if command.generation != self.generation {
            tracing::debug!(
                session = self.session,
                command_generation = command.generation,
                generation = self.generation,
                "Dropping command from an earlier connection"
            );
            return Ok(());
        }
        if command.keys.is_empty() {
            return Ok(());
        }

        let json = self
            .codec
            .encode_subscription(&link.token, command.action, &command.keys)?;
        tracing::debug!(
            session = self.session,
            action = ?command.action,
            count = command.keys.len(),
            "Sending subscription request"
        );
        link.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    async fn handle_text(&self, link: &mut Link<'_>, text: &str) -> Result<(), StreamClientError> {
        let message = match self.codec.decode(text) {
            Ok(message) => message,
            Err(e) => return self.protocol_error(link, "decode", e.to_string()).await,
        };

        match message {
            ServerMessage::Quotes(items) => {
                for raw in items {
                    match self.codec.decode_quote(raw) {
                        Ok(update) => {
                            link.protocol_errors = 0;
                            self.forward_quote(update)?;
                        }
                        Err(e) => self.protocol_error(link, "quote", e.to_string()).await?,
                    }
                }
            }
            ServerMessage::Subscribed(ack) => {
                link.protocol_errors = 0;
                let keys = ack.inference.iter().map(InferenceItem::key).collect();
                self.emit(StreamEvent::Subscribed { keys }).await?;
            }
            ServerMessage::Unsubscribed(ack) => {
                let keys = ack.inference.iter().map(InferenceItem::key).collect();
                self.emit(StreamEvent::Unsubscribed { keys }).await?;
            }
            ServerMessage::Rejected(rejected) => {
                let keys = rejected.inference.iter().map(InferenceItem::key).collect();
                self.emit(StreamEvent::Rejected {
                    keys,
                    reason: rejected.msg,
                })
                .await?;
                self.count_protocol_error(link)?;
            }
            ServerMessage::Heartbeat => {
                self.reply_heartbeat(link.write).await?;
                self.emit(StreamEvent::Heartbeat).await?;
            }
            ServerMessage::Error(err) => {
                let error = AuthError::from(&err);
                if error.is_credential_rejection() {
                    return Err(error.into());
                }
                self.protocol_error(link, "server", error.to_string()).await?;
            }
            ServerMessage::Authenticated(msg) => match self.auth.on_authenticated(msg) {
                Ok(token) => {
                    tracing::info!(
                        session = self.session,
                        generation = self.generation,
                        "Session token refreshed"
                    );
                    link.token = token;
                }
                Err(e) => self.protocol_error(link, "auth", e.to_string()).await?,
            },
        }
        Ok(())
    }

    fn forward_quote(&self, update: QuoteUpdate) -> Result<(), StreamClientError> {
        match self.events.try_send(StreamEvent::Quote(update)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(session = self.session, "Event queue full, quote dropped");
                metrics::record_dropped(DropReason::QueueFull, 1);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(StreamClientError::EngineGone),
        }
    }

    async fn protocol_error(
        &self,
        link: &mut Link<'_>,
        kind: &str,
        message: String,
    ) -> Result<(), StreamClientError> {
        tracing::warn!(session = self.session, kind, message = %message, "Protocol error");
        self.emit(StreamEvent::ProtocolError { message }).await?;
        self.count_protocol_error(link)
    }

    fn count_protocol_error(&self, link: &mut Link<'_>) -> Result<(), StreamClientError> {
        link.protocol_errors += 1;
        if link.protocol_errors > self.config.max_protocol_errors {
            return Err(StreamClientError::TooManyProtocolErrors(link.protocol_errors));
        }
        Ok(())
    }

    async fn send_auth_request(&self, write: &mut WsWrite) -> Result<(), StreamClientError> {
        let request = self
            .auth
            .create_auth_request()
            .to_json()
            .map_err(CodecError::from)?;
        write.send(Message::Text(request.into())).await?;
        Ok(())
    }

    async fn reply_heartbeat(&self, write: &mut WsWrite) -> Result<(), StreamClientError> {
        let json = serde_json::to_string(&HeartbeatReply::default()).map_err(CodecError::from)?;
        write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    async fn emit(&self, event: StreamEvent) -> Result<(), StreamClientError> {
        self.events
            .send(event)
            .await
            .map_err(|_| StreamClientError::EngineGone)
    }
}

/// Per-connection handles threaded through the message loop.
struct Link<'a> {
    write: &'a mut WsWrite,
    read: &'a mut WsRead,
    token: SessionToken,
    heartbeat: &'a HeartbeatState,
    protocol_errors: u32,
}
