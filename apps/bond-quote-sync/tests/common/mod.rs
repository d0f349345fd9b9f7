//! Mock Deep MM market-data service for integration tests.
//!
//! Accepts one WebSocket connection at a time on `127.0.0.1:0`, answers
//! auth requests, acknowledges every subscription batch and reports each
//! inbound frame to the test. The test can push frames to the current
//! connection or drop it.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use bond_quote_sync::infrastructure::deepmm::{HeartbeatConfig, ReconnectConfig};
use bond_quote_sync::{StreamClientConfig, SubscriptionKey, SubscriptionTable};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// How the mock answers auth requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Issue `tok-<connection>`, then `tok-<connection>-<n>` for the n-th
    /// repeat on the same connection.
    Accept,
    /// Reply with error 402.
    Reject,
}

/// Something the mock observed.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// A client connected (1-based connection number).
    Connected(usize),
    /// A JSON frame arrived on a connection.
    Frame(usize, Value),
}

enum Control {
    Send(String),
    Drop,
}

/// Handle to a running mock service.
pub struct MockDeepMm {
    /// `ws://` URL of the listener.
    pub url: String,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    control: mpsc::UnboundedSender<Control>,
}

impl MockDeepMm {
    /// Bind and start serving.
    pub async fn start(mode: AuthMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (control, control_rx) = mpsc::unbounded_channel();

        tokio::spawn(serve(listener, mode, inbound_tx, control_rx));

        Self {
            url,
            inbound,
            control,
        }
    }

    /// Push a raw frame to the current connection.
    pub fn send(&self, frame: &Value) {
        let _ = self.control.send(Control::Send(frame.to_string()));
    }

    /// Drop the current connection without a close frame.
    pub fn drop_connection(&self) {
        let _ = self.control.send(Control::Drop);
    }

    /// Next observation, failing the test after `wait`.
    pub async fn next(&mut self, wait: Duration) -> Inbound {
        tokio::time::timeout(wait, self.inbound.recv())
            .await
            .expect("mock service observed nothing in time")
            .expect("mock service stopped")
    }

    /// Next frame satisfying `pred`, skipping everything else.
    pub async fn frame_where<F>(&mut self, wait: Duration, pred: F) -> (usize, Value)
    where
        F: Fn(&Value) -> bool,
    {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if let Inbound::Frame(conn, value) = self.next(remaining).await
                && pred(&value)
            {
                return (conn, value);
            }
        }
    }

    /// Drain whatever has been observed so far.
    pub fn drain(&mut self) -> Vec<Inbound> {
        let mut seen = Vec::new();
        while let Ok(item) = self.inbound.try_recv() {
            seen.push(item);
        }
        seen
    }
}

/// Whether a frame is a subscribe batch.
pub fn is_subscribe(frame: &Value) -> bool {
    batch_flag(frame, "subscribe")
}

/// Whether a frame is an unsubscribe batch.
pub fn is_unsubscribe(frame: &Value) -> bool {
    batch_flag(frame, "unsubscribe")
}

fn batch_flag(frame: &Value, flag: &str) -> bool {
    frame["inference"]
        .as_array()
        .and_then(|items| items.first())
        .is_some_and(|item| item[flag] == json!(true))
}

/// Number of items in a subscription batch.
pub fn batch_len(frame: &Value) -> usize {
    frame["inference"].as_array().map_or(0, Vec::len)
}

/// A quote push for one key.
pub fn quote_push(
    figi: &str,
    side: &str,
    quantity: u64,
    ats: &str,
    field: &str,
    value: Value,
) -> Value {
    let mut item = json!({
        "figi": figi,
        "side": side,
        "quantity": quantity,
        "ats_indicator": ats,
        "date": "2025-01-02T15:30:00Z",
    });
    item[field] = value;
    json!({ "inference": [item] })
}

/// Client settings tuned for fast tests.
pub fn client_config(url: &str) -> StreamClientConfig {
    StreamClientConfig {
        url: url.to_string(),
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            jitter_factor: 0.0,
            ..ReconnectConfig::default()
        },
        heartbeat: HeartbeatConfig::default(),
        max_protocol_errors: 10,
        token_refresh: Duration::from_secs(3600),
    }
}

/// Keys of a table, sorted.
pub fn sorted_keys(table: &SubscriptionTable) -> Vec<SubscriptionKey> {
    let mut keys: Vec<SubscriptionKey> = table.keys().cloned().collect();
    keys.sort();
    keys
}

async fn serve(
    listener: TcpListener,
    mode: AuthMode,
    inbound: mpsc::UnboundedSender<Inbound>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let mut connection = 0usize;
    loop {
        let Ok((tcp, _)) = listener.accept().await else {
            return;
        };
        let Ok(ws) = tokio_tungstenite::accept_async(tcp).await else {
            continue;
        };
        connection += 1;
        let mut auths = 0usize;
        let _ = inbound.send(Inbound::Connected(connection));
        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                command = control.recv() => match command {
                    Some(Control::Send(text)) => {
                        if write.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Control::Drop) | None => break,
                },
                frame = read.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(_)) => continue,
                        _ => break,
                    };
                    let Ok(value) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    let _ = inbound.send(Inbound::Frame(connection, value.clone()));
                    if let Some(reply) = respond(mode, connection, &mut auths, &value)
                        && write.send(Message::Text(reply.to_string().into())).await.is_err()
                    {
                        break;
                    }
                }
            }
        }
    }
}

fn respond(mode: AuthMode, connection: usize, auths: &mut usize, frame: &Value) -> Option<Value> {
    if frame["action"] == "auth" {
        *auths += 1;
        return Some(match mode {
            AuthMode::Accept => {
                let token = match *auths {
                    1 => format!("tok-{connection}"),
                    n => format!("tok-{connection}-{n}"),
                };
                json!({"type": "authenticated", "token": token})
            }
            AuthMode::Reject => {
                json!({"type": "error", "code": 402, "msg": "Incorrect username or password"})
            }
        });
    }
    let items = frame["inference"].as_array()?;
    let kind = if is_subscribe(frame) {
        "subscribed"
    } else if is_unsubscribe(frame) {
        "unsubscribed"
    } else {
        return None;
    };
    Some(json!({"type": kind, "inference": items}))
}
