//! Quote Stream Session Integration Tests
//!
//! Drives the WebSocket connection task directly against a local mock
//! service: authentication, token refresh, subscription batches, quote
//! forwarding, heartbeats, reconnection and credential rejection.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::time::Duration;

use bond_quote_sync::application::ports::{
    Credentials, QuoteStreamPort, StreamChannels, StreamEvent, SubscriptionAction,
    SubscriptionCommand,
};
use bond_quote_sync::{
    Ats, DeepMmStreamConnector, Figi, Quantity, QuoteLabel, Side, StreamClientConfig,
    SubscriptionKey,
};
use common::{AuthMode, MockDeepMm, batch_len, client_config, is_subscribe, quote_push};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    commands: mpsc::UnboundedSender<SubscriptionCommand>,
    events: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

fn start(server: &MockDeepMm) -> Harness {
    start_with(client_config(&server.url))
}

fn start_with(config: StreamClientConfig) -> Harness {
    let connector = DeepMmStreamConnector::new(config);
    let (commands, command_rx) = mpsc::unbounded_channel();
    let (event_tx, events) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let task = connector.start(
        1,
        Credentials::new("trader@example.com".into(), "secret".into()),
        StreamChannels {
            commands: command_rx,
            events: event_tx,
        },
        cancel.clone(),
    );
    Harness {
        commands,
        events,
        cancel,
        task,
    }
}

/// Wait for the first event `pick` accepts.
async fn wait_for<T, F>(events: &mut mpsc::Receiver<StreamEvent>, pick: F) -> T
where
    F: Fn(&StreamEvent) -> Option<T>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let event = tokio::time::timeout(remaining, events.recv())
            .await
            .expect("event not seen in time")
            .expect("connection task closed its channel");
        if let Some(found) = pick(&event) {
            return found;
        }
    }
}

async fn session_ready(events: &mut mpsc::Receiver<StreamEvent>) -> (String, u64) {
    wait_for(events, |event| match event {
        StreamEvent::SessionReady { token, generation } => {
            Some((token.expose().to_string(), *generation))
        }
        _ => None,
    })
    .await
}

fn key(label: QuoteLabel) -> SubscriptionKey {
    SubscriptionKey {
        figi: Figi::parse("BBG000BLNNH6").unwrap(),
        side: Side::Bid,
        quantity: Quantity::new(1_000_000).unwrap(),
        label,
        ats: Ats::Yes,
    }
}

fn subscribe(generation: u64, keys: Vec<SubscriptionKey>) -> SubscriptionCommand {
    SubscriptionCommand {
        generation,
        action: SubscriptionAction::Subscribe,
        keys,
    }
}

#[tokio::test]
async fn authenticates_subscribes_and_forwards_quotes() {
    let mut server = MockDeepMm::start(AuthMode::Accept).await;
    let mut harness = start(&server);

    let (_, auth) = server.frame_where(WAIT, |f| f["action"] == "auth").await;
    assert_eq!(auth["email"], "trader@example.com");
    assert_eq!(auth["password"], "secret");
    assert_eq!(session_ready(&mut harness.events).await, ("tok-1".into(), 1));

    harness
        .commands
        .send(subscribe(1, vec![key(QuoteLabel::Price)]))
        .unwrap();
    let (_, batch) = server.frame_where(WAIT, is_subscribe).await;
    assert_eq!(batch["token"], "tok-1");
    assert_eq!(batch_len(&batch), 1);
    assert_eq!(batch["inference"][0]["figi"], "BBG000BLNNH6");
    assert_eq!(batch["inference"][0]["quantity"], 1_000_000);
    assert_eq!(batch["inference"][0]["rfq_label"], "price");
    assert_eq!(batch["inference"][0]["ats_indicator"], "Y");

    let acked = wait_for(&mut harness.events, |event| match event {
        StreamEvent::Subscribed { keys } => Some(keys.clone()),
        _ => None,
    })
    .await;
    assert_eq!(acked, vec![key(QuoteLabel::Price)]);

    server.send(&quote_push(
        "BBG000BLNNH6",
        "bid",
        1_000_000,
        "Y",
        "price",
        json!(101.25),
    ));
    let update = wait_for(&mut harness.events, |event| match event {
        StreamEvent::Quote(update) => Some(update.clone()),
        _ => None,
    })
    .await;
    assert_eq!(update.figi.as_str(), "BBG000BLNNH6");
    assert_eq!(update.quantity.value(), 1_000_000);
    assert!(update.fields.get(QuoteLabel::Price).is_some());

    harness.cancel.cancel();
    tokio::time::timeout(WAIT, harness.task).await.unwrap().unwrap();
}

#[tokio::test]
async fn token_is_refreshed_on_the_live_connection() {
    let mut server = MockDeepMm::start(AuthMode::Accept).await;
    let mut harness = start_with(StreamClientConfig {
        token_refresh: Duration::from_millis(150),
        ..client_config(&server.url)
    });
    assert_eq!(session_ready(&mut harness.events).await, ("tok-1".into(), 1));

    let is_auth = |f: &serde_json::Value| f["action"] == "auth";
    server.frame_where(WAIT, is_auth).await;
    let (connection, again) = server.frame_where(WAIT, is_auth).await;
    assert_eq!(connection, 1);
    assert_eq!(again["email"], "trader@example.com");

    // Batches switch to the refreshed token on the same connection and
    // generation.
    let deadline = tokio::time::Instant::now() + WAIT;
    let refreshed = loop {
        harness
            .commands
            .send(subscribe(1, vec![key(QuoteLabel::Price)]))
            .unwrap();
        let (connection, batch) = server.frame_where(WAIT, is_subscribe).await;
        assert_eq!(connection, 1);
        let token = batch["token"].as_str().unwrap().to_string();
        if token != "tok-1" {
            break token;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "batches kept the first token"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert!(refreshed.starts_with("tok-1-"));

    while let Ok(event) = harness.events.try_recv() {
        assert!(
            !matches!(event, StreamEvent::SessionReady { .. }),
            "refresh must not start a new generation"
        );
    }

    harness.cancel.cancel();
    tokio::time::timeout(WAIT, harness.task).await.unwrap().unwrap();
}

#[tokio::test]
async fn server_heartbeat_is_answered() {
    let mut server = MockDeepMm::start(AuthMode::Accept).await;
    let mut harness = start(&server);
    session_ready(&mut harness.events).await;

    server.send(&json!({"type": "heartbeat"}));

    let (_, reply) = server
        .frame_where(WAIT, |f| f["action"] == "heartbeat")
        .await;
    assert_eq!(reply, json!({"action": "heartbeat"}));
    wait_for(&mut harness.events, |event| {
        matches!(event, StreamEvent::Heartbeat).then_some(())
    })
    .await;

    harness.cancel.cancel();
}

#[tokio::test]
async fn reconnect_starts_a_new_generation_and_drops_stale_commands() {
    let mut server = MockDeepMm::start(AuthMode::Accept).await;
    let mut harness = start(&server);
    assert_eq!(session_ready(&mut harness.events).await.1, 1);

    server.drop_connection();
    assert_eq!(session_ready(&mut harness.events).await, ("tok-2".into(), 2));

    harness
        .commands
        .send(subscribe(1, vec![key(QuoteLabel::Ytm)]))
        .unwrap();
    harness
        .commands
        .send(subscribe(2, vec![key(QuoteLabel::Price)]))
        .unwrap();

    let (connection, batch) = server.frame_where(WAIT, is_subscribe).await;
    assert_eq!(connection, 2);
    assert_eq!(batch["token"], "tok-2");
    assert_eq!(batch_len(&batch), 1);
    assert_eq!(batch["inference"][0]["rfq_label"], "price");

    harness.cancel.cancel();
}

#[tokio::test]
async fn rejected_credentials_stop_the_task() {
    let server = MockDeepMm::start(AuthMode::Reject).await;
    let mut harness = start(&server);

    let reason = wait_for(&mut harness.events, |event| match event {
        StreamEvent::AuthRejected { reason } => Some(reason.clone()),
        StreamEvent::SessionReady { .. } => panic!("rejected credentials produced a session"),
        _ => None,
    })
    .await;
    assert_eq!(reason, "Incorrect username or password");

    tokio::time::timeout(WAIT, harness.task)
        .await
        .expect("task kept running after rejection")
        .unwrap();
}
