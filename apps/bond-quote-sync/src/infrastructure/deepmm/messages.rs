//! Deep MM WebSocket Message Types
//!
//! Wire format types for the market-data stream. Every frame is a single
//! JSON object.
//!
//! # Client → Server
//! - `AuthRequest`: `{"action":"auth","email":…,"password":…}`
//! - `SubscriptionRequest`: `{"token":…,"inference":[InferenceItem…]}`
//! - `HeartbeatReply`: `{"action":"heartbeat"}`
//!
//! # Server → Client
//! - `{"type":"authenticated","token":…}`
//! - `{"type":"error","code":402,"msg":…}`
//! - `{"type":"subscribed"|"unsubscribed","inference":[…]}`
//! - `{"type":"rejected","inference":[…],"msg":…}`
//! - `{"type":"heartbeat"}`
//! - quote push with no `type`: `{"inference":[QuoteItem…]}`

use serde::{Deserialize, Serialize};

use crate::domain::instrument::Figi;
use crate::domain::quote::{Ats, Quantity, QuoteLabel, Side};
use crate::domain::subscription::SubscriptionKey;

// =============================================================================
// Client Messages
// =============================================================================

/// Authentication request sent right after the socket opens.
#[derive(Clone, Serialize)]
pub struct AuthRequest {
    action: &'static str,
    email: String,
    password: String,
}

impl AuthRequest {
    /// Create an auth request.
    #[must_use]
    pub const fn new(email: String, password: String) -> Self {
        Self {
            action: "auth",
            email,
            password,
        }
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl std::fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRequest")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Reply to a server heartbeat.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HeartbeatReply {
    action: &'static str,
}

impl Default for HeartbeatReply {
    fn default() -> Self {
        Self {
            action: "heartbeat",
        }
    }
}

/// One subscription entry, used in both directions.
///
/// Outbound items carry exactly one of `subscribe`/`unsubscribe`; echoed
/// items in acks may carry either or neither.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceItem {
    /// Instrument.
    pub figi: Figi,
    /// Notional quantity.
    pub quantity: Quantity,
    /// Requested measure.
    pub rfq_label: QuoteLabel,
    /// Quote side.
    pub side: Side,
    /// ATS flag.
    pub ats_indicator: Ats,
    /// Subscribe marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,
    /// Unsubscribe marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsubscribe: Option<bool>,
}

impl InferenceItem {
    /// Subscribe entry for a key.
    #[must_use]
    pub fn subscribe(key: &SubscriptionKey) -> Self {
        Self {
            subscribe: Some(true),
            ..Self::bare(key)
        }
    }

    /// Unsubscribe entry for a key.
    #[must_use]
    pub fn unsubscribe(key: &SubscriptionKey) -> Self {
        Self {
            unsubscribe: Some(true),
            ..Self::bare(key)
        }
    }

    fn bare(key: &SubscriptionKey) -> Self {
        Self {
            figi: key.figi.clone(),
            quantity: key.quantity,
            rfq_label: key.label,
            side: key.side,
            ats_indicator: key.ats,
            subscribe: None,
            unsubscribe: None,
        }
    }

    /// The subscription key this entry names.
    #[must_use]
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey {
            figi: self.figi.clone(),
            side: self.side,
            quantity: self.quantity,
            label: self.rfq_label,
            ats: self.ats_indicator,
        }
    }
}

/// Batched subscribe or unsubscribe.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRequest {
    /// Session token.
    pub token: String,
    /// Entries.
    pub inference: Vec<InferenceItem>,
}

impl SubscriptionRequest {
    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Server Messages
// =============================================================================

/// Authentication accepted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthenticatedMessage {
    /// Token to attach to subscription requests.
    pub token: String,
}

/// Error with code and description. Code 402 means invalid credentials.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorMessage {
    /// Error code.
    pub code: i32,
    /// Description.
    #[serde(default)]
    pub msg: String,
}

/// Subscribe or unsubscribe acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AckMessage {
    /// Acknowledged entries.
    #[serde(default)]
    pub inference: Vec<InferenceItem>,
}

/// Subscription rejection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RejectedMessage {
    /// Rejected entries.
    #[serde(default)]
    pub inference: Vec<InferenceItem>,
    /// Reason.
    #[serde(default)]
    pub msg: String,
}

/// A label value: one number or a percentile ladder.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum LadderValue {
    /// Percentile ladder.
    Many(Vec<rust_decimal::Decimal>),
    /// Single value.
    One(rust_decimal::Decimal),
}

impl LadderValue {
    /// Values as a ladder.
    #[must_use]
    pub fn into_vec(self) -> Vec<rust_decimal::Decimal> {
        match self {
            Self::Many(values) => values,
            Self::One(value) => vec![value],
        }
    }
}

/// One pushed quote, loosely typed as sent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QuoteItem {
    /// Instrument.
    #[serde(default)]
    pub figi: String,
    /// Side.
    #[serde(default)]
    pub side: String,
    /// Quantity; integral but may arrive as a float.
    pub quantity: Option<f64>,
    /// ATS flag.
    #[serde(default)]
    pub ats_indicator: String,
    /// Price ladder.
    pub price: Option<LadderValue>,
    /// Yield ladder.
    pub ytm: Option<LadderValue>,
    /// Spread ladder.
    pub spread: Option<LadderValue>,
    /// ISO-8601 timestamp.
    pub date: Option<String>,
}

/// Decoded server message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Authentication accepted.
    Authenticated(AuthenticatedMessage),
    /// Error.
    Error(ErrorMessage),
    /// Subscriptions acknowledged.
    Subscribed(AckMessage),
    /// Unsubscriptions acknowledged.
    Unsubscribed(AckMessage),
    /// Subscriptions rejected.
    Rejected(RejectedMessage),
    /// Server heartbeat.
    Heartbeat,
    /// Quote push. Items are kept raw so one bad item does not sink the batch.
    Quotes(Vec<serde_json::Value>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SubscriptionKey {
        SubscriptionKey {
            figi: Figi::parse("BBG000BLNNH6").unwrap(),
            side: Side::Bid,
            quantity: Quantity::new(1_000_000).unwrap(),
            label: QuoteLabel::Price,
            ats: Ats::Yes,
        }
    }

    #[test]
    fn subscribe_item_wire_shape() {
        let json = serde_json::to_value(InferenceItem::subscribe(&key())).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "figi": "BBG000BLNNH6",
                "quantity": 1_000_000,
                "rfq_label": "price",
                "side": "bid",
                "ats_indicator": "Y",
                "subscribe": true
            })
        );
    }

    #[test]
    fn unsubscribe_item_has_no_subscribe_marker() {
        let json = serde_json::to_value(InferenceItem::unsubscribe(&key())).unwrap();
        assert_eq!(json["unsubscribe"], true);
        assert!(json.get("subscribe").is_none());
    }

    #[test]
    fn auth_request_debug_redacts_password() {
        let request = AuthRequest::new("trader@example.com".into(), "hunter2".into());
        let debug = format!("{request:?}");
        assert!(debug.contains("trader@example.com"));
        assert!(!debug.contains("hunter2"));
        assert_eq!(
            request.to_json().unwrap(),
            r#"{"action":"auth","email":"trader@example.com","password":"hunter2"}"#
        );
    }

    #[test]
    fn ladder_accepts_scalar_or_array() {
        let one: LadderValue = serde_json::from_str("101.25").unwrap();
        let many: LadderValue = serde_json::from_str("[1, 2.5]").unwrap();
        assert_eq!(one.into_vec().len(), 1);
        assert_eq!(many.into_vec().len(), 2);
    }

    #[test]
    fn ack_item_round_trips_to_key() {
        let item: InferenceItem = serde_json::from_str(
            r#"{"figi":"BBG000BLNNH6","quantity":1000000,"rfq_label":"price","side":"bid","ats_indicator":"Y"}"#,
        )
        .unwrap();
        assert_eq!(item.key(), key());
    }
}
