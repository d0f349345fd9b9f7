//! Stream Codec
//!
//! Decodes server frames into [`ServerMessage`]s and pushed quote items into
//! domain [`QuoteUpdate`]s; encodes subscription batches.

use chrono::{DateTime, Utc};

use super::messages::{
    AckMessage, AuthenticatedMessage, ErrorMessage, InferenceItem, LadderValue, QuoteItem,
    RejectedMessage, ServerMessage, SubscriptionRequest,
};
use crate::application::ports::SubscriptionAction;
use crate::domain::instrument::Figi;
use crate::domain::quote::{Ats, Quantity, QuoteFields, QuoteUpdate, Side};
use crate::domain::session::SessionToken;
use crate::domain::subscription::SubscriptionKey;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unknown `type` value.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// Frame is not a JSON object or lacks a recognizable shape.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    /// A quote item field is missing or outside its domain.
    #[error("invalid quote field {field}: {value}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: String,
    },

    /// A quote item carries no values.
    #[error("quote item has no price, ytm or spread")]
    EmptyQuote,
}

/// JSON codec for the market-data stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not JSON, is not an object, or has an
    /// unknown `type`.
    pub fn decode(&self, text: &str) -> Result<ServerMessage, CodecError> {
        let value: serde_json::Value = serde_json::from_str(text.trim())?;
        if !value.is_object() {
            return Err(CodecError::InvalidFormat(preview(text)));
        }
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned);

        match kind.as_deref() {
            Some("authenticated") => Ok(ServerMessage::Authenticated(
                serde_json::from_value::<AuthenticatedMessage>(value)?,
            )),
            Some("error") => Ok(ServerMessage::Error(serde_json::from_value::<ErrorMessage>(
                value,
            )?)),
            Some("subscribed") => Ok(ServerMessage::Subscribed(
                serde_json::from_value::<AckMessage>(value)?,
            )),
            Some("unsubscribed") => Ok(ServerMessage::Unsubscribed(
                serde_json::from_value::<AckMessage>(value)?,
            )),
            Some("rejected") => Ok(ServerMessage::Rejected(
                serde_json::from_value::<RejectedMessage>(value)?,
            )),
            Some("heartbeat") => Ok(ServerMessage::Heartbeat),
            Some(other) => Err(CodecError::UnknownMessageType(other.to_string())),
            None => value
                .get("inference")
                .and_then(serde_json::Value::as_array)
                .cloned()
                .map(ServerMessage::Quotes)
                .ok_or_else(|| CodecError::InvalidFormat(preview(text))),
        }
    }

    /// Decode one raw quote item.
    ///
    /// # Errors
    ///
    /// Returns an error if a key field is missing or invalid, or the item
    /// carries no values.
    pub fn decode_quote(&self, raw: serde_json::Value) -> Result<QuoteUpdate, CodecError> {
        let item: QuoteItem = serde_json::from_value(raw)?;

        let figi = Figi::parse(&item.figi).map_err(|_| CodecError::InvalidField {
            field: "figi",
            value: item.figi.clone(),
        })?;
        let side = Side::parse(&item.side).ok_or_else(|| CodecError::InvalidField {
            field: "side",
            value: item.side.clone(),
        })?;
        let quantity = item
            .quantity
            .and_then(Quantity::from_number)
            .ok_or_else(|| CodecError::InvalidField {
                field: "quantity",
                value: item.quantity.map_or_else(String::new, |q| q.to_string()),
            })?;
        let ats = Ats::parse(&item.ats_indicator).ok_or_else(|| CodecError::InvalidField {
            field: "ats_indicator",
            value: item.ats_indicator.clone(),
        })?;

        let fields = QuoteFields {
            price: item.price.map(LadderValue::into_vec),
            ytm: item.ytm.map(LadderValue::into_vec),
            spread: item.spread.map(LadderValue::into_vec),
        };
        if fields.is_empty() {
            return Err(CodecError::EmptyQuote);
        }

        let timestamp = item.date.as_deref().and_then(parse_timestamp);

        Ok(QuoteUpdate {
            figi,
            side,
            quantity,
            ats,
            fields,
            timestamp,
        })
    }

    /// Encode a subscription batch.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode_subscription(
        &self,
        token: &SessionToken,
        action: SubscriptionAction,
        keys: &[SubscriptionKey],
    ) -> Result<String, CodecError> {
        let inference = keys
            .iter()
            .map(|key| match action {
                SubscriptionAction::Subscribe => InferenceItem::subscribe(key),
                SubscriptionAction::Unsubscribe => InferenceItem::unsubscribe(key),
            })
            .collect();
        let request = SubscriptionRequest {
            token: token.expose().to_string(),
            inference,
        };
        Ok(request.to_json()?)
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw.trim()) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            tracing::debug!(date = raw, error = %e, "Unparseable quote timestamp");
            None
        }
    }
}

fn preview(text: &str) -> String {
    text.chars().take(50).collect()
}
