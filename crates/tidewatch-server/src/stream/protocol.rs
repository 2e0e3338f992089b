//! Wire framing for the event stream.
//!
//! Every frame is a JSON envelope `{"type": ..., "data": ...}`. Clients send
//! `subscribe`; the server sends `event`, `subscription_confirmed` and
//! `error`. Decoding failures are reported back to the client as `error`
//! frames and never close the connection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;
use tidewatch_events::SystemEvent;
use tidewatch_types::{Channel, EventKind};
use uuid::Uuid;

/// Inbound envelope before its `data` is interpreted.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// `data` of a `subscribe` frame.
#[derive(Debug, Deserialize)]
struct SubscribeData {
    channel: String,
    /// Epoch milliseconds.
    #[serde(default)]
    last_seen: Option<i64>,
}

/// A validated subscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub channel: Channel,
    /// Replay events created strictly after this instant. `None` means no
    /// history is owed.
    pub last_seen: Option<DateTime<Utc>>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Subscribe(SubscriptionRequest),
}

/// Reasons an inbound frame is rejected. The `Display` text is what the
/// client receives in the `error` frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid message")]
    InvalidMessage,
    #[error("invalid subscription request")]
    InvalidSubscription,
    #[error("unknown channel")]
    UnknownChannel(String),
    #[error("unknown message type")]
    UnknownType(String),
}

/// Decodes one inbound text frame.
///
/// # Errors
///
/// Returns the [`ProtocolError`] to report to the client.
pub fn decode(text: &str) -> Result<Inbound, ProtocolError> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|_| ProtocolError::InvalidMessage)?;

    match envelope.kind.as_str() {
        "subscribe" => {
            let data = envelope.data.ok_or(ProtocolError::InvalidSubscription)?;
            let data: SubscribeData =
                serde_json::from_value(data).map_err(|_| ProtocolError::InvalidSubscription)?;

            let last_seen = data
                .last_seen
                .map(|ms| DateTime::from_timestamp_millis(ms).ok_or(ProtocolError::InvalidSubscription))
                .transpose()?;

            let channel = data
                .channel
                .parse::<Channel>()
                .map_err(|e| ProtocolError::UnknownChannel(e.0))?;

            Ok(Inbound::Subscribe(SubscriptionRequest { channel, last_seen }))
        }
        _ => Err(ProtocolError::UnknownType(envelope.kind)),
    }
}

/// `data` of an `event` frame.
#[derive(Debug, Clone, Serialize)]
pub struct EventMessage {
    pub id: i64,
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<Uuid>,
    /// Forwarded verbatim, including labels this build does not know.
    pub event_type: EventKind,
    /// The stored payload, forwarded without re-encoding.
    pub event_data: Box<RawValue>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<&SystemEvent> for EventMessage {
    type Error = serde_json::Error;

    /// Fails when the stored payload is not valid JSON.
    fn try_from(event: &SystemEvent) -> Result<Self, Self::Error> {
        let event_data = if event.payload.is_empty() {
            RawValue::from_string("null".to_string())?
        } else {
            serde_json::from_slice::<Box<RawValue>>(&event.payload)?
        };

        Ok(Self {
            id: event.id,
            public_key: event.public_key.clone(),
            policy_id: event.policy_id,
            event_type: event.kind.clone(),
            event_data,
            created_at: event.created_at,
        })
    }
}

/// Outbound frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutgoingMessage {
    Event(EventMessage),
    SubscriptionConfirmed { channel: Channel },
    Error { message: String },
}

impl OutgoingMessage {
    /// Serializes the frame.
    ///
    /// # Errors
    ///
    /// Returns the serialization error; in practice only event frames with
    /// an invalid payload fail, and those are caught earlier by
    /// [`encode_event`].
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Builds the `event` frame for `event`.
///
/// # Errors
///
/// Fails when the stored payload is not valid JSON.
pub fn encode_event(event: &SystemEvent) -> Result<String, serde_json::Error> {
    OutgoingMessage::Event(EventMessage::try_from(event)?).to_json()
}

/// Builds the `subscription_confirmed` frame for `channel`.
pub fn encode_confirmation(channel: Channel) -> String {
    encode_control(OutgoingMessage::SubscriptionConfirmed { channel })
}

/// Builds an `error` frame carrying `message`.
pub fn encode_error(message: &str) -> String {
    encode_control(OutgoingMessage::Error {
        message: message.to_string(),
    })
}

/// Serializes a frame that holds no event payload. Those frames are plain
/// strings and enum labels, so serialization cannot fail.
fn encode_control(frame: OutgoingMessage) -> String {
    frame
        .to_json()
        .unwrap_or_else(|_| r#"{"type":"error","data":{"message":"internal error"}}"#.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::{json, Value};
    use tidewatch_types::SystemEventKind;

    fn sample_event(policy_id: Option<Uuid>, payload: &[u8]) -> SystemEvent {
        SystemEvent {
            id: 7,
            public_key: Some("02abc".to_string()),
            policy_id,
            kind: SystemEventKind::PolicyCreated.into(),
            payload: payload.to_vec(),
            created_at: Utc.timestamp_millis_opt(1_700_000_000_250).unwrap(),
        }
    }

    #[test]
    fn decode_subscribe_with_cursor() {
        let inbound =
            decode(r#"{"type":"subscribe","data":{"channel":"system_events","last_seen":50}}"#)
                .unwrap();
        assert_eq!(
            inbound,
            Inbound::Subscribe(SubscriptionRequest {
                channel: Channel::SystemEvents,
                last_seen: Some(Utc.timestamp_millis_opt(50).unwrap()),
            })
        );
    }

    #[test]
    fn decode_subscribe_without_cursor() {
        let inbound = decode(r#"{"type":"subscribe","data":{"channel":"system_events"}}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Subscribe(SubscriptionRequest {
                channel: Channel::SystemEvents,
                last_seen: None,
            })
        );
    }

    #[test]
    fn decode_rejects_malformed_subscription() {
        for text in [
            r#"{"type":"subscribe"}"#,
            r#"{"type":"subscribe","data":"system_events"}"#,
            r#"{"type":"subscribe","data":{"last_seen":5}}"#,
            r#"{"type":"subscribe","data":{"channel":"system_events","last_seen":"yesterday"}}"#,
            r#"{"type":"subscribe","data":{"channel":"system_events","last_seen":9223372036854775807}}"#,
        ] {
            assert_eq!(decode(text), Err(ProtocolError::InvalidSubscription), "{text}");
        }
    }

    #[test]
    fn decode_rejects_unknown_channel_and_type() {
        let err = decode(r#"{"type":"subscribe","data":{"channel":"policies"}}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownChannel("policies".to_string()));
        assert_eq!(err.to_string(), "unknown channel");

        let err = decode(r#"{"type":"unsubscribe","data":{}}"#).unwrap_err();
        assert_eq!(err.to_string(), "unknown message type");

        assert_eq!(decode("not json"), Err(ProtocolError::InvalidMessage));
        assert_eq!(decode(r#"{"data":{}}"#), Err(ProtocolError::InvalidMessage));
    }

    #[test]
    fn event_frame_omits_null_policy_id() {
        let frame: Value = serde_json::from_str(&encode_event(&sample_event(None, b"")).unwrap()).unwrap();
        assert_eq!(frame["type"], "event");
        let data = frame["data"].as_object().unwrap();
        assert!(!data.contains_key("policy_id"));
        assert_eq!(data["public_key"], "02abc");
        assert_eq!(data["event_data"], Value::Null);
        assert_eq!(data["event_type"], "policy_created");
    }

    #[test]
    fn event_frame_includes_policy_id_and_raw_payload() {
        let policy_id = Uuid::new_v4();
        let frame: Value = serde_json::from_str(
            &encode_event(&sample_event(Some(policy_id), br#"{"amount": 5, "to": ["a"]}"#)).unwrap(),
        )
        .unwrap();

        assert_eq!(frame["data"]["policy_id"], policy_id.to_string());
        assert_eq!(frame["data"]["event_data"], json!({"amount": 5, "to": ["a"]}));

        let created_at = frame["data"]["created_at"].as_str().unwrap();
        let parsed = DateTime::parse_from_rfc3339(created_at).unwrap();
        assert_eq!(parsed.timestamp_millis(), 1_700_000_000_250);
    }

    #[test]
    fn event_frame_forwards_unknown_kind_label() {
        let mut event = sample_event(None, b"");
        event.kind = EventKind::Unrecognized("vault_created".to_string());

        let frame: Value = serde_json::from_str(&encode_event(&event).unwrap()).unwrap();
        assert_eq!(frame["data"]["event_type"], "vault_created");
    }

    #[test]
    fn event_frame_rejects_invalid_payload() {
        assert!(encode_event(&sample_event(None, b"{not json")).is_err());
    }

    #[test]
    fn confirmation_and_error_frames() {
        let confirmed: Value = serde_json::from_str(&encode_confirmation(Channel::SystemEvents)).unwrap();
        assert_eq!(confirmed, json!({"type":"subscription_confirmed","data":{"channel":"system_events"}}));

        let error: Value = serde_json::from_str(&encode_error("unknown channel")).unwrap();
        assert_eq!(error, json!({"type":"error","data":{"message":"unknown channel"}}));
    }
}
