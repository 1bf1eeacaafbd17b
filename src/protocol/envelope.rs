//! Wire envelope types.
//!
//! Every frame is a JSON object. The `type` field selects a reserved
//! control frame; anything else is an application message passed through
//! untouched.
//!
//! # Format
//!
//! ```json
//! { "type": "ack",  "id": "uuid", "timestamp": 1700000000000 }
//! { "type": "ping", "timestamp": 1700000000000 }
//! { "type": "pong", "timestamp": 1700000000000 }
//! { "id": "uuid", "type": "chat", "ack_required": true, ... }
//! ```

// ============================================================================
// Imports
// ============================================================================

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, from_str, to_string};

use crate::error::{Error, Result};
use crate::identifiers::MessageId;

// ============================================================================
// Constants
// ============================================================================

/// Field carrying the message identifier.
pub const ID_FIELD: &str = "id";

/// Field selecting the frame type.
pub const TYPE_FIELD: &str = "type";

/// Field asking the receiver to acknowledge.
pub const ACK_REQUIRED_FIELD: &str = "ack_required";

// ============================================================================
// Envelope
// ============================================================================

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Acknowledgment of a message we sent.
    Ack {
        /// ID of the acknowledged message.
        id: MessageId,
        /// Remote timestamp (ms since epoch), if provided.
        timestamp: Option<f64>,
    },

    /// Liveness probe from the remote end.
    Ping {
        /// Remote timestamp (ms since epoch), if provided.
        timestamp: Option<f64>,
    },

    /// Reply to one of our pings.
    Pong {
        /// Echoed timestamp (ms since epoch), if provided.
        timestamp: Option<f64>,
    },

    /// Any other frame, kept as raw JSON.
    Message(InboundMessage),
}

/// An application message received from the remote end.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Message ID used for dedup and acknowledgment.
    pub id: Option<MessageId>,

    /// Value of the `type` field, if any.
    pub kind: Option<String>,

    /// Whether the sender expects an `ack`.
    pub ack_required: bool,

    /// The full frame as received.
    pub body: Value,
}

impl Envelope {
    /// Decodes a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the frame is not a JSON object or an
    /// `ack` frame carries no usable `id`.
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = from_str(text).map_err(|e| Error::decode(e.to_string()))?;

        let Value::Object(fields) = &value else {
            return Err(Error::decode("frame is not a JSON object"));
        };

        let id = fields.get(ID_FIELD).and_then(MessageId::from_json);
        let timestamp = fields.get("timestamp").and_then(Value::as_f64);

        match fields.get(TYPE_FIELD).and_then(Value::as_str) {
            Some("ack") => {
                let id = id.ok_or_else(|| Error::decode("ack frame without id"))?;
                Ok(Self::Ack { id, timestamp })
            }
            Some("ping") => Ok(Self::Ping { timestamp }),
            Some("pong") => Ok(Self::Pong { timestamp }),
            kind => Ok(Self::Message(InboundMessage {
                id,
                kind: kind.map(str::to_owned),
                ack_required: fields
                    .get(ACK_REQUIRED_FIELD)
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                body: value.clone(),
            })),
        }
    }
}

// ============================================================================
// ControlFrame
// ============================================================================

/// A control frame emitted by the local end.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    /// Acknowledges an inbound message.
    Ack {
        /// ID of the message being acknowledged.
        id: MessageId,
        /// Local timestamp (ms since epoch).
        timestamp: f64,
    },

    /// Heartbeat probe.
    Ping {
        /// Local timestamp (ms since epoch).
        timestamp: f64,
    },

    /// Reply to a remote ping.
    Pong {
        /// Echo of the ping timestamp, or local time if absent.
        timestamp: f64,
    },
}

impl ControlFrame {
    /// Creates an `ack` for the given message.
    #[inline]
    #[must_use]
    pub fn ack(id: MessageId) -> Self {
        Self::Ack {
            id,
            timestamp: now_millis(),
        }
    }

    /// Creates a `ping` stamped with the current time.
    #[inline]
    #[must_use]
    pub fn ping() -> Self {
        Self::Ping {
            timestamp: now_millis(),
        }
    }

    /// Creates a `pong` echoing the ping timestamp.
    #[inline]
    #[must_use]
    pub fn pong(echo: Option<f64>) -> Self {
        Self::Pong {
            timestamp: echo.unwrap_or_else(now_millis),
        }
    }

    /// Serializes the frame to JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails.
    pub fn encode(&self) -> Result<String> {
        Ok(to_string(self)?)
    }
}

// ============================================================================
// Outbound Helpers
// ============================================================================

/// Ensures an outbound object carries an `id`, generating one if absent.
///
/// Sets `ack_required` when the sender wants an acknowledgment.
///
/// # Errors
///
/// Returns [`Error::InvalidMessage`] if `content` is not a JSON object.
pub fn stamp_outbound(content: Value, require_ack: bool) -> Result<(MessageId, Value)> {
    let Value::Object(mut fields) = content else {
        return Err(Error::invalid_message("outbound message must be a JSON object"));
    };

    let id = match fields.get(ID_FIELD).and_then(MessageId::from_json) {
        Some(id) => id,
        None => {
            let id = MessageId::generate();
            fields.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
            id
        }
    };

    if require_ack {
        fields.insert(ACK_REQUIRED_FIELD.to_string(), Value::Bool(true));
    }

    Ok((id, Value::Object(fields)))
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[inline]
#[must_use]
pub fn now_millis() -> f64 {
    Utc::now().timestamp_millis() as f64
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_decode_ack() {
        let env = Envelope::decode(r#"{"type":"ack","id":"m-1","timestamp":5}"#).unwrap();
        assert_eq!(
            env,
            Envelope::Ack {
                id: MessageId::new("m-1"),
                timestamp: Some(5.0),
            }
        );
    }

    #[test]
    fn test_decode_ack_without_id_fails() {
        let err = Envelope::decode(r#"{"type":"ack"}"#).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn test_decode_ping_and_pong() {
        assert_eq!(
            Envelope::decode(r#"{"type":"pong"}"#).unwrap(),
            Envelope::Pong { timestamp: None }
        );
        assert_eq!(
            Envelope::decode(r#"{"type":"ping","timestamp":12.5}"#).unwrap(),
            Envelope::Ping {
                timestamp: Some(12.5)
            }
        );
    }

    #[test]
    fn test_decode_application_message() {
        let env =
            Envelope::decode(r#"{"id":"x","type":"chat","text":"hi","ack_required":true}"#)
                .unwrap();

        let Envelope::Message(msg) = env else {
            panic!("expected application message");
        };
        assert_eq!(msg.id, Some(MessageId::new("x")));
        assert_eq!(msg.kind.as_deref(), Some("chat"));
        assert!(msg.ack_required);
        assert_eq!(msg.body["text"], "hi");
    }

    #[test]
    fn test_decode_rejects_non_objects() {
        assert!(Envelope::decode("not json").is_err());
        assert!(Envelope::decode("[1,2,3]").is_err());
        assert!(Envelope::decode("\"text\"").is_err());
    }

    #[test]
    fn test_control_frames_encode_with_type_tag() {
        let ack: Value = from_str(&ControlFrame::ack(MessageId::new("a")).encode().unwrap()).unwrap();
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["id"], "a");
        assert!(ack["timestamp"].is_number());

        let pong: Value = from_str(&ControlFrame::pong(Some(7.0)).encode().unwrap()).unwrap();
        assert_eq!(pong, json!({ "type": "pong", "timestamp": 7.0 }));
    }

    #[test]
    fn test_stamp_outbound_assigns_id() {
        let (id, body) = stamp_outbound(json!({ "text": "hi" }), true).unwrap();
        assert_eq!(body["id"], id.as_str());
        assert_eq!(body["ack_required"], true);
    }

    #[test]
    fn test_stamp_outbound_keeps_existing_id() {
        let (id, body) = stamp_outbound(json!({ "id": "mine" }), false).unwrap();
        assert_eq!(id, MessageId::new("mine"));
        assert!(body.get("ack_required").is_none());
    }

    #[test]
    fn test_stamp_outbound_rejects_scalars() {
        let err = stamp_outbound(json!(3), false).unwrap_err();
        assert!(matches!(err, Error::InvalidMessage { .. }));
        assert!(stamp_outbound(json!({}), false).is_ok());
    }
}
