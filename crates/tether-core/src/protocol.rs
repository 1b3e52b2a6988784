//! Wire constants and fixed-endpoint payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::RichValue;
use crate::principal::PrincipalView;

/// Header distinguishing raw event streams from converted generators.
pub const STREAM_KIND_HEADER: &str = "x-tether-stream";
/// [`STREAM_KIND_HEADER`] value for materializer-converted generators.
pub const STREAM_KIND_GENERATOR: &str = "generator";
/// [`STREAM_KIND_HEADER`] value for pre-framed event streams.
pub const STREAM_KIND_RAW: &str = "raw";

/// `text/event-stream`
pub const CONTENT_TYPE_EVENT_STREAM: &str = "text/event-stream";
/// `application/json`
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// `application/octet-stream`
pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// SSE event name closing a generator stream.
pub const EVENT_END: &str = "end";
/// SSE event name carrying a terminal error.
pub const EVENT_ERROR: &str = "error";
/// SSE event name for hub messages.
pub const EVENT_MESSAGE: &str = "message";
/// SSE event name sent once a subscription is registered.
pub const EVENT_CONNECTED: &str = "connected";

/// Default dispatcher prefix.
pub const DEFAULT_PREFIX: &str = "/api";
/// Credential login.
pub const LOGIN_PATH: &str = "/login";
/// Anonymous identity issuance.
pub const GUEST_PATH: &str = "/guest";
/// Hub publish.
pub const PUBLISH_PATH: &str = "/publish";
/// Hub subscribe (long-lived SSE).
pub const SUBSCRIBE_PATH: &str = "/subscribe";
/// Query parameter carrying a token where headers cannot be set.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Body of an application-level error response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
}

/// `POST /login` body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    /// User id.
    pub username: String,
    /// Plain-text password.
    pub password: String,
}

/// Response of `/login` and `/guest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    /// Bearer token.
    pub token: String,
    /// The authenticated identity.
    pub user: PrincipalView,
}

/// `POST /publish` body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishRequest {
    /// Recipient id (user or in-process client).
    pub to: String,
    /// Message payload.
    #[serde(default = "null_payload")]
    pub payload: RichValue,
}

fn null_payload() -> RichValue {
    RichValue::Null
}

/// Immediate acknowledgement of a publish.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishAck {
    /// Whether the message was handed to a live recipient.
    pub delivered: bool,
    /// Message id.
    pub id: String,
}

/// A message routed through the hub.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HubMessage {
    /// Message id (UUID v7).
    pub id: String,
    /// Sender id.
    pub from: String,
    /// Recipient id.
    pub to: String,
    /// Payload.
    pub payload: RichValue,
    /// When the hub accepted the message.
    pub timestamp: DateTime<Utc>,
}

impl HubMessage {
    /// Create a message stamped now.
    pub fn new(from: impl Into<String>, to: impl Into<String>, payload: RichValue) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            from: from.into(),
            to: to.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Build a reply addressed back to this message's sender.
    pub fn reply(&self, payload: RichValue) -> Self {
        Self::new(self.to.clone(), self.from.clone(), payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_swaps_sender_and_recipient() {
        let msg = HubMessage::new("u1", "bot", "ping".into());
        let reply = msg.reply("pong".into());
        assert_eq!(reply.from, "bot");
        assert_eq!(reply.to, "u1");
        assert_ne!(reply.id, msg.id);
    }

    #[test]
    fn publish_request_payload_defaults_to_null() {
        let req: PublishRequest = serde_json::from_str(r#"{"to":"u2"}"#).unwrap();
        assert!(req.payload.is_null());
    }

    #[test]
    fn hub_message_payload_keeps_rich_values() {
        let msg = HubMessage::new("u1", "u2", RichValue::bytes(vec![1u8, 2]));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("$bytes"));
        let back: HubMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
