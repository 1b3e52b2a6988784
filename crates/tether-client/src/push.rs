//! Consumer side of the server push hub.

use eventsource_stream::{Event, Eventsource};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Deserialize;
use tether_core::codec;
use tether_core::protocol::{EVENT_CONNECTED, EVENT_MESSAGE, HubMessage};
use tether_core::RichValue;

use crate::errors::{ClientError, Result};

/// An event received on a subscription.
#[derive(Clone, Debug, PartialEq)]
pub enum PushEvent {
    /// The subscription is registered.
    Connected {
        /// Our user id.
        user_id: String,
        /// Server-side subscription id.
        subscription_id: String,
    },
    /// A message routed by the hub.
    Message(HubMessage),
    /// A server push under a custom event name.
    Custom {
        /// SSE event name.
        event: String,
        /// Payload.
        payload: RichValue,
    },
}

/// Events of one subscription. Ends when the server closes it.
pub type PushStream = BoxStream<'static, Result<PushEvent>>;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectedData {
    user_id: String,
    subscription_id: String,
}

pub(crate) fn parse_event(event: &Event) -> Result<PushEvent> {
    match event.event.as_str() {
        EVENT_CONNECTED => {
            let data: ConnectedData = serde_json::from_str(&event.data)?;
            Ok(PushEvent::Connected {
                user_id: data.user_id,
                subscription_id: data.subscription_id,
            })
        }
        EVENT_MESSAGE => Ok(PushEvent::Message(serde_json::from_str(&event.data)?)),
        other => Ok(PushEvent::Custom {
            event: other.to_owned(),
            payload: codec::decode(&event.data)?,
        }),
    }
}

pub(crate) fn push_stream(resp: reqwest::Response) -> PushStream {
    resp.bytes_stream()
        .eventsource()
        .map(|item| match item {
            Ok(event) => parse_event(&event),
            Err(e) => Err(ClientError::Stream(e.to_string())),
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, data: &str) -> Event {
        Event {
            event: name.to_owned(),
            data: data.to_owned(),
            id: String::new(),
            retry: None,
        }
    }

    #[test]
    fn connected_event() {
        let parsed = parse_event(&event("connected", r#"{"userId":"u1","subscriptionId":"s1"}"#)).unwrap();
        assert_eq!(
            parsed,
            PushEvent::Connected {
                user_id: "u1".into(),
                subscription_id: "s1".into(),
            }
        );
    }

    #[test]
    fn message_event() {
        let message = HubMessage::new("a", "b", "hi".into());
        let data = serde_json::to_string(&message).unwrap();
        assert_eq!(parse_event(&event("message", &data)).unwrap(), PushEvent::Message(message));
    }

    #[test]
    fn custom_event_decodes_rich_payload() {
        let parsed = parse_event(&event("presence", r#"{"online":true}"#)).unwrap();
        match parsed {
            PushEvent::Custom { event, payload } => {
                assert_eq!(event, "presence");
                assert!(payload.get("online").is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_message_is_decode_error() {
        let err = parse_event(&event("message", "not json")).unwrap_err();
        assert!(matches!(err, ClientError::Decode(_)));
    }
}
