//! One live SSE subscription.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::response::sse::Event;
use metrics::counter;
use serde_json::json;
use tether_core::codec;
use tether_core::protocol::{EVENT_CONNECTED, EVENT_MESSAGE, HubMessage};
use tether_core::RichValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::metrics::HUB_DROPS_TOTAL;

/// Something queued for a subscriber.
#[derive(Clone, Debug, PartialEq)]
pub enum HubEvent {
    /// SSE comment keeping intermediaries from timing out the connection.
    KeepAlive,
    /// Sent once the subscription is registered.
    Connected {
        /// Subscriber id.
        user_id: String,
        /// Subscription id.
        subscription_id: String,
    },
    /// A routed message.
    Message(HubMessage),
    /// A server push under a custom event name.
    Custom {
        /// SSE event name.
        event: String,
        /// Payload.
        payload: RichValue,
    },
}

impl HubEvent {
    /// Render as an SSE event.
    pub fn into_sse(self) -> Event {
        match self {
            Self::KeepAlive => Event::default().comment("keep-alive"),
            Self::Connected {
                user_id,
                subscription_id,
            } => Event::default().event(EVENT_CONNECTED).data(
                json!({ "userId": user_id, "subscriptionId": subscription_id }).to_string(),
            ),
            Self::Message(message) => match serde_json::to_string(&message) {
                Ok(data) => Event::default().event(EVENT_MESSAGE).data(data),
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "failed to serialize hub message");
                    Event::default().comment("dropped")
                }
            },
            Self::Custom { event, payload } => match codec::encode(&payload) {
                Ok(data) => Event::default().event(event).data(data),
                Err(e) => {
                    warn!(event = %event, error = %e, "failed to encode push payload");
                    Event::default().comment("dropped")
                }
            },
        }
    }
}

/// Server side of a subscriber's SSE connection.
pub struct Subscription {
    /// Unique subscription id.
    pub id: String,
    /// Subscriber.
    pub user_id: String,
    tx: mpsc::Sender<HubEvent>,
    cancel: CancellationToken,
    /// When the subscription opened.
    pub connected_at: Instant,
    dropped: AtomicU64,
}

impl Subscription {
    /// New subscription feeding `tx`.
    pub fn new(user_id: impl Into<String>, tx: mpsc::Sender<HubEvent>) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            user_id: user_id.into(),
            tx,
            cancel: CancellationToken::new(),
            connected_at: Instant::now(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue an event without waiting.
    ///
    /// Returns `false` if the buffer is full or the subscriber is gone.
    pub fn send(&self, event: HubEvent) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.tx.try_send(event).is_ok() {
            true
        } else {
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            counter!(HUB_DROPS_TOTAL).increment(1);
            false
        }
    }

    /// Events dropped on a full buffer.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the subscription; its stream ends at the next poll.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether the subscription was closed or the receiver went away.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Whether the SSE side dropped its receiver.
    pub fn receiver_gone(&self) -> bool {
        self.tx.is_closed()
    }

    /// Cancellation token tied to this subscription.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves once the subscription is closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Subscription age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(buffer: usize) -> (Subscription, mpsc::Receiver<HubEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Subscription::new("u1", tx), rx)
    }

    #[tokio::test]
    async fn send_delivers_in_order() {
        let (sub, mut rx) = make(8);
        assert!(sub.send(HubEvent::KeepAlive));
        assert!(sub.send(HubEvent::Message(HubMessage::new("a", "u1", "hi".into()))));
        assert_eq!(rx.recv().await.unwrap(), HubEvent::KeepAlive);
        assert!(matches!(rx.recv().await.unwrap(), HubEvent::Message(m) if m.from == "a"));
    }

    #[tokio::test]
    async fn full_buffer_drops_and_counts() {
        let (sub, _rx) = make(1);
        assert!(sub.send(HubEvent::KeepAlive));
        assert!(!sub.send(HubEvent::KeepAlive));
        assert_eq!(sub.drop_count(), 1);
    }

    #[tokio::test]
    async fn closed_subscription_refuses_events() {
        let (sub, rx) = make(4);
        sub.close();
        assert!(sub.is_closed());
        assert!(!sub.send(HubEvent::KeepAlive));
        drop(rx);
    }

    #[tokio::test]
    async fn dropped_receiver_counts_as_closed() {
        let (sub, rx) = make(4);
        drop(rx);
        assert!(sub.is_closed());
    }

    #[test]
    fn ids_are_unique() {
        let (a, _ra) = make(1);
        let (b, _rb) = make(1);
        assert_ne!(a.id, b.id);
        assert!(a.age() < Duration::from_secs(5));
    }
}
