//! Server push hub.
//!
//! Each user holds at most one long-lived SSE subscription; opening a new one
//! closes the previous. Messages published to a user go to their
//! subscription as `message` events. Messages published to a registered
//! in-process [`HubClient`] are delivered on a background task, and any
//! reply the client returns is pushed to the sender's subscription.

pub mod keep_alive;
pub mod subscription;

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::response::sse::Event;
use futures::Stream;
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use tether_core::protocol::{HubMessage, PublishAck, PublishRequest};
use tether_core::{RichValue, RpcError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics::{HUB_MESSAGES_TOTAL, HUB_SUBSCRIPTIONS_ACTIVE};

pub use self::subscription::{HubEvent, Subscription};

/// An in-process participant addressable by id.
#[async_trait]
pub trait HubClient: Send + Sync {
    /// Handle a message. A returned payload is sent back to the sender.
    async fn on_message(&self, message: HubMessage) -> Option<RichValue>;
}

/// Module callbacks around subscription lifetime.
#[async_trait]
pub trait SubscriptionHooks: Send + Sync {
    /// A user opened a subscription. Events pushed here are delivered after
    /// the `connected` event.
    async fn on_connect(&self, _hub: &Hub, _user_id: &str) {}

    /// A user's live subscription ended.
    async fn on_disconnect(&self, _hub: &Hub, _user_id: &str) {}
}

/// Hub tuning.
#[derive(Clone, Copy, Debug)]
pub struct HubConfig {
    /// Interval between keep-alive comments.
    pub keep_alive: Duration,
    /// Per-subscription event buffer.
    pub buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(8),
            buffer: 256,
        }
    }
}

/// Subscription registry and message router.
pub struct Hub {
    config: HubConfig,
    subscriptions: RwLock<HashMap<String, Arc<Subscription>>>,
    clients: RwLock<HashMap<String, Arc<dyn HubClient>>>,
    hooks: Vec<Arc<dyn SubscriptionHooks>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    /// Hub with the given hooks.
    pub fn new(config: HubConfig, hooks: Vec<Arc<dyn SubscriptionHooks>>) -> Self {
        Self {
            config,
            subscriptions: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            hooks,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Hand over the background tasks still running (keep-alive, cleanup,
    /// client delivery) so shutdown can wait for them.
    pub fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        tasks.retain(|task| !task.is_finished());
        tasks
    }

    /// Register an in-process client under `id`, replacing any previous one.
    pub fn register_client(&self, id: impl Into<String>, client: Arc<dyn HubClient>) {
        let id = id.into();
        debug!(client_id = %id, "hub client registered");
        let _ = self.clients.write().insert(id, client);
    }

    /// Remove an in-process client. Returns whether it existed.
    pub fn unregister_client(&self, id: &str) -> bool {
        self.clients.write().remove(id).is_some()
    }

    /// Whether `user_id` has a live subscription.
    pub fn is_subscribed(&self, user_id: &str) -> bool {
        self.subscriptions.read().contains_key(user_id)
    }

    /// Live subscription count.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    fn subscription(&self, user_id: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.read().get(user_id).cloned()
    }

    fn record_count(&self) {
        #[allow(clippy::cast_precision_loss)]
        gauge!(HUB_SUBSCRIPTIONS_ACTIVE).set(self.subscription_count() as f64);
    }

    /// Open a subscription for `user_id` and return its SSE event stream.
    ///
    /// The stream starts with a keep-alive comment and a `connected` event.
    /// Dropping it (client disconnect) closes the subscription.
    pub async fn connect(
        self: &Arc<Self>,
        user_id: &str,
    ) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
        let (tx, mut rx) = mpsc::channel(self.config.buffer);
        let subscription = Arc::new(Subscription::new(user_id, tx));

        let replaced = self
            .subscriptions
            .write()
            .insert(user_id.to_owned(), Arc::clone(&subscription));
        if let Some(previous) = replaced {
            info!(user_id, previous = %previous.id, "replacing existing subscription");
            previous.close();
        }
        self.record_count();
        info!(user_id, subscription_id = %subscription.id, "subscription opened");

        let _ = subscription.send(HubEvent::KeepAlive);
        let _ = subscription.send(HubEvent::Connected {
            user_id: user_id.to_owned(),
            subscription_id: subscription.id.clone(),
        });
        let ticking = Arc::clone(&subscription);
        let interval = self.config.keep_alive;
        self.track(tokio::spawn(async move {
            let result = keep_alive::run_keep_alive(Arc::clone(&ticking), interval).await;
            debug!(subscription_id = %ticking.id, ?result, "keep-alive stopped");
        }));
        for hook in &self.hooks {
            hook.on_connect(self, user_id).await;
        }

        let hub = Arc::clone(self);
        let watched = Arc::clone(&subscription);
        self.track(tokio::spawn(async move {
            watched.closed().await;
            hub.disconnect(&watched).await;
        }));

        let cancel = subscription.cancellation();
        let guard = cancel.clone().drop_guard();
        async_stream::stream! {
            let _guard = guard;
            loop {
                let next = tokio::select! {
                    () = cancel.cancelled() => None,
                    event = rx.recv() => event,
                };
                match next {
                    Some(event) => yield Ok::<_, Infallible>(event.into_sse()),
                    None => break,
                }
            }
        }
    }

    /// Drop `subscription` if it is still the user's live one, then run the
    /// disconnect hooks for it. A subscription already replaced is a no-op.
    async fn disconnect(&self, subscription: &Arc<Subscription>) {
        let removed = {
            let mut subs = self.subscriptions.write();
            let is_current = subs
                .get(&subscription.user_id)
                .is_some_and(|current| current.id == subscription.id);
            if is_current {
                subs.remove(&subscription.user_id)
            } else {
                None
            }
        };
        self.record_count();
        if let Some(removed) = &removed {
            for hook in &self.hooks {
                hook.on_disconnect(self, &removed.user_id).await;
            }
        }
        let removed = removed.is_some();
        info!(
            user_id = %subscription.user_id,
            subscription_id = %subscription.id,
            removed,
            dropped = subscription.drop_count(),
            age_ms = u64::try_from(subscription.age().as_millis()).unwrap_or(u64::MAX),
            "subscription closed"
        );
    }

    /// Route a message from `from`.
    ///
    /// In-process clients take precedence over subscriptions. Unknown
    /// recipients are a 400. The ack is returned before any client handler
    /// runs.
    pub fn publish(self: &Arc<Self>, from: &str, request: PublishRequest) -> Result<PublishAck, RpcError> {
        let message = HubMessage::new(from, request.to, request.payload);
        let id = message.id.clone();

        let client = self.clients.read().get(&message.to).cloned();
        if let Some(client) = client {
            counter!(HUB_MESSAGES_TOTAL, "route" => "client").increment(1);
            debug!(message_id = %id, from, to = %message.to, "delivering to hub client");
            let hub = Arc::clone(self);
            self.track(tokio::spawn(async move { hub.deliver_to_client(client, message).await }));
            return Ok(PublishAck { delivered: true, id });
        }

        if let Some(subscription) = self.subscription(&message.to) {
            counter!(HUB_MESSAGES_TOTAL, "route" => "subscription").increment(1);
            let to = message.to.clone();
            let delivered = subscription.send(HubEvent::Message(message));
            if !delivered {
                warn!(message_id = %id, to = %to, "subscriber buffer full, message dropped");
            }
            return Ok(PublishAck { delivered, id });
        }

        counter!(HUB_MESSAGES_TOTAL, "route" => "unknown").increment(1);
        Err(RpcError::bad_request(format!("Unknown recipient '{}'", message.to)))
    }

    async fn deliver_to_client(&self, client: Arc<dyn HubClient>, message: HubMessage) {
        let original = message.clone();
        let Some(payload) = client.on_message(message).await else {
            return;
        };
        let reply = original.reply(payload);
        let reply_id = reply.id.clone();
        if !self.push_message(reply) {
            warn!(
                reply_id = %reply_id,
                sender = %original.from,
                "reply dropped: sender has no open subscription"
            );
        }
    }

    /// Push a message to its recipient's subscription. Returns whether it
    /// was queued.
    pub fn push_message(&self, message: HubMessage) -> bool {
        self.subscription(&message.to)
            .is_some_and(|sub| sub.send(HubEvent::Message(message)))
    }

    /// Push a custom event to `user_id`. Returns whether it was queued.
    pub fn push(&self, user_id: &str, event: impl Into<String>, payload: RichValue) -> bool {
        self.subscription(user_id).is_some_and(|sub| {
            sub.send(HubEvent::Custom {
                event: event.into(),
                payload,
            })
        })
    }

    /// Close every subscription (server shutdown).
    pub fn close_all(&self) {
        let subs: Vec<_> = self.subscriptions.read().values().cloned().collect();
        info!(count = subs.len(), "closing all subscriptions");
        for sub in subs {
            sub.close();
        }
    }
}
