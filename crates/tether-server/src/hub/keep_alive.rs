//! Periodic keep-alive comments for a subscription.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};

use super::subscription::{HubEvent, Subscription};

/// Why the keep-alive loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveResult {
    /// The subscription was closed.
    Cancelled,
    /// The subscriber's receiver went away.
    ChannelClosed,
}

/// Queue a keep-alive every `interval` until the subscription closes.
///
/// The first tick fires after one full `interval`; the hub sends the initial
/// keep-alive itself when the subscription opens. A full buffer skips the
/// tick rather than ending the loop.
pub async fn run_keep_alive(subscription: Arc<Subscription>, interval: Duration) -> KeepAliveResult {
    let cancel = subscription.cancellation();
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return KeepAliveResult::Cancelled,
            _ = ticker.tick() => {
                if !subscription.send(HubEvent::KeepAlive) && subscription.receiver_gone() {
                    subscription.close();
                    return KeepAliveResult::ChannelClosed;
                }
            }
        }
    }
}
