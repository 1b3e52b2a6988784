//! Tracks in-flight calls so they can be cancelled individually, as the
//! "current" call, or all at once.
//!
//! Every call registers a [`CancellationToken`] under a fresh request id and
//! holds a [`CallGuard`]; dropping the guard (call finished, response stream
//! drained or dropped) releases the entry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Default)]
struct Tracked {
    next_id: u64,
    tokens: HashMap<u64, CancellationToken>,
    current: Option<u64>,
}

/// Registry of in-flight call tokens.
#[derive(Default)]
pub struct CancellationManager {
    tracked: Mutex<Tracked>,
}

impl CancellationManager {
    /// Empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new call. A caller-supplied `signal` stops the call when it
    /// fires, but the manager only ever cancels a child of it.
    ///
    /// The call becomes "current" only if nothing else is in flight.
    pub fn begin(self: &Arc<Self>, signal: Option<CancellationToken>) -> CallGuard {
        let token = signal.map(|s| s.child_token()).unwrap_or_default();
        let id = {
            let mut tracked = self.tracked.lock();
            tracked.next_id += 1;
            let id = tracked.next_id;
            if tracked.tokens.is_empty() {
                tracked.current = Some(id);
            }
            let _ = tracked.tokens.insert(id, token.clone());
            id
        };
        CallGuard {
            id,
            token,
            manager: Arc::clone(self),
        }
    }

    /// Cancel one call. Returns whether it was in flight.
    pub fn cancel(&self, id: u64) -> bool {
        let token = self.tracked.lock().tokens.get(&id).cloned();
        match token {
            Some(token) => {
                debug!(request_id = id, "cancelling call");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel the current call, if any.
    pub fn cancel_current(&self) -> bool {
        let current = self.tracked.lock().current;
        current.is_some_and(|id| self.cancel(id))
    }

    /// Cancel every in-flight call. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let tokens: Vec<_> = self.tracked.lock().tokens.values().cloned().collect();
        debug!(count = tokens.len(), "cancelling all calls");
        for token in &tokens {
            token.cancel();
        }
        tokens.len()
    }

    /// Number of calls in flight.
    pub fn in_flight(&self) -> usize {
        self.tracked.lock().tokens.len()
    }

    /// Id of the current call.
    pub fn current(&self) -> Option<u64> {
        self.tracked.lock().current
    }

    fn release(&self, id: u64) {
        let mut tracked = self.tracked.lock();
        let _ = tracked.tokens.remove(&id);
        if tracked.current == Some(id) {
            tracked.current = None;
        }
    }
}

/// Keeps a call tracked until dropped.
pub struct CallGuard {
    id: u64,
    token: CancellationToken,
    manager: Arc<CancellationManager>,
}

impl CallGuard {
    /// Request id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The call's cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.manager.release(self.id);
    }
}

impl std::fmt::Debug for CallGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallGuard")
            .field("id", &self.id)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<CancellationManager> {
        Arc::new(CancellationManager::new())
    }

    #[test]
    fn ids_increment() {
        let m = manager();
        let a = m.begin(None);
        let b = m.begin(None);
        assert_eq!(b.id(), a.id() + 1);
        assert_eq!(m.in_flight(), 2);
    }

    #[test]
    fn guard_drop_releases() {
        let m = manager();
        let guard = m.begin(None);
        assert_eq!(m.in_flight(), 1);
        drop(guard);
        assert_eq!(m.in_flight(), 0);
        assert_eq!(m.current(), None);
    }

    #[test]
    fn current_is_only_promoted_when_idle() {
        let m = manager();
        let first = m.begin(None);
        let second = m.begin(None);
        assert_eq!(m.current(), Some(first.id()));

        drop(first);
        assert_eq!(m.current(), None);
        let third = m.begin(None);
        // `second` is still in flight, so `third` is not promoted
        assert_eq!(m.current(), None);
        drop(second);
        drop(third);

        let fourth = m.begin(None);
        assert_eq!(m.current(), Some(fourth.id()));
    }

    #[test]
    fn cancel_by_id() {
        let m = manager();
        let a = m.begin(None);
        let b = m.begin(None);
        assert!(m.cancel(b.id()));
        assert!(b.token().is_cancelled());
        assert!(!a.token().is_cancelled());
        assert!(!m.cancel(999));
    }

    #[test]
    fn cancel_current_targets_first_call() {
        let m = manager();
        let a = m.begin(None);
        let b = m.begin(None);
        assert!(m.cancel_current());
        assert!(a.token().is_cancelled());
        assert!(!b.token().is_cancelled());
    }

    #[test]
    fn cancel_current_without_calls() {
        assert!(!manager().cancel_current());
    }

    #[test]
    fn cancel_all() {
        let m = manager();
        let a = m.begin(None);
        let b = m.begin(None);
        assert_eq!(m.cancel_all(), 2);
        assert!(a.token().is_cancelled());
        assert!(b.token().is_cancelled());
    }

    #[test]
    fn supplied_signal_is_used() {
        let m = manager();
        let signal = CancellationToken::new();
        let guard = m.begin(Some(signal.clone()));
        signal.cancel();
        assert!(guard.token().is_cancelled());
    }

    #[test]
    fn manager_never_cancels_supplied_signal() {
        let m = manager();
        let signal = CancellationToken::new();
        let guard = m.begin(Some(signal.clone()));
        assert!(m.cancel_current());
        assert_eq!(m.cancel_all(), 1);
        assert!(guard.token().is_cancelled());
        assert!(!signal.is_cancelled());
    }
}
