//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long background tasks get to drain before we stop waiting.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Fans a single shutdown signal out to the HTTP listener, the hub and any
/// tracked background task.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a coordinator in the running state.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Child token that fires when shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Begin shutdown. Idempotent.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("shutdown requested");
        }
        self.token.cancel();
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown begins.
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// Signal shutdown, then wait up to `timeout` for `handles` to finish.
    pub async fn drain(&self, handles: Vec<JoinHandle<()>>, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        self.shutdown();
        info!(
            task_count = handles.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "draining background tasks"
        );

        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!(?timeout, "drain timed out, abandoning remaining tasks");
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
