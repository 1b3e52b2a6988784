//! `/health` endpoint body.

use std::time::Instant;

use serde::Serialize;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while serving, `"draining"` once shutdown began.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live hub subscriptions.
    pub subscriptions: usize,
    /// Registered modules.
    pub modules: usize,
    /// Registered operations across all modules.
    pub operations: usize,
}

/// Snapshot of the counters exposed on `/health`.
#[derive(Debug, Clone, Copy)]
pub struct HealthInputs {
    /// Server start.
    pub start_time: Instant,
    /// Live hub subscriptions.
    pub subscriptions: usize,
    /// Registered modules.
    pub modules: usize,
    /// Registered operations.
    pub operations: usize,
    /// Whether shutdown has begun.
    pub shutting_down: bool,
}

/// Build a health response.
pub fn health_check(inputs: HealthInputs) -> HealthResponse {
    HealthResponse {
        status: if inputs.shutting_down { "draining" } else { "ok" },
        uptime_secs: inputs.start_time.elapsed().as_secs(),
        subscriptions: inputs.subscriptions,
        modules: inputs.modules,
        operations: inputs.operations,
    }
}
