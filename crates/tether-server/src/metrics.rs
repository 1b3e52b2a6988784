//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Fails if a recorder is already installed in this process.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// RPC calls dispatched (counter, labels: method).
pub const RPC_REQUESTS_TOTAL: &str = "rpc_requests_total";
/// RPC calls that ended in an error (counter, labels: method, error_type).
pub const RPC_ERRORS_TOTAL: &str = "rpc_errors_total";
/// Handler wall time (histogram, labels: method).
pub const RPC_REQUEST_DURATION_SECONDS: &str = "rpc_request_duration_seconds";
/// Calls rejected before dispatch (counter, labels: reason).
pub const RPC_REJECTED_TOTAL: &str = "rpc_rejected_total";
/// Live hub subscriptions (gauge).
pub const HUB_SUBSCRIPTIONS_ACTIVE: &str = "hub_subscriptions_active";
/// Messages accepted by the hub (counter, labels: route).
pub const HUB_MESSAGES_TOTAL: &str = "hub_messages_total";
/// Hub events dropped on a full subscription buffer (counter).
pub const HUB_DROPS_TOTAL: &str = "hub_drops_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_recorder_renders() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = handle.render();
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn metric_names_are_snake_case() {
        let names = [
            RPC_REQUESTS_TOTAL,
            RPC_ERRORS_TOTAL,
            RPC_REQUEST_DURATION_SECONDS,
            RPC_REJECTED_TOTAL,
            HUB_SUBSCRIPTIONS_ACTIVE,
            HUB_MESSAGES_TOTAL,
            HUB_DROPS_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "{name} is not snake_case"
            );
        }
    }
}
