//! Prometheus metrics endpoint.

use axum::extract::State;
use metrics_exporter_prometheus::PrometheusHandle;

/// Handler for `GET /metrics`.
///
/// Renders the recorder in Prometheus text exposition format. Label sets
/// are bounded (see `observability`), so the output size stays flat as
/// rooms come and go.
pub async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}
