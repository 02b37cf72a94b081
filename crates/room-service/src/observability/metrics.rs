//! Metrics definitions for the room service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `room_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms

use crate::capacity::Tier;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle used by `/metrics`.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // HTTP admission requests include bcrypt work
        .set_buckets_for_metric(
            Matcher::Prefix("room_http".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
            ],
        )
        .map_err(|e| format!("Failed to set HTTP buckets: {e}"))?
        // Signaling requests are mostly engine round-trips
        .set_buckets_for_metric(
            Matcher::Prefix("room_signaling".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set signaling buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// HTTP
// ============================================================================

/// Record HTTP request completion.
///
/// Metric: `room_http_requests_total`, `room_http_request_duration_seconds`
pub fn record_http_request(method: &str, endpoint: &str, status_code: u16, duration: Duration) {
    let endpoint = normalize_endpoint(endpoint);
    let status = categorize_status_code(status_code);

    histogram!("room_http_request_duration_seconds",
        "method" => method.to_string(),
        "endpoint" => endpoint,
        "status" => status
    )
    .record(duration.as_secs_f64());

    counter!("room_http_requests_total",
        "method" => method.to_string(),
        "endpoint" => endpoint,
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        101 | 200..=299 => "success",
        408 | 504 => "timeout",
        _ => "error",
    }
}

/// Map a request path onto a bounded label. Unknown paths become `/other`.
fn normalize_endpoint(path: &str) -> &'static str {
    match path {
        "/api/health" => "/api/health",
        "/api/status" => "/api/status",
        "/api/rooms/create" => "/api/rooms/create",
        "/api/rooms/join" => "/api/rooms/join",
        "/api/rooms/can-create" => "/api/rooms/can-create",
        "/api/rooms/limits" => "/api/rooms/limits",
        "/ws" => "/ws",
        "/live" => "/live",
        "/ready" => "/ready",
        "/metrics" => "/metrics",
        _ => "/other",
    }
}

// ============================================================================
// Admission
// ============================================================================

/// Record a create or join attempt.
///
/// Metric: `room_admissions_total`
/// Labels: `operation` (create, join, connect), `status`, `reason`
pub fn record_admission(operation: &'static str, status: &'static str, reason: Option<&'static str>) {
    counter!("room_admissions_total",
        "operation" => operation,
        "status" => status,
        "reason" => reason.unwrap_or("none")
    )
    .increment(1);
}

// ============================================================================
// Signaling
// ============================================================================

/// Record one signaling request or notification.
///
/// Metric: `room_signaling_requests_total`, `room_signaling_request_duration_seconds`
pub fn record_signaling_request(operation: &'static str, status: &'static str, duration: Duration) {
    histogram!("room_signaling_request_duration_seconds",
        "operation" => operation
    )
    .record(duration.as_secs_f64());

    counter!("room_signaling_requests_total",
        "operation" => operation,
        "status" => status
    )
    .increment(1);
}

/// Record a frame that could not be queued for a peer.
///
/// Metric: `room_events_dropped_total`
pub fn record_event_dropped(event: &'static str, count: usize) {
    counter!("room_events_dropped_total",
        "event" => event
    )
    .increment(count as u64);
}

// ============================================================================
// Gauges
// ============================================================================

pub fn set_active_rooms(tier: Tier, count: usize) {
    gauge!("room_active_rooms", "tier" => tier.as_str()).set(count as f64);
}

pub fn set_active_peers(count: usize) {
    gauge!("room_active_peers").set(count as f64);
}

pub fn connection_opened() {
    gauge!("room_active_connections").increment(1.0);
}

pub fn connection_closed() {
    gauge!("room_active_connections").decrement(1.0);
}

// ============================================================================
// Errors
// ============================================================================

/// Metric: `room_errors_total`
pub fn record_error(operation: &'static str, error_type: &'static str, status_code: u16) {
    counter!("room_errors_total",
        "operation" => operation,
        "error_type" => error_type,
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

/// Metric: `room_worker_deaths_total`
pub fn record_worker_death() {
    counter!("room_worker_deaths_total").increment(1);
}
