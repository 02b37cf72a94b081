//! Observability for the room service.
//!
//! Metric labels are bounded:
//! - `operation`: fixed set of admission and signaling operations
//! - `tier`: 2 values (free, supporter)
//! - `event`: fixed set of server event names
//! - `error_type`: bounded by `RoomError::error_type_label`
//!
//! Room names, peer ids, display names and chat text never appear as labels.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `room_http_requests_total` | Counter | `method`, `endpoint`, `status_code` |
//! | `room_http_request_duration_seconds` | Histogram | `method`, `endpoint`, `status` |
//! | `room_admissions_total` | Counter | `operation`, `status`, `reason` |
//! | `room_signaling_requests_total` | Counter | `operation`, `status` |
//! | `room_signaling_request_duration_seconds` | Histogram | `operation` |
//! | `room_events_dropped_total` | Counter | `event` |
//! | `room_active_rooms` | Gauge | `tier` |
//! | `room_active_peers` | Gauge | none |
//! | `room_active_connections` | Gauge | none |
//! | `room_errors_total` | Counter | `operation`, `error_type`, `status_code` |
//! | `room_worker_deaths_total` | Counter | none |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
