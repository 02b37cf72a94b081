//! HTTP request handlers for the room service.

pub mod metrics;
pub mod rooms;
pub mod status;

pub use metrics::metrics_handler;
pub use rooms::{create_room, join_room};
pub use status::{can_create, health, limits, status};
