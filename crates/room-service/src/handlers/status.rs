//! Public status handlers.
//!
//! - `GET /api/health` - room count and uptime
//! - `GET /api/status` - public room list, capacity and host snapshot
//! - `GET /api/rooms/can-create` - read-only admission preflight
//! - `GET /api/rooms/limits` - per-tier limits
//!
//! Nothing here exposes password hashes, peer ids or tokens.

use crate::capacity::Tier;
use crate::errors::RoomError;
use crate::models::{
    CanCreateQuery, CanCreateResponse, HealthResponse, LimitsResponse, StatusResponse,
};
use crate::routes::AppState;
use crate::system_info::gather_system_snapshot;
use axum::extract::{Query, State};
use axum::Json;
use std::sync::Arc;
use tracing::instrument;

/// Room count and process uptime.
#[instrument(skip_all, name = "room.http.health")]
pub async fn health(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, RoomError> {
    let snapshot = state.registry.snapshot().await?;

    Ok(Json(HealthResponse {
        status: "ok",
        rooms: snapshot.rooms.len(),
        uptime: state.started_at.elapsed().as_secs(),
    }))
}

/// Public room list, capacity and host resources.
#[instrument(skip_all, name = "room.http.status")]
pub async fn status(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, RoomError> {
    let snapshot = state.registry.snapshot().await?;
    let uptime = state.started_at.elapsed();

    // sysinfo reads /proc; keep it off the async workers
    let system = tokio::task::spawn_blocking(move || gather_system_snapshot(uptime))
        .await
        .map_err(|e| RoomError::Internal(format!("system snapshot task failed: {e}")))?;

    Ok(Json(StatusResponse {
        rooms: snapshot.rooms,
        capacity: snapshot.capacity,
        system,
    }))
}

/// Whether a room of `tier` could be created right now.
///
/// Reserves nothing; the answer can be stale by the time a create arrives.
#[instrument(skip_all, name = "room.http.can_create")]
pub async fn can_create(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CanCreateQuery>,
) -> Result<Json<CanCreateResponse>, RoomError> {
    let tier = match query.tier.as_deref() {
        None | Some("") => Tier::default(),
        Some(raw) => raw.parse::<Tier>().map_err(RoomError::Validation)?,
    };

    let check = state.registry.can_admit(tier).await?;

    Ok(Json(CanCreateResponse {
        allowed: check.allowed,
        tier,
        reason: (!check.allowed).then(|| tier.pool_full_reason()),
        pool: check.pool,
    }))
}

/// Per-tier limits table.
pub async fn limits(State(state): State<Arc<AppState>>) -> Json<LimitsResponse> {
    Json(state.config.tiers.clone())
}
