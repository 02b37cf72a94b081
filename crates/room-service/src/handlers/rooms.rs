//! Admission handlers.
//!
//! - `POST /api/rooms/create` - Create a room and admit its creator
//! - `POST /api/rooms/join` - Admit a peer to an existing room
//!
//! Both return a session token for `GET /ws`. The admitted peer has no
//! connection until that token is presented.
//!
//! # Security
//!
//! - Passwords are bcrypt-hashed on the blocking pool and never logged
//! - Unknown room and wrong password are distinct errors (404 / 401); room
//!   names are not secret
//! - Infrastructure failures return a generic message

use crate::auth::password::{hash_password, verify_password};
use crate::errors::RoomError;
use crate::models::{CreateRoomRequest, CreateRoomResponse, JoinRoomRequest, JoinRoomResponse};
use crate::observability::metrics;
use crate::registry::NewRoom;
use crate::routes::AppState;
use axum::{extract::State, http::StatusCode, Json};
use common::secret::SecretString;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Record a rejected admission and hand the error back.
fn rejected(operation: &'static str, error: RoomError) -> RoomError {
    metrics::record_admission(operation, "rejected", Some(error.error_code()));
    if !matches!(error.error_type_label(), "admission" | "not_found" | "rejected") {
        metrics::record_error(
            operation,
            error.error_type_label(),
            error.status_code().as_u16(),
        );
    }
    tracing::Span::current().record("status", error.status_code().as_u16());
    error
}

/// Create a room and admit the caller as its first peer.
///
/// # Response
///
/// - 201 Created: room created, session token issued
/// - 400 Bad Request: malformed body or invalid fields
/// - 409 Conflict: room name in use
/// - 503 Service Unavailable: tier pool exhausted (body carries pool status)
#[instrument(
    skip_all,
    name = "room.http.create",
    fields(
        method = "POST",
        endpoint = "/api/rooms/create",
        tier = tracing::field::Empty,
        status = tracing::field::Empty,
    )
)]
pub async fn create_room(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Json<CreateRoomResponse>), RoomError> {
    let start = Instant::now();

    // Deserialize request body manually to return 400 (not Axum's default 422)
    let request: CreateRoomRequest = serde_json::from_slice(&body).map_err(|e| {
        debug!(target: "room.http", error = %e, "Invalid create body");
        rejected(
            "create",
            RoomError::Validation("Invalid request body".to_string()),
        )
    })?;

    // 1. Validate fields
    request
        .validate()
        .map_err(|e| rejected("create", RoomError::Validation(e.to_string())))?;

    let room_name = request.room_name();
    let display_name = request.display_name();
    let tier = request.tier;
    tracing::Span::current().record("tier", tier.as_str());

    // 2. Preflight name and pool so a doomed request skips bcrypt and the
    //    router allocation. Nothing is reserved yet.
    state
        .registry
        .check_create(room_name.clone(), tier)
        .await
        .map_err(|e| rejected("create", e))?;

    // 3. Hash password
    let password_hash = hash_password(
        SecretString::from(request.password),
        state.config.password_hash_cost,
    )
    .await
    .map_err(|e| rejected("create", e))?;

    // 4. Allocate a router on the next worker
    let router = state
        .workers
        .create_router()
        .await
        .map_err(|e| rejected("create", RoomError::from(e)))?;

    // 5. Sign the creator's token before the room exists, so a signing
    //    failure leaves nothing behind
    let peer_id = Uuid::new_v4().to_string();
    let session_token = match state.issuer.issue(&peer_id, &room_name, &display_name) {
        Ok(token) => token,
        Err(e) => {
            router.close();
            return Err(rejected("create", e));
        }
    };

    // 6. Register atomically. The registry re-checks name and pool, and
    //    closes the router if this request lost a race.
    let limits = state
        .registry
        .create_room(
            NewRoom {
                name: room_name.clone(),
                password_hash,
                creator_peer_id: peer_id.clone(),
                tier,
                router,
            },
            display_name,
        )
        .await
        .map_err(|e| rejected("create", e))?;

    metrics::record_admission("create", "success", None);
    tracing::Span::current().record("status", 201u16);
    info!(
        target: "room.http",
        room = %room_name,
        tier = %tier,
        duration_ms = start.elapsed().as_millis() as u64,
        "Room created"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateRoomResponse {
            session_token,
            peer_id,
            room_name,
            tier,
            limits,
        }),
    ))
}

/// Admit the caller to an existing room.
///
/// # Response
///
/// - 200 OK: session token issued
/// - 400 Bad Request: malformed body or invalid fields
/// - 401 Unauthorized: wrong password
/// - 403 Forbidden: room full
/// - 404 Not Found: no such room
#[instrument(
    skip_all,
    name = "room.http.join",
    fields(
        method = "POST",
        endpoint = "/api/rooms/join",
        status = tracing::field::Empty,
    )
)]
pub async fn join_room(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> Result<Json<JoinRoomResponse>, RoomError> {
    let start = Instant::now();

    let request: JoinRoomRequest = serde_json::from_slice(&body).map_err(|e| {
        debug!(target: "room.http", error = %e, "Invalid join body");
        rejected("join", RoomError::Validation("Invalid request body".to_string()))
    })?;

    request
        .validate()
        .map_err(|e| rejected("join", RoomError::Validation(e.to_string())))?;

    let room_name = request.room_name();
    let display_name = request.display_name();

    // 1. Look up the room's password hash
    let password_hash = state
        .registry
        .password_hash(room_name.clone())
        .await
        .map_err(|e| rejected("join", e))?
        .ok_or_else(|| rejected("join", RoomError::RoomNotFound))?;

    // 2. Verify password
    let verified = verify_password(SecretString::from(request.password), password_hash)
        .await
        .map_err(|e| rejected("join", e))?;
    if !verified {
        debug!(target: "room.http", room = %room_name, "Join rejected: wrong password");
        return Err(rejected("join", RoomError::InvalidCredentials));
    }

    // 3. Sign, then admit. The room may have filled or closed during bcrypt;
    //    the registry decides.
    let peer_id = Uuid::new_v4().to_string();
    let session_token = state
        .issuer
        .issue(&peer_id, &room_name, &display_name)
        .map_err(|e| rejected("join", e))?;

    state
        .registry
        .add_peer(room_name.clone(), peer_id.clone(), display_name)
        .await
        .map_err(|e| rejected("join", e))?;

    metrics::record_admission("join", "success", None);
    tracing::Span::current().record("status", 200u16);
    info!(
        target: "room.http",
        room = %room_name,
        duration_ms = start.elapsed().as_millis() as u64,
        "Peer admitted"
    );

    Ok(Json(JoinRoomResponse {
        session_token,
        peer_id,
        room_name,
    }))
}
