//! Request and response models for the HTTP API.
//!
//! Admission bodies use camelCase field names, matching the web client.

use crate::capacity::{CapacityStatus, PoolStatus, Tier};
use crate::config::{TierLimits, TierTable};
use crate::registry::RoomSummary;
use crate::system_info::SystemSnapshot;
use serde::{Deserialize, Serialize};

/// Maximum room name length in characters.
pub const MAX_ROOM_NAME_LENGTH: usize = 50;

/// Minimum room password length in characters.
pub const MIN_PASSWORD_LENGTH: usize = 4;

/// Maximum room password length in characters.
pub const MAX_PASSWORD_LENGTH: usize = 128;

/// Maximum display name length in characters.
pub const MAX_DISPLAY_NAME_LENGTH: usize = 128;

/// Display name used when the caller sends none.
pub const DEFAULT_DISPLAY_NAME: &str = "Participant";

fn validate_room_name(room_name: &str) -> Result<(), &'static str> {
    let room_name = room_name.trim();

    if room_name.is_empty() {
        return Err("Room name is required");
    }

    if room_name.chars().count() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name must be at most 50 characters");
    }

    if !room_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '=' | '-'))
    {
        return Err("Room name may only contain letters, digits, '.', '_', '=' and '-'");
    }

    Ok(())
}

fn validate_password(password: &str) -> Result<(), &'static str> {
    let length = password.chars().count();

    if length < MIN_PASSWORD_LENGTH {
        return Err("Password must be at least 4 characters");
    }

    if length > MAX_PASSWORD_LENGTH {
        return Err("Password must be at most 128 characters");
    }

    Ok(())
}

fn validate_display_name(display_name: &str) -> Result<(), &'static str> {
    let display_name = display_name.trim();

    if display_name.chars().count() > MAX_DISPLAY_NAME_LENGTH {
        return Err("Display name must be at most 128 characters");
    }

    if display_name.chars().any(char::is_control) {
        return Err("Display name must not contain control characters");
    }

    Ok(())
}

/// Trimmed display name, or the default when blank.
fn normalize_display_name(display_name: &str) -> String {
    let display_name = display_name.trim();
    if display_name.is_empty() {
        DEFAULT_DISPLAY_NAME.to_string()
    } else {
        display_name.to_string()
    }
}

/// Request to create a room.
///
/// The creator is admitted as the room's first peer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub room_name: String,

    pub password: String,

    #[serde(default)]
    pub display_name: String,

    /// Service level (default: free).
    #[serde(default)]
    pub tier: Tier,
}

impl CreateRoomRequest {
    /// Validate the request.
    ///
    /// # Errors
    ///
    /// Returns an error message if validation fails.
    pub fn validate(&self) -> Result<(), &'static str> {
        validate_room_name(&self.room_name)?;
        validate_password(&self.password)?;
        validate_display_name(&self.display_name)?;
        Ok(())
    }

    pub fn room_name(&self) -> String {
        self.room_name.trim().to_string()
    }

    pub fn display_name(&self) -> String {
        normalize_display_name(&self.display_name)
    }
}

/// Request to join an existing room.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest {
    pub room_name: String,

    pub password: String,

    #[serde(default)]
    pub display_name: String,
}

impl JoinRoomRequest {
    /// Validate the request.
    ///
    /// Join only needs a plausible password; the length rules apply when
    /// the room is created.
    ///
    /// # Errors
    ///
    /// Returns an error message if validation fails.
    pub fn validate(&self) -> Result<(), &'static str> {
        validate_room_name(&self.room_name)?;

        if self.password.is_empty() {
            return Err("Password is required");
        }
        if self.password.chars().count() > MAX_PASSWORD_LENGTH {
            return Err("Password must be at most 128 characters");
        }

        validate_display_name(&self.display_name)?;
        Ok(())
    }

    pub fn room_name(&self) -> String {
        self.room_name.trim().to_string()
    }

    pub fn display_name(&self) -> String {
        normalize_display_name(&self.display_name)
    }
}

/// Response after creating a room.
///
/// Returned by `POST /api/rooms/create` with status 201 Created.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomResponse {
    /// Signed credential for `GET /ws`.
    pub session_token: String,

    pub peer_id: String,

    pub room_name: String,

    pub tier: Tier,

    /// Limits of the room's tier.
    pub limits: TierLimits,
}

/// Response after joining a room.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomResponse {
    pub session_token: String,
    pub peer_id: String,
    pub room_name: String,
}

/// `GET /api/health` response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,

    /// Number of active rooms.
    pub rooms: usize,

    /// Process uptime in seconds.
    pub uptime: u64,
}

/// `GET /api/status` response. Every field is safe for public disclosure.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub rooms: Vec<RoomSummary>,
    pub capacity: CapacityStatus,
    pub system: SystemSnapshot,
}

/// Query for `GET /api/rooms/can-create`.
#[derive(Debug, Clone, Deserialize)]
pub struct CanCreateQuery {
    #[serde(default)]
    pub tier: Option<String>,
}

/// `GET /api/rooms/can-create` response.
#[derive(Debug, Clone, Serialize)]
pub struct CanCreateResponse {
    pub allowed: bool,
    pub tier: Tier,

    /// Stable reason code when not allowed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,

    pub pool: PoolStatus,
}

/// `GET /api/rooms/limits` response.
pub type LimitsResponse = TierTable;
