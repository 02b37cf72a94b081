//! Room service error types.
//!
//! One error type serves both the admission HTTP API and the signaling
//! protocol. Every variant carries a stable reason code so clients can tell
//! "try again" apart from "structurally blocked".
//!
//! # Classes
//!
//! - Admission: `RoomAlreadyExists`, `PoolFull`, `RoomFull`, `InvalidCredentials`
//! - Resource not found: room, peer, transport, producer, consumer, superseded session
//! - Validation: malformed input, oversized payloads
//! - Infrastructure: media engine failures, internal errors (generic client message)

use crate::capacity::{PoolStatus, Tier};
use crate::media::MediaError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("Room already exists")]
    RoomAlreadyExists,

    #[error("No {tier} room slots available")]
    PoolFull { tier: Tier, pool: PoolStatus },

    #[error("Room is full")]
    RoomFull,

    #[error("Room not found")]
    RoomNotFound,

    #[error("Invalid room password")]
    InvalidCredentials,

    #[error("Invalid or expired session token")]
    InvalidToken,

    #[error("Peer not found")]
    PeerNotFound,

    #[error("Session superseded by a newer connection")]
    SessionSuperseded,

    #[error("Transport not found")]
    TransportNotFound,

    #[error("Producer not found")]
    ProducerNotFound,

    #[error("Consumer not found")]
    ConsumerNotFound,

    #[error("No receive transport")]
    NoReceiveTransport,

    #[error("Cannot consume this producer")]
    CannotConsume,

    #[error("Screen share limit reached ({max})")]
    ScreenShareLimit { max: usize },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Media engine error: {0}")]
    Media(#[from] MediaError),

    #[error("Service is shutting down")]
    Draining,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RoomError {
    /// Stable reason code exposed to clients.
    pub fn error_code(&self) -> &'static str {
        match self {
            RoomError::RoomAlreadyExists => "ROOM_EXISTS",
            RoomError::PoolFull { tier, .. } => match tier {
                Tier::Free => "FREE_POOL_FULL",
                Tier::Supporter => "SUPPORTER_POOL_FULL",
            },
            RoomError::RoomFull => "ROOM_FULL",
            RoomError::RoomNotFound => "ROOM_NOT_FOUND",
            RoomError::InvalidCredentials => "INVALID_PASSWORD",
            RoomError::InvalidToken => "INVALID_TOKEN",
            RoomError::PeerNotFound => "PEER_NOT_FOUND",
            RoomError::SessionSuperseded => "SESSION_SUPERSEDED",
            RoomError::TransportNotFound => "TRANSPORT_NOT_FOUND",
            RoomError::ProducerNotFound => "PRODUCER_NOT_FOUND",
            RoomError::ConsumerNotFound => "CONSUMER_NOT_FOUND",
            RoomError::NoReceiveTransport => "NO_RECV_TRANSPORT",
            RoomError::CannotConsume => "CANNOT_CONSUME",
            RoomError::ScreenShareLimit { .. } => "SCREEN_SHARE_LIMIT",
            RoomError::Validation(_) => "BAD_REQUEST",
            RoomError::Media(_) => "MEDIA_ERROR",
            RoomError::Draining => "SERVICE_UNAVAILABLE",
            RoomError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status for the admission API.
    pub fn status_code(&self) -> StatusCode {
        match self {
            RoomError::RoomAlreadyExists => StatusCode::CONFLICT,
            RoomError::PoolFull { .. } | RoomError::Draining => StatusCode::SERVICE_UNAVAILABLE,
            RoomError::RoomFull | RoomError::ScreenShareLimit { .. } => StatusCode::FORBIDDEN,
            RoomError::InvalidCredentials | RoomError::InvalidToken => StatusCode::UNAUTHORIZED,
            RoomError::RoomNotFound
            | RoomError::PeerNotFound
            | RoomError::SessionSuperseded
            | RoomError::TransportNotFound
            | RoomError::ProducerNotFound
            | RoomError::ConsumerNotFound => StatusCode::NOT_FOUND,
            RoomError::NoReceiveTransport | RoomError::CannotConsume | RoomError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            RoomError::Media(_) | RoomError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Bounded label for metrics.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            RoomError::RoomAlreadyExists
            | RoomError::PoolFull { .. }
            | RoomError::RoomFull
            | RoomError::InvalidCredentials
            | RoomError::InvalidToken => "admission",
            RoomError::RoomNotFound
            | RoomError::PeerNotFound
            | RoomError::SessionSuperseded
            | RoomError::TransportNotFound
            | RoomError::ProducerNotFound
            | RoomError::ConsumerNotFound => "not_found",
            RoomError::NoReceiveTransport
            | RoomError::CannotConsume
            | RoomError::ScreenShareLimit { .. }
            | RoomError::Validation(_) => "rejected",
            RoomError::Media(_) => "media",
            RoomError::Draining => "unavailable",
            RoomError::Internal(_) => "internal",
        }
    }

    /// True for the benign "it vanished under you" class.
    pub fn is_not_found(&self) -> bool {
        self.error_type_label() == "not_found"
    }

    /// Message safe to show the caller. Infrastructure details stay in logs.
    pub fn client_message(&self) -> String {
        match self {
            RoomError::Media(_) => "Media operation failed".to_string(),
            RoomError::Internal(_) => "An internal error occurred".to_string(),
            RoomError::PoolFull { tier, .. } => match tier {
                Tier::Free => "All free rooms are in use. Please try again later.".to_string(),
                Tier::Supporter => {
                    "All supporter rooms are in use. Please try again later.".to_string()
                }
            },
            other => other.to_string(),
        }
    }

    /// Structured body shared by HTTP responses and signaling replies.
    pub fn to_body(&self) -> ErrorBody {
        let (tier, pool) = match self {
            RoomError::PoolFull { tier, pool } => (Some(*tier), Some(*pool)),
            _ => (None, None),
        };
        ErrorBody {
            code: self.error_code(),
            message: self.client_message(),
            tier,
            pool,
        }
    }
}

/// `{"code", "message"}` plus pool details for pool-full errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStatus>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

impl IntoResponse for RoomError {
    fn into_response(self) -> Response {
        match &self {
            RoomError::Media(err) => {
                tracing::error!(target: "room.media", error = %err, "Media operation failed");
            }
            RoomError::Internal(reason) => {
                tracing::error!(target: "room.http", reason = %reason, "Internal error");
            }
            _ => {}
        }

        let status = self.status_code();
        (
            status,
            Json(ErrorResponse {
                error: self.to_body(),
            }),
        )
            .into_response()
    }
}
