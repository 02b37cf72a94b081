//! Room password hashing.
//!
//! bcrypt is deliberately slow, so both operations run on the blocking pool
//! and never on the registry actor or a request's async task.

use crate::config::{MAX_PASSWORD_HASH_COST, MIN_PASSWORD_HASH_COST};
use crate::errors::RoomError;
use common::secret::{ExposeSecret, SecretString};
use tracing::{instrument, warn};

/// Hash a room password with a per-hash random salt.
#[instrument(skip_all)]
pub async fn hash_password(password: SecretString, cost: u32) -> Result<String, RoomError> {
    if !(MIN_PASSWORD_HASH_COST..=MAX_PASSWORD_HASH_COST).contains(&cost) {
        return Err(RoomError::Internal(format!(
            "Invalid bcrypt cost: {cost} (must be {MIN_PASSWORD_HASH_COST}-{MAX_PASSWORD_HASH_COST})"
        )));
    }

    tokio::task::spawn_blocking(move || bcrypt::hash(password.expose_secret(), cost))
        .await
        .map_err(|e| RoomError::Internal(format!("password hashing task failed: {e}")))?
        .map_err(|e| RoomError::Internal(format!("password hashing failed: {e}")))
}

/// Verify `password` against a stored hash.
///
/// A corrupt stored hash verifies as false rather than erroring.
#[instrument(skip_all)]
pub async fn verify_password(password: SecretString, hash: String) -> Result<bool, RoomError> {
    let verified = tokio::task::spawn_blocking(move || bcrypt::verify(password.expose_secret(), &hash))
        .await
        .map_err(|e| RoomError::Internal(format!("password verification task failed: {e}")))?;

    match verified {
        Ok(ok) => Ok(ok),
        Err(e) => {
            warn!(target: "room.auth", error = %e, "Stored password hash could not be verified");
            Ok(false)
        }
    }
}
