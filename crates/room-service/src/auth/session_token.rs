//! Session tokens for the signaling connection.
//!
//! Tokens are HS256 JWTs signed with the service secret. They carry the
//! peer id, room name and display name assigned at admission and expire
//! after the configured TTL. Verification failures all map to the same
//! generic `InvalidToken` error; details are logged at debug level.

use crate::errors::RoomError;
use common::jwt::{precheck_token, validate_iat, DEFAULT_CLOCK_SKEW};
use common::secret::{ExposeSecret, SecretString};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Leeway applied to `exp`, in seconds.
const EXPIRY_LEEWAY_SECONDS: u64 = 5;

/// Claims bound into a session token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaims {
    pub peer_id: String,
    pub room_name: String,
    pub display_name: String,
    pub iat: i64,
    pub exp: i64,
}

/// Custom Debug implementation that redacts the peer id.
impl fmt::Debug for SessionClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionClaims")
            .field("peer_id", &"[REDACTED]")
            .field("room_name", &self.room_name)
            .field("display_name", &self.display_name)
            .field("iat", &self.iat)
            .field("exp", &self.exp)
            .finish()
    }
}

/// Issues and verifies session tokens.
#[derive(Clone)]
pub struct SessionTokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl_seconds: u64,
}

impl fmt::Debug for SessionTokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTokenIssuer")
            .field("keys", &"[REDACTED]")
            .field("ttl_seconds", &self.ttl_seconds)
            .finish()
    }
}

impl SessionTokenIssuer {
    pub fn new(secret: &SecretString, ttl_seconds: u64) -> Self {
        let bytes = secret.expose_secret().as_bytes();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = EXPIRY_LEEWAY_SECONDS;
        validation.set_required_spec_claims(&["exp", "iat"]);

        Self {
            encoding_key: EncodingKey::from_secret(bytes),
            decoding_key: DecodingKey::from_secret(bytes),
            validation,
            ttl_seconds,
        }
    }

    /// Sign a token for an admitted peer.
    pub fn issue(
        &self,
        peer_id: &str,
        room_name: &str,
        display_name: &str,
    ) -> Result<String, RoomError> {
        let now = chrono::Utc::now().timestamp();
        let ttl = i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX);
        let claims = SessionClaims {
            peer_id: peer_id.to_string(),
            room_name: room_name.to_string(),
            display_name: display_name.to_string(),
            iat: now,
            exp: now.saturating_add(ttl),
        };
        self.sign(&claims)
    }

    fn sign(&self, claims: &SessionClaims) -> Result<String, RoomError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| RoomError::Internal(format!("token signing failed: {e}")))
    }

    /// Verify signature, expiry and `iat`, returning the bound claims.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, RoomError> {
        precheck_token(token).map_err(|_| RoomError::InvalidToken)?;

        let data = decode::<SessionClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| {
                debug!(target: "room.auth", error = %e, "Session token rejected");
                RoomError::InvalidToken
            })?;

        validate_iat(data.claims.iat, DEFAULT_CLOCK_SKEW).map_err(|_| RoomError::InvalidToken)?;

        Ok(data.claims)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    fn issuer() -> SessionTokenIssuer {
        SessionTokenIssuer::new(
            &SecretString::from("0123456789abcdef0123456789abcdef"),
            3600,
        )
    }

    #[test]
    fn test_issue_and_verify_round_trip() {
        let issuer = issuer();
        let token = issuer.issue("peer-1", "team", "Ada").unwrap();

        let claims = issuer.verify(&token).unwrap();
        assert_eq!(claims.peer_id, "peer-1");
        assert_eq!(claims.room_name, "team");
        assert_eq!(claims.display_name, "Ada");
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = issuer().issue("peer-1", "team", "Ada").unwrap();
        let other = SessionTokenIssuer::new(
            &SecretString::from("ffffffffffffffffffffffffffffffff"),
            3600,
        );
        assert_eq!(other.verify(&token), Err(RoomError::InvalidToken));
    }

    #[test]
    fn test_expired_token_rejected() {
        let issuer = issuer();
        let now = chrono::Utc::now().timestamp();
        let token = issuer
            .sign(&SessionClaims {
                peer_id: "peer-1".to_string(),
                room_name: "team".to_string(),
                display_name: "Ada".to_string(),
                iat: now - 7200,
                exp: now - 3600,
            })
            .unwrap();

        assert_eq!(issuer.verify(&token), Err(RoomError::InvalidToken));
    }

    #[test]
    fn test_future_iat_rejected() {
        let issuer = issuer();
        let now = chrono::Utc::now().timestamp();
        let token = issuer
            .sign(&SessionClaims {
                peer_id: "peer-1".to_string(),
                room_name: "team".to_string(),
                display_name: "Ada".to_string(),
                iat: now + 3600,
                exp: now + 7200,
            })
            .unwrap();

        assert_eq!(issuer.verify(&token), Err(RoomError::InvalidToken));
    }

    #[test]
    fn test_tampered_room_rejected() {
        let issuer = issuer();
        let token = issuer.issue("peer-1", "team", "Ada").unwrap();
        let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();

        let payload = URL_SAFE_NO_PAD.decode(parts.get(1).unwrap()).unwrap();
        let mut claims: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        claims["roomName"] = serde_json::json!("other-room");
        *parts.get_mut(1).unwrap() =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());

        assert_eq!(issuer.verify(&parts.join(".")), Err(RoomError::InvalidToken));
    }

    #[test]
    fn test_garbage_and_oversized_rejected() {
        let issuer = issuer();
        assert_eq!(issuer.verify(""), Err(RoomError::InvalidToken));
        assert_eq!(issuer.verify("not-a-token"), Err(RoomError::InvalidToken));
        let huge = format!("{}.b.c", "a".repeat(9000));
        assert_eq!(issuer.verify(&huge), Err(RoomError::InvalidToken));
    }

    #[test]
    fn test_claims_debug_redacts_peer_id() {
        let claims = issuer()
            .verify(&issuer().issue("secret-peer", "team", "Ada").unwrap())
            .unwrap();
        let debug = format!("{claims:?}");
        assert!(!debug.contains("secret-peer"));
        assert!(debug.contains("team"));
    }
}
