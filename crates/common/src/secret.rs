//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types used across the room services. Anything a
//! participant or operator would not want to see in a log line goes in a
//! `SecretString`: room passwords, the session-token signing key, issued
//! session tokens.
//!
//! `SecretString` implements `Debug` with redaction, so structs that derive
//! `Debug` stay safe to log. Values are zeroized on drop.
//!
//! # Example
//!
//! ```rust
//! use common::secret::SecretString;
//! use secrecy::ExposeSecret;
//!
//! #[derive(Debug)]
//! struct JoinRequest {
//!     room_name: String,
//!     password: SecretString,
//! }
//!
//! let req = JoinRequest {
//!     room_name: "team".to_string(),
//!     password: SecretString::from("hunter2"),
//! };
//!
//! assert!(!format!("{req:?}").contains("hunter2"));
//! assert_eq!(req.password.expose_secret(), "hunter2");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// Returns true if the secret is at least `min_bytes` long.
///
/// Used when validating signing keys at startup without exposing the value
/// outside this call.
#[must_use]
pub fn has_min_length(secret: &SecretString, min_bytes: usize) -> bool {
    secret.expose_secret().len() >= min_bytes
}
