//! Auth gate.
//!
//! Room passwords are bcrypt hashes. Connections to the signaling endpoint
//! present a short-lived HS256 session token binding peer, room and display
//! name; nothing touches room state until that token verifies.

pub mod password;
pub mod session_token;

pub use session_token::{SessionClaims, SessionTokenIssuer};
