//! Common utilities and types shared across the Hush room services.

#![warn(clippy::pedantic)]

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for JWT utilities (size limits, iat validation)
pub mod jwt;
