//! # Room Test Utilities
//!
//! Shared test utilities for the room service.
//!
//! This crate provides:
//! - Server test harness (`TestRoomServer` for E2E tests)
//! - WebSocket signaling client (`TestWsClient`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use room_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<(), anyhow::Error> {
//!     let server = TestRoomServer::spawn().await?;
//!     let (status, body) = server.create_room("team", "hunter2", "Ana", "free").await?;
//!     assert_eq!(status, 201);
//!
//!     let token = body["sessionToken"].as_str().unwrap();
//!     let mut ws = TestWsClient::connect(&server.ws_url(token)).await?;
//!     let peers = ws.request_ok("list-peers", serde_json::json!({})).await?;
//!     Ok(())
//! }
//! ```

pub mod server_harness;
pub mod ws_client;

// Re-export commonly used items
pub use server_harness::*;
pub use ws_client::*;
