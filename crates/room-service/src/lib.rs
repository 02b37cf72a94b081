//! Room Service Library
//!
//! Control plane for a multi-party SFU deployment. The service decides who
//! may create and join rooms, tracks which peer owns which media resources,
//! and relays signaling between participants. Media packets never pass
//! through it; those are the media engine's job.
//!
//! - Tiered room capacity (`free`, `supporter`) with per-tier limits
//! - Password-protected rooms with signed, expiring session tokens
//! - WebSocket signaling for transports, producers and consumers
//! - Reconnect convergence keyed on per-connection session ids
//! - Chat and end-to-end key exchange relay
//!
//! # Architecture
//!
//! ```text
//! HTTP (axum) ──► handlers ──┐
//!                            ├──► RoomRegistryActor ──► RoomRegistry + CapacityPool
//! WebSocket ──► signaling ───┘            ▲
//!                 │                       │ lifecycle events
//!                 └──► WorkerPool ──► media engine (routers, transports, ...)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Registry actor, the single owner of room state
//! - [`auth`] - Password hashing and session tokens
//! - [`capacity`] - Tier pools
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with stable reason codes
//! - [`media`] - Media engine seam and worker/router allocation
//! - [`registry`] - Rooms and peers
//! - [`signaling`] - WebSocket signaling protocol

pub mod actors;
pub mod auth;
pub mod capacity;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod media;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod registry;
pub mod routes;
pub mod signaling;
pub mod system_info;
