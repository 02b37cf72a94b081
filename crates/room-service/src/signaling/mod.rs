//! Signaling protocol handler.
//!
//! Per-connection state machine: `Connecting` (token verified before the
//! upgrade) → `Bound` (session bound to its peer, `peer-joined` broadcast)
//! → `Active` (requests and notifications) → `Closed` (peer removed only if
//! this connection still owns it).

pub mod lifecycle;
pub mod protocol;
pub mod session;
pub mod ws;

pub use session::SignalingSession;
pub use ws::ws_handler;
