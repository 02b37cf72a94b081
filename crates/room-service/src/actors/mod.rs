//! Actor model for the room service.
//!
//! # Architecture
//!
//! ```text
//! RoomRegistryActor (singleton, owns RoomRegistry + CapacityPool)
//!   ^
//!   | RegistryMessage (mpsc, oneshot replies)
//!   |
//!   +-- HTTP admission handlers (create / join / status)
//!   +-- one signaling task per WebSocket connection
//!   +-- lifecycle watchers (one per engine transport/producer/consumer)
//! ```
//!
//! All room and peer mutations are serialized through the registry actor.
//! Engine calls run in the connection tasks, never inside the actor, so a
//! slow engine does not stall other rooms.
//!
//! # Cancellation
//!
//! The actor holds a `CancellationToken`. Cancelling it closes every room,
//! which closes every router and with it every engine resource.

pub mod messages;
pub mod registry;

pub use messages::{ConsumeContext, PeerRef, RegistryMessage, RegistrySnapshot, Resource, RouterContext};
pub use registry::{RoomRegistryActor, RoomRegistryActorHandle, ROOM_EXPIRED_REASON, SHUTDOWN_REASON};
