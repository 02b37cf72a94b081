//! Message types for the registry actor.
//!
//! Request/reply messages carry a `oneshot` sender. Lifecycle reports from
//! engine watchers are fire-and-forget.

use crate::capacity::{AdmissionCheck, CapacityStatus, Tier};
use crate::config::TierLimits;
use crate::errors::RoomError;
use crate::media::{
    CloseCause, EngineObject, MediaConsumer, MediaKind, MediaProducer, MediaRouter, MediaTransport,
};
use crate::registry::peer::{AppTag, BindAction, Binding, SessionId};
use crate::registry::{NewRoom, RoomSummary};
use crate::signaling::protocol::PeerSummary;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::oneshot;

/// A peer as seen from the connection currently driving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRef {
    pub room_name: String,
    pub peer_id: String,
    pub session_id: SessionId,
}

/// Engine resource reported by a lifecycle watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Transport(String),
    Producer(String),
    Consumer(String),
}

/// Router context for a session's engine calls.
#[derive(Clone)]
pub struct RouterContext {
    pub router: Arc<dyn MediaRouter>,
    /// The room tier's bitrate ceiling.
    pub max_bitrate: u32,
}

/// What a consume needs from the registry.
pub struct ConsumeContext {
    pub transport: Arc<dyn MediaTransport>,
    pub app_data: AppTag,
}

/// Public rooms plus capacity, taken in one actor turn.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub rooms: Vec<RoomSummary>,
    pub capacity: CapacityStatus,
}

pub enum RegistryMessage {
    CheckCreate {
        room_name: String,
        tier: Tier,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },
    /// Create a room and add its creator as a pending peer.
    CreateRoom {
        room: NewRoom,
        creator_display_name: String,
        respond_to: oneshot::Sender<Result<TierLimits, RoomError>>,
    },
    CanAdmit {
        tier: Tier,
        respond_to: oneshot::Sender<AdmissionCheck>,
    },
    GetPasswordHash {
        room_name: String,
        respond_to: oneshot::Sender<Option<String>>,
    },
    AddPeer {
        room_name: String,
        peer_id: String,
        display_name: String,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },
    /// Pre-upgrade check that a connection for this peer could bind.
    CheckConnect {
        room_name: String,
        peer_id: String,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },
    BindSession {
        room_name: String,
        peer_id: String,
        display_name: String,
        binding: Binding,
        respond_to: oneshot::Sender<Result<BindAction, RoomError>>,
    },
    UnbindSession {
        peer: PeerRef,
        respond_to: oneshot::Sender<bool>,
    },
    Snapshot {
        respond_to: oneshot::Sender<RegistrySnapshot>,
    },
    GetRouter {
        peer: PeerRef,
        respond_to: oneshot::Sender<Result<RouterContext, RoomError>>,
    },
    AttachTransport {
        peer: PeerRef,
        transport: Arc<dyn MediaTransport>,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },
    GetTransport {
        peer: PeerRef,
        transport_id: String,
        respond_to: oneshot::Sender<Result<Arc<dyn MediaTransport>, RoomError>>,
    },
    PrepareProduce {
        peer: PeerRef,
        transport_id: String,
        app_data: AppTag,
        respond_to: oneshot::Sender<Result<Arc<dyn MediaTransport>, RoomError>>,
    },
    AttachProducer {
        peer: PeerRef,
        transport_id: String,
        producer: Arc<dyn MediaProducer>,
        kind: MediaKind,
        app_data: AppTag,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },
    PrepareConsume {
        peer: PeerRef,
        producer_id: String,
        rtp_capabilities: EngineObject,
        respond_to: oneshot::Sender<Result<ConsumeContext, RoomError>>,
    },
    AttachConsumer {
        peer: PeerRef,
        consumer: Arc<dyn MediaConsumer>,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },
    GetConsumer {
        peer: PeerRef,
        consumer_id: String,
        respond_to: oneshot::Sender<Result<Arc<dyn MediaConsumer>, RoomError>>,
    },
    CloseProducer {
        peer: PeerRef,
        producer_id: String,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },
    UpdateProducerTag {
        peer: PeerRef,
        producer_id: String,
        patch: AppTag,
        respond_to: oneshot::Sender<Result<AppTag, RoomError>>,
    },
    ListPeers {
        peer: PeerRef,
        respond_to: oneshot::Sender<Result<Vec<PeerSummary>, RoomError>>,
    },
    /// Broadcast validated chat text to the whole room, sender included.
    Chat {
        peer: PeerRef,
        text: String,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },
    /// Relay key material to one peer. Silently dropped if it is offline.
    RelayKey {
        peer: PeerRef,
        target_peer_id: String,
        key_material: Value,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },
    /// An engine resource closed.
    ResourceClosed {
        room_name: String,
        peer_id: String,
        resource: Resource,
        cause: CloseCause,
    },
    /// Close every room and stop accepting new ones.
    Shutdown {
        reason: String,
        respond_to: oneshot::Sender<usize>,
    },
}
