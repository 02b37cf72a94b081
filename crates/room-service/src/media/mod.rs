//! Media engine seam.
//!
//! The SFU that actually forwards RTP is an external collaborator. The room
//! service only creates workers, routers, transports, producers and consumers
//! on it, and reacts to their lifecycle events. Each resource is a trait
//! object exposing its operations plus a broadcast stream of [`MediaEvent`]s.
//!
//! [`local::LocalEngine`] is the in-process implementation used by the binary
//! and by tests.

pub mod allocator;
pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Opaque engine payloads (RTP capabilities, RTP/DTLS parameters, ICE data).
/// The control plane relays them without interpreting their contents.
pub type EngineObject = Value;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("No media workers available")]
    NoWorkers,

    #[error("Media worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("Media resource is closed")]
    Closed,

    #[error("Media engine rejected the request: {0}")]
    Rejected(String),
}

/// Direction class of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Recv,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Send => "send",
            Direction::Recv => "recv",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Connected,
    Completed,
    Disconnected,
    Closed,
}

/// Why a resource closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// `close()` was called on the resource itself.
    Local,
    WorkerClosed,
    RouterClosed,
    TransportClosed,
    ProducerClosed,
}

/// Lifecycle events emitted by engine resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    Closed(CloseCause),
    DtlsStateChanged(DtlsState),
    IceStateChanged(IceState),
    WorkerDied { reason: String },
}

/// Connection parameters relayed to the far end of a new transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    pub ice_parameters: EngineObject,
    pub ice_candidates: EngineObject,
    pub dtls_parameters: EngineObject,
    pub sctp_parameters: Option<EngineObject>,
}

/// Settings used when spawning a worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

/// Options for a new transport.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub direction: Direction,
    pub initial_available_outgoing_bitrate: u32,
    pub announced_address: Option<String>,
}

/// Codecs every router is created with.
pub fn media_codecs() -> EngineObject {
    json!([
        {
            "kind": "audio",
            "mimeType": "audio/opus",
            "clockRate": 48000,
            "channels": 2
        },
        {
            "kind": "video",
            "mimeType": "video/VP8",
            "clockRate": 90000,
            "parameters": { "x-google-start-bitrate": 1000 }
        },
        {
            "kind": "video",
            "mimeType": "video/H264",
            "clockRate": 90000,
            "parameters": {
                "packetization-mode": 1,
                "profile-level-id": "42e01f",
                "level-asymmetry-allowed": 1
            }
        }
    ])
}

/// Factory for media workers.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(
        &self,
        settings: &WorkerSettings,
    ) -> Result<Arc<dyn MediaWorker>, MediaError>;
}

/// A media engine process. Its death is fatal to the service.
#[async_trait]
pub trait MediaWorker: Send + Sync {
    fn id(&self) -> &str;

    async fn create_router(
        &self,
        media_codecs: &EngineObject,
    ) -> Result<Arc<dyn MediaRouter>, MediaError>;

    fn close(&self);

    fn is_closed(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent>;
}

/// Codec-scoped routing context. One per room.
#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> &str;

    /// Media capabilities a client negotiates against.
    fn rtp_capabilities(&self) -> EngineObject;

    /// Whether a consumer with `rtp_capabilities` can receive `producer_id`.
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &EngineObject) -> bool;

    async fn create_transport(
        &self,
        options: &TransportOptions,
    ) -> Result<Arc<dyn MediaTransport>, MediaError>;

    fn close(&self);

    fn is_closed(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent>;
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> &str;

    fn direction(&self) -> Direction;

    fn params(&self) -> TransportParams;

    async fn connect(&self, dtls_parameters: EngineObject) -> Result<(), MediaError>;

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), MediaError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: EngineObject,
    ) -> Result<Arc<dyn MediaProducer>, MediaError>;

    /// Create a consumer of `producer_id`. Consumers start paused when asked.
    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &EngineObject,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>, MediaError>;

    fn close(&self);

    fn is_closed(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent>;
}

pub trait MediaProducer: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn close(&self);

    fn is_closed(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent>;
}

#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> &str;

    fn producer_id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> EngineObject;

    fn is_paused(&self) -> bool;

    async fn resume(&self) -> Result<(), MediaError>;

    fn close(&self);

    fn is_closed(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent>;
}
