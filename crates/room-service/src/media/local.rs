//! In-process media engine.
//!
//! `LocalEngine` implements the full resource lifecycle of the media engine
//! seam without moving any media: it allocates ids and connection
//! parameters, tracks which producers a router carries so `can_consume`
//! answers honestly, and cascades closes the way an SFU does
//! (worker → router → transport → producer → consumer).
//!
//! The binary runs on it when no external SFU is wired in. Tests use the
//! inspection hooks (`kill`, `set_dtls_state`, `find_transport`, ...) to
//! drive lifecycle events.

use super::{
    CloseCause, Direction, DtlsState, EngineObject, IceState, MediaConsumer, MediaEngine,
    MediaError, MediaEvent, MediaKind, MediaProducer, MediaRouter, MediaTransport, MediaWorker,
    TransportOptions, TransportParams, WorkerSettings,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 32;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn codec_kind(codec: &Value) -> Option<&str> {
    codec.get("kind").and_then(Value::as_str)
}

fn codec_mime(codec: &Value) -> Option<&str> {
    codec.get("mimeType").and_then(Value::as_str)
}

/// Id, closed flag and event channel shared by every resource kind.
struct Lifecycle {
    id: String,
    closed: AtomicBool,
    events: broadcast::Sender<MediaEvent>,
}

impl Lifecycle {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            id: Uuid::new_v4().to_string(),
            closed: AtomicBool::new(false),
            events,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns false if the resource was already closed.
    fn close(&self, cause: CloseCause) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.emit(MediaEvent::Closed(cause));
        true
    }

    fn emit(&self, event: MediaEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Knobs shared by every resource an engine creates.
#[derive(Default)]
struct EngineFlags {
    reject_bitrate_caps: AtomicBool,
}

/// RTC port allocator for one worker.
struct PortRange {
    min: u16,
    max: u16,
    next: AtomicU32,
}

impl PortRange {
    fn next_port(&self) -> u16 {
        let span = u32::from(self.max - self.min) + 1;
        let offset = self.next.fetch_add(1, Ordering::Relaxed) % span;
        // offset < span <= u16::MAX + 1, and min + offset <= max
        u16::try_from(u32::from(self.min) + offset).unwrap_or(self.max)
    }
}

/// In-process media engine.
#[derive(Default)]
pub struct LocalEngine {
    flags: Arc<EngineFlags>,
    workers: Mutex<Vec<Arc<LocalWorker>>>,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every transport refuse bitrate caps from now on.
    pub fn reject_bitrate_caps(&self) {
        self.flags.reject_bitrate_caps.store(true, Ordering::SeqCst);
    }

    /// All workers created so far, in creation order.
    pub fn workers(&self) -> Vec<Arc<LocalWorker>> {
        lock(&self.workers).clone()
    }

    pub fn find_transport(&self, transport_id: &str) -> Option<Arc<LocalTransport>> {
        self.workers()
            .iter()
            .flat_map(|w| w.routers())
            .flat_map(|r| r.transports())
            .find(|t| t.life.id == transport_id)
    }

    pub fn find_producer(&self, producer_id: &str) -> Option<Arc<LocalProducer>> {
        self.workers()
            .iter()
            .flat_map(|w| w.routers())
            .find_map(|r| r.producer(producer_id))
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    async fn create_worker(
        &self,
        settings: &WorkerSettings,
    ) -> Result<Arc<dyn MediaWorker>, MediaError> {
        if settings.rtc_min_port > settings.rtc_max_port {
            return Err(MediaError::Rejected("invalid RTC port range".to_string()));
        }

        let worker = Arc::new(LocalWorker {
            life: Lifecycle::new(),
            flags: Arc::clone(&self.flags),
            ports: Arc::new(PortRange {
                min: settings.rtc_min_port,
                max: settings.rtc_max_port,
                next: AtomicU32::new(0),
            }),
            routers: Mutex::new(Vec::new()),
        });
        lock(&self.workers).push(Arc::clone(&worker));

        debug!(target: "room.media", worker_id = %worker.life.id, "Local media worker started");
        Ok(worker)
    }
}

pub struct LocalWorker {
    life: Lifecycle,
    flags: Arc<EngineFlags>,
    ports: Arc<PortRange>,
    routers: Mutex<Vec<Arc<LocalRouter>>>,
}

impl LocalWorker {
    /// Simulate the worker process dying.
    pub fn kill(&self, reason: &str) {
        if self.life.is_closed() {
            return;
        }
        warn!(target: "room.media", worker_id = %self.life.id, reason, "Local media worker killed");
        self.life.emit(MediaEvent::WorkerDied {
            reason: reason.to_string(),
        });
        self.shutdown();
    }

    pub fn routers(&self) -> Vec<Arc<LocalRouter>> {
        lock(&self.routers).clone()
    }

    fn shutdown(&self) {
        if !self.life.close(CloseCause::Local) {
            return;
        }
        let routers = std::mem::take(&mut *lock(&self.routers));
        for router in routers {
            router.close_with(CloseCause::WorkerClosed);
        }
    }
}

#[async_trait]
impl MediaWorker for LocalWorker {
    fn id(&self) -> &str {
        &self.life.id
    }

    async fn create_router(
        &self,
        media_codecs: &EngineObject,
    ) -> Result<Arc<dyn MediaRouter>, MediaError> {
        if self.life.is_closed() {
            return Err(MediaError::WorkerUnavailable(self.life.id.clone()));
        }

        let router = Arc::new_cyclic(|me| LocalRouter {
            life: Lifecycle::new(),
            me: me.clone(),
            flags: Arc::clone(&self.flags),
            ports: Arc::clone(&self.ports),
            codecs: media_codecs.clone(),
            transports: Mutex::new(Vec::new()),
            producers: Mutex::new(HashMap::new()),
        });

        let mut routers = lock(&self.routers);
        routers.retain(|r| !r.life.is_closed());
        routers.push(Arc::clone(&router));

        Ok(router)
    }

    fn close(&self) {
        self.shutdown();
    }

    fn is_closed(&self) -> bool {
        self.life.is_closed()
    }

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.life.events.subscribe()
    }
}

pub struct LocalRouter {
    life: Lifecycle,
    me: Weak<LocalRouter>,
    flags: Arc<EngineFlags>,
    ports: Arc<PortRange>,
    codecs: EngineObject,
    transports: Mutex<Vec<Arc<LocalTransport>>>,
    producers: Mutex<HashMap<String, Weak<LocalProducer>>>,
}

impl LocalRouter {
    pub fn transports(&self) -> Vec<Arc<LocalTransport>> {
        lock(&self.transports).clone()
    }

    fn producer(&self, producer_id: &str) -> Option<Arc<LocalProducer>> {
        lock(&self.producers)
            .get(producer_id)
            .and_then(Weak::upgrade)
            .filter(|p| !p.life.is_closed())
    }

    fn supports(&self, kind: MediaKind, mime_type: &str) -> bool {
        self.codecs.as_array().is_some_and(|codecs| {
            codecs.iter().any(|c| {
                codec_kind(c) == Some(kind.as_str())
                    && codec_mime(c).is_some_and(|m| m.eq_ignore_ascii_case(mime_type))
            })
        })
    }

    fn codecs_for(&self, kind: MediaKind) -> Vec<Value> {
        self.codecs
            .as_array()
            .map(|codecs| {
                codecs
                    .iter()
                    .filter(|c| codec_kind(c) == Some(kind.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn close_with(&self, cause: CloseCause) {
        if !self.life.close(cause) {
            return;
        }
        let transports = std::mem::take(&mut *lock(&self.transports));
        for transport in transports {
            transport.close_with(CloseCause::RouterClosed);
        }
        lock(&self.producers).clear();
    }
}

#[async_trait]
impl MediaRouter for LocalRouter {
    fn id(&self) -> &str {
        &self.life.id
    }

    fn rtp_capabilities(&self) -> EngineObject {
        json!({ "codecs": self.codecs, "headerExtensions": [] })
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &EngineObject) -> bool {
        let Some(producer) = self.producer(producer_id) else {
            return false;
        };
        let kind = producer.kind;

        rtp_capabilities
            .get("codecs")
            .and_then(Value::as_array)
            .is_some_and(|codecs| {
                codecs.iter().any(|c| {
                    codec_kind(c) == Some(kind.as_str())
                        && codec_mime(c).is_some_and(|m| self.supports(kind, m))
                })
            })
    }

    async fn create_transport(
        &self,
        options: &TransportOptions,
    ) -> Result<Arc<dyn MediaTransport>, MediaError> {
        if self.life.is_closed() {
            return Err(MediaError::Closed);
        }

        let life = Lifecycle::new();
        let ip = options
            .announced_address
            .clone()
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let params = TransportParams {
            id: life.id.clone(),
            ice_parameters: json!({
                "usernameFragment": Uuid::new_v4().simple().to_string(),
                "password": Uuid::new_v4().simple().to_string(),
                "iceLite": true
            }),
            ice_candidates: json!([{
                "foundation": "udpcandidate",
                "priority": 1_076_302_079_u32,
                "ip": ip,
                "port": self.ports.next_port(),
                "protocol": "udp",
                "type": "host"
            }]),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{
                    "algorithm": "sha-256",
                    "value": Uuid::new_v4().simple().to_string()
                }]
            }),
            sctp_parameters: None,
        };

        let transport = Arc::new(LocalTransport {
            life,
            router: self.me.clone(),
            flags: Arc::clone(&self.flags),
            direction: options.direction,
            params,
            connected: AtomicBool::new(false),
            max_incoming_bitrate: AtomicU32::new(0),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        });
        transport.life.emit(MediaEvent::IceStateChanged(IceState::New));
        transport.life.emit(MediaEvent::DtlsStateChanged(DtlsState::New));

        let mut transports = lock(&self.transports);
        transports.retain(|t| !t.life.is_closed());
        transports.push(Arc::clone(&transport));

        Ok(transport)
    }

    fn close(&self) {
        self.close_with(CloseCause::Local);
    }

    fn is_closed(&self) -> bool {
        self.life.is_closed()
    }

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.life.events.subscribe()
    }
}

pub struct LocalTransport {
    life: Lifecycle,
    router: Weak<LocalRouter>,
    flags: Arc<EngineFlags>,
    direction: Direction,
    params: TransportParams,
    connected: AtomicBool,
    max_incoming_bitrate: AtomicU32,
    producers: Mutex<Vec<Arc<LocalProducer>>>,
    consumers: Mutex<Vec<Arc<LocalConsumer>>>,
}

impl LocalTransport {
    /// Push a DTLS state change as the remote side would cause it.
    pub fn set_dtls_state(&self, state: DtlsState) {
        self.life.emit(MediaEvent::DtlsStateChanged(state));
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Applied incoming bitrate cap, 0 when none was set.
    pub fn max_incoming_bitrate(&self) -> u32 {
        self.max_incoming_bitrate.load(Ordering::SeqCst)
    }

    fn close_with(&self, cause: CloseCause) {
        if !self.life.close(cause) {
            return;
        }
        let producers = std::mem::take(&mut *lock(&self.producers));
        for producer in producers {
            producer.close_with(CloseCause::TransportClosed);
        }
        let consumers = std::mem::take(&mut *lock(&self.consumers));
        for consumer in consumers {
            consumer.close_with(CloseCause::TransportClosed);
        }
    }
}

#[async_trait]
impl MediaTransport for LocalTransport {
    fn id(&self) -> &str {
        &self.life.id
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn params(&self) -> TransportParams {
        self.params.clone()
    }

    async fn connect(&self, dtls_parameters: EngineObject) -> Result<(), MediaError> {
        if self.life.is_closed() {
            return Err(MediaError::Closed);
        }
        if !dtls_parameters.is_object() {
            return Err(MediaError::Rejected("invalid DTLS parameters".to_string()));
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(MediaError::Rejected("transport already connected".to_string()));
        }

        self.life.emit(MediaEvent::DtlsStateChanged(DtlsState::Connecting));
        self.life.emit(MediaEvent::IceStateChanged(IceState::Connected));
        self.life.emit(MediaEvent::DtlsStateChanged(DtlsState::Connected));
        Ok(())
    }

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), MediaError> {
        if self.flags.reject_bitrate_caps.load(Ordering::SeqCst) {
            return Err(MediaError::Rejected(
                "bitrate cap not supported".to_string(),
            ));
        }
        if self.life.is_closed() {
            return Err(MediaError::Closed);
        }
        self.max_incoming_bitrate.store(bitrate, Ordering::SeqCst);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: EngineObject,
    ) -> Result<Arc<dyn MediaProducer>, MediaError> {
        if self.life.is_closed() {
            return Err(MediaError::Closed);
        }
        if self.direction != Direction::Send {
            return Err(MediaError::Rejected(
                "cannot produce on a receive transport".to_string(),
            ));
        }
        if !rtp_parameters.is_object() {
            return Err(MediaError::Rejected("invalid RTP parameters".to_string()));
        }
        let router = self.router.upgrade().ok_or(MediaError::Closed)?;

        let producer = Arc::new_cyclic(|me| LocalProducer {
            life: Lifecycle::new(),
            me: me.clone(),
            router: self.router.clone(),
            kind,
            consumers: Mutex::new(Vec::new()),
        });
        lock(&router.producers).insert(producer.life.id.clone(), Arc::downgrade(&producer));

        let mut producers = lock(&self.producers);
        producers.retain(|p| !p.life.is_closed());
        producers.push(Arc::clone(&producer));

        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &EngineObject,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>, MediaError> {
        if self.life.is_closed() {
            return Err(MediaError::Closed);
        }
        if self.direction != Direction::Recv {
            return Err(MediaError::Rejected(
                "cannot consume on a send transport".to_string(),
            ));
        }
        let router = self.router.upgrade().ok_or(MediaError::Closed)?;
        if !router.can_consume(producer_id, rtp_capabilities) {
            return Err(MediaError::Rejected("cannot consume producer".to_string()));
        }
        let producer = router
            .producer(producer_id)
            .ok_or_else(|| MediaError::Rejected("unknown producer".to_string()))?;

        let mut consumers = lock(&self.consumers);
        consumers.retain(|c| !c.life.is_closed());
        let mid = consumers.len();

        let consumer = Arc::new(LocalConsumer {
            life: Lifecycle::new(),
            producer_id: producer_id.to_string(),
            kind: producer.kind,
            rtp_parameters: json!({
                "mid": mid.to_string(),
                "codecs": router.codecs_for(producer.kind),
                "encodings": [{ "ssrc": 100_000 + mid }],
            }),
            paused: AtomicBool::new(paused),
        });
        consumers.push(Arc::clone(&consumer));
        drop(consumers);

        producer.attach(&consumer);
        // Producer may have closed between the lookup and the attach.
        if producer.life.is_closed() {
            consumer.close_with(CloseCause::ProducerClosed);
        }
        debug!(
            target: "room.media",
            transport_id = %self.life.id,
            consumer_id = %consumer.life.id,
            "Local consumer created"
        );

        Ok(consumer)
    }

    fn close(&self) {
        self.close_with(CloseCause::Local);
    }

    fn is_closed(&self) -> bool {
        self.life.is_closed()
    }

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.life.events.subscribe()
    }
}

pub struct LocalProducer {
    life: Lifecycle,
    me: Weak<LocalProducer>,
    router: Weak<LocalRouter>,
    kind: MediaKind,
    consumers: Mutex<Vec<Weak<LocalConsumer>>>,
}

impl LocalProducer {
    fn attach(&self, consumer: &Arc<LocalConsumer>) {
        let mut consumers = lock(&self.consumers);
        consumers.retain(|c| c.strong_count() > 0);
        consumers.push(Arc::downgrade(consumer));
    }

    /// Number of live consumers of this producer.
    pub fn consumer_count(&self) -> usize {
        lock(&self.consumers)
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| !c.life.is_closed())
            .count()
    }

    fn close_with(&self, cause: CloseCause) {
        if !self.life.close(cause) {
            return;
        }
        if let Some(router) = self.router.upgrade() {
            let mut producers = lock(&router.producers);
            let is_self = producers
                .get(&self.life.id)
                .is_some_and(|p| p.ptr_eq(&self.me));
            if is_self {
                producers.remove(&self.life.id);
            }
        }
        let consumers = std::mem::take(&mut *lock(&self.consumers));
        for consumer in consumers.iter().filter_map(Weak::upgrade) {
            consumer.close_with(CloseCause::ProducerClosed);
        }
    }
}

impl MediaProducer for LocalProducer {
    fn id(&self) -> &str {
        &self.life.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        self.close_with(CloseCause::Local);
    }

    fn is_closed(&self) -> bool {
        self.life.is_closed()
    }

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.life.events.subscribe()
    }
}

pub struct LocalConsumer {
    life: Lifecycle,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: EngineObject,
    paused: AtomicBool,
}

impl LocalConsumer {
    fn close_with(&self, cause: CloseCause) {
        self.life.close(cause);
    }
}

#[async_trait]
impl MediaConsumer for LocalConsumer {
    fn id(&self) -> &str {
        &self.life.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> EngineObject {
        self.rtp_parameters.clone()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<(), MediaError> {
        if self.life.is_closed() {
            return Err(MediaError::Closed);
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.close_with(CloseCause::Local);
    }

    fn is_closed(&self) -> bool {
        self.life.is_closed()
    }

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.life.events.subscribe()
    }
}
