//! Peer session tracking.
//!
//! A peer outlives any single connection. Its identity (peer id, display
//! name) comes from the session token; the connection currently driving it
//! is recorded as a session id. Reconnects rebind the session id and keep
//! the peer's engine resources.

use crate::media::{Direction, MediaConsumer, MediaKind, MediaProducer, MediaTransport};
use crate::signaling::protocol::ServerFrame;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// Identifier of one live signaling connection.
pub type SessionId = Uuid;

/// Outbound queue of a connection.
pub type Outbox = mpsc::Sender<ServerFrame>;

/// `appData.source` of a screen-share producer.
pub const SCREEN_SOURCE: &str = "screen";

/// `appData.source` of an internal warm-up producer. Never announced.
pub const WARMUP_SOURCE: &str = "_warmup";

/// Application tag attached to a producer (`appData`).
///
/// The service only interprets `source`; every other field is relayed as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppTag(Map<String, Value>);

impl AppTag {
    pub fn source(&self) -> Option<&str> {
        self.0.get("source").and_then(Value::as_str)
    }

    pub fn is_screen(&self) -> bool {
        self.source() == Some(SCREEN_SOURCE)
    }

    pub fn is_warmup(&self) -> bool {
        self.source() == Some(WARMUP_SOURCE)
    }

    /// Shallow merge: fields in `patch` overwrite existing ones.
    pub fn merge(&mut self, patch: &AppTag) {
        for (key, value) in &patch.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }
}

impl From<Map<String, Value>> for AppTag {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// The connection bound to a peer.
#[derive(Debug, Clone)]
pub struct Binding {
    pub session_id: SessionId,
    pub outbox: Outbox,
}

pub struct ProducerEntry {
    pub handle: Arc<dyn MediaProducer>,
    pub kind: MediaKind,
    pub app_data: AppTag,
}

pub struct ConsumerEntry {
    pub handle: Arc<dyn MediaConsumer>,
    pub producer_id: String,
}

pub struct Peer {
    pub id: String,
    pub display_name: String,
    binding: Option<Binding>,
    /// When the peer was admitted or last lost its binding.
    pub admitted_at: Instant,
    pub transports: HashMap<String, Arc<dyn MediaTransport>>,
    pub producers: HashMap<String, ProducerEntry>,
    pub consumers: HashMap<String, ConsumerEntry>,
    last_chat_timestamp: i64,
    chat_seq: u64,
}

impl Peer {
    pub fn new(id: String, display_name: String, binding: Option<Binding>) -> Self {
        Self {
            id,
            display_name,
            binding,
            admitted_at: Instant::now(),
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            last_chat_timestamp: 0,
            chat_seq: 0,
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.binding.as_ref().map(|b| b.session_id)
    }

    /// True when `session_id` is the connection currently bound.
    pub fn is_bound_to(&self, session_id: SessionId) -> bool {
        self.session_id() == Some(session_id)
    }

    pub fn bind(&mut self, binding: Binding) {
        self.binding = Some(binding);
    }

    /// Queue a frame on the bound connection. Returns false if the peer has
    /// no connection or its queue is full or closed.
    pub fn send(&self, frame: ServerFrame) -> bool {
        match &self.binding {
            Some(binding) => binding.outbox.try_send(frame).is_ok(),
            None => false,
        }
    }

    /// First receive transport, used for every consumer of this peer.
    pub fn recv_transport(&self) -> Option<Arc<dyn MediaTransport>> {
        self.transports
            .values()
            .find(|t| t.direction() == Direction::Recv)
            .cloned()
    }

    pub fn screen_share_count(&self) -> usize {
        self.producers
            .values()
            .filter(|p| p.app_data.is_screen())
            .count()
    }

    /// Id and timestamp for this peer's next chat message.
    ///
    /// Timestamps never go backwards for one peer even if the wall clock does.
    pub fn next_chat_stamp(&mut self, now_millis: i64) -> (String, i64) {
        let timestamp = now_millis.max(self.last_chat_timestamp);
        self.last_chat_timestamp = timestamp;
        self.chat_seq = self.chat_seq.wrapping_add(1);
        (
            format!("{}-{}-{}", self.id, timestamp, self.chat_seq),
            timestamp,
        )
    }

    /// Close every engine resource the peer owns.
    pub fn close_resources(&mut self) {
        for (_, consumer) in self.consumers.drain() {
            consumer.handle.close();
        }
        for (_, producer) in self.producers.drain() {
            producer.handle.close();
        }
        for (_, transport) in self.transports.drain() {
            transport.close();
        }
    }
}

/// What to do when a connection claims a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindAction {
    /// Peer exists; point it at the new session and keep its resources.
    Rebind { previous: Option<SessionId> },
    /// Peer exists and is already bound to this session.
    AlreadyBound,
    /// Peer is gone (its old connection closed first); insert it afresh.
    ReRegister,
}

/// Decide how a connection with `incoming` session binds to a peer.
///
/// Open and close events for a reconnect can arrive in either order; both
/// orders end with one peer entry bound to the newest session.
pub fn resolve_binding(existing: Option<&Peer>, incoming: SessionId) -> BindAction {
    match existing {
        None => BindAction::ReRegister,
        Some(peer) if peer.is_bound_to(incoming) => BindAction::AlreadyBound,
        Some(peer) => BindAction::Rebind {
            previous: peer.session_id(),
        },
    }
}

/// What to do when the connection with `closing` session goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnbindAction {
    /// The closing connection still owns the peer: remove it.
    Remove,
    /// A newer connection owns the peer, or the peer is gone already.
    Ignore,
}

pub fn resolve_unbind(existing: Option<&Peer>, closing: SessionId) -> UnbindAction {
    match existing {
        Some(peer) if peer.is_bound_to(closing) => UnbindAction::Remove,
        _ => UnbindAction::Ignore,
    }
}
