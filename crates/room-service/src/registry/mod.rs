//! Room registry.
//!
//! Owns every live room and, through the rooms, every peer. The registry is
//! plain synchronous state: [`crate::actors::RoomRegistryActor`] owns the only
//! instance and is the single path that mutates it. Capacity pool counters
//! move only through [`RoomRegistry::create_room`] and room removal.
//!
//! A room with no peers does not persist. Removing the last peer deletes the
//! room immediately and returns its pool slot.

pub mod peer;

use crate::capacity::{AdmissionCheck, CapacityPool, CapacityStatus, Tier};
use crate::config::{TierLimits, TierTable};
use crate::errors::RoomError;
use crate::media::MediaRouter;
use crate::signaling::protocol::{PeerSummary, ProducerSummary, ServerFrame};
use chrono::{DateTime, Utc};
use peer::{resolve_binding, resolve_unbind, BindAction, Binding, Peer, SessionId, UnbindAction};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

pub struct Room {
    pub name: String,
    password_hash: String,
    pub creator_peer_id: String,
    pub tier: Tier,
    pub limits: TierLimits,
    pub created_at: DateTime<Utc>,
    created_instant: Instant,
    pub router: Arc<dyn MediaRouter>,
    pub peers: HashMap<String, Peer>,
}

impl Room {
    pub fn password_hash(&self) -> &str {
        &self.password_hash
    }

    /// Active screen-share producers across the room.
    pub fn screen_share_count(&self) -> usize {
        self.peers.values().map(Peer::screen_share_count).sum()
    }

    /// Queue `frame` for every bound peer except `except`.
    ///
    /// Returns how many peers could not take the frame.
    pub fn broadcast(&self, except: Option<&str>, frame: &ServerFrame) -> usize {
        let mut dropped = 0;
        for peer in self.peers.values() {
            if Some(peer.id.as_str()) == except || peer.session_id().is_none() {
                continue;
            }
            if !peer.send(frame.clone()) {
                dropped += 1;
            }
        }
        dropped
    }

    /// Every peer except `caller`, with their announced producers.
    pub fn peer_summaries(&self, caller: &str) -> Vec<PeerSummary> {
        self.peers
            .values()
            .filter(|p| p.id != caller)
            .map(|p| PeerSummary {
                id: p.id.clone(),
                display_name: p.display_name.clone(),
                producers: p
                    .producers
                    .iter()
                    .filter(|(_, entry)| !entry.app_data.is_warmup())
                    .map(|(id, entry)| ProducerSummary {
                        id: id.clone(),
                        kind: entry.kind,
                        app_data: entry.app_data.clone(),
                    })
                    .collect(),
            })
            .collect()
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            name: self.name.clone(),
            tier: self.tier,
            participants: self.peers.len(),
            max_participants: self.limits.max_participants,
            created_at: self.created_at,
        }
    }

    fn close(&mut self) {
        for peer in self.peers.values_mut() {
            peer.close_resources();
        }
        self.router.close();
    }
}

/// Public view of a room. Never carries the password hash or peer ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub name: String,
    pub tier: Tier,
    pub participants: usize,
    pub max_participants: usize,
    pub created_at: DateTime<Utc>,
}

/// Inputs for a new room. The password is already hashed and the router
/// already allocated; both happen outside the registry.
pub struct NewRoom {
    pub name: String,
    pub password_hash: String,
    pub creator_peer_id: String,
    pub tier: Tier,
    pub router: Arc<dyn MediaRouter>,
}

/// A peer removed from a room.
pub struct Removal {
    pub peer: Peer,
    /// Set when the removal emptied and deleted the room.
    pub room_closed: Option<Tier>,
}

pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
    capacity: CapacityPool,
    tiers: TierTable,
}

impl RoomRegistry {
    pub fn new(capacity: CapacityPool, tiers: TierTable) -> Self {
        Self {
            rooms: HashMap::new(),
            capacity,
            tiers,
        }
    }

    /// Preflight for a create: name free and pool has a slot.
    pub fn check_create(&self, name: &str, tier: Tier) -> Result<(), RoomError> {
        if self.rooms.contains_key(name) {
            return Err(RoomError::RoomAlreadyExists);
        }
        let check = self.capacity.can_admit(tier);
        if !check.allowed {
            return Err(RoomError::PoolFull {
                tier,
                pool: check.pool,
            });
        }
        Ok(())
    }

    /// Store a new room and take a slot from its tier's pool.
    ///
    /// Re-checks the name and pool, so a racing create that passed the
    /// preflight still fails cleanly here.
    pub fn create_room(&mut self, new: NewRoom) -> Result<&Room, RoomError> {
        self.check_create(&new.name, new.tier)?;
        self.capacity
            .admit(new.tier)
            .map_err(|pool| RoomError::PoolFull {
                tier: new.tier,
                pool,
            })?;

        let limits = self.tiers.limits(new.tier).clone();
        info!(
            target: "room.registry",
            room = %new.name,
            tier = %new.tier,
            max_participants = limits.max_participants,
            "Room created"
        );

        let room = Room {
            name: new.name.clone(),
            password_hash: new.password_hash,
            creator_peer_id: new.creator_peer_id,
            tier: new.tier,
            limits,
            created_at: Utc::now(),
            created_instant: Instant::now(),
            router: new.router,
            peers: HashMap::new(),
        };
        Ok(self.rooms.entry(new.name).or_insert(room))
    }

    pub fn room(&self, name: &str) -> Result<&Room, RoomError> {
        self.rooms.get(name).ok_or(RoomError::RoomNotFound)
    }

    pub fn room_mut(&mut self, name: &str) -> Result<&mut Room, RoomError> {
        self.rooms.get_mut(name).ok_or(RoomError::RoomNotFound)
    }

    /// Stored hash for `name`, or `None` for unknown rooms.
    pub fn password_hash(&self, name: &str) -> Option<String> {
        self.rooms.get(name).map(|r| r.password_hash.clone())
    }

    /// Insert a peer, failing once the room is at its participant limit.
    pub fn add_peer(
        &mut self,
        room_name: &str,
        peer_id: &str,
        display_name: &str,
        binding: Option<Binding>,
    ) -> Result<(), RoomError> {
        let room = self.room_mut(room_name)?;
        if room.peers.contains_key(peer_id) {
            return Err(RoomError::Internal(format!(
                "peer {peer_id} already present in {room_name}"
            )));
        }
        if room.peers.len() >= room.limits.max_participants {
            return Err(RoomError::RoomFull);
        }

        room.peers.insert(
            peer_id.to_string(),
            Peer::new(peer_id.to_string(), display_name.to_string(), binding),
        );
        debug!(
            target: "room.registry",
            room = %room_name,
            participants = room.peers.len(),
            "Peer added"
        );
        Ok(())
    }

    /// Bind a connection to a peer, re-registering it if it is gone.
    pub fn bind_session(
        &mut self,
        room_name: &str,
        peer_id: &str,
        display_name: &str,
        binding: Binding,
    ) -> Result<BindAction, RoomError> {
        let room = self.room_mut(room_name)?;
        let action = resolve_binding(room.peers.get(peer_id), binding.session_id);

        match action {
            BindAction::ReRegister => {
                self.add_peer(room_name, peer_id, display_name, Some(binding))?;
            }
            BindAction::Rebind { .. } => {
                if let Some(peer) = room.peers.get_mut(peer_id) {
                    peer.bind(binding);
                }
            }
            BindAction::AlreadyBound => {}
        }
        Ok(action)
    }

    /// Remove the peer only if `session_id` still owns it.
    pub fn unbind_session(
        &mut self,
        room_name: &str,
        peer_id: &str,
        session_id: SessionId,
    ) -> Option<Removal> {
        let peer = self.rooms.get(room_name)?.peers.get(peer_id);
        match resolve_unbind(peer, session_id) {
            UnbindAction::Remove => self.remove_peer(room_name, peer_id),
            UnbindAction::Ignore => None,
        }
    }

    /// Delete a peer and close its resources. Deletes the room when it
    /// empties. Unknown rooms or peers are a no-op.
    pub fn remove_peer(&mut self, room_name: &str, peer_id: &str) -> Option<Removal> {
        let room = self.rooms.get_mut(room_name)?;
        let mut peer = room.peers.remove(peer_id)?;
        peer.close_resources();

        let room_closed = if room.peers.is_empty() {
            self.destroy_room(room_name).map(|r| r.tier)
        } else {
            None
        };

        Some(Removal { peer, room_closed })
    }

    /// Delete a room, close its router and every peer's resources, and
    /// release its pool slot. Returns the removed room.
    pub fn destroy_room(&mut self, name: &str) -> Option<Room> {
        let mut room = self.rooms.remove(name)?;
        room.close();
        let pool = self.capacity.release(room.tier);
        info!(
            target: "room.registry",
            room = %name,
            tier = %room.tier,
            pool_active = pool.active,
            "Room deleted"
        );
        Some(room)
    }

    /// Resolve a peer for a request from `session_id`.
    pub fn session_peer(
        &self,
        room_name: &str,
        peer_id: &str,
        session_id: SessionId,
    ) -> Result<(&Room, &Peer), RoomError> {
        let room = self.room(room_name)?;
        let peer = room.peers.get(peer_id).ok_or(RoomError::PeerNotFound)?;
        if !peer.is_bound_to(session_id) {
            return Err(RoomError::SessionSuperseded);
        }
        Ok((room, peer))
    }

    pub fn session_peer_mut(
        &mut self,
        room_name: &str,
        peer_id: &str,
        session_id: SessionId,
    ) -> Result<&mut Peer, RoomError> {
        let room = self.room_mut(room_name)?;
        let peer = room.peers.get_mut(peer_id).ok_or(RoomError::PeerNotFound)?;
        if !peer.is_bound_to(session_id) {
            return Err(RoomError::SessionSuperseded);
        }
        Ok(peer)
    }

    /// Rooms ordered by creation time.
    pub fn list_rooms(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<RoomSummary> = self.rooms.values().map(Room::summary).collect();
        rooms.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        rooms
    }

    pub fn can_admit(&self, tier: Tier) -> AdmissionCheck {
        self.capacity.can_admit(tier)
    }

    pub fn capacity_status(&self) -> CapacityStatus {
        self.capacity.status()
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn room_count_for(&self, tier: Tier) -> usize {
        self.rooms.values().filter(|r| r.tier == tier).count()
    }

    pub fn peer_count(&self) -> usize {
        self.rooms.values().map(|r| r.peers.len()).sum()
    }

    pub fn room_names(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }

    /// `(room, peer)` pairs admitted longer than `timeout` ago that never
    /// bound a connection.
    pub fn pending_peers(&self, now: Instant, timeout: Duration) -> Vec<(String, String)> {
        self.rooms
            .values()
            .flat_map(|room| {
                room.peers
                    .values()
                    .filter(move |p| {
                        p.session_id().is_none()
                            && now.saturating_duration_since(p.admitted_at) >= timeout
                    })
                    .map(move |p| (room.name.clone(), p.id.clone()))
            })
            .collect()
    }

    /// Rooms alive for at least `max_age`.
    pub fn expired_rooms(&self, now: Instant, max_age: Duration) -> Vec<String> {
        self.rooms
            .values()
            .filter(|r| now.saturating_duration_since(r.created_instant) >= max_age)
            .map(|r| r.name.clone())
            .collect()
    }
}
