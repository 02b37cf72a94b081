//! `RoomRegistryActor` - single owner of all room, peer and capacity state.
//!
//! Every mutation of the registry happens inside this task, one message at a
//! time. Engine calls (router, transport, producer and consumer creation)
//! never run here: connection tasks perform them and then register the
//! result through an `Attach*` message. Attach re-checks that the room still
//! exists and the peer is still bound to the calling session; a result that
//! arrives for a vanished or superseded peer is closed and discarded.
//!
//! The actor also runs housekeeping on a timer: peers admitted over HTTP that
//! never connect are pruned, and rooms past their maximum lifetime are closed.

use super::messages::{
    ConsumeContext, PeerRef, RegistryMessage, RegistrySnapshot, Resource, RouterContext,
};
use crate::capacity::{AdmissionCheck, Tier};
use crate::config::{HousekeepingConfig, TierLimits};
use crate::errors::RoomError;
use crate::media::{
    CloseCause, EngineObject, MediaConsumer, MediaKind, MediaProducer, MediaTransport,
};
use crate::observability::metrics;
use crate::registry::peer::{AppTag, BindAction, Binding, ConsumerEntry, ProducerEntry};
use crate::registry::{NewRoom, RoomRegistry};
use crate::signaling::protocol::{PeerSummary, ServerEvent, ServerFrame};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// Reason sent in `room-closed` when a room outlives its maximum duration.
pub const ROOM_EXPIRED_REASON: &str = "max-duration";

/// Reason sent in `room-closed` on service shutdown.
pub const SHUTDOWN_REASON: &str = "server-shutdown";

/// Handle to the `RoomRegistryActor`.
#[derive(Clone)]
pub struct RoomRegistryActorHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryActorHandle {
    /// Spawn the actor around `registry` and return a handle to it.
    #[must_use]
    pub fn new(registry: RoomRegistry, housekeeping: HousekeepingConfig) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RoomRegistryActor {
            receiver,
            cancel_token: cancel_token.clone(),
            registry,
            housekeeping,
            accepting_new: true,
        };
        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> RegistryMessage,
    ) -> Result<T, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(message(tx))
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    /// Name free and pool has a slot. Nothing is reserved.
    pub async fn check_create(&self, room_name: String, tier: Tier) -> Result<(), RoomError> {
        self.request(|respond_to| RegistryMessage::CheckCreate {
            room_name,
            tier,
            respond_to,
        })
        .await?
    }

    /// Create a room and add its creator as a not-yet-connected peer.
    pub async fn create_room(
        &self,
        room: NewRoom,
        creator_display_name: String,
    ) -> Result<TierLimits, RoomError> {
        self.request(|respond_to| RegistryMessage::CreateRoom {
            room,
            creator_display_name,
            respond_to,
        })
        .await?
    }

    pub async fn can_admit(&self, tier: Tier) -> Result<AdmissionCheck, RoomError> {
        self.request(|respond_to| RegistryMessage::CanAdmit { tier, respond_to })
            .await
    }

    pub async fn password_hash(&self, room_name: String) -> Result<Option<String>, RoomError> {
        self.request(|respond_to| RegistryMessage::GetPasswordHash {
            room_name,
            respond_to,
        })
        .await
    }

    pub async fn add_peer(
        &self,
        room_name: String,
        peer_id: String,
        display_name: String,
    ) -> Result<(), RoomError> {
        self.request(|respond_to| RegistryMessage::AddPeer {
            room_name,
            peer_id,
            display_name,
            respond_to,
        })
        .await?
    }

    pub async fn check_connect(&self, room_name: String, peer_id: String) -> Result<(), RoomError> {
        self.request(|respond_to| RegistryMessage::CheckConnect {
            room_name,
            peer_id,
            respond_to,
        })
        .await?
    }

    pub async fn bind_session(
        &self,
        room_name: String,
        peer_id: String,
        display_name: String,
        binding: Binding,
    ) -> Result<BindAction, RoomError> {
        self.request(|respond_to| RegistryMessage::BindSession {
            room_name,
            peer_id,
            display_name,
            binding,
            respond_to,
        })
        .await?
    }

    /// Remove the peer if this session still owns it. Returns whether it did.
    pub async fn unbind_session(&self, peer: PeerRef) -> Result<bool, RoomError> {
        self.request(|respond_to| RegistryMessage::UnbindSession { peer, respond_to })
            .await
    }

    pub async fn snapshot(&self) -> Result<RegistrySnapshot, RoomError> {
        self.request(|respond_to| RegistryMessage::Snapshot { respond_to })
            .await
    }

    pub async fn router(&self, peer: PeerRef) -> Result<RouterContext, RoomError> {
        self.request(|respond_to| RegistryMessage::GetRouter { peer, respond_to })
            .await?
    }

    pub async fn attach_transport(
        &self,
        peer: PeerRef,
        transport: Arc<dyn MediaTransport>,
    ) -> Result<(), RoomError> {
        self.request(|respond_to| RegistryMessage::AttachTransport {
            peer,
            transport,
            respond_to,
        })
        .await?
    }

    pub async fn transport(
        &self,
        peer: PeerRef,
        transport_id: String,
    ) -> Result<Arc<dyn MediaTransport>, RoomError> {
        self.request(|respond_to| RegistryMessage::GetTransport {
            peer,
            transport_id,
            respond_to,
        })
        .await?
    }

    pub async fn prepare_produce(
        &self,
        peer: PeerRef,
        transport_id: String,
        app_data: AppTag,
    ) -> Result<Arc<dyn MediaTransport>, RoomError> {
        self.request(|respond_to| RegistryMessage::PrepareProduce {
            peer,
            transport_id,
            app_data,
            respond_to,
        })
        .await?
    }

    pub async fn attach_producer(
        &self,
        peer: PeerRef,
        transport_id: String,
        producer: Arc<dyn MediaProducer>,
        kind: MediaKind,
        app_data: AppTag,
    ) -> Result<(), RoomError> {
        self.request(|respond_to| RegistryMessage::AttachProducer {
            peer,
            transport_id,
            producer,
            kind,
            app_data,
            respond_to,
        })
        .await?
    }

    pub async fn prepare_consume(
        &self,
        peer: PeerRef,
        producer_id: String,
        rtp_capabilities: EngineObject,
    ) -> Result<ConsumeContext, RoomError> {
        self.request(|respond_to| RegistryMessage::PrepareConsume {
            peer,
            producer_id,
            rtp_capabilities,
            respond_to,
        })
        .await?
    }

    pub async fn attach_consumer(
        &self,
        peer: PeerRef,
        consumer: Arc<dyn MediaConsumer>,
    ) -> Result<(), RoomError> {
        self.request(|respond_to| RegistryMessage::AttachConsumer {
            peer,
            consumer,
            respond_to,
        })
        .await?
    }

    pub async fn consumer(
        &self,
        peer: PeerRef,
        consumer_id: String,
    ) -> Result<Arc<dyn MediaConsumer>, RoomError> {
        self.request(|respond_to| RegistryMessage::GetConsumer {
            peer,
            consumer_id,
            respond_to,
        })
        .await?
    }

    pub async fn close_producer(&self, peer: PeerRef, producer_id: String) -> Result<(), RoomError> {
        self.request(|respond_to| RegistryMessage::CloseProducer {
            peer,
            producer_id,
            respond_to,
        })
        .await?
    }

    pub async fn update_producer_tag(
        &self,
        peer: PeerRef,
        producer_id: String,
        patch: AppTag,
    ) -> Result<AppTag, RoomError> {
        self.request(|respond_to| RegistryMessage::UpdateProducerTag {
            peer,
            producer_id,
            patch,
            respond_to,
        })
        .await?
    }

    pub async fn list_peers(&self, peer: PeerRef) -> Result<Vec<PeerSummary>, RoomError> {
        self.request(|respond_to| RegistryMessage::ListPeers { peer, respond_to })
            .await?
    }

    pub async fn chat(&self, peer: PeerRef, text: String) -> Result<(), RoomError> {
        self.request(|respond_to| RegistryMessage::Chat {
            peer,
            text,
            respond_to,
        })
        .await?
    }

    pub async fn relay_key(
        &self,
        peer: PeerRef,
        target_peer_id: String,
        key_material: Value,
    ) -> Result<(), RoomError> {
        self.request(|respond_to| RegistryMessage::RelayKey {
            peer,
            target_peer_id,
            key_material,
            respond_to,
        })
        .await?
    }

    /// Report a closed engine resource. Dropped if the actor is gone.
    pub async fn resource_closed(
        &self,
        room_name: String,
        peer_id: String,
        resource: Resource,
        cause: CloseCause,
    ) {
        let _ = self
            .sender
            .send(RegistryMessage::ResourceClosed {
                room_name,
                peer_id,
                resource,
                cause,
            })
            .await;
    }

    /// Close every room and refuse new ones. Returns how many rooms closed.
    pub async fn shutdown(&self, reason: String) -> Result<usize, RoomError> {
        self.request(|respond_to| RegistryMessage::Shutdown { reason, respond_to })
            .await
    }

    /// Stop the actor. Remaining rooms are closed on the way out.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

pub struct RoomRegistryActor {
    receiver: mpsc::Receiver<RegistryMessage>,
    cancel_token: CancellationToken,
    registry: RoomRegistry,
    housekeeping: HousekeepingConfig,
    accepting_new: bool,
}

impl RoomRegistryActor {
    #[instrument(skip_all, name = "room.actor.registry")]
    async fn run(mut self) {
        info!(target: "room.registry", "RoomRegistryActor started");

        let mut tick = tokio::time::interval(self.housekeeping.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "room.registry", "RoomRegistryActor received cancellation signal");
                    self.close_all(SHUTDOWN_REASON);
                    break;
                }

                _ = tick.tick() => {
                    self.housekeeping(Instant::now());
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message),
                        None => {
                            info!(target: "room.registry", "RoomRegistryActor channel closed, exiting");
                            self.close_all(SHUTDOWN_REASON);
                            break;
                        }
                    }
                }
            }
        }

        info!(target: "room.registry", "RoomRegistryActor stopped");
    }

    fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::CheckCreate {
                room_name,
                tier,
                respond_to,
            } => {
                let result = if self.accepting_new {
                    self.registry.check_create(&room_name, tier)
                } else {
                    Err(RoomError::Draining)
                };
                let _ = respond_to.send(result);
            }
            RegistryMessage::CreateRoom {
                room,
                creator_display_name,
                respond_to,
            } => {
                let result = self.create_room(room, &creator_display_name);
                let _ = respond_to.send(result);
            }
            RegistryMessage::CanAdmit { tier, respond_to } => {
                let _ = respond_to.send(self.registry.can_admit(tier));
            }
            RegistryMessage::GetPasswordHash {
                room_name,
                respond_to,
            } => {
                let _ = respond_to.send(self.registry.password_hash(&room_name));
            }
            RegistryMessage::AddPeer {
                room_name,
                peer_id,
                display_name,
                respond_to,
            } => {
                let result = self
                    .registry
                    .add_peer(&room_name, &peer_id, &display_name, None);
                self.refresh_gauges();
                let _ = respond_to.send(result);
            }
            RegistryMessage::CheckConnect {
                room_name,
                peer_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.check_connect(&room_name, &peer_id));
            }
            RegistryMessage::BindSession {
                room_name,
                peer_id,
                display_name,
                binding,
                respond_to,
            } => {
                let result = self.bind_session(&room_name, &peer_id, &display_name, binding);
                let _ = respond_to.send(result);
            }
            RegistryMessage::UnbindSession { peer, respond_to } => {
                let _ = respond_to.send(self.unbind_session(&peer));
            }
            RegistryMessage::Snapshot { respond_to } => {
                let _ = respond_to.send(RegistrySnapshot {
                    rooms: self.registry.list_rooms(),
                    capacity: self.registry.capacity_status(),
                });
            }
            RegistryMessage::GetRouter { peer, respond_to } => {
                let result = self
                    .registry
                    .session_peer(&peer.room_name, &peer.peer_id, peer.session_id)
                    .map(|(room, _)| RouterContext {
                        router: Arc::clone(&room.router),
                        max_bitrate: room.limits.max_bitrate,
                    });
                let _ = respond_to.send(result);
            }
            RegistryMessage::AttachTransport {
                peer,
                transport,
                respond_to,
            } => {
                let _ = respond_to.send(self.attach_transport(&peer, transport));
            }
            RegistryMessage::GetTransport {
                peer,
                transport_id,
                respond_to,
            } => {
                let result = self
                    .registry
                    .session_peer(&peer.room_name, &peer.peer_id, peer.session_id)
                    .and_then(|(_, p)| {
                        p.transports
                            .get(&transport_id)
                            .cloned()
                            .ok_or(RoomError::TransportNotFound)
                    });
                let _ = respond_to.send(result);
            }
            RegistryMessage::PrepareProduce {
                peer,
                transport_id,
                app_data,
                respond_to,
            } => {
                let _ = respond_to.send(self.check_produce(&peer, &transport_id, &app_data));
            }
            RegistryMessage::AttachProducer {
                peer,
                transport_id,
                producer,
                kind,
                app_data,
                respond_to,
            } => {
                let result = self.attach_producer(&peer, transport_id, producer, kind, app_data);
                let _ = respond_to.send(result);
            }
            RegistryMessage::PrepareConsume {
                peer,
                producer_id,
                rtp_capabilities,
                respond_to,
            } => {
                let _ = respond_to.send(self.prepare_consume(&peer, &producer_id, &rtp_capabilities));
            }
            RegistryMessage::AttachConsumer {
                peer,
                consumer,
                respond_to,
            } => {
                let _ = respond_to.send(self.attach_consumer(&peer, consumer));
            }
            RegistryMessage::GetConsumer {
                peer,
                consumer_id,
                respond_to,
            } => {
                let result = self
                    .registry
                    .session_peer(&peer.room_name, &peer.peer_id, peer.session_id)
                    .and_then(|(_, p)| {
                        p.consumers
                            .get(&consumer_id)
                            .map(|c| Arc::clone(&c.handle))
                            .ok_or(RoomError::ConsumerNotFound)
                    });
                let _ = respond_to.send(result);
            }
            RegistryMessage::CloseProducer {
                peer,
                producer_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.close_producer(&peer, &producer_id));
            }
            RegistryMessage::UpdateProducerTag {
                peer,
                producer_id,
                patch,
                respond_to,
            } => {
                let _ = respond_to.send(self.update_producer_tag(&peer, &producer_id, &patch));
            }
            RegistryMessage::ListPeers { peer, respond_to } => {
                let result = self
                    .registry
                    .session_peer(&peer.room_name, &peer.peer_id, peer.session_id)
                    .map(|(room, _)| room.peer_summaries(&peer.peer_id));
                let _ = respond_to.send(result);
            }
            RegistryMessage::Chat {
                peer,
                text,
                respond_to,
            } => {
                let _ = respond_to.send(self.chat(&peer, text));
            }
            RegistryMessage::RelayKey {
                peer,
                target_peer_id,
                key_material,
                respond_to,
            } => {
                let _ = respond_to.send(self.relay_key(&peer, &target_peer_id, key_material));
            }
            RegistryMessage::ResourceClosed {
                room_name,
                peer_id,
                resource,
                cause,
            } => {
                self.resource_closed(&room_name, &peer_id, resource, cause);
            }
            RegistryMessage::Shutdown { reason, respond_to } => {
                self.accepting_new = false;
                let _ = respond_to.send(self.close_all(&reason));
            }
        }
    }

    fn create_room(
        &mut self,
        room: NewRoom,
        creator_display_name: &str,
    ) -> Result<TierLimits, RoomError> {
        let router = Arc::clone(&room.router);
        if !self.accepting_new {
            router.close();
            return Err(RoomError::Draining);
        }

        let room_name = room.name.clone();
        let creator = room.creator_peer_id.clone();
        let limits = match self.registry.create_room(room) {
            Ok(created) => created.limits.clone(),
            Err(e) => {
                // Lost a race against another create; the router is ours to close.
                router.close();
                return Err(e);
            }
        };

        if let Err(e) = self
            .registry
            .add_peer(&room_name, &creator, creator_display_name, None)
        {
            self.registry.destroy_room(&room_name);
            return Err(e);
        }

        self.refresh_gauges();
        Ok(limits)
    }

    fn check_connect(&self, room_name: &str, peer_id: &str) -> Result<(), RoomError> {
        if !self.accepting_new {
            return Err(RoomError::Draining);
        }
        let room = self.registry.room(room_name)?;
        if !room.peers.contains_key(peer_id) && room.peers.len() >= room.limits.max_participants {
            return Err(RoomError::RoomFull);
        }
        Ok(())
    }

    fn bind_session(
        &mut self,
        room_name: &str,
        peer_id: &str,
        display_name: &str,
        binding: Binding,
    ) -> Result<BindAction, RoomError> {
        let action = self
            .registry
            .bind_session(room_name, peer_id, display_name, binding)?;

        info!(
            target: "room.registry",
            room = %room_name,
            action = ?action,
            "Session bound"
        );

        if action != BindAction::AlreadyBound {
            self.broadcast(
                room_name,
                Some(peer_id),
                ServerEvent::PeerJoined {
                    peer_id: peer_id.to_string(),
                    display_name: display_name.to_string(),
                },
            );
        }
        self.refresh_gauges();
        Ok(action)
    }

    fn unbind_session(&mut self, peer: &PeerRef) -> bool {
        let Some(removal) =
            self.registry
                .unbind_session(&peer.room_name, &peer.peer_id, peer.session_id)
        else {
            debug!(
                target: "room.registry",
                room = %peer.room_name,
                "Closed session no longer owns its peer, leaving it in place"
            );
            return false;
        };

        if removal.room_closed.is_none() {
            self.broadcast(
                &peer.room_name,
                None,
                ServerEvent::PeerLeft {
                    peer_id: removal.peer.id.clone(),
                    display_name: removal.peer.display_name.clone(),
                },
            );
        }
        info!(
            target: "room.registry",
            room = %peer.room_name,
            room_closed = removal.room_closed.is_some(),
            "Peer left"
        );
        self.refresh_gauges();
        true
    }

    fn attach_transport(
        &mut self,
        peer: &PeerRef,
        transport: Arc<dyn MediaTransport>,
    ) -> Result<(), RoomError> {
        let result = if transport.is_closed() {
            Err(RoomError::Media(crate::media::MediaError::Closed))
        } else {
            self.registry
                .session_peer_mut(&peer.room_name, &peer.peer_id, peer.session_id)
                .map(|p| {
                    p.transports
                        .insert(transport.id().to_string(), Arc::clone(&transport));
                })
        };

        if let Err(e) = &result {
            debug!(target: "room.registry", error = %e, "Discarding late transport");
            transport.close();
        }
        result
    }

    fn check_produce(
        &self,
        peer: &PeerRef,
        transport_id: &str,
        app_data: &AppTag,
    ) -> Result<Arc<dyn MediaTransport>, RoomError> {
        let (room, p) = self
            .registry
            .session_peer(&peer.room_name, &peer.peer_id, peer.session_id)?;
        let transport = p
            .transports
            .get(transport_id)
            .cloned()
            .ok_or(RoomError::TransportNotFound)?;

        if app_data.is_screen() && room.screen_share_count() >= room.limits.max_screen_shares {
            return Err(RoomError::ScreenShareLimit {
                max: room.limits.max_screen_shares,
            });
        }
        Ok(transport)
    }

    fn attach_producer(
        &mut self,
        peer: &PeerRef,
        transport_id: String,
        producer: Arc<dyn MediaProducer>,
        kind: MediaKind,
        app_data: AppTag,
    ) -> Result<(), RoomError> {
        // Concurrent screen shares may both have passed the prepare check.
        let checked = self
            .check_produce(peer, &transport_id, &app_data)
            .and_then(|_| {
                if producer.is_closed() {
                    Err(RoomError::Media(crate::media::MediaError::Closed))
                } else {
                    Ok(())
                }
            });
        if let Err(e) = checked {
            debug!(target: "room.registry", error = %e, "Discarding late producer");
            producer.close();
            return Err(e);
        }

        let producer_id = producer.id().to_string();
        let announce = !app_data.is_warmup();
        let p = self
            .registry
            .session_peer_mut(&peer.room_name, &peer.peer_id, peer.session_id)?;
        p.producers.insert(
            producer_id.clone(),
            ProducerEntry {
                handle: producer,
                kind,
                app_data: app_data.clone(),
            },
        );

        if announce {
            self.broadcast(
                &peer.room_name,
                Some(&peer.peer_id),
                ServerEvent::NewProducer {
                    producer_id,
                    peer_id: peer.peer_id.clone(),
                    kind,
                    app_data,
                },
            );
        } else {
            debug!(target: "room.registry", "Warm-up producer registered without announcement");
        }
        Ok(())
    }

    fn prepare_consume(
        &self,
        peer: &PeerRef,
        producer_id: &str,
        rtp_capabilities: &EngineObject,
    ) -> Result<ConsumeContext, RoomError> {
        let (room, p) = self
            .registry
            .session_peer(&peer.room_name, &peer.peer_id, peer.session_id)?;

        if !room.router.can_consume(producer_id, rtp_capabilities) {
            return Err(RoomError::CannotConsume);
        }
        let transport = p.recv_transport().ok_or(RoomError::NoReceiveTransport)?;
        let app_data = room
            .peers
            .values()
            .find_map(|other| other.producers.get(producer_id))
            .map(|entry| entry.app_data.clone())
            .unwrap_or_default();

        Ok(ConsumeContext {
            transport,
            app_data,
        })
    }

    fn attach_consumer(
        &mut self,
        peer: &PeerRef,
        consumer: Arc<dyn MediaConsumer>,
    ) -> Result<(), RoomError> {
        let result = if consumer.is_closed() {
            Err(RoomError::Media(crate::media::MediaError::Closed))
        } else {
            self.registry
                .session_peer_mut(&peer.room_name, &peer.peer_id, peer.session_id)
                .map(|p| {
                    p.consumers.insert(
                        consumer.id().to_string(),
                        ConsumerEntry {
                            handle: Arc::clone(&consumer),
                            producer_id: consumer.producer_id().to_string(),
                        },
                    );
                })
        };

        if let Err(e) = &result {
            debug!(target: "room.registry", error = %e, "Discarding late consumer");
            consumer.close();
        }
        result
    }

    fn close_producer(&mut self, peer: &PeerRef, producer_id: &str) -> Result<(), RoomError> {
        let entry = self
            .registry
            .session_peer_mut(&peer.room_name, &peer.peer_id, peer.session_id)?
            .producers
            .remove(producer_id)
            .ok_or(RoomError::ProducerNotFound)?;
        entry.handle.close();

        if !entry.app_data.is_warmup() {
            self.broadcast(
                &peer.room_name,
                Some(&peer.peer_id),
                ServerEvent::ProducerClosed {
                    producer_id: producer_id.to_string(),
                    peer_id: peer.peer_id.clone(),
                },
            );
        }
        Ok(())
    }

    fn update_producer_tag(
        &mut self,
        peer: &PeerRef,
        producer_id: &str,
        patch: &AppTag,
    ) -> Result<AppTag, RoomError> {
        let entry = self
            .registry
            .session_peer_mut(&peer.room_name, &peer.peer_id, peer.session_id)?
            .producers
            .get_mut(producer_id)
            .ok_or(RoomError::ProducerNotFound)?;
        entry.app_data.merge(patch);
        let merged = entry.app_data.clone();

        if !merged.is_warmup() {
            self.broadcast(
                &peer.room_name,
                Some(&peer.peer_id),
                ServerEvent::ProducerUpdated {
                    producer_id: producer_id.to_string(),
                    peer_id: peer.peer_id.clone(),
                    app_data: merged.clone(),
                },
            );
        }
        Ok(merged)
    }

    fn chat(&mut self, peer: &PeerRef, text: String) -> Result<(), RoomError> {
        let p = self
            .registry
            .session_peer_mut(&peer.room_name, &peer.peer_id, peer.session_id)?;
        let (id, timestamp) = p.next_chat_stamp(chrono::Utc::now().timestamp_millis());
        let display_name = p.display_name.clone();

        self.broadcast(
            &peer.room_name,
            None,
            ServerEvent::MessageReceived {
                id,
                peer_id: peer.peer_id.clone(),
                display_name,
                text,
                timestamp,
            },
        );
        Ok(())
    }

    fn relay_key(
        &self,
        peer: &PeerRef,
        target_peer_id: &str,
        key_material: Value,
    ) -> Result<(), RoomError> {
        let (room, _) = self
            .registry
            .session_peer(&peer.room_name, &peer.peer_id, peer.session_id)?;

        let delivered = room.peers.get(target_peer_id).is_some_and(|target| {
            target.send(ServerFrame::event(ServerEvent::KeyExchange {
                from_peer_id: peer.peer_id.clone(),
                key_material,
            }))
        });
        if !delivered {
            debug!(target: "room.signaling", room = %peer.room_name, "Key exchange target offline, dropped");
        }
        Ok(())
    }

    fn resource_closed(
        &mut self,
        room_name: &str,
        peer_id: &str,
        resource: Resource,
        cause: CloseCause,
    ) {
        let Some(p) = self
            .registry
            .room_mut(room_name)
            .ok()
            .and_then(|room| room.peers.get_mut(peer_id))
        else {
            return;
        };

        match resource {
            Resource::Transport(id) => {
                if p.transports.remove(&id).is_some() {
                    debug!(target: "room.media", room = %room_name, cause = ?cause, "Transport closed");
                }
            }
            Resource::Producer(id) => {
                let Some(entry) = p.producers.remove(&id) else {
                    return;
                };
                debug!(target: "room.media", room = %room_name, cause = ?cause, "Producer closed");
                if !entry.app_data.is_warmup() {
                    self.broadcast(
                        room_name,
                        Some(peer_id),
                        ServerEvent::ProducerClosed {
                            producer_id: id,
                            peer_id: peer_id.to_string(),
                        },
                    );
                }
            }
            Resource::Consumer(id) => {
                let Some(entry) = p.consumers.remove(&id) else {
                    return;
                };
                if cause == CloseCause::ProducerClosed {
                    let frame = ServerFrame::event(ServerEvent::ConsumerClosed {
                        consumer_id: id,
                        producer_id: entry.producer_id,
                    });
                    if !p.send(frame) {
                        metrics::record_event_dropped("consumer-closed", 1);
                    }
                }
            }
        }
    }

    /// Close a room, telling its members why.
    fn close_room(&mut self, room_name: &str, reason: &str) {
        self.broadcast(
            room_name,
            None,
            ServerEvent::RoomClosed {
                reason: reason.to_string(),
            },
        );
        if self.registry.destroy_room(room_name).is_some() {
            info!(target: "room.registry", room = %room_name, reason = %reason, "Room closed");
        }
    }

    fn close_all(&mut self, reason: &str) -> usize {
        let names = self.registry.room_names();
        let count = names.len();
        for name in names {
            self.close_room(&name, reason);
        }
        self.refresh_gauges();
        count
    }

    fn housekeeping(&mut self, now: Instant) {
        let pending = self
            .registry
            .pending_peers(now, self.housekeeping.pending_peer_timeout);
        for (room_name, peer_id) in pending {
            if self.registry.remove_peer(&room_name, &peer_id).is_some() {
                info!(
                    target: "room.registry",
                    room = %room_name,
                    "Pruned peer that never connected"
                );
            }
        }

        if let Some(max_duration) = self.housekeeping.room_max_duration {
            for room_name in self.registry.expired_rooms(now, max_duration) {
                self.close_room(&room_name, ROOM_EXPIRED_REASON);
            }
        }

        self.refresh_gauges();
    }

    /// Queue an event for every bound peer in the room except `except`.
    fn broadcast(&self, room_name: &str, except: Option<&str>, event: ServerEvent) {
        let Ok(room) = self.registry.room(room_name) else {
            return;
        };
        let name = event.name();
        let dropped = room.broadcast(except, &ServerFrame::event(event));
        if dropped > 0 {
            warn!(
                target: "room.signaling",
                room = %room_name,
                event = name,
                dropped,
                "Outbound queue full or closed, event dropped"
            );
            metrics::record_event_dropped(name, dropped);
        }
    }

    fn refresh_gauges(&self) {
        for tier in Tier::ALL {
            metrics::set_active_rooms(tier, self.registry.room_count_for(tier));
        }
        metrics::set_active_peers(self.registry.peer_count());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::capacity::CapacityPool;
    use crate::config::{CapacityConfig, TierTable};
    use crate::media::local::tests::{client_caps, options, settings};
    use crate::media::local::LocalEngine;
    use crate::media::{media_codecs, Direction, MediaEngine, MediaRouter};
    use crate::registry::peer::SessionId;
    use crate::signaling::protocol::ServerEvent;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    struct Harness {
        handle: RoomRegistryActorHandle,
        engine: LocalEngine,
    }

    fn housekeeping() -> HousekeepingConfig {
        HousekeepingConfig {
            interval: Duration::from_secs(5),
            pending_peer_timeout: Duration::from_secs(60),
            room_max_duration: Some(Duration::from_secs(3 * 3600)),
        }
    }

    fn harness(total_rooms: u32) -> Harness {
        let mut tiers = TierTable::default();
        tiers.free.max_participants = 2;
        tiers.free.max_screen_shares = 1;
        let registry = RoomRegistry::new(
            CapacityPool::new(CapacityConfig {
                total_max_rooms: total_rooms,
                free_percent: 100,
                supporter_percent: 0,
            }),
            tiers,
        );
        Harness {
            handle: RoomRegistryActorHandle::new(registry, housekeeping()),
            engine: LocalEngine::new(),
        }
    }

    impl Harness {
        async fn router(&self) -> Arc<dyn MediaRouter> {
            let worker = self.engine.create_worker(&settings()).await.unwrap();
            worker.create_router(&media_codecs()).await.unwrap()
        }

        async fn create(&self, name: &str, creator: &str) -> Result<TierLimits, RoomError> {
            let room = NewRoom {
                name: name.to_string(),
                password_hash: "hash".to_string(),
                creator_peer_id: creator.to_string(),
                tier: Tier::Free,
                router: self.router().await,
            };
            self.handle.create_room(room, creator.to_uppercase()).await
        }

        /// Bind `peer_id` with a fresh session and return its event stream.
        async fn connect(
            &self,
            room: &str,
            peer_id: &str,
        ) -> (PeerRef, mpsc::Receiver<ServerFrame>) {
            let (tx, rx) = mpsc::channel(32);
            let session_id: SessionId = Uuid::new_v4();
            self.handle
                .bind_session(
                    room.to_string(),
                    peer_id.to_string(),
                    peer_id.to_uppercase(),
                    Binding {
                        session_id,
                        outbox: tx,
                    },
                )
                .await
                .unwrap();
            (
                PeerRef {
                    room_name: room.to_string(),
                    peer_id: peer_id.to_string(),
                    session_id,
                },
                rx,
            )
        }

        async fn transport(&self, peer: &PeerRef, direction: Direction) -> Arc<dyn MediaTransport> {
            let ctx = self.handle.router(peer.clone()).await.unwrap();
            let transport = ctx.router.create_transport(&options(direction)).await.unwrap();
            self.handle
                .attach_transport(peer.clone(), Arc::clone(&transport))
                .await
                .unwrap();
            transport
        }

        async fn produce(
            &self,
            peer: &PeerRef,
            transport: &Arc<dyn MediaTransport>,
            app_data: Value,
        ) -> Result<String, RoomError> {
            let app_data: AppTag = serde_json::from_value(app_data).unwrap();
            let transport = self
                .handle
                .prepare_produce(peer.clone(), transport.id().to_string(), app_data.clone())
                .await?;
            let producer = transport
                .produce(
                    MediaKind::Video,
                    json!({"codecs": [{"mimeType": "video/VP8"}]}),
                )
                .await
                .unwrap();
            let id = producer.id().to_string();
            self.handle
                .attach_producer(
                    peer.clone(),
                    transport.id().to_string(),
                    producer,
                    MediaKind::Video,
                    app_data,
                )
                .await?;
            Ok(id)
        }
    }

    fn events(rx: &mut mpsc::Receiver<ServerFrame>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let ServerFrame::Event { event } = frame {
                out.push(event);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_create_then_pool_full() {
        let h = harness(2);
        h.create("team", "a").await.unwrap();
        h.create("team2", "b").await.unwrap();

        let err = h.create("team3", "c").await.unwrap_err();
        assert_eq!(err.error_code(), "FREE_POOL_FULL");
        assert_eq!(
            h.handle.check_create("team".to_string(), Tier::Free).await,
            Err(RoomError::RoomAlreadyExists)
        );

        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.rooms.len(), 2);
        assert_eq!(snapshot.capacity.free.available, 0);
    }

    #[tokio::test]
    async fn test_losing_create_closes_router() {
        let h = harness(4);
        h.create("team", "a").await.unwrap();

        let router = h.router().await;
        let room = NewRoom {
            name: "team".to_string(),
            password_hash: "hash".to_string(),
            creator_peer_id: "b".to_string(),
            tier: Tier::Free,
            router: Arc::clone(&router),
        };
        let err = h.handle.create_room(room, "B".to_string()).await;
        assert_eq!(err, Err(RoomError::RoomAlreadyExists));
        assert!(router.is_closed());
    }

    #[tokio::test]
    async fn test_join_announcements_and_conditional_leave() {
        let h = harness(4);
        h.create("team", "a").await.unwrap();
        h.handle
            .add_peer("team".to_string(), "b".to_string(), "B".to_string())
            .await
            .unwrap();

        let (a, mut a_rx) = h.connect("team", "a").await;
        let (b_old, _b_old_rx) = h.connect("team", "b").await;
        assert!(matches!(
            events(&mut a_rx).as_slice(),
            [ServerEvent::PeerJoined { peer_id, .. }] if peer_id == "b"
        ));

        // b reconnects; the stale close must not remove it.
        let (_b_new, _b_new_rx) = h.connect("team", "b").await;
        assert!(!h.handle.unbind_session(b_old).await.unwrap());
        let peers = h.handle.list_peers(a.clone()).await.unwrap();
        assert_eq!(peers.len(), 1);
        assert!(events(&mut a_rx)
            .iter()
            .all(|e| !matches!(e, ServerEvent::PeerLeft { .. })));
    }

    #[tokio::test]
    async fn test_peer_left_broadcast_and_room_deleted_on_last_leave() {
        let h = harness(4);
        h.create("team", "a").await.unwrap();
        h.handle
            .add_peer("team".to_string(), "b".to_string(), "B".to_string())
            .await
            .unwrap();
        let (a, mut a_rx) = h.connect("team", "a").await;
        let (b, _b_rx) = h.connect("team", "b").await;
        events(&mut a_rx);

        assert!(h.handle.unbind_session(b).await.unwrap());
        assert!(matches!(
            events(&mut a_rx).as_slice(),
            [ServerEvent::PeerLeft { peer_id, .. }] if peer_id == "b"
        ));

        assert!(h.handle.unbind_session(a).await.unwrap());
        let snapshot = h.handle.snapshot().await.unwrap();
        assert!(snapshot.rooms.is_empty());
        assert_eq!(snapshot.capacity.free.active, 0);
    }

    #[tokio::test]
    async fn test_stale_session_requests_fail() {
        let h = harness(4);
        h.create("team", "a").await.unwrap();
        let (old, _rx1) = h.connect("team", "a").await;
        let (_new, _rx2) = h.connect("team", "a").await;

        assert_eq!(
            h.handle.list_peers(old.clone()).await.unwrap_err(),
            RoomError::SessionSuperseded
        );
        assert!(h.handle.router(old).await.is_err());
    }

    #[tokio::test]
    async fn test_screen_share_cap_resets_on_close() {
        let h = harness(4);
        h.create("team", "a").await.unwrap();
        let (a, _rx) = h.connect("team", "a").await;
        let send = h.transport(&a, Direction::Send).await;

        let first = h.produce(&a, &send, json!({"source": "screen"})).await.unwrap();
        let err = h
            .produce(&a, &send, json!({"source": "screen"}))
            .await
            .unwrap_err();
        assert_eq!(err, RoomError::ScreenShareLimit { max: 1 });

        // Non-screen producers are unaffected.
        h.produce(&a, &send, json!({"source": "camera"})).await.unwrap();

        h.handle.close_producer(a.clone(), first).await.unwrap();
        h.produce(&a, &send, json!({"source": "screen"})).await.unwrap();
    }

    #[tokio::test]
    async fn test_warmup_producer_is_never_announced() {
        let h = harness(4);
        h.create("team", "a").await.unwrap();
        h.handle
            .add_peer("team".to_string(), "b".to_string(), "B".to_string())
            .await
            .unwrap();
        let (a, _a_rx) = h.connect("team", "a").await;
        let (b, mut b_rx) = h.connect("team", "b").await;
        let send = h.transport(&a, Direction::Send).await;

        let warmup = h.produce(&a, &send, json!({"source": "_warmup"})).await.unwrap();
        let camera = h.produce(&a, &send, json!({"source": "camera"})).await.unwrap();

        let announced: Vec<String> = events(&mut b_rx)
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::NewProducer { producer_id, .. } => Some(producer_id),
                _ => None,
            })
            .collect();
        assert_eq!(announced, vec![camera.clone()]);

        let peers = h.handle.list_peers(b).await.unwrap();
        let listed: Vec<&str> = peers
            .first()
            .unwrap()
            .producers
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(listed, vec![camera.as_str()]);
        assert!(!listed.contains(&warmup.as_str()));
    }

    #[tokio::test]
    async fn test_update_producer_tag_merges_and_broadcasts() {
        let h = harness(4);
        h.create("team", "a").await.unwrap();
        h.handle
            .add_peer("team".to_string(), "b".to_string(), "B".to_string())
            .await
            .unwrap();
        let (a, _a_rx) = h.connect("team", "a").await;
        let (_b, mut b_rx) = h.connect("team", "b").await;
        let send = h.transport(&a, Direction::Send).await;
        let id = h.produce(&a, &send, json!({"source": "camera"})).await.unwrap();
        events(&mut b_rx);

        let merged = h
            .handle
            .update_producer_tag(
                a.clone(),
                id.clone(),
                serde_json::from_value(json!({"muted": true})).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_value(&merged).unwrap(),
            json!({"source": "camera", "muted": true})
        );
        assert!(matches!(
            events(&mut b_rx).as_slice(),
            [ServerEvent::ProducerUpdated { producer_id, .. }] if *producer_id == id
        ));

        assert_eq!(
            h.handle
                .update_producer_tag(a, "missing".to_string(), AppTag::default())
                .await
                .unwrap_err(),
            RoomError::ProducerNotFound
        );
    }

    #[tokio::test]
    async fn test_consume_requires_recv_transport_and_codec() {
        let h = harness(4);
        h.create("team", "a").await.unwrap();
        h.handle
            .add_peer("team".to_string(), "b".to_string(), "B".to_string())
            .await
            .unwrap();
        let (a, _a_rx) = h.connect("team", "a").await;
        let (b, _b_rx) = h.connect("team", "b").await;
        let send = h.transport(&a, Direction::Send).await;
        let producer_id = h.produce(&a, &send, json!({"source": "camera"})).await.unwrap();

        assert_eq!(
            h.handle
                .prepare_consume(b.clone(), producer_id.clone(), client_caps())
                .await
                .err(),
            Some(RoomError::NoReceiveTransport)
        );
        assert_eq!(
            h.handle
                .prepare_consume(b.clone(), producer_id.clone(), json!({"codecs": []}))
                .await
                .err(),
            Some(RoomError::CannotConsume)
        );

        h.transport(&b, Direction::Recv).await;
        let ctx = h
            .handle
            .prepare_consume(b, producer_id, client_caps())
            .await
            .unwrap();
        assert_eq!(ctx.app_data.source(), Some("camera"));
    }

    #[tokio::test]
    async fn test_producer_close_notifies_consumer_owner() {
        let h = harness(4);
        h.create("team", "a").await.unwrap();
        h.handle
            .add_peer("team".to_string(), "b".to_string(), "B".to_string())
            .await
            .unwrap();
        let (a, _a_rx) = h.connect("team", "a").await;
        let (b, mut b_rx) = h.connect("team", "b").await;
        let send = h.transport(&a, Direction::Send).await;
        let producer_id = h.produce(&a, &send, json!({"source": "camera"})).await.unwrap();
        h.transport(&b, Direction::Recv).await;

        let ctx = h
            .handle
            .prepare_consume(b.clone(), producer_id.clone(), client_caps())
            .await
            .unwrap();
        let consumer = ctx
            .transport
            .consume(&producer_id, &client_caps(), true)
            .await
            .unwrap();
        let consumer_id = consumer.id().to_string();
        h.handle.attach_consumer(b.clone(), consumer).await.unwrap();
        events(&mut b_rx);

        h.handle.close_producer(a, producer_id.clone()).await.unwrap();
        h.handle
            .resource_closed(
                "team".to_string(),
                "b".to_string(),
                Resource::Consumer(consumer_id.clone()),
                CloseCause::ProducerClosed,
            )
            .await;
        h.handle.snapshot().await.unwrap();

        let received = events(&mut b_rx);
        assert!(received.contains(&ServerEvent::ProducerClosed {
            producer_id: producer_id.clone(),
            peer_id: "a".to_string()
        }));
        assert!(received.contains(&ServerEvent::ConsumerClosed {
            consumer_id: consumer_id.clone(),
            producer_id
        }));
        assert_eq!(
            h.handle.consumer(b, consumer_id).await.err(),
            Some(RoomError::ConsumerNotFound)
        );
    }

    #[tokio::test]
    async fn test_late_transport_for_departed_peer_is_closed() {
        let h = harness(4);
        h.create("team", "a").await.unwrap();
        h.handle
            .add_peer("team".to_string(), "b".to_string(), "B".to_string())
            .await
            .unwrap();
        let (a, _a_rx) = h.connect("team", "a").await;
        let ctx = h.handle.router(a.clone()).await.unwrap();
        let transport = ctx
            .router
            .create_transport(&options(Direction::Send))
            .await
            .unwrap();

        // The connection closes while the engine call was in flight.
        h.handle.unbind_session(a.clone()).await.unwrap();
        let result = h
            .handle
            .attach_transport(a, Arc::clone(&transport))
            .await;
        assert_eq!(result, Err(RoomError::PeerNotFound));
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_chat_reaches_everyone_including_sender() {
        let h = harness(4);
        h.create("team", "a").await.unwrap();
        h.handle
            .add_peer("team".to_string(), "b".to_string(), "B".to_string())
            .await
            .unwrap();
        let (a, mut a_rx) = h.connect("team", "a").await;
        let (_b, mut b_rx) = h.connect("team", "b").await;
        events(&mut a_rx);

        h.handle.chat(a.clone(), "hello".to_string()).await.unwrap();
        h.handle.chat(a, "again".to_string()).await.unwrap();

        let mine = events(&mut a_rx);
        let theirs = events(&mut b_rx);
        assert_eq!(mine.len(), 2);
        assert_eq!(mine, theirs);

        let stamps: Vec<(String, i64)> = mine
            .iter()
            .filter_map(|e| match e {
                ServerEvent::MessageReceived {
                    id,
                    text,
                    timestamp,
                    display_name,
                    ..
                } => {
                    assert_eq!(display_name, "A");
                    assert!(text == "hello" || text == "again");
                    Some((id.clone(), *timestamp))
                }
                _ => None,
            })
            .collect();
        let (first, second) = (stamps.first().unwrap(), stamps.get(1).unwrap());
        assert!(!first.0.is_empty());
        assert_ne!(first.0, second.0);
        assert!(first.1 <= second.1);
    }

    #[tokio::test]
    async fn test_key_relay_delivers_or_drops_silently() {
        let h = harness(4);
        h.create("team", "a").await.unwrap();
        h.handle
            .add_peer("team".to_string(), "b".to_string(), "B".to_string())
            .await
            .unwrap();
        let (a, _a_rx) = h.connect("team", "a").await;

        // b admitted but not connected: dropped, no error.
        h.handle
            .relay_key(a.clone(), "b".to_string(), json!({"k": 1}))
            .await
            .unwrap();
        h.handle
            .relay_key(a.clone(), "nobody".to_string(), json!({"k": 1}))
            .await
            .unwrap();

        let (_b, mut b_rx) = h.connect("team", "b").await;
        h.handle
            .relay_key(a, "b".to_string(), json!({"k": 2}))
            .await
            .unwrap();
        assert_eq!(
            events(&mut b_rx),
            vec![ServerEvent::KeyExchange {
                from_peer_id: "a".to_string(),
                key_material: json!({"k": 2})
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_housekeeping_prunes_pending_and_expires_rooms() {
        let h = harness(4);
        h.create("idle", "ghost").await.unwrap();
        h.create("team", "a").await.unwrap();
        let (_a, mut a_rx) = h.connect("team", "a").await;

        tokio::time::sleep(Duration::from_secs(65)).await;
        let snapshot = h.handle.snapshot().await.unwrap();
        let names: Vec<&str> = snapshot.rooms.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["team"]);
        assert_eq!(snapshot.capacity.free.active, 1);

        tokio::time::sleep(Duration::from_secs(3 * 3600)).await;
        let snapshot = h.handle.snapshot().await.unwrap();
        assert!(snapshot.rooms.is_empty());
        assert_eq!(snapshot.capacity.free.active, 0);
        assert!(events(&mut a_rx).contains(&ServerEvent::RoomClosed {
            reason: ROOM_EXPIRED_REASON.to_string()
        }));
    }

    #[tokio::test]
    async fn test_shutdown_closes_rooms_and_refuses_new_ones() {
        let h = harness(4);
        h.create("team", "a").await.unwrap();
        let (_a, mut a_rx) = h.connect("team", "a").await;

        let closed = h.handle.shutdown(SHUTDOWN_REASON.to_string()).await.unwrap();
        assert_eq!(closed, 1);
        assert!(events(&mut a_rx).contains(&ServerEvent::RoomClosed {
            reason: SHUTDOWN_REASON.to_string()
        }));
        assert_eq!(
            h.create("again", "b").await.unwrap_err(),
            RoomError::Draining
        );
        for worker in h.engine.workers() {
            assert!(worker.routers().iter().all(|r| r.is_closed()));
        }
    }
}
