//! Engine lifecycle watchers.
//!
//! Every transport, producer and consumer a connection creates gets a small
//! task that listens to its event stream and reports closes back to the
//! registry actor. Watchers subscribe before the resource is attached, so a
//! close that races the attach is still seen.
//!
//! Watchers hold only a weak reference to their resource and exit after the
//! first `Closed` event.

use crate::actors::{PeerRef, Resource, RoomRegistryActorHandle};
use crate::media::{DtlsState, MediaConsumer, MediaEvent, MediaProducer, MediaTransport};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

/// Watch a transport. A remote DTLS close closes the transport, which
/// cascades to its producers and consumers.
pub fn watch_transport(
    registry: &RoomRegistryActorHandle,
    peer: &PeerRef,
    transport: &Arc<dyn MediaTransport>,
) {
    let mut events = transport.subscribe();
    let weak = Arc::downgrade(transport);
    let resource = Resource::Transport(transport.id().to_string());
    let registry = registry.clone();
    let peer = peer.clone();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(MediaEvent::DtlsStateChanged(DtlsState::Closed)) => {
                    debug!(target: "room.media", room = %peer.room_name, "Transport DTLS closed");
                    if let Some(transport) = weak.upgrade() {
                        transport.close();
                    }
                }
                Ok(MediaEvent::Closed(cause)) => {
                    registry
                        .resource_closed(peer.room_name, peer.peer_id, resource, cause)
                        .await;
                    return;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return,
            }
        }
    });
}

pub fn watch_producer(
    registry: &RoomRegistryActorHandle,
    peer: &PeerRef,
    producer: &Arc<dyn MediaProducer>,
) {
    spawn_close_watcher(
        producer.subscribe(),
        registry,
        peer,
        Resource::Producer(producer.id().to_string()),
    );
}

pub fn watch_consumer(
    registry: &RoomRegistryActorHandle,
    peer: &PeerRef,
    consumer: &Arc<dyn MediaConsumer>,
) {
    spawn_close_watcher(
        consumer.subscribe(),
        registry,
        peer,
        Resource::Consumer(consumer.id().to_string()),
    );
}

fn spawn_close_watcher(
    mut events: broadcast::Receiver<MediaEvent>,
    registry: &RoomRegistryActorHandle,
    peer: &PeerRef,
    resource: Resource,
) {
    let registry = registry.clone();
    let peer = peer.clone();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(MediaEvent::Closed(cause)) => {
                    registry
                        .resource_closed(peer.room_name, peer.peer_id, resource, cause)
                        .await;
                    return;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return,
            }
        }
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::capacity::{CapacityPool, Tier};
    use crate::config::{CapacityConfig, HousekeepingConfig, TierTable};
    use crate::media::local::tests::{client_caps, options, settings};
    use crate::media::local::LocalEngine;
    use crate::media::{media_codecs, Direction, MediaEngine, MediaKind};
    use crate::registry::peer::{AppTag, Binding};
    use crate::registry::{NewRoom, RoomRegistry};
    use crate::signaling::protocol::{ServerEvent, ServerFrame};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    async fn setup(engine: &LocalEngine) -> RoomRegistryActorHandle {
        let registry = RoomRegistry::new(
            CapacityPool::new(CapacityConfig {
                total_max_rooms: 4,
                free_percent: 100,
                supporter_percent: 0,
            }),
            TierTable::default(),
        );
        let handle = RoomRegistryActorHandle::new(
            registry,
            HousekeepingConfig {
                interval: Duration::from_secs(5),
                pending_peer_timeout: Duration::from_secs(60),
                room_max_duration: None,
            },
        );

        let worker = engine.create_worker(&settings()).await.unwrap();
        let router = worker.create_router(&media_codecs()).await.unwrap();
        handle
            .create_room(
                NewRoom {
                    name: "team".to_string(),
                    password_hash: "hash".to_string(),
                    creator_peer_id: "a".to_string(),
                    tier: Tier::Free,
                    router,
                },
                "A".to_string(),
            )
            .await
            .unwrap();
        handle
            .add_peer("team".to_string(), "b".to_string(), "B".to_string())
            .await
            .unwrap();
        handle
    }

    async fn bind(
        handle: &RoomRegistryActorHandle,
        peer_id: &str,
    ) -> (PeerRef, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(32);
        let session_id = Uuid::new_v4();
        handle
            .bind_session(
                "team".to_string(),
                peer_id.to_string(),
                peer_id.to_uppercase(),
                Binding {
                    session_id,
                    outbox: tx,
                },
            )
            .await
            .unwrap();
        let peer = PeerRef {
            room_name: "team".to_string(),
            peer_id: peer_id.to_string(),
            session_id,
        };
        (peer, rx)
    }

    async fn transport(
        handle: &RoomRegistryActorHandle,
        peer: &PeerRef,
        direction: Direction,
    ) -> Arc<dyn MediaTransport> {
        let ctx = handle.router(peer.clone()).await.unwrap();
        let transport = ctx.router.create_transport(&options(direction)).await.unwrap();
        watch_transport(handle, peer, &transport);
        handle
            .attach_transport(peer.clone(), Arc::clone(&transport))
            .await
            .unwrap();
        transport
    }

    async fn next_event(rx: &mut mpsc::Receiver<ServerFrame>) -> ServerEvent {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("outbox closed");
            if let ServerFrame::Event { event } = frame {
                if !matches!(event, ServerEvent::PeerJoined { .. }) {
                    return event;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_dtls_close_cascades_to_producer_and_consumer() {
        let engine = LocalEngine::new();
        let handle = setup(&engine).await;
        let (a, _a_rx) = bind(&handle, "a").await;
        let (b, mut b_rx) = bind(&handle, "b").await;

        let send = transport(&handle, &a, Direction::Send).await;
        let producer = send
            .produce(MediaKind::Audio, json!({"codecs": []}))
            .await
            .unwrap();
        watch_producer(&handle, &a, &producer);
        let producer_id = producer.id().to_string();
        handle
            .attach_producer(
                a.clone(),
                send.id().to_string(),
                producer,
                MediaKind::Audio,
                AppTag::default(),
            )
            .await
            .unwrap();
        assert!(matches!(next_event(&mut b_rx).await, ServerEvent::NewProducer { .. }));

        let ctx = handle
            .prepare_consume(b.clone(), producer_id.clone(), client_caps())
            .await;
        assert!(matches!(ctx, Err(crate::errors::RoomError::NoReceiveTransport)));
        transport(&handle, &b, Direction::Recv).await;
        let ctx = handle
            .prepare_consume(b.clone(), producer_id.clone(), client_caps())
            .await
            .unwrap();
        let consumer = ctx
            .transport
            .consume(&producer_id, &client_caps(), true)
            .await
            .unwrap();
        watch_consumer(&handle, &b, &consumer);
        let consumer_id = consumer.id().to_string();
        handle.attach_consumer(b.clone(), consumer).await.unwrap();

        engine
            .find_transport(send.id())
            .unwrap()
            .set_dtls_state(DtlsState::Closed);

        let mut seen = vec![next_event(&mut b_rx).await, next_event(&mut b_rx).await];
        seen.sort_by_key(|e| e.name());
        assert_eq!(
            seen,
            vec![
                ServerEvent::ConsumerClosed {
                    consumer_id,
                    producer_id: producer_id.clone()
                },
                ServerEvent::ProducerClosed {
                    producer_id,
                    peer_id: "a".to_string()
                },
            ]
        );
        assert!(send.is_closed());
    }
}
