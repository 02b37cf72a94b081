//! Request handling for one bound signaling connection.
//!
//! Every operation first resolves the caller through the registry actor,
//! which fails with a not-found class error when the room or peer vanished
//! or a newer connection took the peer over. Engine calls then run here, in
//! the connection's own task, and their results are registered back through
//! the actor.

use super::lifecycle;
use super::protocol::{ClientNotification, ClientRequest, ConsumerInfo, ResponseData};
use crate::actors::{PeerRef, RoomRegistryActorHandle};
use crate::config::SignalingConfig;
use crate::errors::RoomError;
use crate::media::allocator::WorkerPool;
use crate::observability::metrics;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

pub struct SignalingSession {
    peer: PeerRef,
    registry: RoomRegistryActorHandle,
    workers: Arc<WorkerPool>,
    config: SignalingConfig,
}

impl SignalingSession {
    pub fn new(
        peer: PeerRef,
        registry: RoomRegistryActorHandle,
        workers: Arc<WorkerPool>,
        config: SignalingConfig,
    ) -> Self {
        Self {
            peer,
            registry,
            workers,
            config,
        }
    }

    pub fn peer(&self) -> &PeerRef {
        &self.peer
    }

    /// Run one request and record its outcome.
    #[instrument(
        skip_all,
        name = "room.signaling.request",
        fields(room = %self.peer.room_name, operation = request.operation())
    )]
    pub async fn handle_request(&self, request: ClientRequest) -> Result<ResponseData, RoomError> {
        let operation = request.operation();
        let start = Instant::now();
        let result = self.dispatch(request).await;
        self.record(operation, start, result.as_ref().err());
        result
    }

    /// Run one notification. A rejection is reported to the caller only.
    #[instrument(
        skip_all,
        name = "room.signaling.notify",
        fields(room = %self.peer.room_name, operation = notification.operation())
    )]
    pub async fn handle_notification(
        &self,
        notification: ClientNotification,
    ) -> Result<(), RoomError> {
        let operation = notification.operation();
        let start = Instant::now();
        let result = match notification {
            ClientNotification::SendMessage { text } => self.send_message(&text).await,
            ClientNotification::KeyExchange {
                target_peer_id,
                key_material,
            } => self.relay_key(target_peer_id, key_material).await,
        };
        self.record(operation, start, result.as_ref().err());
        result
    }

    async fn send_message(&self, text: &str) -> Result<(), RoomError> {
        let text = validate_chat_text(text, self.config.chat_max_length)?;
        self.registry.chat(self.peer.clone(), text).await
    }

    async fn relay_key(&self, target_peer_id: String, key_material: Value) -> Result<(), RoomError> {
        let size = serde_json::to_vec(&key_material)
            .map(|bytes| bytes.len())
            .map_err(|e| RoomError::Validation(format!("Invalid key material: {e}")))?;
        if size > self.config.key_material_max_bytes {
            return Err(RoomError::Validation(format!(
                "Key material exceeds {} bytes",
                self.config.key_material_max_bytes
            )));
        }
        self.registry
            .relay_key(self.peer.clone(), target_peer_id, key_material)
            .await
    }

    async fn dispatch(&self, request: ClientRequest) -> Result<ResponseData, RoomError> {
        match request {
            ClientRequest::GetCapabilities => {
                let ctx = self.registry.router(self.peer.clone()).await?;
                Ok(ResponseData::Capabilities {
                    rtp_capabilities: ctx.router.rtp_capabilities(),
                })
            }

            ClientRequest::CreateTransport { direction } => {
                let ctx = self.registry.router(self.peer.clone()).await?;
                let (transport, params) = self
                    .workers
                    .create_transport(ctx.router.as_ref(), direction, Some(ctx.max_bitrate))
                    .await?;
                lifecycle::watch_transport(&self.registry, &self.peer, &transport);
                self.registry
                    .attach_transport(self.peer.clone(), transport)
                    .await?;
                debug!(
                    target: "room.signaling",
                    direction = direction.as_str(),
                    transport_id = %params.id,
                    "Transport created"
                );
                Ok(ResponseData::Transport { params })
            }

            ClientRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                let transport = self
                    .registry
                    .transport(self.peer.clone(), transport_id)
                    .await?;
                transport.connect(dtls_parameters).await?;
                Ok(ResponseData::Ack {})
            }

            ClientRequest::Produce {
                transport_id,
                kind,
                rtp_parameters,
                app_data,
            } => {
                let transport = self
                    .registry
                    .prepare_produce(self.peer.clone(), transport_id.clone(), app_data.clone())
                    .await?;
                let producer = transport.produce(kind, rtp_parameters).await?;
                lifecycle::watch_producer(&self.registry, &self.peer, &producer);
                let producer_id = producer.id().to_string();
                self.registry
                    .attach_producer(self.peer.clone(), transport_id, producer, kind, app_data)
                    .await?;
                Ok(ResponseData::Produced { producer_id })
            }

            ClientRequest::Consume {
                producer_id,
                rtp_capabilities,
            } => {
                let ctx = self
                    .registry
                    .prepare_consume(self.peer.clone(), producer_id.clone(), rtp_capabilities.clone())
                    .await?;
                // Consumers start paused; the client resumes once it is ready.
                let consumer = ctx
                    .transport
                    .consume(&producer_id, &rtp_capabilities, true)
                    .await?;
                lifecycle::watch_consumer(&self.registry, &self.peer, &consumer);
                let info = ConsumerInfo {
                    consumer_id: consumer.id().to_string(),
                    producer_id,
                    kind: consumer.kind(),
                    rtp_parameters: consumer.rtp_parameters(),
                    app_data: ctx.app_data,
                };
                self.registry
                    .attach_consumer(self.peer.clone(), consumer)
                    .await?;
                Ok(ResponseData::Consumed(info))
            }

            ClientRequest::ResumeConsumer { consumer_id } => {
                let consumer = self
                    .registry
                    .consumer(self.peer.clone(), consumer_id)
                    .await?;
                consumer.resume().await?;
                Ok(ResponseData::Ack {})
            }

            ClientRequest::CloseProducer { producer_id } => {
                self.registry
                    .close_producer(self.peer.clone(), producer_id)
                    .await?;
                Ok(ResponseData::Ack {})
            }

            ClientRequest::UpdateProducerTag {
                producer_id,
                app_data,
            } => {
                let app_data = self
                    .registry
                    .update_producer_tag(self.peer.clone(), producer_id, app_data)
                    .await?;
                Ok(ResponseData::Tag { app_data })
            }

            ClientRequest::ListPeers => {
                let peers = self.registry.list_peers(self.peer.clone()).await?;
                Ok(ResponseData::Peers { peers })
            }
        }
    }

    fn record(&self, operation: &'static str, start: Instant, error: Option<&RoomError>) {
        let duration = start.elapsed();
        match error {
            None => metrics::record_signaling_request(operation, "success", duration),
            Some(err) => {
                metrics::record_signaling_request(operation, "error", duration);
                metrics::record_error(
                    operation,
                    err.error_type_label(),
                    err.status_code().as_u16(),
                );
                if err.is_not_found() {
                    debug!(target: "room.signaling", operation, error = %err, "Request target gone");
                } else {
                    warn!(target: "room.signaling", operation, error = %err, "Request failed");
                }
            }
        }
    }
}

/// Trim chat text and enforce the length cap (in characters).
pub fn validate_chat_text(text: &str, max_length: usize) -> Result<String, RoomError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(RoomError::Validation("Message cannot be empty".to_string()));
    }
    if text.chars().count() > max_length {
        return Err(RoomError::Validation(format!(
            "Message exceeds {max_length} characters"
        )));
    }
    Ok(text.to_string())
}
