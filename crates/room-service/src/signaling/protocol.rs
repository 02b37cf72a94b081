//! Signaling wire format.
//!
//! Client frames:
//!
//! ```json
//! {"id": 7, "request": {"type": "create-transport", "direction": "send"}}
//! {"notify": {"type": "send-message", "text": "hello"}}
//! ```
//!
//! Server frames:
//!
//! ```json
//! {"id": 7, "ok": true, "data": {...}}
//! {"id": 7, "ok": false, "error": {"code": "TRANSPORT_NOT_FOUND", "message": "..."}}
//! {"event": {"type": "peer-joined", "peerId": "...", "displayName": "..."}}
//! ```

use crate::errors::{ErrorBody, RoomError};
use crate::media::{Direction, EngineObject, MediaKind, TransportParams};
use crate::registry::peer::AppTag;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request/response operations.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientRequest {
    GetCapabilities,
    CreateTransport {
        direction: Direction,
    },
    ConnectTransport {
        transport_id: String,
        dtls_parameters: EngineObject,
    },
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: EngineObject,
        #[serde(default)]
        app_data: AppTag,
    },
    Consume {
        producer_id: String,
        rtp_capabilities: EngineObject,
    },
    ResumeConsumer {
        consumer_id: String,
    },
    CloseProducer {
        producer_id: String,
    },
    UpdateProducerTag {
        producer_id: String,
        app_data: AppTag,
    },
    ListPeers,
}

impl ClientRequest {
    /// Operation name used in logs and metrics.
    pub fn operation(&self) -> &'static str {
        match self {
            ClientRequest::GetCapabilities => "get-capabilities",
            ClientRequest::CreateTransport { .. } => "create-transport",
            ClientRequest::ConnectTransport { .. } => "connect-transport",
            ClientRequest::Produce { .. } => "produce",
            ClientRequest::Consume { .. } => "consume",
            ClientRequest::ResumeConsumer { .. } => "resume-consumer",
            ClientRequest::CloseProducer { .. } => "close-producer",
            ClientRequest::UpdateProducerTag { .. } => "update-producer-tag",
            ClientRequest::ListPeers => "list-peers",
        }
    }
}

/// Fire-and-forget client messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientNotification {
    SendMessage { text: String },
    KeyExchange { target_peer_id: String, key_material: Value },
}

impl ClientNotification {
    pub fn operation(&self) -> &'static str {
        match self {
            ClientNotification::SendMessage { .. } => "send-message",
            ClientNotification::KeyExchange { .. } => "key-exchange",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Request { id: u64, request: ClientRequest },
    Notify(ClientNotification),
}

/// Why a frame could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Not even the envelope parsed; nothing to reply to.
    Malformed(String),
    /// The envelope had an id but the request body was invalid.
    BadRequest { id: u64, reason: String },
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    request: Option<Value>,
    #[serde(default)]
    notify: Option<Value>,
}

/// Parse one text frame from the client.
pub fn parse_client_frame(text: &str) -> Result<ClientFrame, FrameError> {
    let raw: RawFrame =
        serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;

    match (raw.id, raw.request, raw.notify) {
        (Some(id), Some(request), None) => serde_json::from_value(request)
            .map(|request| ClientFrame::Request { id, request })
            .map_err(|e| FrameError::BadRequest {
                id,
                reason: e.to_string(),
            }),
        (None, None, Some(notify)) => serde_json::from_value(notify)
            .map(ClientFrame::Notify)
            .map_err(|e| FrameError::Malformed(e.to_string())),
        (Some(id), _, _) => Err(FrameError::BadRequest {
            id,
            reason: "expected exactly one request".to_string(),
        }),
        _ => Err(FrameError::Malformed(
            "expected a request with an id or a notification".to_string(),
        )),
    }
}

/// Peer entry in a `list-peers` reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub id: String,
    pub display_name: String,
    pub producers: Vec<ProducerSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub id: String,
    pub kind: MediaKind,
    pub app_data: AppTag,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub consumer_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: EngineObject,
    pub app_data: AppTag,
}

/// Successful reply payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum ResponseData {
    Capabilities { rtp_capabilities: EngineObject },
    Transport { params: TransportParams },
    Produced { producer_id: String },
    Consumed(ConsumerInfo),
    Tag { app_data: AppTag },
    Peers { peers: Vec<PeerSummary> },
    Ack {},
}

/// Server-initiated events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    NewProducer {
        producer_id: String,
        peer_id: String,
        kind: MediaKind,
        app_data: AppTag,
    },
    ProducerClosed {
        producer_id: String,
        peer_id: String,
    },
    ProducerUpdated {
        producer_id: String,
        peer_id: String,
        app_data: AppTag,
    },
    ConsumerClosed {
        consumer_id: String,
        producer_id: String,
    },
    PeerJoined {
        peer_id: String,
        display_name: String,
    },
    PeerLeft {
        peer_id: String,
        display_name: String,
    },
    MessageReceived {
        id: String,
        peer_id: String,
        display_name: String,
        text: String,
        timestamp: i64,
    },
    KeyExchange {
        from_peer_id: String,
        key_material: Value,
    },
    RoomClosed {
        reason: String,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerEvent {
    /// Event name used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::NewProducer { .. } => "new-producer",
            ServerEvent::ProducerClosed { .. } => "producer-closed",
            ServerEvent::ProducerUpdated { .. } => "producer-updated",
            ServerEvent::ConsumerClosed { .. } => "consumer-closed",
            ServerEvent::PeerJoined { .. } => "peer-joined",
            ServerEvent::PeerLeft { .. } => "peer-left",
            ServerEvent::MessageReceived { .. } => "message-received",
            ServerEvent::KeyExchange { .. } => "key-exchange",
            ServerEvent::RoomClosed { .. } => "room-closed",
            ServerEvent::Error { .. } => "error",
        }
    }

    /// Caller-only error event for a rejected notification.
    pub fn from_error(err: &RoomError) -> Self {
        ServerEvent::Error {
            code: err.error_code().to_string(),
            message: err.client_message(),
        }
    }
}

/// Everything the server writes to a connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Response {
        id: u64,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<ResponseData>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    Event {
        event: ServerEvent,
    },
}

impl ServerFrame {
    pub fn reply(id: u64, result: Result<ResponseData, RoomError>) -> Self {
        match result {
            Ok(data) => ServerFrame::Response {
                id,
                ok: true,
                data: Some(data),
                error: None,
            },
            Err(err) => ServerFrame::Response {
                id,
                ok: false,
                data: None,
                error: Some(err.to_body()),
            },
        }
    }

    pub fn event(event: ServerEvent) -> Self {
        ServerFrame::Event { event }
    }

    /// Name for logs: `response` or the event name.
    pub fn name(&self) -> &'static str {
        match self {
            ServerFrame::Response { .. } => "response",
            ServerFrame::Event { event } => event.name(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_request_frame() {
        let frame = parse_client_frame(
            r#"{"id": 3, "request": {"type": "create-transport", "direction": "recv"}}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            ClientFrame::Request {
                id: 3,
                request: ClientRequest::CreateTransport {
                    direction: Direction::Recv
                }
            }
        );
    }

    #[test]
    fn test_parse_produce_defaults_app_data() {
        let frame = parse_client_frame(
            r#"{"id": 1, "request": {"type": "produce", "transportId": "t1", "kind": "video", "rtpParameters": {}}}"#,
        )
        .unwrap();
        let ClientFrame::Request {
            request: ClientRequest::Produce { app_data, kind, .. },
            ..
        } = frame
        else {
            panic!("expected produce request");
        };
        assert_eq!(kind, MediaKind::Video);
        assert_eq!(app_data, AppTag::default());
    }

    #[test]
    fn test_parse_notification_frame() {
        let frame =
            parse_client_frame(r#"{"notify": {"type": "send-message", "text": "hello"}}"#)
                .unwrap();
        assert_eq!(
            frame,
            ClientFrame::Notify(ClientNotification::SendMessage {
                text: "hello".to_string()
            })
        );

        let frame = parse_client_frame(
            r#"{"notify": {"type": "key-exchange", "targetPeerId": "p2", "keyMaterial": {"k": "abc"}}}"#,
        )
        .unwrap();
        assert!(matches!(
            frame,
            ClientFrame::Notify(ClientNotification::KeyExchange { ref target_peer_id, .. })
                if target_peer_id == "p2"
        ));
    }

    #[test]
    fn test_unknown_request_keeps_id() {
        let err = parse_client_frame(r#"{"id": 9, "request": {"type": "teleport"}}"#).unwrap_err();
        assert!(matches!(err, FrameError::BadRequest { id: 9, .. }));
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(
            parse_client_frame("not json"),
            Err(FrameError::Malformed(_))
        ));
        assert!(matches!(
            parse_client_frame(r#"{"request": {"type": "list-peers"}}"#),
            Err(FrameError::Malformed(_))
        ));
        assert!(matches!(
            parse_client_frame(r#"{"id": 1}"#),
            Err(FrameError::BadRequest { id: 1, .. })
        ));
    }

    #[test]
    fn test_reply_serialization() {
        let ok = ServerFrame::reply(
            4,
            Ok(ResponseData::Produced {
                producer_id: "p1".to_string(),
            }),
        );
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"id": 4, "ok": true, "data": {"producerId": "p1"}})
        );

        let ack = ServerFrame::reply(5, Ok(ResponseData::Ack {}));
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"id": 5, "ok": true, "data": {}})
        );

        let err = ServerFrame::reply(6, Err(RoomError::TransportNotFound));
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"id": 6, "ok": false, "error": {"code": "TRANSPORT_NOT_FOUND", "message": "Transport not found"}})
        );
    }

    #[test]
    fn test_event_serialization() {
        let frame = ServerFrame::event(ServerEvent::PeerJoined {
            peer_id: "p1".to_string(),
            display_name: "Ada".to_string(),
        });
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"event": {"type": "peer-joined", "peerId": "p1", "displayName": "Ada"}})
        );

        let frame = ServerFrame::event(ServerEvent::KeyExchange {
            from_peer_id: "p1".to_string(),
            key_material: json!({"k": 1}),
        });
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"event": {"type": "key-exchange", "fromPeerId": "p1", "keyMaterial": {"k": 1}}})
        );
    }
}
