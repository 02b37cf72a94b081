//! WebSocket signaling client for E2E tests.
//!
//! Speaks the room service's JSON framing: requests carry an `id` and get a
//! matching reply, everything else arrives as `{"event": {...}}`. Events seen
//! while waiting for a reply are buffered, so no event is lost to a request.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// How long helpers wait for a frame before failing the test.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestWsClient {
    socket: Socket,
    next_id: u64,
    events: VecDeque<Value>,
}

/// Outcome of a connection attempt that may be refused before the upgrade.
#[derive(Debug)]
pub enum ConnectOutcome {
    Connected(TestWsClient),
    /// HTTP status and JSON body of the refusal.
    Refused(u16, Value),
}

impl TestWsClient {
    /// Connect and expect the upgrade to succeed.
    pub async fn connect(url: &str) -> Result<Self, anyhow::Error> {
        match Self::try_connect(url).await? {
            ConnectOutcome::Connected(client) => Ok(client),
            ConnectOutcome::Refused(status, body) => {
                anyhow::bail!("connection refused with {status}: {body}")
            }
        }
    }

    /// Connect, reporting a pre-upgrade refusal instead of failing.
    pub async fn try_connect(url: &str) -> Result<ConnectOutcome, anyhow::Error> {
        match connect_async(url).await {
            Ok((socket, _)) => Ok(ConnectOutcome::Connected(Self {
                socket,
                next_id: 1,
                events: VecDeque::new(),
            })),
            Err(tungstenite::Error::Http(response)) => {
                let status = response.status().as_u16();
                let body = response
                    .body()
                    .as_deref()
                    .and_then(|bytes| serde_json::from_slice(bytes).ok())
                    .unwrap_or(Value::Null);
                Ok(ConnectOutcome::Refused(status, body))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send a request and wait for its reply frame.
    ///
    /// `payload` is merged into the request object next to `type`.
    pub async fn request(&mut self, kind: &str, payload: Value) -> Result<Value, anyhow::Error> {
        let id = self.next_id;
        self.next_id += 1;

        let mut request = json!({ "type": kind });
        merge(&mut request, payload);
        self.send_json(&json!({ "id": id, "request": request }))
            .await?;

        loop {
            let frame = self.read_frame(DEFAULT_WAIT).await?;
            if frame.get("event").is_some() {
                self.events.push_back(frame);
                continue;
            }
            if frame["id"] == id {
                return Ok(frame);
            }
        }
    }

    /// Send a request and return `data`, failing if the reply is an error.
    pub async fn request_ok(&mut self, kind: &str, payload: Value) -> Result<Value, anyhow::Error> {
        let reply = self.request(kind, payload).await?;
        if reply["ok"] != true {
            anyhow::bail!("{kind} failed: {}", reply["error"]);
        }
        Ok(reply.get("data").cloned().unwrap_or(Value::Null))
    }

    /// Send a request expected to fail and return the error code.
    pub async fn request_err(&mut self, kind: &str, payload: Value) -> Result<String, anyhow::Error> {
        let reply = self.request(kind, payload).await?;
        if reply["ok"] != false {
            anyhow::bail!("{kind} unexpectedly succeeded: {reply}");
        }
        reply["error"]["code"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("error reply without code: {reply}"))
    }

    /// Send a fire-and-forget notification.
    pub async fn notify(&mut self, kind: &str, payload: Value) -> Result<(), anyhow::Error> {
        let mut notify = json!({ "type": kind });
        merge(&mut notify, payload);
        self.send_json(&json!({ "notify": notify })).await
    }

    /// Send raw text, for malformed-frame tests.
    pub async fn send_text(&mut self, text: &str) -> Result<(), anyhow::Error> {
        self.socket.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    /// Next event of the given `type`, skipping any others.
    pub async fn wait_for_event(&mut self, kind: &str) -> Result<Value, anyhow::Error> {
        let deadline = tokio::time::Instant::now() + DEFAULT_WAIT;
        loop {
            if let Some(index) = self.events.iter().position(|e| e["event"]["type"] == kind) {
                if let Some(frame) = self.events.remove(index) {
                    return Ok(frame["event"].clone());
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                anyhow::bail!("timed out waiting for {kind} event");
            }
            let frame = self.read_frame(remaining).await?;
            if frame.get("event").is_some() {
                self.events.push_back(frame);
            }
        }
    }

    /// Assert no event of the given `type` arrives within `window`.
    pub async fn expect_no_event(&mut self, kind: &str, window: Duration) -> Result<(), anyhow::Error> {
        if self.events.iter().any(|e| e["event"]["type"] == kind) {
            anyhow::bail!("unexpected {kind} event already buffered");
        }
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            match tokio::time::timeout(remaining, self.next_json()).await {
                Err(_) => return Ok(()),
                Ok(Ok(Some(frame))) => {
                    if frame["event"]["type"] == kind {
                        anyhow::bail!("unexpected {kind} event: {frame}");
                    }
                    if frame.get("event").is_some() {
                        self.events.push_back(frame);
                    }
                }
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    /// Wait for the server to close the socket.
    pub async fn wait_closed(&mut self) -> Result<(), anyhow::Error> {
        let deadline = tokio::time::Instant::now() + DEFAULT_WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, self.next_json()).await {
                Err(_) => anyhow::bail!("socket still open"),
                Ok(Ok(None)) | Ok(Err(_)) => return Ok(()),
                Ok(Ok(Some(frame))) => {
                    if frame.get("event").is_some() {
                        self.events.push_back(frame);
                    }
                }
            }
        }
    }

    pub async fn close(mut self) -> Result<(), anyhow::Error> {
        self.socket.close(None).await?;
        Ok(())
    }

    async fn send_json(&mut self, value: &Value) -> Result<(), anyhow::Error> {
        self.socket.send(Message::Text(value.to_string())).await?;
        Ok(())
    }

    async fn read_frame(&mut self, wait: Duration) -> Result<Value, anyhow::Error> {
        match tokio::time::timeout(wait, self.next_json()).await {
            Err(_) => anyhow::bail!("timed out waiting for a frame"),
            Ok(Ok(Some(frame))) => Ok(frame),
            Ok(Ok(None)) => anyhow::bail!("socket closed"),
            Ok(Err(e)) => Err(e),
        }
    }

    /// Next JSON text frame; `None` once the socket is closed.
    async fn next_json(&mut self) -> Result<Option<Value>, anyhow::Error> {
        while let Some(message) = self.socket.next().await {
            match message? {
                Message::Text(text) => return Ok(Some(serde_json::from_str(&text)?)),
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }
}

impl std::fmt::Debug for TestWsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestWsClient")
            .field("next_id", &self.next_id)
            .field("buffered_events", &self.events.len())
            .finish()
    }
}

fn merge(target: &mut Value, payload: Value) {
    if let (Some(target), Value::Object(fields)) = (target.as_object_mut(), payload) {
        target.extend(fields);
    }
}
