//! Integration tests for resource and room lifecycle.
//!
//! Tests drive the in-process media engine from the outside to cover:
//! - Remote DTLS close cascading to producers and consumers
//! - Media worker death clearing readiness
//! - Housekeeping of pending peers and expired rooms
//! - Tier bitrate caps on new transports

#![allow(clippy::unwrap_used, clippy::expect_used)]

use room_service::media::DtlsState;
use room_test_utils::{TestRoomServer, TestWsClient};
use serde_json::{json, Value};
use std::time::Duration;

fn token(body: &Value) -> &str {
    body["sessionToken"].as_str().unwrap()
}

async fn wait_for_room_count(server: &TestRoomServer, expected: u64) -> Result<(), anyhow::Error> {
    for _ in 0..100 {
        let (_, health) = server.get("/api/health").await?;
        if health["rooms"].as_u64() == Some(expected) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    anyhow::bail!("room count never reached {expected}")
}

async fn create_transport(ws: &mut TestWsClient, direction: &str) -> Result<String, anyhow::Error> {
    let data = ws
        .request_ok("create-transport", json!({"direction": direction}))
        .await?;
    Ok(data["params"]["id"].as_str().unwrap().to_string())
}

/// Test that a remote DTLS close tears down producers and their consumers.
#[tokio::test]
async fn test_dtls_close_cascades_to_producers_and_consumers() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;
    let (_, created) = server.create_room("team", "hunter2", "Ana", "free").await?;
    let (_, joined) = server.join_room("team", "hunter2", "Ben").await?;
    let mut ana = TestWsClient::connect(&server.ws_url(token(&created))).await?;
    let mut ben = TestWsClient::connect(&server.ws_url(token(&joined))).await?;
    ana.wait_for_event("peer-joined").await?;

    let send = create_transport(&mut ana, "send").await?;
    let produced = ana
        .request_ok(
            "produce",
            json!({
                "transportId": send,
                "kind": "video",
                "rtpParameters": {"encodings": [{"ssrc": 2222}]},
                "appData": {"source": "camera"}
            }),
        )
        .await?;
    let producer_id = produced["producerId"].as_str().unwrap().to_string();
    ben.wait_for_event("new-producer").await?;

    let caps = ben.request_ok("get-capabilities", json!({})).await?;
    create_transport(&mut ben, "recv").await?;
    let consumed = ben
        .request_ok(
            "consume",
            json!({"producerId": producer_id, "rtpCapabilities": caps["rtpCapabilities"]}),
        )
        .await?;
    let consumer_id = consumed["consumerId"].as_str().unwrap().to_string();

    server
        .transport(&send)
        .expect("send transport is known to the engine")
        .set_dtls_state(DtlsState::Closed);

    let closed = ben.wait_for_event("producer-closed").await?;
    assert_eq!(closed["producerId"], producer_id.as_str());
    let consumer_closed = ben.wait_for_event("consumer-closed").await?;
    assert_eq!(consumer_closed["consumerId"], consumer_id.as_str());

    let peers = ben.request_ok("list-peers", json!({})).await?;
    assert_eq!(peers["peers"][0]["producers"], json!([]));
    Ok(())
}

/// Test that a media worker death is reported and clears readiness.
#[tokio::test]
async fn test_worker_death_clears_readiness() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;

    let response = reqwest::get(format!("{}/ready", server.url())).await?;
    assert_eq!(response.status(), 200);

    let worker = server.workers().into_iter().next().expect("a worker is running");
    worker.kill("segfault");

    let death = tokio::time::timeout(Duration::from_secs(5), server.wait_for_worker_death())
        .await??;
    assert!(death.reason.contains("segfault"));

    let response = reqwest::get(format!("{}/ready", server.url())).await?;
    assert_eq!(response.status(), 503);

    // Liveness is unaffected; the orchestrator restarts on readiness
    let response = reqwest::get(format!("{}/live", server.url())).await?;
    assert_eq!(response.status(), 200);
    Ok(())
}

/// Test that peers who never connect are pruned along with their room.
#[tokio::test]
async fn test_pending_peers_are_pruned() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::builder()
        .var("HOUSEKEEPING_INTERVAL_SECONDS", "1")
        .var("PENDING_PEER_TIMEOUT_SECONDS", "1")
        .spawn()
        .await?;

    let (status, _) = server.create_room("team", "hunter2", "Ana", "free").await?;
    assert_eq!(status, 201);
    wait_for_room_count(&server, 1).await?;

    // Nobody ever connects
    wait_for_room_count(&server, 0).await?;

    let (_, can_create) = server.get("/api/rooms/can-create?tier=free").await?;
    assert_eq!(can_create["pool"]["active"], 0);
    Ok(())
}

/// Test that a room past its maximum lifetime is closed for its members.
#[tokio::test]
async fn test_room_max_duration_closes_room() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::builder()
        .var("HOUSEKEEPING_INTERVAL_SECONDS", "1")
        .var("ROOM_MAX_DURATION_SECONDS", "1")
        .spawn()
        .await?;

    let (_, created) = server.create_room("team", "hunter2", "Ana", "free").await?;
    let mut ana = TestWsClient::connect(&server.ws_url(token(&created))).await?;

    let closed = ana.wait_for_event("room-closed").await?;
    assert_eq!(closed["reason"], "max-duration");
    ana.wait_closed().await?;

    wait_for_room_count(&server, 0).await?;
    let (status, _) = server.join_room("team", "hunter2", "Ben").await?;
    assert_eq!(status, 404);
    Ok(())
}

/// Test that new transports carry the tier bitrate cap, and that an engine
/// refusing the cap does not fail the request.
#[tokio::test]
async fn test_transport_bitrate_cap() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;
    let (_, created) = server.create_room("team", "hunter2", "Ana", "free").await?;
    let mut ana = TestWsClient::connect(&server.ws_url(token(&created))).await?;

    let capped = create_transport(&mut ana, "send").await?;
    let bitrate = server.transport(&capped).unwrap().max_incoming_bitrate();
    assert!(bitrate > 0);
    assert!(bitrate <= server.config().tiers.free.max_bitrate);

    server.reject_bitrate_caps();
    let uncapped = create_transport(&mut ana, "send").await?;
    assert_eq!(server.transport(&uncapped).unwrap().max_incoming_bitrate(), 0);
    Ok(())
}
