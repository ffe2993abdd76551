// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket integration tests using real connections against an in-process
//! axum server.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use ridehub::config::HubConfig;
use ridehub::manager::Manager;
use ridehub::message::{Message, Role};
use ridehub::test_support::{spawn_http_server, test_manager, test_state, token};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsTx = futures_util::stream::SplitSink<WsStream, WsMessage>;
type WsRx = futures_util::stream::SplitStream<WsStream>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Send a JSON message over the WebSocket.
async fn ws_send(stream: &mut WsTx, value: &serde_json::Value) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    stream.send(WsMessage::Text(text.into())).await.map_err(|e| anyhow::anyhow!("ws send: {e}"))?;
    Ok(())
}

/// Receive the next JSON text frame, skipping control frames.
async fn ws_recv(stream: &mut WsRx, timeout: Duration) -> anyhow::Result<serde_json::Value> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let msg = tokio::time::timeout_at(deadline, stream.next())
            .await
            .map_err(|_| anyhow::anyhow!("ws recv timeout"))?
            .ok_or_else(|| anyhow::anyhow!("ws stream closed"))?
            .map_err(|e| anyhow::anyhow!("ws recv: {e}"))?;

        match msg {
            WsMessage::Text(text) => return Ok(serde_json::from_str(&text)?),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => anyhow::bail!("expected Text message, got {other:?}"),
        }
    }
}

/// Receive frames until one of type `kind` arrives.
async fn ws_recv_kind(stream: &mut WsRx, kind: &str) -> anyhow::Result<serde_json::Value> {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let value = ws_recv(stream, remaining).await?;
        if value["type"] == kind {
            return Ok(value);
        }
    }
}

/// Every text frame of type `kind` received within `window`.
async fn ws_collect_kind(
    stream: &mut WsRx,
    kind: &str,
    window: Duration,
) -> Vec<serde_json::Value> {
    let deadline = tokio::time::Instant::now() + window;
    let mut found = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match ws_recv(stream, remaining).await {
            Ok(value) if value["type"] == kind => found.push(value),
            Ok(_) => {}
            Err(_) => return found,
        }
    }
}

/// Connect as `user_id`, returning once the welcome message has arrived.
async fn ws_connect(
    addr: &std::net::SocketAddr,
    user_id: &str,
    role: Role,
) -> anyhow::Result<(WsTx, WsRx)> {
    let url = format!("ws://{addr}/ws/connect?token={}", token(user_id, role)?);
    let (stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(|e| anyhow::anyhow!("ws connect: {e}"))?;
    let (tx, mut rx) = stream.split();
    ws_recv_kind(&mut rx, "system").await?;
    Ok((tx, rx))
}

async fn start(config: HubConfig) -> anyhow::Result<(Arc<Manager>, std::net::SocketAddr)> {
    let manager = test_manager(config);
    let (addr, _handle) = spawn_http_server(test_state(Arc::clone(&manager))).await?;
    Ok((manager, addr))
}

#[tokio::test]
async fn connect_greets_then_answers_ping() -> anyhow::Result<()> {
    let (manager, addr) = start(HubConfig::test()).await?;
    let url = format!("ws://{addr}/ws/connect?token={}", token("alice", Role::Rider)?);
    let (stream, _) = tokio_tungstenite::connect_async(&url).await?;
    let (mut tx, mut rx) = stream.split();

    let ack = ws_recv_kind(&mut rx, "connection_ack").await?;
    assert_eq!(ack["data"]["userId"], "alice");
    assert_eq!(ack["data"]["role"], "rider");
    let client_id = ack["data"]["clientId"].clone();

    let welcome = ws_recv_kind(&mut rx, "system").await?;
    assert_eq!(welcome["data"]["message"], "Connected successfully");
    assert_eq!(welcome["data"]["clientId"], client_id);
    assert!(welcome["data"]["reconnectToken"].as_str().is_some_and(|t| t.len() == 43));

    ws_send(&mut tx, &json!({ "type": "ping", "requestId": "p1" })).await?;
    let pong = ws_recv_kind(&mut rx, "pong").await?;
    assert_eq!(pong["requestId"], "p1");
    assert!(manager.hub().is_user_connected("alice"));
    manager.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn bad_token_is_rejected_before_upgrade() -> anyhow::Result<()> {
    let (manager, addr) = start(HubConfig::test()).await?;

    let result =
        tokio_tungstenite::connect_async(format!("ws://{addr}/ws/connect?token=wrong")).await;
    assert!(result.is_err(), "should reject connection with wrong token");
    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/connect")).await;
    assert!(result.is_err(), "should reject connection without token");
    assert_eq!(manager.hub().total_connections(), 0);
    manager.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn connection_limit_returns_unavailable() -> anyhow::Result<()> {
    let config = HubConfig { max_connections: 1, ..HubConfig::test() };
    let (manager, addr) = start(config).await?;

    let _first = ws_connect(&addr, "alice", Role::Rider).await?;
    let second = ws_connect(&addr, "bob", Role::Rider).await;
    assert!(second.is_err(), "second connection should be refused");
    manager.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn typing_reaches_the_other_user() -> anyhow::Result<()> {
    let (manager, addr) = start(HubConfig::test()).await?;
    let (mut alice_tx, mut alice_rx) = ws_connect(&addr, "alice", Role::Rider).await?;
    let (_bob_tx, mut bob_rx) = ws_connect(&addr, "bob", Role::Driver).await?;

    let typing = json!({
        "type": "typing",
        "requestId": "t1",
        "data": { "receiverId": "bob", "isTyping": true }
    });
    ws_send(&mut alice_tx, &typing).await?;

    let typing = ws_recv_kind(&mut bob_rx, "typing").await?;
    assert_eq!(typing["data"]["senderId"], "alice");
    assert_eq!(typing["data"]["isTyping"], true);
    let ack = ws_recv_kind(&mut alice_rx, "ack").await?;
    assert_eq!(ack["requestId"], "t1");
    manager.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn driver_location_reaches_riders() -> anyhow::Result<()> {
    let (manager, addr) = start(HubConfig::test()).await?;
    let (mut driver_tx, _driver_rx) = ws_connect(&addr, "d1", Role::Driver).await?;
    let (mut rider_tx, mut rider_rx) = ws_connect(&addr, "r1", Role::Rider).await?;

    let location = json!({
        "type": "driver_location_update",
        "data": { "latitude": 40.7, "longitude": -74.0 }
    });
    ws_send(&mut driver_tx, &location).await?;
    let update = ws_recv_kind(&mut rider_rx, "driver_location_update").await?;
    assert_eq!(update["data"]["driverId"], "d1");
    assert_eq!(update["data"]["latitude"], 40.7);

    // Riders may not publish locations.
    let spoofed = json!({
        "type": "driver_location_update",
        "requestId": "x",
        "data": { "latitude": 1, "longitude": 1 }
    });
    ws_send(&mut rider_tx, &spoofed).await?;
    let err = ws_recv_kind(&mut rider_rx, "error").await?;
    assert_eq!(err["data"]["code"], "FORBIDDEN");
    assert_eq!(err["requestId"], "x");
    manager.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn invalid_frames_get_errors_without_disconnect() -> anyhow::Result<()> {
    let (manager, addr) = start(HubConfig::test()).await?;
    let (mut tx, mut rx) = ws_connect(&addr, "alice", Role::Rider).await?;

    tx.send(WsMessage::Text("not json".into())).await?;
    let err = ws_recv_kind(&mut rx, "error").await?;
    assert_eq!(err["data"]["error"], "invalid message format");

    ws_send(&mut tx, &json!({ "type": "warp_drive" })).await?;
    let err = ws_recv_kind(&mut rx, "error").await?;
    assert_eq!(err["data"]["error"], "unhandled message type: warp_drive");

    ws_send(&mut tx, &json!({ "type": "ping" })).await?;
    ws_recv_kind(&mut rx, "pong").await?;
    manager.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn acked_delivery_stops_after_client_ack() -> anyhow::Result<()> {
    let (manager, addr) = start(HubConfig::test()).await?;
    let (mut tx, mut rx) = ws_connect(&addr, "alice", Role::Rider).await?;

    let msg = Message::with_json("ride_request_accepted", json!({ "rideId": "r1" })).acked();
    assert!(manager.send_message("alice", msg).await);

    let first = ws_recv_kind(&mut rx, "ride_request_accepted").await?;
    assert_eq!(first["requireAck"], true);
    let id = first["messageId"].clone();
    ws_send(&mut tx, &json!({ "type": "ack", "data": { "messageId": id } })).await?;

    let repeats =
        ws_collect_kind(&mut rx, "ride_request_accepted", Duration::from_millis(300)).await;
    assert!(repeats.is_empty(), "acked message was resent: {repeats:?}");
    manager.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn unacked_delivery_is_retried() -> anyhow::Result<()> {
    let (manager, addr) = start(HubConfig::test()).await?;
    let (_tx, mut rx) = ws_connect(&addr, "alice", Role::Rider).await?;

    let msg = Message::with_json("ride_started", json!({})).acked();
    manager.send_message("alice", msg).await;

    let copies = ws_collect_kind(&mut rx, "ride_started", Duration::from_millis(600)).await;
    assert_eq!(copies.len(), 4, "one delivery plus three retries");
    assert!(copies.windows(2).all(|w| w[0]["messageId"] == w[1]["messageId"]));
    manager.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn offline_notifications_arrive_on_connect() -> anyhow::Result<()> {
    let (manager, addr) = start(HubConfig::test()).await?;
    assert!(!manager.send_notification("alice", json!({ "title": "Your ride is booked" })).await);

    let (_tx, mut rx) = ws_connect(&addr, "alice", Role::Rider).await?;
    let bulk = ws_recv_kind(&mut rx, "notification_bulk").await?;
    assert_eq!(bulk["data"]["count"], 1);
    assert_eq!(bulk["data"]["notifications"][0]["title"], "Your ride is booked");
    manager.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn disconnect_announces_offline() -> anyhow::Result<()> {
    let (manager, addr) = start(HubConfig::test()).await?;
    let (_watch_tx, mut watch_rx) = ws_connect(&addr, "watcher", Role::Admin).await?;
    let (mut alice_tx, _alice_rx) = ws_connect(&addr, "alice", Role::Rider).await?;
    // The watcher also hears its own announcement; wait for alice's.
    while ws_recv_kind(&mut watch_rx, "user_online").await?["data"]["userId"] != "alice" {}

    alice_tx.send(WsMessage::Close(None)).await?;
    let offline = ws_recv_kind(&mut watch_rx, "user_offline").await?;
    assert_eq!(offline["data"]["userId"], "alice");
    assert!(!manager.hub().is_user_connected("alice"));
    assert_eq!(manager.hub().total_connections(), 1);
    manager.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn shutdown_closes_client_sockets() -> anyhow::Result<()> {
    let (manager, addr) = start(HubConfig::test()).await?;
    let (_tx, mut rx) = ws_connect(&addr, "alice", Role::Rider).await?;

    manager.shutdown(Duration::from_secs(1)).await;
    let closed = tokio::time::timeout(RECV_TIMEOUT, async {
        while let Some(frame) = rx.next().await {
            if matches!(frame, Ok(WsMessage::Close(_)) | Err(_)) {
                return true;
            }
        }
        true
    })
    .await?;
    assert!(closed);
    Ok(())
}
