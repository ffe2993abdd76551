// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Integration tests for the hub HTTP API.
//!
//! Uses `axum_test::TestServer`, no real TCP needed.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::json;

use ridehub::config::HubConfig;
use ridehub::manager::{Identity, Manager};
use ridehub::message::{Message, MessageType, Role};
use ridehub::state::AppState;
use ridehub::test_support::{test_manager, test_state, token, TestClient};
use ridehub::transport::build_router;

fn test_server(state: Arc<AppState>) -> anyhow::Result<TestServer> {
    Ok(TestServer::new(build_router(state))?)
}

fn with_token(path: &str, user_id: &str, role: Role) -> anyhow::Result<String> {
    let sep = if path.contains('?') { '&' } else { '?' };
    Ok(format!("{path}{sep}token={}", token(user_id, role)?))
}

/// Register a hub-side connection directly (bypasses the WebSocket upgrade).
async fn connect(manager: &Manager, user_id: &str, role: Role) -> anyhow::Result<TestClient> {
    let identity = Identity { user_id: user_id.to_owned(), role };
    let (conn, rx) = manager.new_connection(identity, String::new());
    anyhow::ensure!(manager.hub().register(Arc::clone(&conn)).await, "hub not running");
    let mut client = TestClient { conn, rx };
    client.recv_kind(MessageType::CONNECTION_ACK).await?;
    Ok(client)
}

#[tokio::test]
async fn health_needs_no_token() -> anyhow::Result<()> {
    let manager = test_manager(HubConfig::test());
    let _alice = connect(&manager, "alice", Role::Rider).await?;
    let _alice2 = connect(&manager, "alice", Role::Rider).await?;

    let server = test_server(test_state(Arc::clone(&manager)))?;
    let resp = server.get("/ws/health").await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["connected_users"], 1);
    assert_eq!(body["total_connections"], 2);
    assert!(body["timestamp"].is_string());
    manager.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn missing_or_forged_token_is_unauthorized() -> anyhow::Result<()> {
    let manager = test_manager(HubConfig::test());
    let server = test_server(test_state(Arc::clone(&manager)))?;

    let resp = server.post("/ws/presence").json(&json!({ "userIds": [] })).await;
    resp.assert_status(StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let forged = ridehub::transport::auth::HmacAuthenticator::new(b"other-secret")
        .issue("alice", &Role::Admin, None)?;
    let resp = server.get(&format!("/ws/stats?token={forged}")).await;
    resp.assert_status(StatusCode::UNAUTHORIZED);
    manager.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn stats_require_admin() -> anyhow::Result<()> {
    let manager = test_manager(HubConfig::test());
    let _driver = connect(&manager, "d1", Role::Driver).await?;
    let server = test_server(test_state(Arc::clone(&manager)))?;

    let resp = server.get(&with_token("/ws/stats", "r1", Role::Rider)?).await;
    resp.assert_status(StatusCode::FORBIDDEN);

    let resp = server.get(&with_token("/ws/stats", "ops", Role::Admin)?).await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["connected_users"], 1);
    assert_eq!(body["connected_drivers"], 1);
    assert_eq!(body["users"]["d1"], 1);
    assert!(body["handlers"].as_array().is_some_and(|h| !h.is_empty()));
    manager.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn presence_reports_online_and_device_counts() -> anyhow::Result<()> {
    let manager = test_manager(HubConfig::test());
    let _a = connect(&manager, "alice", Role::Rider).await?;
    let _b = connect(&manager, "alice", Role::Rider).await?;
    let server = test_server(test_state(Arc::clone(&manager)))?;

    let resp = server
        .post(&with_token("/ws/presence", "bob", Role::Rider)?)
        .json(&json!({ "userIds": ["alice", "carol"] }))
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["presence"]["alice"], json!({ "online": true, "connectionCount": 2 }));
    assert_eq!(body["presence"]["carol"], json!({ "online": false, "connectionCount": 0 }));
    manager.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn send_delivers_to_online_user() -> anyhow::Result<()> {
    let manager = test_manager(HubConfig::test());
    let mut alice = connect(&manager, "alice", Role::Rider).await?;
    let server = test_server(test_state(Arc::clone(&manager)))?;

    let resp = server
        .post(&with_token("/ws/send", "backend", Role::Admin)?)
        .json(&json!({
            "userId": "alice",
            "type": "ride_driver_arriving",
            "data": { "etaMinutes": 3 },
            "requireAck": true
        }))
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body, json!({ "success": true, "message": "message sent", "online": true }));

    let msg = alice.recv_kind(MessageType::RIDE_DRIVER_ARRIVING).await?;
    assert_eq!(msg.data["etaMinutes"], 3);
    assert!(msg.require_ack && msg.message_id.is_some());
    manager.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn send_to_offline_user_is_stored_for_later() -> anyhow::Result<()> {
    let manager = test_manager(HubConfig::test());
    let server = test_server(test_state(Arc::clone(&manager)))?;

    let resp = server
        .post(&with_token("/ws/send", "backend", Role::Admin)?)
        .json(&json!({
            "userId": "alice",
            "type": "ride_cancelled",
            "data": { "reason": "no drivers" }
        }))
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body, json!({ "success": false, "message": "user offline", "online": false }));

    let mut alice = connect(&manager, "alice", Role::Rider).await?;
    manager.deliver_offline(&alice.conn).await;
    let msg = alice.recv_kind(MessageType::RIDE_CANCELLED).await?;
    assert_eq!(msg.str_field("reason"), Some("no drivers"));
    manager.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn send_rejects_missing_fields() -> anyhow::Result<()> {
    let manager = test_manager(HubConfig::test());
    let server = test_server(test_state(Arc::clone(&manager)))?;

    let resp = server
        .post(&with_token("/ws/send", "backend", Role::Admin)?)
        .json(&json!({ "userId": "", "type": "chat_message" }))
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
    manager.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn broadcast_requires_admin_and_honors_role() -> anyhow::Result<()> {
    let manager = test_manager(HubConfig::test());
    let mut driver = connect(&manager, "d1", Role::Driver).await?;
    let mut rider = connect(&manager, "r1", Role::Rider).await?;
    let server = test_server(test_state(Arc::clone(&manager)))?;

    let request = json!({ "type": "sos_alert", "data": { "rideId": "ride-3" }, "role": "driver" });
    let resp = server.post(&with_token("/ws/broadcast", "r1", Role::Rider)?).json(&request).await;
    resp.assert_status(StatusCode::FORBIDDEN);

    let resp = server.post(&with_token("/ws/broadcast", "ops", Role::Admin)?).json(&request).await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["success"], true);

    let alert = driver.recv_kind(MessageType::SOS_ALERT).await?;
    assert_eq!(alert.str_field("rideId"), Some("ride-3"));
    let leaked = rider.collect_kind(MessageType::SOS_ALERT, Duration::from_millis(100)).await;
    assert!(leaked.is_empty());

    let everyone = json!({ "type": "system", "data": { "message": "maintenance" } });
    let resp = server.post(&with_token("/ws/broadcast", "ops", Role::Admin)?).json(&everyone).await;
    resp.assert_status_ok();
    rider.recv_kind(MessageType::SYSTEM).await?;
    driver.recv_kind(MessageType::SYSTEM).await?;
    manager.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn messages_sent_through_hub_match_http_shape() -> anyhow::Result<()> {
    // The REST send path and direct hub sends produce the same envelope.
    let manager = test_manager(HubConfig::test());
    let mut alice = connect(&manager, "alice", Role::Rider).await?;

    let direct = Message::with_json(MessageType::RATING_PROMPT, json!({ "rideId": "r1" }));
    manager.hub().send_to_user("alice", direct).await;
    let msg = alice.recv_kind(MessageType::RATING_PROMPT).await?;
    let wire = serde_json::to_value(&msg)?;
    assert_eq!(wire["type"], "rating_prompt");
    assert_eq!(wire["targetUserId"], "alice");
    assert!(wire.get("requireAck").is_none());
    manager.shutdown(Duration::from_secs(1)).await;
    Ok(())
}
