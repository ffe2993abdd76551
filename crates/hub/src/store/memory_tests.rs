// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use super::{MemoryStore, StoreLimits};
use crate::message::{Message, Role};
use crate::store::{MessageStore, NotificationStore, PresenceDevice, PresenceStore};

fn limits() -> StoreLimits {
    StoreLimits {
        presence_ttl: Duration::from_secs(300),
        notification_cap: 1000,
        notification_retention: Duration::from_secs(3600),
        message_retention: Duration::from_secs(3600),
    }
}

fn device(id: &str) -> PresenceDevice {
    PresenceDevice {
        device_id: id.into(),
        role: Role::Rider,
        user_agent: "test".into(),
        connected_at: Utc::now(),
    }
}

#[tokio::test]
async fn presence_tracks_devices() -> anyhow::Result<()> {
    let store = MemoryStore::new(limits());
    store.set_device("u1", device("c1")).await?;
    store.set_device("u1", device("c2")).await?;
    assert!(store.is_online("u1").await?);
    assert_eq!(store.devices("u1").await?.len(), 2);

    assert_eq!(store.remove_device("u1", "c1").await?, 1);
    assert!(store.is_online("u1").await?);
    assert_eq!(store.remove_device("u1", "c2").await?, 0);
    assert!(!store.is_online("u1").await?);
    Ok(())
}

#[tokio::test]
async fn presence_expires_without_refresh() -> anyhow::Result<()> {
    let store =
        MemoryStore::new(StoreLimits { presence_ttl: Duration::from_millis(40), ..limits() });
    store.set_device("u1", device("c1")).await?;
    store.set_device("u2", device("c2")).await?;

    tokio::time::sleep(Duration::from_millis(25)).await;
    store.refresh("u2").await?;
    tokio::time::sleep(Duration::from_millis(25)).await;

    assert!(!store.is_online("u1").await?);
    assert!(store.is_online("u2").await?);
    Ok(())
}

#[tokio::test]
async fn clear_drops_all_devices() -> anyhow::Result<()> {
    let store = MemoryStore::new(limits());
    store.set_device("u1", device("c1")).await?;
    store.set_device("u1", device("c2")).await?;
    PresenceStore::clear(&store, "u1").await?;
    assert!(store.devices("u1").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn notifications_newest_first_and_capped() -> anyhow::Result<()> {
    let store = MemoryStore::new(StoreLimits { notification_cap: 3, ..limits() });
    for i in 0..5 {
        store.push("u1", json!({ "id": format!("n{i}"), "title": "ride" })).await?;
    }

    let pending = NotificationStore::pending(&store, "u1").await?;
    let ids: Vec<&str> = pending.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["n4", "n3", "n2"]);
    Ok(())
}

#[tokio::test]
async fn notifications_expire_after_retention() -> anyhow::Result<()> {
    let store =
        MemoryStore::new(StoreLimits { notification_retention: Duration::ZERO, ..limits() });
    store.push("u1", json!({ "title": "late" })).await?;
    assert!(NotificationStore::pending(&store, "u1").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn mark_read_removes_selected_notifications() -> anyhow::Result<()> {
    let store = MemoryStore::new(limits());
    store.push("u1", json!({ "id": "a" })).await?;
    store.push("u1", json!({ "id": "b" })).await?;
    store.push("u1", json!({})).await?;

    store.mark_read("u1", &["a".to_owned()]).await?;
    let pending = NotificationStore::pending(&store, "u1").await?;
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|n| n.id != "a"));

    NotificationStore::clear(&store, "u1").await?;
    assert!(NotificationStore::pending(&store, "u1").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn pending_messages_oldest_first_until_delivered() -> anyhow::Result<()> {
    let store = MemoryStore::new(limits());
    for i in 0..3 {
        let msg = Message::with_json("chat_message", json!({ "n": i }));
        store.store("u1", msg).await?;
    }

    let pending = MessageStore::pending(&store, "u1", 2).await?;
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].data["n"], 0);
    assert!(pending.iter().all(|m| m.message_id.is_some()));

    let ids: Vec<String> = pending.iter().filter_map(|m| m.message_id.clone()).collect();
    store.mark_delivered("u1", &ids).await?;

    let rest = MessageStore::pending(&store, "u1", 10).await?;
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].data["n"], 2);
    Ok(())
}

#[tokio::test]
async fn delete_old_respects_age() -> anyhow::Result<()> {
    let store = MemoryStore::new(limits());
    store.store("u1", Message::with_json("chat_message", json!({}))).await?;
    store.store("u2", Message::with_json("chat_message", json!({}))).await?;

    assert_eq!(store.delete_old(Duration::from_secs(3600)).await?, 0);
    assert_eq!(store.delete_old(Duration::ZERO).await?, 2);
    assert!(MessageStore::pending(&store, "u1", 10).await?.is_empty());
    Ok(())
}
