// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stores backed by NATS JetStream key-value buckets, shared by every hub
//! node attached to the same NATS cluster.
//!
//! Each user's state lives under one key holding a JSON document. Writes
//! are compare-and-set on the entry revision so concurrent nodes do not
//! clobber each other. Bucket `max_age` provides expiry: the presence
//! bucket's age is the presence TTL, so a record that is not rewritten
//! disappears on its own.

use std::time::Duration;

use async_nats::jetstream::{self, kv};
use bytes::Bytes;
use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::memory::StoreLimits;
use super::{
    cutoff, MessageStore, NotificationStore, PresenceDevice, PresenceStore, StoredMessage,
    StoredNotification,
};
use crate::message::Message;

/// Retries for a compare-and-set write before giving up.
const CAS_ATTEMPTS: usize = 8;

#[derive(Debug, Default, Serialize, Deserialize)]
struct PresenceRecord {
    devices: Vec<PresenceDevice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageEntry {
    #[serde(flatten)]
    stored: StoredMessage,
    #[serde(default)]
    delivered: bool,
}

pub struct KvStore {
    limits: StoreLimits,
    presence: kv::Store,
    notifications: kv::Store,
    messages: kv::Store,
}

impl KvStore {
    /// Open (or create) the three buckets under `prefix`.
    pub async fn open(
        client: async_nats::Client,
        prefix: &str,
        limits: StoreLimits,
    ) -> anyhow::Result<Self> {
        let js = jetstream::new(client);
        let presence = open_bucket(&js, format!("{prefix}-presence"), limits.presence_ttl).await?;
        let notifications =
            open_bucket(&js, format!("{prefix}-notifications"), limits.notification_retention)
                .await?;
        let messages =
            open_bucket(&js, format!("{prefix}-messages"), limits.message_retention).await?;
        Ok(Self { limits, presence, notifications, messages })
    }
}

async fn open_bucket(
    js: &jetstream::Context,
    name: String,
    max_age: Duration,
) -> anyhow::Result<kv::Store> {
    match js.get_key_value(name.clone()).await {
        Ok(store) => Ok(store),
        Err(e) => {
            debug!(bucket = %name, "creating kv bucket ({e})");
            let config = kv::Config { bucket: name, history: 1, max_age, ..Default::default() };
            Ok(js.create_key_value(config).await?)
        }
    }
}

/// Map a user id onto the key alphabet NATS accepts. Bytes outside
/// `[A-Za-z0-9_-]` are written as `=XX` so distinct ids stay distinct.
pub(crate) fn user_key(user_id: &str) -> String {
    let mut key = String::with_capacity(user_id.len() + 5);
    key.push_str("user.");
    for b in user_id.bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
            key.push(b as char);
        } else {
            key.push_str(&format!("={b:02X}"));
        }
    }
    key
}

async fn load<T>(bucket: &kv::Store, key: &str) -> anyhow::Result<Option<(T, u64)>>
where
    T: DeserializeOwned,
{
    match bucket.entry(key).await? {
        Some(entry) if entry.operation == kv::Operation::Put => {
            Ok(Some((serde_json::from_slice(&entry.value)?, entry.revision)))
        }
        _ => Ok(None),
    }
}

/// Read-modify-write a JSON document with optimistic concurrency.
async fn modify<T, R, F>(bucket: &kv::Store, key: &str, mut f: F) -> anyhow::Result<R>
where
    T: Serialize + DeserializeOwned + Default,
    F: FnMut(&mut T) -> R,
{
    for _ in 0..CAS_ATTEMPTS {
        let (mut doc, revision) = match load::<T>(bucket, key).await? {
            Some((doc, rev)) => (doc, Some(rev)),
            None => (T::default(), None),
        };
        let out = f(&mut doc);
        let bytes = Bytes::from(serde_json::to_vec(&doc)?);
        let written = match revision {
            Some(rev) => bucket.update(key, bytes, rev).await.is_ok(),
            None => bucket.create(key, bytes).await.is_ok(),
        };
        if written {
            return Ok(out);
        }
    }
    anyhow::bail!("concurrent update conflict on {key}")
}

impl PresenceStore for KvStore {
    fn set_device<'a>(
        &'a self,
        user_id: &'a str,
        device: PresenceDevice,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            modify(&self.presence, &user_key(user_id), |rec: &mut PresenceRecord| {
                rec.devices.retain(|d| d.device_id != device.device_id);
                rec.devices.push(device.clone());
            })
            .await
        })
    }

    fn remove_device<'a>(
        &'a self,
        user_id: &'a str,
        device_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<usize>> {
        Box::pin(async move {
            let key = user_key(user_id);
            let remaining = modify(&self.presence, &key, |rec: &mut PresenceRecord| {
                rec.devices.retain(|d| d.device_id != device_id);
                rec.devices.len()
            })
            .await?;
            if remaining == 0 {
                self.presence.delete(&key).await?;
            }
            Ok(remaining)
        })
    }

    fn clear<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.presence.delete(user_key(user_id)).await?;
            Ok(())
        })
    }

    fn refresh<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let key = user_key(user_id);
            // Rewriting the record restarts its age in the bucket.
            if let Some((rec, rev)) = load::<PresenceRecord>(&self.presence, &key).await? {
                let bytes = Bytes::from(serde_json::to_vec(&rec)?);
                if let Err(e) = self.presence.update(&key, bytes, rev).await {
                    debug!(user_id, "presence refresh raced with another write: {e}");
                }
            }
            Ok(())
        })
    }

    fn devices<'a>(
        &'a self,
        user_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Vec<PresenceDevice>>> {
        Box::pin(async move {
            Ok(load::<PresenceRecord>(&self.presence, &user_key(user_id))
                .await?
                .map(|(rec, _)| rec.devices)
                .unwrap_or_default())
        })
    }
}

impl NotificationStore for KvStore {
    fn push<'a>(&'a self, user_id: &'a str, payload: Value) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let id = payload
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let cap = self.limits.notification_cap;
            let notification = StoredNotification { id, stored_at: Utc::now(), payload };
            modify(&self.notifications, &user_key(user_id), |list: &mut Vec<StoredNotification>| {
                list.insert(0, notification.clone());
                list.truncate(cap);
            })
            .await
        })
    }

    fn pending<'a>(
        &'a self,
        user_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Vec<StoredNotification>>> {
        Box::pin(async move {
            let oldest = cutoff(self.limits.notification_retention);
            let list = load::<Vec<StoredNotification>>(&self.notifications, &user_key(user_id))
                .await?
                .map(|(list, _)| list)
                .unwrap_or_default();
            Ok(list.into_iter().filter(|n| n.stored_at > oldest).collect())
        })
    }

    fn mark_read<'a>(
        &'a self,
        user_id: &'a str,
        ids: &'a [String],
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            modify(&self.notifications, &user_key(user_id), |list: &mut Vec<StoredNotification>| {
                list.retain(|n| !ids.contains(&n.id));
            })
            .await
        })
    }

    fn clear<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.notifications.delete(user_key(user_id)).await?;
            Ok(())
        })
    }
}

impl MessageStore for KvStore {
    fn store<'a>(
        &'a self,
        user_id: &'a str,
        mut message: Message,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            if message.message_id.is_none() {
                message.message_id = Some(uuid::Uuid::new_v4().to_string());
            }
            let stored = StoredMessage { stored_at: Utc::now(), message };
            let entry = MessageEntry { stored, delivered: false };
            modify(&self.messages, &user_key(user_id), |list: &mut Vec<MessageEntry>| {
                list.push(entry.clone());
            })
            .await
        })
    }

    fn pending<'a>(
        &'a self,
        user_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, anyhow::Result<Vec<Message>>> {
        Box::pin(async move {
            let list = load::<Vec<MessageEntry>>(&self.messages, &user_key(user_id))
                .await?
                .map(|(list, _)| list)
                .unwrap_or_default();
            Ok(list
                .into_iter()
                .filter(|e| !e.delivered)
                .take(limit)
                .map(|e| e.stored.message)
                .collect())
        })
    }

    fn mark_delivered<'a>(
        &'a self,
        user_id: &'a str,
        message_ids: &'a [String],
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            modify(&self.messages, &user_key(user_id), |list: &mut Vec<MessageEntry>| {
                for entry in list.iter_mut() {
                    let id = entry.stored.message.message_id.as_ref();
                    if id.is_some_and(|id| message_ids.contains(id)) {
                        entry.delivered = true;
                    }
                }
            })
            .await
        })
    }

    fn delete_old(&self, max_age: Duration) -> BoxFuture<'_, anyhow::Result<usize>> {
        Box::pin(async move {
            let oldest = cutoff(max_age);
            let mut keys = self.messages.keys().await?;
            let mut names = Vec::new();
            while let Some(key) = keys.next().await {
                names.push(key?);
            }

            let mut removed = 0;
            for key in names {
                let dropped = modify(&self.messages, &key, |list: &mut Vec<MessageEntry>| {
                    let before = list.len();
                    list.retain(|e| e.stored.stored_at > oldest);
                    before - list.len()
                })
                .await?;
                removed += dropped;
            }
            Ok(removed)
        })
    }
}
