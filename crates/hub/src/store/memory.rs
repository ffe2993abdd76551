// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process stores used in single-node mode and tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use super::{
    cutoff, MessageStore, NotificationStore, PresenceDevice, PresenceStore, StoredMessage,
    StoredNotification,
};
use crate::config::HubConfig;
use crate::message::Message;

/// Retention limits shared by the in-memory and key-value stores.
#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    pub presence_ttl: Duration,
    pub notification_cap: usize,
    pub notification_retention: Duration,
    pub message_retention: Duration,
}

impl StoreLimits {
    pub fn from_config(config: &HubConfig) -> Self {
        Self {
            presence_ttl: config.presence_ttl(),
            notification_cap: config.notification_cap,
            notification_retention: config.notification_retention(),
            message_retention: config.message_retention(),
        }
    }
}

struct PresenceEntry {
    devices: IndexMap<String, PresenceDevice>,
    expires_at: Instant,
}

struct MessageEntry {
    stored: StoredMessage,
    delivered: bool,
}

pub struct MemoryStore {
    limits: StoreLimits,
    presence: Mutex<HashMap<String, PresenceEntry>>,
    notifications: Mutex<HashMap<String, VecDeque<StoredNotification>>>,
    messages: Mutex<HashMap<String, Vec<MessageEntry>>>,
}

impl MemoryStore {
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            limits,
            presence: Mutex::new(HashMap::new()),
            notifications: Mutex::new(HashMap::new()),
            messages: Mutex::new(HashMap::new()),
        }
    }

    fn live_presence<'m>(
        map: &'m mut HashMap<String, PresenceEntry>,
        user_id: &str,
    ) -> Option<&'m mut PresenceEntry> {
        let expired = map.get(user_id).is_some_and(|e| e.expires_at <= Instant::now());
        if expired {
            map.remove(user_id);
        }
        map.get_mut(user_id)
    }
}

impl PresenceStore for MemoryStore {
    fn set_device<'a>(
        &'a self,
        user_id: &'a str,
        device: PresenceDevice,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let expires_at = Instant::now() + self.limits.presence_ttl;
            let mut map = self.presence.lock();
            match Self::live_presence(&mut map, user_id) {
                Some(entry) => {
                    entry.devices.insert(device.device_id.clone(), device);
                    entry.expires_at = expires_at;
                }
                None => {
                    let mut devices = IndexMap::new();
                    devices.insert(device.device_id.clone(), device);
                    map.insert(user_id.to_owned(), PresenceEntry { devices, expires_at });
                }
            }
            Ok(())
        })
    }

    fn remove_device<'a>(
        &'a self,
        user_id: &'a str,
        device_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<usize>> {
        Box::pin(async move {
            let mut map = self.presence.lock();
            let Some(entry) = Self::live_presence(&mut map, user_id) else {
                return Ok(0);
            };
            entry.devices.shift_remove(device_id);
            let remaining = entry.devices.len();
            if remaining == 0 {
                map.remove(user_id);
            }
            Ok(remaining)
        })
    }

    fn clear<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.presence.lock().remove(user_id);
            Ok(())
        })
    }

    fn refresh<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let mut map = self.presence.lock();
            if let Some(entry) = Self::live_presence(&mut map, user_id) {
                entry.expires_at = Instant::now() + self.limits.presence_ttl;
            }
            Ok(())
        })
    }

    fn devices<'a>(
        &'a self,
        user_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Vec<PresenceDevice>>> {
        Box::pin(async move {
            let mut map = self.presence.lock();
            Ok(Self::live_presence(&mut map, user_id)
                .map(|e| e.devices.values().cloned().collect())
                .unwrap_or_default())
        })
    }
}

impl NotificationStore for MemoryStore {
    fn push<'a>(&'a self, user_id: &'a str, payload: Value) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let id = payload
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let mut map = self.notifications.lock();
            let list = map.entry(user_id.to_owned()).or_default();
            list.push_front(StoredNotification { id, stored_at: Utc::now(), payload });
            list.truncate(self.limits.notification_cap);
            Ok(())
        })
    }

    fn pending<'a>(
        &'a self,
        user_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Vec<StoredNotification>>> {
        Box::pin(async move {
            let oldest = cutoff(self.limits.notification_retention);
            let mut map = self.notifications.lock();
            let Some(list) = map.get_mut(user_id) else {
                return Ok(Vec::new());
            };
            list.retain(|n| n.stored_at > oldest);
            Ok(list.iter().cloned().collect())
        })
    }

    fn mark_read<'a>(
        &'a self,
        user_id: &'a str,
        ids: &'a [String],
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            if let Some(list) = self.notifications.lock().get_mut(user_id) {
                list.retain(|n| !ids.contains(&n.id));
            }
            Ok(())
        })
    }

    fn clear<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.notifications.lock().remove(user_id);
            Ok(())
        })
    }
}

impl MessageStore for MemoryStore {
    fn store<'a>(
        &'a self,
        user_id: &'a str,
        mut message: Message,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            if message.message_id.is_none() {
                message.message_id = Some(uuid::Uuid::new_v4().to_string());
            }
            let entry = MessageEntry {
                stored: StoredMessage { stored_at: Utc::now(), message },
                delivered: false,
            };
            self.messages.lock().entry(user_id.to_owned()).or_default().push(entry);
            Ok(())
        })
    }

    fn pending<'a>(
        &'a self,
        user_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, anyhow::Result<Vec<Message>>> {
        Box::pin(async move {
            let map = self.messages.lock();
            Ok(map
                .get(user_id)
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|e| !e.delivered)
                        .take(limit)
                        .map(|e| e.stored.message.clone())
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn mark_delivered<'a>(
        &'a self,
        user_id: &'a str,
        message_ids: &'a [String],
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            if let Some(entries) = self.messages.lock().get_mut(user_id) {
                for entry in entries.iter_mut() {
                    let id = entry.stored.message.message_id.as_ref();
                    if id.is_some_and(|id| message_ids.contains(id)) {
                        entry.delivered = true;
                    }
                }
            }
            Ok(())
        })
    }

    fn delete_old(&self, max_age: Duration) -> BoxFuture<'_, anyhow::Result<usize>> {
        Box::pin(async move {
            let oldest = cutoff(max_age);
            let mut removed = 0;
            let mut map = self.messages.lock();
            map.retain(|_, entries| {
                let before = entries.len();
                entries.retain(|e| e.stored.stored_at > oldest);
                removed += before - entries.len();
                !entries.is_empty()
            });
            Ok(removed)
        })
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
