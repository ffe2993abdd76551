// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persistence seams: presence, undelivered notifications, and stored
//! messages. All operations are fallible; callers log and continue.

pub mod kv;
pub mod memory;

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{Message, Role};

/// One connected device in a user's presence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceDevice {
    pub device_id: String,
    pub role: Role,
    #[serde(default)]
    pub user_agent: String,
    pub connected_at: DateTime<Utc>,
}

/// Tracks which users are online across all hub nodes.
pub trait PresenceStore: Send + Sync + 'static {
    /// Add or replace a device and refresh the record's TTL.
    fn set_device<'a>(
        &'a self,
        user_id: &'a str,
        device: PresenceDevice,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Remove one device; returns how many devices remain.
    fn remove_device<'a>(
        &'a self,
        user_id: &'a str,
        device_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<usize>>;

    /// Drop the user's record entirely.
    fn clear<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Extend the record's TTL without changing devices.
    fn refresh<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;

    fn devices<'a>(&'a self, user_id: &'a str)
        -> BoxFuture<'a, anyhow::Result<Vec<PresenceDevice>>>;

    fn is_online<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, anyhow::Result<bool>> {
        Box::pin(async move { Ok(!self.devices(user_id).await?.is_empty()) })
    }
}

/// Notification kept for a user until delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredNotification {
    pub id: String,
    pub stored_at: DateTime<Utc>,
    pub payload: Value,
}

/// Bounded newest-first list of undelivered notifications per user.
pub trait NotificationStore: Send + Sync + 'static {
    fn push<'a>(&'a self, user_id: &'a str, payload: Value) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Pending notifications, newest first.
    fn pending<'a>(
        &'a self,
        user_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Vec<StoredNotification>>>;

    /// Remove specific notifications by id.
    fn mark_read<'a>(
        &'a self,
        user_id: &'a str,
        ids: &'a [String],
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    fn clear<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Message kept for replay to a user who was offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub stored_at: DateTime<Utc>,
    pub message: Message,
}

pub trait MessageStore: Send + Sync + 'static {
    /// Store a message for the user. Assigns a message id when absent.
    fn store<'a>(&'a self, user_id: &'a str, message: Message) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Up to `limit` undelivered messages, oldest first.
    fn pending<'a>(
        &'a self,
        user_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, anyhow::Result<Vec<Message>>>;

    fn mark_delivered<'a>(
        &'a self,
        user_id: &'a str,
        message_ids: &'a [String],
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Delete messages stored longer ago than `max_age`; returns the count removed.
    fn delete_old(&self, max_age: Duration) -> BoxFuture<'_, anyhow::Result<usize>>;
}

/// Age cutoff as a wall-clock instant.
pub(crate) fn cutoff(max_age: Duration) -> DateTime<Utc> {
    let age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
    Utc::now().checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC)
}
