// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire envelope shared by clients, the hub, and the cross-node bus.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Open message-type tag. Known kinds are associated constants; any other
/// string is accepted and routed to a registered handler (or rejected).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageType(String);

impl MessageType {
    // Connection lifecycle
    pub const CONNECTION_ACK: &'static str = "connection_ack";
    pub const PING: &'static str = "ping";
    pub const PONG: &'static str = "pong";
    pub const ERROR: &'static str = "error";
    pub const ACK: &'static str = "ack";
    pub const SYSTEM: &'static str = "system";

    // Presence
    pub const USER_ONLINE: &'static str = "user_online";
    pub const USER_OFFLINE: &'static str = "user_offline";
    pub const PRESENCE: &'static str = "presence";
    pub const TYPING: &'static str = "typing";
    pub const READ_RECEIPT: &'static str = "read_receipt";

    // Notifications
    pub const NOTIFICATION: &'static str = "notification";
    pub const NOTIFICATION_READ: &'static str = "notification_read";
    pub const NOTIFICATION_BULK: &'static str = "notification_bulk";

    // Chat
    pub const CHAT_MESSAGE: &'static str = "chat_message";
    pub const CHAT_MESSAGE_SENT: &'static str = "chat_message_sent";
    pub const CHAT_EDIT: &'static str = "chat_edit";
    pub const CHAT_DELETE: &'static str = "chat_delete";

    // Rides
    pub const RIDE_REQUEST: &'static str = "ride_request";
    pub const RIDE_REQUEST_ACCEPTED: &'static str = "ride_request_accepted";
    pub const RIDE_REQUEST_REJECTED: &'static str = "ride_request_rejected";
    pub const RIDE_STATUS_UPDATE: &'static str = "ride_status_update";
    pub const RIDE_DRIVER_ARRIVING: &'static str = "ride_driver_arriving";
    pub const RIDE_DRIVER_ARRIVED: &'static str = "ride_driver_arrived";
    pub const RIDE_STARTED: &'static str = "ride_started";
    pub const RIDE_COMPLETED: &'static str = "ride_completed";
    pub const RIDE_CANCELLED: &'static str = "ride_cancelled";
    pub const RATING_PROMPT: &'static str = "rating_prompt";
    pub const DRIVER_LOCATION_UPDATE: &'static str = "driver_location_update";

    // Safety
    pub const SOS_ALERT: &'static str = "sos_alert";
    pub const SOS_RESOLVED: &'static str = "sos_resolved";
    pub const SOS_ESCALATED: &'static str = "sos_escalated";

    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is(&self, kind: &str) -> bool {
        self.0 == kind
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageType {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl PartialEq<str> for MessageType {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for MessageType {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Role attached to a connection at authentication time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Driver,
    Rider,
    Admin,
    /// No role claim was present.
    Unclassified,
    /// Any role string the hub does not know about.
    Other(String),
}

impl Role {
    pub fn parse(s: &str) -> Self {
        match s {
            "driver" => Self::Driver,
            "rider" => Self::Rider,
            "admin" => Self::Admin,
            "" => Self::Unclassified,
            other => Self::Other(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Driver => "driver",
            Self::Rider => "rider",
            Self::Admin => "admin",
            Self::Unclassified => "",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Role {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

/// The envelope exchanged over every WebSocket connection and the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub data: Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub require_ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Internal delivery-attempt counter; never on the wire.
    #[serde(skip)]
    pub retry_count: u32,
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn null_as_empty<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Map<String, Value>, D::Error> {
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Message {
    /// Build a message stamped with the current time.
    pub fn new(kind: impl Into<MessageType>, data: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            target_user_id: None,
            data,
            timestamp: Utc::now(),
            request_id: None,
            require_ack: false,
            message_id: None,
            retry_count: 0,
        }
    }

    /// Build a message from a `serde_json::json!` object. Non-object values
    /// become an empty payload.
    pub fn with_json(kind: impl Into<MessageType>, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(kind, data)
    }

    pub fn to(mut self, user_id: impl Into<String>) -> Self {
        self.target_user_id = Some(user_id.into());
        self
    }

    pub fn reply_to(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    /// Mark the message as requiring a client ack, assigning an id if absent.
    pub fn acked(mut self) -> Self {
        self.require_ack = true;
        if self.message_id.is_none() {
            self.message_id = Some(uuid::Uuid::new_v4().to_string());
        }
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.target_user_id.as_deref().is_none_or(str::is_empty)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn f64_field(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(Value::as_f64)
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(Value::as_bool)
    }

    /// String entries of an array field; non-string entries are skipped.
    pub fn str_list(&self, key: &str) -> Option<Vec<String>> {
        let items = self.data.get(key)?.as_array()?;
        Some(items.iter().filter_map(Value::as_str).map(str::to_owned).collect())
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
