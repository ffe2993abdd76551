// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use clap::Parser;

use crate::connection::ConnectionSettings;

/// Configuration for the ridehub server.
#[derive(Debug, Clone, Parser)]
#[command(name = "ridehub", version, about = "Real-time messaging hub for ride-hailing clients.")]
pub struct HubConfig {
    /// Host to bind on.
    #[arg(long, default_value = "0.0.0.0", env = "RIDEHUB_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080, env = "RIDEHUB_PORT")]
    pub port: u16,

    /// HMAC secret used to verify client tokens.
    #[arg(long, env = "RIDEHUB_AUTH_SECRET", hide_env_values = true)]
    pub auth_secret: Option<String>,

    /// Identifier of this hub instance on the bus. Random when unset.
    #[arg(long, env = "RIDEHUB_NODE_ID")]
    pub node_id: Option<String>,

    /// NATS server URL. Without it the hub runs single-node with in-memory stores.
    #[arg(long, env = "RIDEHUB_NATS_URL")]
    pub nats_url: Option<String>,

    /// NATS auth token.
    #[arg(long, env = "RIDEHUB_NATS_TOKEN", hide_env_values = true)]
    pub nats_token: Option<String>,

    /// Bus subject carrying cross-node deliveries.
    #[arg(long, default_value = "websocket:broadcast", env = "RIDEHUB_BUS_CHANNEL")]
    pub bus_channel: String,

    /// Prefix for key-value buckets.
    #[arg(long, default_value = "ridehub", env = "RIDEHUB_KV_PREFIX")]
    pub kv_prefix: String,

    /// Maximum concurrent connections on this node.
    #[arg(long, default_value_t = 10_000, env = "RIDEHUB_MAX_CONNECTIONS")]
    pub max_connections: usize,

    /// Per-connection outbound queue capacity.
    #[arg(long, default_value_t = 256, env = "RIDEHUB_MESSAGE_BUFFER_SIZE")]
    pub message_buffer_size: usize,

    /// Maximum inbound frame size in bytes.
    #[arg(long, default_value_t = 512 * 1024, env = "RIDEHUB_MAX_MESSAGE_SIZE")]
    pub max_message_size: usize,

    /// Record presence in the presence store.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "RIDEHUB_ENABLE_PRESENCE")]
    pub enable_presence: bool,

    /// Record delivered messages for offline replay.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "RIDEHUB_ENABLE_MESSAGE_STORE")]
    pub enable_message_store: bool,

    /// Store undelivered notifications for later delivery.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "RIDEHUB_PERSISTENCE_ENABLED")]
    pub persistence_enabled: bool,

    /// Maximum notifications kept per user.
    #[arg(long, default_value_t = 1000, env = "RIDEHUB_NOTIFICATION_CAP")]
    pub notification_cap: usize,

    /// Days an undelivered notification is kept.
    #[arg(long, default_value_t = 30, env = "RIDEHUB_NOTIFICATION_RETENTION_DAYS")]
    pub notification_retention_days: u64,

    /// Days a stored message is kept.
    #[arg(long, default_value_t = 7, env = "RIDEHUB_MESSAGE_RETENTION_DAYS")]
    pub message_retention_days: u64,

    /// Delivery attempts after the first before an unacked message is dropped.
    #[arg(long, default_value_t = 3, env = "RIDEHUB_MAX_ACK_RETRIES")]
    pub max_ack_retries: u32,

    /// Idle time before a connection is considered dead.
    #[arg(long, default_value_t = 60_000, env = "RIDEHUB_PONG_WAIT_MS")]
    pub pong_wait_ms: u64,

    /// Deadline for a single frame write.
    #[arg(long, default_value_t = 10_000, env = "RIDEHUB_WRITE_WAIT_MS")]
    pub write_wait_ms: u64,

    /// Time to wait for a client ack before redelivering.
    #[arg(long, default_value_t = 10_000, env = "RIDEHUB_ACK_TIMEOUT_MS")]
    pub ack_timeout_ms: u64,

    /// Heartbeat monitor interval.
    #[arg(long, default_value_t = 30_000, env = "RIDEHUB_HEARTBEAT_INTERVAL_MS")]
    pub heartbeat_interval_ms: u64,

    /// Stats logging interval.
    #[arg(long, default_value_t = 10_000, env = "RIDEHUB_METRICS_INTERVAL_MS")]
    pub metrics_interval_ms: u64,

    /// Interval between sweeps of expired stored messages.
    #[arg(long, default_value_t = 3_600_000, env = "RIDEHUB_RETENTION_SWEEP_MS")]
    pub retention_sweep_ms: u64,

    /// Presence record time-to-live.
    #[arg(long, default_value_t = 300_000, env = "RIDEHUB_PRESENCE_TTL_MS")]
    pub presence_ttl_ms: u64,

    /// Bound on waiting for background tasks at shutdown.
    #[arg(long, default_value_t = 10_000, env = "RIDEHUB_SHUTDOWN_TIMEOUT_MS")]
    pub shutdown_timeout_ms: u64,

    /// Log format (json or text).
    #[arg(long, default_value = "json", env = "RIDEHUB_LOG_FORMAT")]
    pub log_format: String,

    /// Log level filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info", env = "RIDEHUB_LOG_LEVEL")]
    pub log_level: String,
}

impl HubConfig {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.auth_secret.as_deref().is_none_or(str::is_empty) {
            anyhow::bail!("--auth-secret must be specified");
        }
        if self.message_buffer_size == 0 {
            anyhow::bail!("--message-buffer-size must be greater than zero");
        }
        if self.max_connections == 0 {
            anyhow::bail!("--max-connections must be greater than zero");
        }
        if self.max_ack_retries > 10 {
            anyhow::bail!("--max-ack-retries must be at most 10");
        }
        if self.pong_wait_ms < 10 {
            anyhow::bail!("--pong-wait-ms must be at least 10");
        }
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid --log-format: {other} (expected json or text)"),
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    /// Keepalive ping period, always shorter than the idle deadline.
    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms * 9 / 10)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn retention_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.retention_sweep_ms)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_millis(self.presence_ttl_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn notification_retention(&self) -> Duration {
        Duration::from_secs(self.notification_retention_days * 24 * 60 * 60)
    }

    pub fn message_retention(&self) -> Duration {
        Duration::from_secs(self.message_retention_days * 24 * 60 * 60)
    }

    /// Timing knobs handed to every new connection.
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            buffer_size: self.message_buffer_size,
            pong_wait: self.pong_wait(),
            ping_period: self.ping_period(),
            write_wait: self.write_wait(),
            ack_timeout: self.ack_timeout(),
            max_ack_retries: self.max_ack_retries,
        }
    }

    /// Build a config with short timeouts for tests.
    pub fn test() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            auth_secret: Some("test-secret".into()),
            node_id: None,
            nats_url: None,
            nats_token: None,
            bus_channel: "websocket:broadcast".into(),
            kv_prefix: "ridehub-test".into(),
            max_connections: 1000,
            message_buffer_size: 64,
            max_message_size: 512 * 1024,
            enable_presence: true,
            enable_message_store: true,
            persistence_enabled: true,
            notification_cap: 1000,
            notification_retention_days: 30,
            message_retention_days: 7,
            max_ack_retries: 3,
            pong_wait_ms: 2_000,
            write_wait_ms: 500,
            ack_timeout_ms: 50,
            heartbeat_interval_ms: 100,
            metrics_interval_ms: 100,
            retention_sweep_ms: 100,
            presence_ttl_ms: 300_000,
            shutdown_timeout_ms: 1_000,
            log_format: "text".into(),
            log_level: "debug".into(),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
