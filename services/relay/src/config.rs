use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use courier_core::config::Config;

use crate::domain::types::{DEFAULT_CAPACITY, DEFAULT_POLL_INTERVAL, RELAY_LOCK_NAME};
use crate::relay::RelaySettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackendKind {
    /// Redis lease lock, shared by every relay instance.
    Redis,
    /// In-process lock; only correct with a single relay instance.
    Local,
}

/// Relay service configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Redis connection URL (broker stream, lock, processed-id log).
    pub redis_url: String,
    /// TCP port to listen on. Env var: `RELAY_PORT`.
    #[serde(default = "default_port")]
    pub relay_port: u16,
    /// Broker stream name. Env var: `OUTBOX_TOPIC`.
    #[serde(default = "default_topic")]
    pub outbox_topic: String,
    #[serde(default = "default_capacity")]
    pub outbox_capacity: u64,
    #[serde(default = "default_tick_ms")]
    pub relay_tick_ms: u64,
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    /// Re-check period while the relay waits for an envelope.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    #[serde(default = "default_lock_backend")]
    pub lock_backend: LockBackendKind,
    #[serde(default = "default_lock_lease_ms")]
    pub lock_lease_ms: u64,
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold: u32,
    /// Approximate cap on the broker stream length. Unset keeps every entry.
    #[serde(default)]
    pub stream_max_len: Option<u64>,
    #[serde(default = "default_true")]
    pub consumer_enabled: bool,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Unique per process unless set; instances sharing a name would share
    /// one pending list.
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,
    #[serde(default = "default_consumer_block_ms")]
    pub consumer_block_ms: u64,
    /// Pending entries idle this long are taken over from whichever consumer
    /// holds them.
    #[serde(default = "default_consumer_claim_idle_ms")]
    pub consumer_claim_idle_ms: u64,
    /// Deliveries after which an entry moves to the dead-letter stream.
    #[serde(default = "default_consumer_max_deliveries")]
    pub consumer_max_deliveries: u64,
    /// Defaults to `<OUTBOX_TOPIC>.dead`.
    #[serde(default)]
    pub dead_letter_topic: Option<String>,
    /// How long one consumer may hold a message id while handling it.
    #[serde(default = "default_processing_lease_ms")]
    pub processing_lease_ms: u64,
    /// Retention of processed message ids, in seconds (7 days).
    #[serde(default = "default_processed_ttl_secs")]
    pub processed_ttl_secs: u64,
}

fn default_port() -> u16 {
    3120
}

fn default_topic() -> String {
    "message-outbox".to_owned()
}

fn default_capacity() -> u64 {
    DEFAULT_CAPACITY
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_receive_timeout_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_publish_timeout_ms() -> u64 {
    5000
}

fn default_lock_backend() -> LockBackendKind {
    LockBackendKind::Redis
}

fn default_lock_lease_ms() -> u64 {
    30_000
}

fn default_stuck_threshold() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_consumer_group() -> String {
    "courier-consumers".to_owned()
}

fn default_consumer_name() -> String {
    format!("courier-relay-{}", Uuid::new_v4().simple())
}

fn default_consumer_block_ms() -> u64 {
    2000
}

fn default_consumer_claim_idle_ms() -> u64 {
    30_000
}

fn default_consumer_max_deliveries() -> u64 {
    10
}

fn default_processing_lease_ms() -> u64 {
    60_000
}

/// One year.
const MAX_PROCESSED_TTL_SECS: u64 = 365 * 24 * 60 * 60;

fn default_processed_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

impl Config for RelayConfig {}

/// Upper bound for every configured duration (one day). Larger values would
/// overflow deadline arithmetic.
const MAX_DURATION_MS: u64 = 24 * 60 * 60 * 1000;

fn bounded_millis(ms: u64) -> Duration {
    Duration::from_millis(ms.min(MAX_DURATION_MS))
}

impl RelayConfig {
    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            tick_interval: bounded_millis(self.relay_tick_ms.max(1)),
            receive_timeout: bounded_millis(self.receive_timeout_ms),
            publish_timeout: bounded_millis(self.publish_timeout_ms),
            lock_name: RELAY_LOCK_NAME.to_owned(),
            stuck_threshold: self.stuck_threshold,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        bounded_millis(self.poll_interval_ms.max(1))
    }

    pub fn lock_lease(&self) -> Duration {
        bounded_millis(self.lock_lease_ms.max(1))
    }

    pub fn consumer_block(&self) -> Duration {
        bounded_millis(self.consumer_block_ms)
    }

    pub fn consumer_claim_idle(&self) -> Duration {
        bounded_millis(self.consumer_claim_idle_ms)
    }

    pub fn processing_lease(&self) -> Duration {
        bounded_millis(self.processing_lease_ms.max(1))
    }

    pub fn dead_letter_stream(&self) -> String {
        self.dead_letter_topic
            .clone()
            .unwrap_or_else(|| format!("{}.dead", self.outbox_topic))
    }

    pub fn processed_ttl(&self) -> Duration {
        Duration::from_secs(self.processed_ttl_secs.min(MAX_PROCESSED_TTL_SECS))
    }
}
