use std::time::Duration;

use chrono::{DateTime, Utc};

use courier_domain::envelope::Envelope;

// ── Constants ────────────────────────────────────────────────────────────────

/// Default backlog ceiling of the durable channel.
pub const DEFAULT_CAPACITY: u64 = 1000;

/// Default re-check period while a poll waits for an available envelope.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Name of the lock that serializes draining across relay instances.
pub const RELAY_LOCK_NAME: &str = "outbox-relay";

/// Partition key given to messages created without one.
pub const DEFAULT_PARTITION_KEY: &str = "default";

pub const DEFAULT_PENDING_LIMIT: u64 = 100;
pub const MAX_PENDING_LIMIT: u64 = 1000;

// ── Pending query ────────────────────────────────────────────────────────────

/// Read-only filter over pending envelopes.
///
/// `created_after` is exclusive, `created_before` inclusive. Results are
/// ordered by `created_at`, then `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFilter {
    pub partition_key: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: u64,
}

impl Default for PendingFilter {
    fn default() -> Self {
        Self {
            partition_key: None,
            created_after: None,
            created_before: None,
            limit: DEFAULT_PENDING_LIMIT,
        }
    }
}

impl PendingFilter {
    /// Clamp `limit` into `1..=MAX_PENDING_LIMIT`.
    pub fn clamped(mut self) -> Self {
        self.limit = self.limit.clamp(1, MAX_PENDING_LIMIT);
        self
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        let key_ok = self
            .partition_key
            .as_ref()
            .is_none_or(|key| &envelope.partition_key == key);
        let after_ok = self
            .created_after
            .is_none_or(|after| envelope.created_at > after);
        let before_ok = self
            .created_before
            .is_none_or(|before| envelope.created_at <= before);
        key_ok && after_ok && before_ok
    }
}

// ── Lock ─────────────────────────────────────────────────────────────────────

/// Proof of lock ownership. The token distinguishes this owner from any later
/// holder of the same name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub name: String,
    pub token: String,
}

// ── Consumer ─────────────────────────────────────────────────────────────────

/// One entry read from the broker topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned entry id, used for acknowledgement.
    pub entry_id: String,
    pub key: String,
    pub payload: Vec<u8>,
}

/// What the consumer loop should do with a delivery after handling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Leave unacknowledged so the broker redelivers it.
    Retry,
}

/// Result of trying to take a message id for processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingClaim {
    /// This consumer holds the processing lease and must run the handler.
    Acquired,
    /// Another delivery of the same id is being handled right now.
    InFlight,
    AlreadyProcessed,
}
