//! Broker-facing message record.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::id::MessageId;

/// Message content plus metadata, serialized into the envelope payload and
/// published to the broker as-is.
///
/// Wire format: JSON object with `id`, `content`, `partition_key` and
/// `timestamp` (RFC 3339).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: MessageId,
    pub content: String,
    /// Routing hint, called "region" by older producers.
    #[serde(alias = "region")]
    pub partition_key: String,
    pub timestamp: DateTime<Utc>,
}

impl OutboxMessage {
    /// Build a message with a fresh id, timestamped now (millisecond precision).
    pub fn new(content: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            content: content.into(),
            partition_key: partition_key.into(),
            timestamp: Utc::now().trunc_subsecs(3),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
