//! The durable unit of the outbox.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::id::MessageId;
use crate::message::OutboxMessage;

/// One pending outgoing message plus its routing and identity metadata.
///
/// Every field is immutable once written. The store only inserts and deletes
/// envelopes, never rewrites them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: MessageId,
    pub partition_key: String,
    pub created_at: DateTime<Utc>,
    /// Serialized [`OutboxMessage`]; opaque to the store and the relay.
    pub payload: Vec<u8>,
}

/// Error returned when a payload cannot be encoded into or decoded from an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to encode message {id}: {source}")]
    Encode {
        id: MessageId,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode payload of {id}: {source}")]
    Decode {
        id: MessageId,
        #[source]
        source: serde_json::Error,
    },
}

impl Envelope {
    /// Wrap a message, serializing it into the payload.
    pub fn seal(message: &OutboxMessage) -> Result<Self, EnvelopeError> {
        let payload = message.to_bytes().map_err(|source| EnvelopeError::Encode {
            id: message.id,
            source,
        })?;
        Ok(Self {
            id: message.id,
            partition_key: message.partition_key.clone(),
            created_at: message.timestamp,
            payload,
        })
    }

    /// Decode the payload back into the message it was sealed from.
    pub fn open(&self) -> Result<OutboxMessage, EnvelopeError> {
        OutboxMessage::from_bytes(&self.payload).map_err(|source| EnvelopeError::Decode {
            id: self.id,
            source,
        })
    }

    /// Broker message key (the id as a string).
    pub fn key(&self) -> String {
        self.id.to_string()
    }
}
