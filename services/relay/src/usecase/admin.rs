use std::sync::Arc;

use courier_domain::envelope::Envelope;
use courier_domain::id::MessageId;

use crate::channel::DurableChannel;
use crate::domain::repository::OutboxStore;
use crate::domain::types::PendingFilter;
use crate::error::OutboxError;

// ── ListPending ──────────────────────────────────────────────────────────────

pub struct ListPendingUseCase<S: OutboxStore> {
    pub store: S,
}

impl<S: OutboxStore> ListPendingUseCase<S> {
    pub async fn execute(&self, filter: PendingFilter) -> Result<Vec<Envelope>, OutboxError> {
        self.store.find_pending(&filter.clamped()).await
    }
}

// ── GetMessage ───────────────────────────────────────────────────────────────

pub struct GetMessageUseCase<S: OutboxStore> {
    pub store: S,
}

impl<S: OutboxStore> GetMessageUseCase<S> {
    pub async fn execute(&self, id: MessageId) -> Result<Envelope, OutboxError> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or(OutboxError::NotFound)
    }
}

// ── DeleteMessage ────────────────────────────────────────────────────────────

/// Manually drop a pending message. Deleting an absent id succeeds.
pub struct DeleteMessageUseCase<S: OutboxStore> {
    pub store: S,
}

impl<S: OutboxStore> DeleteMessageUseCase<S> {
    pub async fn execute(&self, id: MessageId) -> Result<bool, OutboxError> {
        let deleted = self.store.delete_by_id(id).await?;
        if deleted {
            tracing::info!(message_id = %id, "pending message deleted");
        } else {
            tracing::debug!(message_id = %id, "delete of absent message ignored");
        }
        Ok(deleted)
    }
}

// ── Stats ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxStats {
    pub pending: u64,
    pub capacity: u64,
}

pub struct OutboxStatsUseCase<S: OutboxStore> {
    pub channel: Arc<DurableChannel<S>>,
}

impl<S: OutboxStore> OutboxStatsUseCase<S> {
    pub async fn execute(&self) -> Result<OutboxStats, OutboxError> {
        Ok(OutboxStats {
            pending: self.channel.pending().await?,
            capacity: self.channel.capacity(),
        })
    }
}
