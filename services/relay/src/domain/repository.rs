#![allow(async_fn_in_trait)]

use courier_domain::envelope::Envelope;
use courier_domain::id::MessageId;
use courier_domain::message::OutboxMessage;

use crate::domain::publish::PublishHandle;
use crate::domain::types::{LockHandle, PendingFilter, ProcessingClaim};
use crate::error::OutboxError;

/// Persistent backlog of pending envelopes.
pub trait OutboxStore: Send + Sync {
    type Claim: ClaimScope;

    /// Persist a new envelope. A duplicate id is a `Storage` error.
    async fn insert(&self, envelope: &Envelope) -> Result<(), OutboxError>;

    /// Returns `false` if nothing was deleted (already delivered or never stored).
    async fn delete_by_id(&self, id: MessageId) -> Result<bool, OutboxError>;

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Envelope>, OutboxError>;

    async fn find_pending(&self, filter: &PendingFilter) -> Result<Vec<Envelope>, OutboxError>;

    /// Number of pending envelopes, claimed ones included.
    async fn count_pending(&self) -> Result<u64, OutboxError>;

    /// Open the claim scope of one relay tick.
    async fn begin_claim(&self) -> Result<Self::Claim, OutboxError>;
}

/// Claims taken during one relay tick.
///
/// Dropping a scope without [`ClaimScope::commit`] rolls it back: deletes are
/// discarded and every claim is released.
pub trait ClaimScope: Send {
    /// Claim the oldest available envelope not already claimed in this scope.
    async fn claim_next(&mut self) -> Result<Option<Envelope>, OutboxError>;

    /// Delete a claimed envelope. Takes effect on commit.
    async fn delete(&mut self, id: MessageId) -> Result<bool, OutboxError>;

    /// Give a claim back. The envelope is available again no later than the
    /// end of the scope.
    async fn release(&mut self, id: MessageId) -> Result<(), OutboxError>;

    async fn commit(self) -> Result<(), OutboxError>;
}

/// Named mutual-exclusion leases.
pub trait LockRegistry: Send + Sync {
    /// `Ok(None)` when another owner holds an unexpired lease.
    async fn try_acquire(&self, name: &str) -> Result<Option<LockHandle>, OutboxError>;

    /// Renew the lease. `Ok(false)` when ownership was lost.
    async fn extend(&self, handle: &LockHandle) -> Result<bool, OutboxError>;

    /// No-op when the lease already passed to another owner.
    async fn release(&self, handle: LockHandle) -> Result<(), OutboxError>;
}

/// Sends serialized messages to the broker topic.
pub trait BrokerPublisher: Send + Sync {
    fn publish(&self, key: &str, payload: &[u8]) -> PublishHandle;
}

/// Business processing of a consumed message.
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &OutboxMessage) -> anyhow::Result<()>;
}

/// Record of message ids a consumer already processed, with short processing
/// leases so concurrent deliveries of one id run the handler once.
pub trait ProcessedLog: Send + Sync {
    async fn is_processed(&self, id: MessageId) -> Result<bool, OutboxError>;

    /// Atomically check the record and take the processing lease for `id`.
    async fn try_claim(&self, id: MessageId) -> Result<ProcessingClaim, OutboxError>;

    /// Record `id` as processed and drop the lease.
    async fn mark_processed(&self, id: MessageId) -> Result<(), OutboxError>;

    /// Drop the lease without recording, so a redelivery can try again.
    async fn release_claim(&self, id: MessageId) -> Result<(), OutboxError>;
}
