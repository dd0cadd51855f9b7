use std::time::Duration;

use tokio::time::{Instant, sleep};

use courier_domain::envelope::Envelope;

use crate::domain::repository::{ClaimScope, OutboxStore};
use crate::domain::types::DEFAULT_POLL_INTERVAL;
use crate::error::OutboxError;

/// Bounded queue view over an [`OutboxStore`].
///
/// Producers enqueue; the relay claims through a scope opened with
/// [`DurableChannel::begin`]. The ceiling is checked before the insert, so
/// concurrent producers can overshoot it by at most their number.
pub struct DurableChannel<S> {
    store: S,
    capacity: u64,
    poll_interval: Duration,
}

impl<S: OutboxStore> DurableChannel<S> {
    pub fn new(store: S, capacity: u64) -> Self {
        Self {
            store,
            capacity,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub async fn pending(&self) -> Result<u64, OutboxError> {
        self.store.count_pending().await
    }

    /// Persist an envelope unless the backlog is full.
    pub async fn enqueue(&self, envelope: &Envelope) -> Result<(), OutboxError> {
        let pending = self.store.count_pending().await?;
        if pending >= self.capacity {
            tracing::warn!(
                message_id = %envelope.id,
                pending,
                capacity = self.capacity,
                "outbox full, rejecting message"
            );
            return Err(OutboxError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        self.store.insert(envelope).await
    }

    pub async fn begin(&self) -> Result<S::Claim, OutboxError> {
        self.store.begin_claim().await
    }

    /// Claim one available envelope, waiting up to `timeout` for one to show
    /// up. A zero timeout checks exactly once.
    pub async fn poll(
        &self,
        claim: &mut S::Claim,
        timeout: Duration,
    ) -> Result<Option<Envelope>, OutboxError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(envelope) = claim.claim_next().await? {
                return Ok(Some(envelope));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Claim every currently available envelope.
    pub async fn drain_all(&self, claim: &mut S::Claim) -> Result<Vec<Envelope>, OutboxError> {
        let mut drained = Vec::new();
        while let Some(envelope) = self.poll(claim, Duration::ZERO).await? {
            drained.push(envelope);
        }
        Ok(drained)
    }
}
