use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};

use courier_domain::envelope::Envelope;
use courier_domain::id::MessageId;

use crate::channel::DurableChannel;
use crate::domain::publish::PublishReceipt;
use crate::domain::repository::{BrokerPublisher, ClaimScope, LockRegistry, OutboxStore};
use crate::domain::types::{LockHandle, RELAY_LOCK_NAME};
use crate::error::OutboxError;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub tick_interval: Duration,
    /// How long the first claim of a tick waits for an envelope.
    pub receive_timeout: Duration,
    pub publish_timeout: Duration,
    pub lock_name: String,
    /// Consecutive publish failures after which a record is reported as stuck.
    pub stuck_threshold: u32,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            receive_timeout: Duration::from_secs(1),
            publish_timeout: Duration::from_secs(5),
            lock_name: RELAY_LOCK_NAME.to_owned(),
            stuck_threshold: 10,
        }
    }
}

/// Why a tick stopped before the backlog was drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    PublishFailed,
    PublishTimedOut,
    LockLost,
    LockUnavailable,
    StoreFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another owner holds the relay lock.
    Busy,
    /// Nothing to deliver.
    Idle,
    Drained {
        delivered: usize,
    },
    Interrupted {
        delivered: usize,
        reason: InterruptReason,
    },
}

/// Periodically moves envelopes from the outbox to the broker.
///
/// Each tick takes the relay lock, then claims, publishes and deletes
/// envelopes one at a time inside a single claim scope. An envelope is only
/// deleted after the broker confirmed it; the first failure ends the tick.
pub struct RelayScheduler<S, L, P> {
    channel: Arc<DurableChannel<S>>,
    locks: L,
    publisher: P,
    settings: RelaySettings,
    failures: Mutex<HashMap<MessageId, u32>>,
}

impl<S, L, P> RelayScheduler<S, L, P>
where
    S: OutboxStore,
    L: LockRegistry,
    P: BrokerPublisher,
{
    pub fn new(
        channel: Arc<DurableChannel<S>>,
        locks: L,
        publisher: P,
        settings: RelaySettings,
    ) -> Self {
        Self {
            channel,
            locks,
            publisher,
            settings,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Tick every `tick_interval` until `shutdown` flips to `true`. A tick in
    /// progress runs to completion.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            tick_ms = self.settings.tick_interval.as_millis() as u64,
            "relay started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.tick().await;
                    tracing::debug!(?outcome, "relay tick finished");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("relay stopped");
    }

    /// One relay cycle.
    pub async fn tick(&self) -> TickOutcome {
        let lock = match self.locks.try_acquire(&self.settings.lock_name).await {
            Ok(Some(lock)) => lock,
            Ok(None) => return TickOutcome::Busy,
            Err(e) => {
                tracing::warn!(error = %e.detail(), "failed to acquire relay lock");
                return TickOutcome::Interrupted {
                    delivered: 0,
                    reason: InterruptReason::LockUnavailable,
                };
            }
        };

        let outcome = self.drain(&lock).await;
        self.prune_failures().await;

        if let Err(e) = self.locks.release(lock).await {
            tracing::warn!(error = %e.detail(), "failed to release relay lock");
        }
        if let TickOutcome::Drained { delivered } | TickOutcome::Interrupted { delivered, .. } =
            outcome
        {
            if delivered > 0 {
                tracing::info!(delivered, "outbox messages delivered");
            }
        }
        outcome
    }

    async fn drain(&self, lock: &LockHandle) -> TickOutcome {
        let mut claim = match self.channel.begin().await {
            Ok(claim) => claim,
            Err(e) => return store_failure(0, "begin claim", &e),
        };

        let mut delivered = 0;
        let mut wait = self.settings.receive_timeout;
        let interrupted = loop {
            let envelope = match self.channel.poll(&mut claim, wait).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break None,
                Err(e) => return store_failure(delivered, "claim", &e),
            };
            wait = Duration::ZERO;

            match self.publish(&envelope).await {
                Ok(_) => {
                    if let Err(e) = claim.delete(envelope.id).await {
                        return store_failure(delivered, "delete", &e);
                    }
                    delivered += 1;
                    self.clear_failures(envelope.id);
                }
                Err(e) => {
                    self.record_failure(&envelope, &e);
                    if let Err(e) = claim.release(envelope.id).await {
                        return store_failure(delivered, "release", &e);
                    }
                    break Some(match e {
                        OutboxError::PublishTimeout(_) => InterruptReason::PublishTimedOut,
                        _ => InterruptReason::PublishFailed,
                    });
                }
            }

            match self.locks.extend(lock).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(delivered, "relay lock lost, ending tick");
                    break Some(InterruptReason::LockLost);
                }
                Err(e) => {
                    tracing::warn!(error = %e.detail(), "failed to extend relay lock");
                    break Some(InterruptReason::LockLost);
                }
            }
        };

        if let Err(e) = claim.commit().await {
            return store_failure(delivered, "commit", &e);
        }

        match interrupted {
            Some(reason) => TickOutcome::Interrupted { delivered, reason },
            None if delivered == 0 => TickOutcome::Idle,
            None => TickOutcome::Drained { delivered },
        }
    }

    async fn publish(&self, envelope: &Envelope) -> Result<PublishReceipt, OutboxError> {
        let handle = self.publisher.publish(&envelope.key(), &envelope.payload);
        let timeout = self.settings.publish_timeout;
        let receipt = match tokio::time::timeout(timeout, handle).await {
            Ok(result) => result?,
            Err(_) => return Err(OutboxError::PublishTimeout(timeout)),
        };
        tracing::debug!(
            message_id = %envelope.id,
            partition_key = %envelope.partition_key,
            entry_id = %receipt.entry_id,
            "message published"
        );
        Ok(receipt)
    }

    fn record_failure(&self, envelope: &Envelope, error: &OutboxError) {
        let attempts = {
            let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
            let attempts = failures.entry(envelope.id).or_insert(0);
            *attempts += 1;
            *attempts
        };
        tracing::warn!(
            message_id = %envelope.id,
            partition_key = %envelope.partition_key,
            attempts,
            error = %error,
            "publish failed, message stays pending"
        );
        let threshold = self.settings.stuck_threshold.max(1);
        if attempts % threshold == 0 {
            tracing::error!(
                message_id = %envelope.id,
                partition_key = %envelope.partition_key,
                attempts,
                "message is stuck in the outbox"
            );
        }
    }

    fn clear_failures(&self, id: MessageId) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Forget failure counts of records that left the outbox some other way
    /// (deleted by an operator or delivered by another instance).
    async fn prune_failures(&self) {
        let tracked: Vec<MessageId> = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        for id in tracked {
            match self.channel.store().find_by_id(id).await {
                Ok(Some(_)) => {}
                Ok(None) => self.clear_failures(id),
                Err(e) => {
                    tracing::warn!(error = %e.detail(), "failed to prune publish failure counts");
                    return;
                }
            }
        }
    }

    /// Consecutive publish failures recorded for `id`.
    pub fn failure_count(&self, id: MessageId) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .copied()
            .unwrap_or(0)
    }
}

fn store_failure(delivered: usize, step: &str, error: &OutboxError) -> TickOutcome {
    tracing::error!(
        step,
        delivered,
        error = %error.detail(),
        "outbox store failed, rolling back tick"
    );
    TickOutcome::Interrupted {
        delivered,
        reason: InterruptReason::StoreFailed,
    }
}
