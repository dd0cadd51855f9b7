//! In-process outbox store.
//!
//! Claims are leases with a visibility timeout: a claim that is neither
//! released nor committed becomes available again once the lease expires.
//! Leases run on `tokio::time`, so paused-clock tests can expire them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use courier_domain::envelope::Envelope;
use courier_domain::id::MessageId;

use crate::domain::repository::{ClaimScope, OutboxStore};
use crate::domain::types::PendingFilter;
use crate::error::OutboxError;

pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

type OrderKey = (DateTime<Utc>, MessageId);

#[derive(Default)]
struct Inner {
    records: BTreeMap<OrderKey, Record>,
    index: HashMap<MessageId, DateTime<Utc>>,
    next_scope: u64,
}

struct Record {
    envelope: Envelope,
    lease: Option<Lease>,
}

struct Lease {
    scope: u64,
    expires_at: Instant,
}

impl Inner {
    fn record_mut(&mut self, id: MessageId) -> Option<&mut Record> {
        let created_at = *self.index.get(&id)?;
        self.records.get_mut(&(created_at, id))
    }

    fn remove(&mut self, id: MessageId) -> bool {
        match self.index.remove(&id) {
            Some(created_at) => self.records.remove(&(created_at, id)).is_some(),
            None => false,
        }
    }

    fn clear_leases(&mut self, scope: u64) {
        for record in self.records.values_mut() {
            if record.lease.as_ref().is_some_and(|l| l.scope == scope) {
                record.lease = None;
            }
        }
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct InMemoryOutboxStore {
    inner: Arc<Mutex<Inner>>,
    visibility_timeout: Duration,
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            visibility_timeout,
        }
    }

    /// Snapshot of every pending envelope in store order.
    pub fn snapshot(&self) -> Vec<Envelope> {
        lock(&self.inner)
            .records
            .values()
            .map(|r| r.envelope.clone())
            .collect()
    }
}

impl OutboxStore for InMemoryOutboxStore {
    type Claim = MemoryClaim;

    async fn insert(&self, envelope: &Envelope) -> Result<(), OutboxError> {
        let mut inner = lock(&self.inner);
        if inner.index.contains_key(&envelope.id) {
            return Err(OutboxError::Storage(anyhow::anyhow!(
                "duplicate outbox message id {}",
                envelope.id
            )));
        }
        inner.index.insert(envelope.id, envelope.created_at);
        inner.records.insert(
            (envelope.created_at, envelope.id),
            Record {
                envelope: envelope.clone(),
                lease: None,
            },
        );
        Ok(())
    }

    async fn delete_by_id(&self, id: MessageId) -> Result<bool, OutboxError> {
        Ok(lock(&self.inner).remove(id))
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Envelope>, OutboxError> {
        let mut inner = lock(&self.inner);
        Ok(inner.record_mut(id).map(|r| r.envelope.clone()))
    }

    async fn find_pending(&self, filter: &PendingFilter) -> Result<Vec<Envelope>, OutboxError> {
        let limit = usize::try_from(filter.limit).unwrap_or(usize::MAX);
        Ok(lock(&self.inner)
            .records
            .values()
            .filter(|r| filter.matches(&r.envelope))
            .take(limit)
            .map(|r| r.envelope.clone())
            .collect())
    }

    async fn count_pending(&self) -> Result<u64, OutboxError> {
        Ok(lock(&self.inner).records.len() as u64)
    }

    async fn begin_claim(&self) -> Result<MemoryClaim, OutboxError> {
        let scope = {
            let mut inner = lock(&self.inner);
            inner.next_scope += 1;
            inner.next_scope
        };
        Ok(MemoryClaim {
            inner: Arc::clone(&self.inner),
            scope,
            visibility_timeout: self.visibility_timeout,
            claimed: HashSet::new(),
            deletes: Vec::new(),
            finished: false,
        })
    }
}

/// Claim scope over an [`InMemoryOutboxStore`].
pub struct MemoryClaim {
    inner: Arc<Mutex<Inner>>,
    scope: u64,
    visibility_timeout: Duration,
    claimed: HashSet<MessageId>,
    deletes: Vec<MessageId>,
    finished: bool,
}

impl MemoryClaim {
    /// End the scope the way a crashed relay would: nothing is committed and
    /// the claims stay leased until their visibility timeout runs out.
    pub fn abandon(mut self) {
        self.finished = true;
    }
}

impl ClaimScope for MemoryClaim {
    async fn claim_next(&mut self) -> Result<Option<Envelope>, OutboxError> {
        let now = Instant::now();
        let mut inner = lock(&self.inner);
        let claimed = &self.claimed;
        let record = inner.records.values_mut().find(|r| {
            !claimed.contains(&r.envelope.id)
                && r.lease.as_ref().is_none_or(|l| l.expires_at <= now)
        });
        let Some(record) = record else {
            return Ok(None);
        };
        record.lease = Some(Lease {
            scope: self.scope,
            expires_at: now + self.visibility_timeout,
        });
        let envelope = record.envelope.clone();
        self.claimed.insert(envelope.id);
        Ok(Some(envelope))
    }

    async fn delete(&mut self, id: MessageId) -> Result<bool, OutboxError> {
        if self.deletes.contains(&id) || !lock(&self.inner).index.contains_key(&id) {
            return Ok(false);
        }
        self.deletes.push(id);
        Ok(true)
    }

    async fn release(&mut self, id: MessageId) -> Result<(), OutboxError> {
        let scope = self.scope;
        if let Some(record) = lock(&self.inner).record_mut(id) {
            if record.lease.as_ref().is_some_and(|l| l.scope == scope) {
                record.lease = None;
            }
        }
        Ok(())
    }

    async fn commit(mut self) -> Result<(), OutboxError> {
        {
            let mut inner = lock(&self.inner);
            for id in self.deletes.drain(..) {
                inner.remove(id);
            }
            inner.clear_leases(self.scope);
        }
        self.finished = true;
        Ok(())
    }
}

impl Drop for MemoryClaim {
    fn drop(&mut self) {
        if !self.finished {
            lock(&self.inner).clear_leases(self.scope);
        }
    }
}
