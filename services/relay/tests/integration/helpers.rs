use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};

use courier_domain::envelope::Envelope;
use courier_domain::id::MessageId;
use courier_domain::message::OutboxMessage;
use courier_relay::domain::publish::{PublishCompleter, PublishHandle, PublishReceipt};
use courier_relay::domain::repository::{
    BrokerPublisher, ClaimScope, LockRegistry, MessageHandler, OutboxStore, ProcessedLog,
};
use courier_relay::domain::types::{LockHandle, PendingFilter, ProcessingClaim};
use courier_relay::error::OutboxError;
use courier_relay::infra::lock::LocalLockRegistry;
use courier_relay::infra::memory::{InMemoryOutboxStore, MemoryClaim};
use courier_relay::relay::RelaySettings;

// ── Fixtures ─────────────────────────────────────────────────────────────────

pub fn settings() -> RelaySettings {
    RelaySettings {
        tick_interval: Duration::from_secs(1),
        receive_timeout: Duration::from_millis(200),
        publish_timeout: Duration::from_secs(5),
        stuck_threshold: 3,
        ..RelaySettings::default()
    }
}

pub fn local_locks() -> LocalLockRegistry {
    LocalLockRegistry::new(Duration::from_secs(30))
}

/// Envelope for `content` created `secs` after the epoch, so tests control
/// store order.
pub fn envelope_at(content: &str, partition_key: &str, secs: i64) -> Envelope {
    let mut message = OutboxMessage::new(content, partition_key);
    message.timestamp = Utc.timestamp_opt(secs, 0).unwrap();
    Envelope::seal(&message).unwrap()
}

pub fn content_of(payload: &[u8]) -> String {
    OutboxMessage::from_bytes(payload).unwrap().content
}

// ── MockPublisher ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    Succeed,
    Fail,
    /// Never completes.
    Hang,
    /// Completes successfully after the given delay.
    Delay(Duration),
}

#[derive(Clone)]
pub struct MockPublisher {
    pub mode: Arc<Mutex<PublishMode>>,
    pub published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    pub attempts: Arc<AtomicUsize>,
    stalled: Arc<Mutex<Vec<PublishCompleter>>>,
}

impl MockPublisher {
    pub fn new(mode: PublishMode) -> Self {
        Self {
            mode: Arc::new(Mutex::new(mode)),
            published: Arc::new(Mutex::new(Vec::new())),
            attempts: Arc::new(AtomicUsize::new(0)),
            stalled: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(PublishMode::Succeed)
    }

    pub fn set_mode(&self, mode: PublishMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn published_keys(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl BrokerPublisher for MockPublisher {
    fn publish(&self, key: &str, payload: &[u8]) -> PublishHandle {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst);
        let receipt = PublishReceipt {
            entry_id: format!("{n}-0"),
        };
        let mode = *self.mode.lock().unwrap();
        match mode {
            PublishMode::Succeed => {
                self.published
                    .lock()
                    .unwrap()
                    .push((key.to_owned(), payload.to_vec()));
                PublishHandle::ready(Ok(receipt))
            }
            PublishMode::Fail => PublishHandle::ready(Err(OutboxError::PublishFailed(
                "broker unavailable".to_owned(),
            ))),
            PublishMode::Hang => {
                let (completer, handle) = PublishHandle::pending();
                self.stalled.lock().unwrap().push(completer);
                handle
            }
            PublishMode::Delay(delay) => {
                let (completer, handle) = PublishHandle::pending();
                let published = Arc::clone(&self.published);
                let record = (key.to_owned(), payload.to_vec());
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    published.lock().unwrap().push(record);
                    completer.complete(Ok(receipt));
                });
                handle
            }
        }
    }
}

// ── FlakyStore ───────────────────────────────────────────────────────────────

/// In-memory store whose claim scopes fail deletes on demand.
#[derive(Clone)]
pub struct FlakyStore {
    pub inner: InMemoryOutboxStore,
    pub fail_deletes: Arc<AtomicBool>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryOutboxStore::new(),
            fail_deletes: Arc::new(AtomicBool::new(false)),
        }
    }
}

pub struct FlakyClaim {
    inner: MemoryClaim,
    fail_deletes: Arc<AtomicBool>,
}

impl OutboxStore for FlakyStore {
    type Claim = FlakyClaim;

    async fn insert(&self, envelope: &Envelope) -> Result<(), OutboxError> {
        self.inner.insert(envelope).await
    }

    async fn delete_by_id(&self, id: MessageId) -> Result<bool, OutboxError> {
        self.inner.delete_by_id(id).await
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Envelope>, OutboxError> {
        self.inner.find_by_id(id).await
    }

    async fn find_pending(&self, filter: &PendingFilter) -> Result<Vec<Envelope>, OutboxError> {
        self.inner.find_pending(filter).await
    }

    async fn count_pending(&self) -> Result<u64, OutboxError> {
        self.inner.count_pending().await
    }

    async fn begin_claim(&self) -> Result<FlakyClaim, OutboxError> {
        Ok(FlakyClaim {
            inner: self.inner.begin_claim().await?,
            fail_deletes: Arc::clone(&self.fail_deletes),
        })
    }
}

impl ClaimScope for FlakyClaim {
    async fn claim_next(&mut self) -> Result<Option<Envelope>, OutboxError> {
        self.inner.claim_next().await
    }

    async fn delete(&mut self, id: MessageId) -> Result<bool, OutboxError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(OutboxError::Storage(anyhow::anyhow!("connection reset")));
        }
        self.inner.delete(id).await
    }

    async fn release(&mut self, id: MessageId) -> Result<(), OutboxError> {
        self.inner.release(id).await
    }

    async fn commit(self) -> Result<(), OutboxError> {
        self.inner.commit().await
    }
}

// ── Locks ────────────────────────────────────────────────────────────────────

/// Grants the lock but reports it lost on every renewal.
pub struct LosingLock {
    pub inner: LocalLockRegistry,
}

impl LockRegistry for LosingLock {
    async fn try_acquire(&self, name: &str) -> Result<Option<LockHandle>, OutboxError> {
        self.inner.try_acquire(name).await
    }

    async fn extend(&self, _handle: &LockHandle) -> Result<bool, OutboxError> {
        Ok(false)
    }

    async fn release(&self, handle: LockHandle) -> Result<(), OutboxError> {
        self.inner.release(handle).await
    }
}

// ── Consumer side ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ProcessedState {
    pub processed: HashSet<MessageId>,
    pub in_flight: HashSet<MessageId>,
}

#[derive(Clone, Default)]
pub struct MockProcessedLog {
    pub state: Arc<Mutex<ProcessedState>>,
}

impl MockProcessedLog {
    pub fn is_in_flight(&self, id: MessageId) -> bool {
        self.state.lock().unwrap().in_flight.contains(&id)
    }
}

impl ProcessedLog for MockProcessedLog {
    async fn is_processed(&self, id: MessageId) -> Result<bool, OutboxError> {
        Ok(self.state.lock().unwrap().processed.contains(&id))
    }

    async fn try_claim(&self, id: MessageId) -> Result<ProcessingClaim, OutboxError> {
        let mut state = self.state.lock().unwrap();
        if state.processed.contains(&id) {
            return Ok(ProcessingClaim::AlreadyProcessed);
        }
        if !state.in_flight.insert(id) {
            return Ok(ProcessingClaim::InFlight);
        }
        Ok(ProcessingClaim::Acquired)
    }

    async fn mark_processed(&self, id: MessageId) -> Result<(), OutboxError> {
        let mut state = self.state.lock().unwrap();
        state.in_flight.remove(&id);
        state.processed.insert(id);
        Ok(())
    }

    async fn release_claim(&self, id: MessageId) -> Result<(), OutboxError> {
        self.state.lock().unwrap().in_flight.remove(&id);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingHandler {
    pub handled: Arc<Mutex<Vec<OutboxMessage>>>,
    pub fail: bool,
    /// Simulated processing time before the message is recorded.
    pub delay: Duration,
}

impl RecordingHandler {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn handled_count(&self) -> usize {
        self.handled.lock().unwrap().len()
    }
}

impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: &OutboxMessage) -> anyhow::Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            anyhow::bail!("downstream rejected {}", message.id);
        }
        self.handled.lock().unwrap().push(message.clone());
        Ok(())
    }
}
