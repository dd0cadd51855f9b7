//! Redis Streams adapters: one stream is the broker topic.
//!
//! Entries carry two fields, `key` (the message id) and `payload` (the
//! serialized message).

use std::collections::HashMap;
use std::time::Duration;

use deadpool_redis::Pool;
use deadpool_redis::redis::{Cmd, Value, cmd};
use tokio::sync::watch;
use tokio::time::{Instant, sleep};

use crate::domain::publish::{PublishHandle, PublishReceipt};
use crate::domain::repository::{BrokerPublisher, MessageHandler, ProcessedLog};
use crate::domain::types::{Delivery, Disposition};
use crate::error::OutboxError;
use crate::usecase::consume::ConsumeUseCase;

const KEY_FIELD: &str = "key";
const PAYLOAD_FIELD: &str = "payload";

// ── Publisher ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RedisStreamPublisher {
    pub pool: Pool,
    pub stream: String,
    /// Approximate stream length cap (`MAXLEN ~`). `None` keeps everything.
    pub max_len: Option<u64>,
}

impl RedisStreamPublisher {
    pub fn new(pool: Pool, stream: impl Into<String>) -> Self {
        Self {
            pool,
            stream: stream.into(),
            max_len: None,
        }
    }

    pub fn with_max_len(mut self, max_len: Option<u64>) -> Self {
        self.max_len = max_len;
        self
    }

    fn xadd(&self, key: &str, payload: &[u8]) -> Cmd {
        let mut xadd = cmd("XADD");
        xadd.arg(&self.stream);
        if let Some(max_len) = self.max_len {
            xadd.arg("MAXLEN").arg("~").arg(max_len);
        }
        xadd.arg("*")
            .arg(KEY_FIELD)
            .arg(key)
            .arg(PAYLOAD_FIELD)
            .arg(payload);
        xadd
    }
}

impl BrokerPublisher for RedisStreamPublisher {
    fn publish(&self, key: &str, payload: &[u8]) -> PublishHandle {
        let (completer, handle) = PublishHandle::pending();
        let xadd = self.xadd(key, payload);
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let result = async {
                let mut conn = pool
                    .get()
                    .await
                    .map_err(|e| OutboxError::PublishFailed(e.to_string()))?;
                let entry_id: String = xadd
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| OutboxError::PublishFailed(e.to_string()))?;
                Ok(PublishReceipt { entry_id })
            }
            .await;
            completer.complete(result);
        });
        handle
    }
}

// ── Consumer ─────────────────────────────────────────────────────────────────

/// Walk the group's pending entries at most this often.
const PENDING_RESCAN: Duration = Duration::from_secs(30);
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);
/// `XAUTOCLAIM` cursor of the first page, and of "no more pages".
const CURSOR_START: &str = "0-0";

/// Entries returned by one `XREADGROUP` or `XAUTOCLAIM`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReadBatch {
    pub deliveries: Vec<Delivery>,
    /// Pending entries whose content was trimmed from the stream.
    pub orphaned: Vec<String>,
}

/// One page of the group's pending entries, taken over by this consumer.
#[derive(Debug, PartialEq, Eq)]
pub struct ClaimPage {
    /// Where the next page starts; [`CURSOR_START`] once the list is done.
    pub next: String,
    pub batch: ReadBatch,
}

#[derive(Clone)]
pub struct RedisStreamConsumer {
    pub pool: Pool,
    pub stream: String,
    pub group: String,
    /// Must be unique per process.
    pub consumer: String,
    pub block: Duration,
    pub batch_size: usize,
    /// Pending entries idle this long are taken over on rescans, whichever
    /// consumer they were delivered to.
    pub claim_idle: Duration,
    /// Deliveries after which an entry moves to `dead_letter_stream`.
    pub max_deliveries: u64,
    pub dead_letter_stream: String,
}

impl RedisStreamConsumer {
    async fn connection(&self) -> Result<deadpool_redis::Connection, OutboxError> {
        self.pool
            .get()
            .await
            .map_err(|e| OutboxError::Storage(e.into()))
    }

    /// Create the consumer group (and the stream) if missing.
    pub async fn ensure_group(&self) -> Result<(), OutboxError> {
        let mut conn = self.connection().await?;
        let created: Result<(), _> = cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => {
                tracing::info!(stream = %self.stream, group = %self.group, "consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(OutboxError::Storage(e.into())),
        }
    }

    /// Read entries never delivered to the group, blocking up to `block`.
    pub async fn read_new(&self) -> Result<ReadBatch, OutboxError> {
        let mut conn = self.connection().await?;
        let reply: Value = cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(self.batch_size)
            .arg("BLOCK")
            .arg(self.block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(|e| OutboxError::Storage(e.into()))?;
        Ok(parse_read_reply(reply))
    }

    fn autoclaim_cmd(&self, cursor: &str) -> Cmd {
        let mut autoclaim = cmd("XAUTOCLAIM");
        autoclaim
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.claim_idle.as_millis() as u64)
            .arg(cursor)
            .arg("COUNT")
            .arg(self.batch_size);
        autoclaim
    }

    /// Take over the page of idle pending entries starting at `cursor`.
    pub async fn claim_pending(&self, cursor: &str) -> Result<ClaimPage, OutboxError> {
        let mut conn = self.connection().await?;
        let reply: Value = self
            .autoclaim_cmd(cursor)
            .query_async(&mut conn)
            .await
            .map_err(|e| OutboxError::Storage(e.into()))?;
        Ok(parse_autoclaim_reply(reply))
    }

    /// Delivery counts of entries this consumer now owns, keyed by entry id.
    /// `deliveries` must be in stream order.
    pub async fn delivery_counts(
        &self,
        deliveries: &[Delivery],
    ) -> Result<HashMap<String, u64>, OutboxError> {
        let (Some(first), Some(last)) = (deliveries.first(), deliveries.last()) else {
            return Ok(HashMap::new());
        };
        let mut conn = self.connection().await?;
        let reply: Value = cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&first.entry_id)
            .arg(&last.entry_id)
            .arg(deliveries.len())
            .arg(&self.consumer)
            .query_async(&mut conn)
            .await
            .map_err(|e| OutboxError::Storage(e.into()))?;
        Ok(parse_pending_counts(reply))
    }

    pub async fn ack(&self, entry_id: &str) -> Result<(), OutboxError> {
        let mut conn = self.connection().await?;
        let _: i64 = cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(entry_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| OutboxError::Storage(e.into()))?;
        Ok(())
    }

    /// Copy an entry to the dead-letter stream, then acknowledge it.
    async fn dead_letter(&self, delivery: &Delivery, deliveries: u64) -> Result<(), OutboxError> {
        let mut conn = self.connection().await?;
        let _: String = cmd("XADD")
            .arg(&self.dead_letter_stream)
            .arg("*")
            .arg(KEY_FIELD)
            .arg(&delivery.key)
            .arg(PAYLOAD_FIELD)
            .arg(delivery.payload.as_slice())
            .arg("entry_id")
            .arg(&delivery.entry_id)
            .arg("deliveries")
            .arg(deliveries)
            .query_async(&mut conn)
            .await
            .map_err(|e| OutboxError::Storage(e.into()))?;
        self.ack(&delivery.entry_id).await
    }

    /// Consume until `shutdown` flips. Pending entries of the whole group are
    /// walked on start and then every [`PENDING_RESCAN`].
    pub async fn run<H, D>(
        &self,
        usecase: &ConsumeUseCase<H, D>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), OutboxError>
    where
        H: MessageHandler,
        D: ProcessedLog,
    {
        self.ensure_group().await?;
        tracing::info!(
            stream = %self.stream,
            group = %self.group,
            consumer = %self.consumer,
            "consumer started"
        );

        let mut rescan_at = Instant::now();
        while !*shutdown.borrow() {
            if Instant::now() >= rescan_at {
                if let Err(e) = self.rescan(usecase, &shutdown).await {
                    tracing::warn!(error = %e.detail(), "pending rescan failed");
                }
                rescan_at = Instant::now() + PENDING_RESCAN;
                continue;
            }

            let batch = tokio::select! {
                result = self.read_new() => result,
                _ = shutdown.changed() => break,
            };
            match batch {
                Ok(batch) => self.handle_batch(usecase, &batch, None).await,
                Err(e) => {
                    tracing::warn!(error = %e.detail(), "stream read failed");
                    sleep(READ_ERROR_BACKOFF).await;
                }
            }
        }

        tracing::info!("consumer stopped");
        Ok(())
    }

    /// Page through the pending list until the cursor wraps, so entries that
    /// keep failing never hide the ones behind them.
    async fn rescan<H, D>(
        &self,
        usecase: &ConsumeUseCase<H, D>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), OutboxError>
    where
        H: MessageHandler,
        D: ProcessedLog,
    {
        let mut cursor = CURSOR_START.to_owned();
        loop {
            let page = self.claim_pending(&cursor).await?;
            let counts = self.delivery_counts(&page.batch.deliveries).await?;
            self.handle_batch(usecase, &page.batch, Some(&counts)).await;
            if page.next == CURSOR_START || *shutdown.borrow() {
                return Ok(());
            }
            cursor = page.next;
        }
    }

    async fn handle_batch<H, D>(
        &self,
        usecase: &ConsumeUseCase<H, D>,
        batch: &ReadBatch,
        counts: Option<&HashMap<String, u64>>,
    ) where
        H: MessageHandler,
        D: ProcessedLog,
    {
        for entry_id in &batch.orphaned {
            tracing::warn!(entry_id = %entry_id, "acknowledging trimmed entry");
            self.ack_logged(entry_id).await;
        }
        for delivery in &batch.deliveries {
            if let Some(deliveries) = self.exhausted(delivery, counts) {
                match self.dead_letter(delivery, deliveries).await {
                    Ok(()) => tracing::error!(
                        entry_id = %delivery.entry_id,
                        key = %delivery.key,
                        deliveries,
                        dead_letter_stream = %self.dead_letter_stream,
                        "delivery attempts exhausted, moved to dead-letter stream"
                    ),
                    Err(e) => tracing::warn!(
                        entry_id = %delivery.entry_id,
                        error = %e.detail(),
                        "dead-lettering failed"
                    ),
                }
                continue;
            }
            if usecase.execute(delivery).await == Disposition::Ack {
                self.ack_logged(&delivery.entry_id).await;
            }
        }
    }

    /// Delivery count of an entry that is past `max_deliveries`. Entries read
    /// fresh (no counts) were delivered once.
    fn exhausted(&self, delivery: &Delivery, counts: Option<&HashMap<String, u64>>) -> Option<u64> {
        let deliveries = counts
            .and_then(|counts| counts.get(&delivery.entry_id).copied())
            .unwrap_or(1);
        (deliveries > self.max_deliveries).then_some(deliveries)
    }

    async fn ack_logged(&self, entry_id: &str) {
        if let Err(e) = self.ack(entry_id).await {
            tracing::warn!(entry_id = %entry_id, error = %e.detail(), "ack failed");
        }
    }
}

// ── Reply parsing ────────────────────────────────────────────────────────────

fn text(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

fn bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::BulkString(bytes) => Some(bytes.clone()),
        Value::SimpleString(s) => Some(s.clone().into_bytes()),
        _ => None,
    }
}

/// Per-stream entry lists of an `XREADGROUP` reply (RESP2 array or RESP3 map).
fn stream_entries(reply: Value) -> Vec<Value> {
    match reply {
        Value::Array(streams) => streams
            .into_iter()
            .filter_map(|stream| match stream {
                Value::Array(mut pair) if pair.len() == 2 => pair.pop(),
                _ => None,
            })
            .collect(),
        Value::Map(streams) => streams.into_iter().map(|(_, entries)| entries).collect(),
        _ => Vec::new(),
    }
}

fn parse_entries(entries: Value, batch: &mut ReadBatch) {
    let Value::Array(entries) = entries else {
        return;
    };
    for entry in entries {
        let Value::Array(parts) = entry else {
            continue;
        };
        let Some(entry_id) = parts.first().and_then(text) else {
            continue;
        };
        let fields = match parts.get(1) {
            Some(Value::Array(fields)) => fields,
            _ => {
                batch.orphaned.push(entry_id);
                continue;
            }
        };
        let mut key = None;
        let mut payload = None;
        for pair in fields.chunks(2) {
            if let [name, value] = pair {
                match text(name).as_deref() {
                    Some(KEY_FIELD) => key = text(value),
                    Some(PAYLOAD_FIELD) => payload = bytes(value),
                    _ => {}
                }
            }
        }
        match (key, payload) {
            (Some(key), Some(payload)) => batch.deliveries.push(Delivery {
                entry_id,
                key,
                payload,
            }),
            _ => batch.orphaned.push(entry_id),
        }
    }
}

pub fn parse_read_reply(reply: Value) -> ReadBatch {
    let mut batch = ReadBatch::default();
    for entries in stream_entries(reply) {
        parse_entries(entries, &mut batch);
    }
    batch
}

/// `[next cursor, entries, deleted ids]`. Deleted ids (Redis 7+) are already
/// gone from the pending list.
pub fn parse_autoclaim_reply(reply: Value) -> ClaimPage {
    let mut batch = ReadBatch::default();
    let Value::Array(parts) = reply else {
        return ClaimPage {
            next: CURSOR_START.to_owned(),
            batch,
        };
    };
    let mut parts = parts.into_iter();
    let next = parts
        .next()
        .as_ref()
        .and_then(text)
        .unwrap_or_else(|| CURSOR_START.to_owned());
    if let Some(entries) = parts.next() {
        parse_entries(entries, &mut batch);
    }
    ClaimPage { next, batch }
}

/// Rows of the extended `XPENDING` form: `[id, consumer, idle ms, deliveries]`.
pub fn parse_pending_counts(reply: Value) -> HashMap<String, u64> {
    let Value::Array(rows) = reply else {
        return HashMap::new();
    };
    rows.iter()
        .filter_map(|row| {
            let Value::Array(fields) = row else {
                return None;
            };
            let entry_id = fields.first().and_then(text)?;
            let deliveries = match fields.get(3)? {
                Value::Int(n) => u64::try_from(*n).ok()?,
                _ => return None,
            };
            Some((entry_id, deliveries))
        })
        .collect()
}
