use std::time::Duration;

use deadpool_redis::Pool;
use deadpool_redis::redis::{AsyncCommands, cmd};
use uuid::Uuid;

use courier_domain::id::MessageId;

use crate::domain::repository::ProcessedLog;
use crate::domain::types::ProcessingClaim;
use crate::error::OutboxError;

/// KEYS: processed, processing. ARGV: owner, lease ms.
const CLAIM_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
    return 2
end
if redis.call("SET", KEYS[2], ARGV[1], "NX", "PX", ARGV[2]) then
    return 1
end
return 0
"#;

/// KEYS: processed, processing. ARGV: owner, ttl secs.
const MARK_SCRIPT: &str = r#"
redis.call("SET", KEYS[1], 1, "EX", ARGV[2])
if redis.call("GET", KEYS[2]) == ARGV[1] then
    redis.call("DEL", KEYS[2])
end
return 1
"#;

/// KEYS: processing. ARGV: owner.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Processed-id log kept in Redis with a retention TTL.
///
/// Before the handler runs, the consumer takes `courier:processing:{id}` with
/// its owner token and a short lease; the check against the processed key
/// and the lease acquisition run as one script. A consumer that dies
/// mid-handler loses its lease when it expires.
#[derive(Clone)]
pub struct RedisProcessedLog {
    pub pool: Pool,
    pub ttl: Duration,
    pub lease: Duration,
    owner: String,
}

fn processed_key(id: MessageId) -> String {
    format!("courier:processed:{id}")
}

fn processing_key(id: MessageId) -> String {
    format!("courier:processing:{id}")
}

fn claim_from_reply(reply: i64) -> ProcessingClaim {
    match reply {
        1 => ProcessingClaim::Acquired,
        2 => ProcessingClaim::AlreadyProcessed,
        _ => ProcessingClaim::InFlight,
    }
}

impl RedisProcessedLog {
    pub fn new(pool: Pool, ttl: Duration, lease: Duration) -> Self {
        Self {
            pool,
            ttl,
            lease,
            owner: Uuid::new_v4().to_string(),
        }
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, OutboxError> {
        self.pool
            .get()
            .await
            .map_err(|e| OutboxError::Storage(e.into()))
    }
}

impl ProcessedLog for RedisProcessedLog {
    async fn is_processed(&self, id: MessageId) -> Result<bool, OutboxError> {
        let mut conn = self.connection().await?;
        let exists: bool = conn
            .exists(processed_key(id))
            .await
            .map_err(|e: deadpool_redis::redis::RedisError| OutboxError::Storage(e.into()))?;
        Ok(exists)
    }

    async fn try_claim(&self, id: MessageId) -> Result<ProcessingClaim, OutboxError> {
        let mut conn = self.connection().await?;
        let reply: i64 = cmd("EVAL")
            .arg(CLAIM_SCRIPT)
            .arg(2)
            .arg(processed_key(id))
            .arg(processing_key(id))
            .arg(&self.owner)
            .arg(u64::try_from(self.lease.as_millis()).unwrap_or(u64::MAX).max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| OutboxError::Storage(e.into()))?;
        Ok(claim_from_reply(reply))
    }

    async fn mark_processed(&self, id: MessageId) -> Result<(), OutboxError> {
        let mut conn = self.connection().await?;
        let _: i64 = cmd("EVAL")
            .arg(MARK_SCRIPT)
            .arg(2)
            .arg(processed_key(id))
            .arg(processing_key(id))
            .arg(&self.owner)
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| OutboxError::Storage(e.into()))?;
        Ok(())
    }

    async fn release_claim(&self, id: MessageId) -> Result<(), OutboxError> {
        let mut conn = self.connection().await?;
        let _: i64 = cmd("EVAL")
            .arg(RELEASE_SCRIPT)
            .arg(1)
            .arg(processing_key(id))
            .arg(&self.owner)
            .query_async(&mut conn)
            .await
            .map_err(|e| OutboxError::Storage(e.into()))?;
        Ok(())
    }
}
