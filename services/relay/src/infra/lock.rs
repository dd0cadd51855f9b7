use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use deadpool_redis::Pool;
use deadpool_redis::redis::cmd;
use tokio::time::Instant;
use uuid::Uuid;

use crate::domain::repository::LockRegistry;
use crate::domain::types::LockHandle;
use crate::error::OutboxError;

const KEY_PREFIX: &str = "courier:lock:";

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

fn lock_key(name: &str) -> String {
    format!("{KEY_PREFIX}{name}")
}

fn lease_millis(lease: Duration) -> u64 {
    u64::try_from(lease.as_millis()).unwrap_or(u64::MAX).max(1)
}

// ── Redis ────────────────────────────────────────────────────────────────────

/// Cross-process lease lock: `SET NX PX` to acquire, token-checked scripts to
/// extend and release. A crashed owner's lease simply expires.
#[derive(Clone)]
pub struct RedisLockRegistry {
    pub pool: Pool,
    pub lease: Duration,
}

impl RedisLockRegistry {
    pub fn new(pool: Pool, lease: Duration) -> Self {
        Self { pool, lease }
    }

    async fn run_owned_script(
        &self,
        script: &str,
        handle: &LockHandle,
    ) -> Result<i64, OutboxError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| OutboxError::Storage(e.into()))?;
        let affected: i64 = cmd("EVAL")
            .arg(script)
            .arg(1)
            .arg(lock_key(&handle.name))
            .arg(&handle.token)
            .arg(lease_millis(self.lease))
            .query_async(&mut conn)
            .await
            .map_err(|e| OutboxError::Storage(e.into()))?;
        Ok(affected)
    }
}

impl LockRegistry for RedisLockRegistry {
    async fn try_acquire(&self, name: &str) -> Result<Option<LockHandle>, OutboxError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| OutboxError::Storage(e.into()))?;
        let token = Uuid::new_v4().to_string();
        let reply: Option<String> = cmd("SET")
            .arg(lock_key(name))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(lease_millis(self.lease))
            .query_async(&mut conn)
            .await
            .map_err(|e| OutboxError::Storage(e.into()))?;
        Ok(reply.map(|_| LockHandle {
            name: name.to_owned(),
            token,
        }))
    }

    async fn extend(&self, handle: &LockHandle) -> Result<bool, OutboxError> {
        Ok(self.run_owned_script(EXTEND_SCRIPT, handle).await? == 1)
    }

    async fn release(&self, handle: LockHandle) -> Result<(), OutboxError> {
        // ARGV[2] is unused by the release script.
        self.run_owned_script(RELEASE_SCRIPT, &handle).await?;
        Ok(())
    }
}

// ── Local ────────────────────────────────────────────────────────────────────

/// In-process lease lock. Only excludes tasks within one process.
#[derive(Clone)]
pub struct LocalLockRegistry {
    leases: Arc<Mutex<HashMap<String, LocalLease>>>,
    lease: Duration,
}

struct LocalLease {
    token: String,
    expires_at: Instant,
}

impl LocalLockRegistry {
    pub fn new(lease: Duration) -> Self {
        Self {
            leases: Arc::new(Mutex::new(HashMap::new())),
            lease,
        }
    }
}

impl LockRegistry for LocalLockRegistry {
    async fn try_acquire(&self, name: &str) -> Result<Option<LockHandle>, OutboxError> {
        let now = Instant::now();
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        if leases.get(name).is_some_and(|l| l.expires_at > now) {
            return Ok(None);
        }
        let token = Uuid::new_v4().to_string();
        leases.insert(
            name.to_owned(),
            LocalLease {
                token: token.clone(),
                expires_at: now + self.lease,
            },
        );
        Ok(Some(LockHandle {
            name: name.to_owned(),
            token,
        }))
    }

    async fn extend(&self, handle: &LockHandle) -> Result<bool, OutboxError> {
        let now = Instant::now();
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        match leases.get_mut(&handle.name) {
            Some(lease) if lease.token == handle.token && lease.expires_at > now => {
                lease.expires_at = now + self.lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, handle: LockHandle) -> Result<(), OutboxError> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        if leases
            .get(&handle.name)
            .is_some_and(|l| l.token == handle.token)
        {
            leases.remove(&handle.name);
        }
        Ok(())
    }
}

// ── Backend selection ────────────────────────────────────────────────────────

/// Lock registry chosen at startup.
#[derive(Clone)]
pub enum LockBackend {
    Redis(RedisLockRegistry),
    Local(LocalLockRegistry),
}

impl LockRegistry for LockBackend {
    async fn try_acquire(&self, name: &str) -> Result<Option<LockHandle>, OutboxError> {
        match self {
            Self::Redis(r) => r.try_acquire(name).await,
            Self::Local(l) => l.try_acquire(name).await,
        }
    }

    async fn extend(&self, handle: &LockHandle) -> Result<bool, OutboxError> {
        match self {
            Self::Redis(r) => r.extend(handle).await,
            Self::Local(l) => l.extend(handle).await,
        }
    }

    async fn release(&self, handle: LockHandle) -> Result<(), OutboxError> {
        match self {
            Self::Redis(r) => r.release(handle).await,
            Self::Local(l) => l.release(handle).await,
        }
    }
}
