//! Message Queue: bounded, TTL'd per-recipient storage for
//! envelopes addressed to an identity with no local session anywhere.
//!
//! Overflow policy is reject-newest: once a queue holds `MAX_QUEUE_LEN`
//! items, `push` refuses the new envelope and reports `dropped` rather
//! than evicting anything already queued.

use async_trait::async_trait;
use deadpool_redis::Pool;
use once_cell::sync::Lazy;
use redis::Script;

use crate::error::Result;
use crate::protocol::{Envelope, QueuedItem};

fn queue_key(identity: &str) -> String {
    format!("queue:{identity}")
}

/// Checks length against `max_len` and pushes in one round trip, so two
/// concurrent `push`es racing the same key can't both observe room and
/// both land — a plain pipeline can't express the conditional branch.
static PUSH_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if tonumber(redis.call('LLEN', KEYS[1])) >= tonumber(ARGV[2]) then
            return 0
        end
        redis.call('RPUSH', KEYS[1], ARGV[1])
        redis.call('EXPIRE', KEYS[1], ARGV[3])
        return 1
        "#,
    )
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    Dropped,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Append `envelope` to `identity`'s queue, expiring in `ttl_secs`.
    /// Returns [`PushOutcome::Dropped`] without mutating the queue if it
    /// is already at `max_len`.
    async fn push(
        &self,
        identity: &str,
        envelope: Envelope,
        ttl_secs: i64,
        max_len: usize,
    ) -> Result<PushOutcome>;

    /// Atomically drain and return `identity`'s queue in FIFO order,
    /// dropping any entries that have expired since they were queued.
    async fn flush(&self, identity: &str, now: i64) -> Result<Vec<Envelope>>;
}

pub struct RedisMessageQueue {
    pool: Pool,
}

impl RedisMessageQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageQueue for RedisMessageQueue {
    async fn push(
        &self,
        identity: &str,
        envelope: Envelope,
        ttl_secs: i64,
        max_len: usize,
    ) -> Result<PushOutcome> {
        let mut conn = self.pool.get().await?;
        let key = queue_key(identity);

        let item = QueuedItem {
            expires_at: envelope.timestamp + ttl_secs,
            envelope,
        };
        let encoded = serde_json::to_string(&item)
            .map_err(|e| crate::error::RelayError::InvalidArgument(e.to_string()))?;

        let admitted: i64 = PUSH_SCRIPT
            .key(&key)
            .arg(encoded)
            .arg(max_len)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;

        Ok(if admitted == 1 {
            PushOutcome::Queued
        } else {
            PushOutcome::Dropped
        })
    }

    async fn flush(&self, identity: &str, now: i64) -> Result<Vec<Envelope>> {
        let mut conn = self.pool.get().await?;
        let key = queue_key(identity);

        let (raw,): (Vec<String>,) = redis::pipe()
            .atomic()
            .lrange(&key, 0, -1)
            .del(&key)
            .ignore()
            .query_async(&mut conn)
            .await?;

        let envelopes = raw
            .into_iter()
            .filter_map(|s| serde_json::from_str::<QueuedItem>(&s).ok())
            .filter(|item| !item.is_expired(now))
            .map(|item| item.envelope)
            .collect();

        Ok(envelopes)
    }
}

/// In-memory implementation sharing [`MessageQueue`] with the
/// Redis-backed one, for unit/integration tests.
pub struct InMemoryMessageQueue {
    queues: dashmap::DashMap<String, Vec<QueuedItem>>,
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self {
            queues: dashmap::DashMap::new(),
        }
    }
}

impl Default for InMemoryMessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn push(
        &self,
        identity: &str,
        envelope: Envelope,
        ttl_secs: i64,
        max_len: usize,
    ) -> Result<PushOutcome> {
        let mut entry = self.queues.entry(identity.to_string()).or_default();
        if entry.len() >= max_len {
            return Ok(PushOutcome::Dropped);
        }
        entry.push(QueuedItem {
            expires_at: envelope.timestamp + ttl_secs,
            envelope,
        });
        Ok(PushOutcome::Queued)
    }

    async fn flush(&self, identity: &str, now: i64) -> Result<Vec<Envelope>> {
        let items = self
            .queues
            .remove(identity)
            .map(|(_, items)| items)
            .unwrap_or_default();
        Ok(items
            .into_iter()
            .filter(|item| !item.is_expired(now))
            .map(|item| item.envelope)
            .collect())
    }
}
