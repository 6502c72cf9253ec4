//! Presence Store: cross-instance online/offline state,
//! backed by Redis so every relay instance sees the same view.

use async_trait::async_trait;
use deadpool_redis::redis::AsyncCommands;
use deadpool_redis::Pool;

use crate::error::Result;
use crate::protocol::Identity;

const ONLINE_USERS_KEY: &str = "online_users";

fn presence_key(identity: &str) -> String {
    format!("presence:{identity}")
}

/// Opaque locator encoding `(instance_id, session_id)`. Only
/// the Dispatcher interprets this, to decide local-vs-remote delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRef {
    pub instance_id: String,
    pub session_id: String,
}

impl SessionRef {
    pub fn new(instance_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            session_id: session_id.into(),
        }
    }

    pub fn encode(&self) -> String {
        format!("{}:{}", self.instance_id, self.session_id)
    }

    pub fn decode(s: &str) -> Option<Self> {
        let (instance_id, session_id) = s.split_once(':')?;
        Some(Self {
            instance_id: instance_id.to_string(),
            session_id: session_id.to_string(),
        })
    }
}

#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Mark `identity` online, recording an opaque `session_ref`
    /// (`instance_id:session_id`).
    async fn set_online(&self, identity: &str, session_ref: &SessionRef, ttl_secs: i64) -> Result<()>;

    /// Mark `identity` offline. Idempotent — calling it twice, or for an
    /// identity that was never online, is not an error.
    async fn set_offline(&self, identity: &str) -> Result<()>;

    async fn is_online(&self, identity: &str) -> Result<bool>;

    /// Resolve the session locator currently recorded for `identity`, if
    /// any. Used by the Dispatcher to decide
    /// local-vs-remote delivery.
    async fn lookup(&self, identity: &str) -> Result<Option<SessionRef>>;
}

pub struct RedisPresenceStore {
    pool: Pool,
}

impl RedisPresenceStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn set_online(&self, identity: &str, session_ref: &SessionRef, ttl_secs: i64) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let key = presence_key(identity);
        redis::pipe()
            .atomic()
            .sadd(ONLINE_USERS_KEY, identity)
            .ignore()
            .set_ex::<_, _>(&key, session_ref.encode(), ttl_secs as u64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_offline(&self, identity: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let key = presence_key(identity);
        redis::pipe()
            .atomic()
            .srem(ONLINE_USERS_KEY, identity)
            .ignore()
            .del(&key)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn is_online(&self, identity: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let online: bool = conn.sismember(ONLINE_USERS_KEY, identity).await?;
        Ok(online)
    }

    async fn lookup(&self, identity: &str) -> Result<Option<SessionRef>> {
        let mut conn = self.pool.get().await?;
        let raw: Option<String> = conn.get(presence_key(identity)).await?;
        Ok(raw.and_then(|s| SessionRef::decode(&s)))
    }
}

/// In-memory implementation backing unit/integration tests, sharing the
/// [`PresenceStore`] trait with the Redis-backed implementation.
#[derive(Default)]
pub struct InMemoryPresenceStore {
    online: dashmap::DashMap<Identity, SessionRef>,
}

impl InMemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresenceStore {
    async fn set_online(&self, identity: &str, session_ref: &SessionRef, _ttl_secs: i64) -> Result<()> {
        self.online.insert(identity.to_string(), session_ref.clone());
        Ok(())
    }

    async fn set_offline(&self, identity: &str) -> Result<()> {
        self.online.remove(identity);
        Ok(())
    }

    async fn is_online(&self, identity: &str) -> Result<bool> {
        Ok(self.online.contains_key(identity))
    }

    async fn lookup(&self, identity: &str) -> Result<Option<SessionRef>> {
        Ok(self.online.get(identity).map(|r| r.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn online_then_offline() {
        let store = InMemoryPresenceStore::new();
        assert!(!store.is_online("alice").await.unwrap());
        store
            .set_online("alice", &SessionRef::new("inst1", "s1"), 3600)
            .await
            .unwrap();
        assert!(store.is_online("alice").await.unwrap());
        store.set_offline("alice").await.unwrap();
        assert!(!store.is_online("alice").await.unwrap());
    }

    #[tokio::test]
    async fn set_offline_is_idempotent() {
        let store = InMemoryPresenceStore::new();
        store.set_offline("bob").await.unwrap();
        store.set_offline("bob").await.unwrap();
        assert!(!store.is_online("bob").await.unwrap());
    }

    #[tokio::test]
    async fn lookup_decodes_instance_and_session() {
        let store = InMemoryPresenceStore::new();
        store
            .set_online("alice", &SessionRef::new("inst1", "s1"), 3600)
            .await
            .unwrap();
        let r = store.lookup("alice").await.unwrap().unwrap();
        assert_eq!(r.instance_id, "inst1");
        assert_eq!(r.session_id, "s1");
    }

    #[test]
    fn session_ref_round_trips_through_string() {
        let r = SessionRef::new("inst-7", "sess-42");
        let encoded = r.encode();
        assert_eq!(encoded, "inst-7:sess-42");
        assert_eq!(SessionRef::decode(&encoded), Some(r));
    }
}
