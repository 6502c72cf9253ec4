//! Pairing / Invite Module: short-lived codes that let a
//! secondary device join an existing identity without re-running the
//! full registration flow.

use async_trait::async_trait;
use deadpool_redis::redis::AsyncCommands;
use deadpool_redis::Pool;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{RelayError, Result};
use crate::protocol::Identity;

fn invite_key(code: &str) -> String {
    format!("invite:{code}")
}

/// Six-character uppercase hex pairing code, sourced from
/// the OS CSPRNG rather than a PRNG — these gate device linking.
pub fn generate_code() -> String {
    let mut bytes = [0u8; 3];
    OsRng.fill_bytes(&mut bytes);
    hex::encode_upper(bytes)
}

#[async_trait]
pub trait InviteStore: Send + Sync {
    async fn create_invite(&self, identity: &str, ttl_secs: i64) -> Result<(String, i64)>;
    async fn resolve_invite(&self, code: &str) -> Result<Identity>;
}

pub struct RedisInviteStore {
    pool: Pool,
}

impl RedisInviteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InviteStore for RedisInviteStore {
    async fn create_invite(&self, identity: &str, ttl_secs: i64) -> Result<(String, i64)> {
        let mut conn = self.pool.get().await?;
        // Collisions are astronomically unlikely at 2^24 codes with a
        // 300s TTL, but retry a handful of times rather than trust luck.
        for _ in 0..5 {
            let code = generate_code();
            let key = invite_key(&code);
            let set: bool = redis::cmd("SET")
                .arg(&key)
                .arg(identity)
                .arg("NX")
                .arg("EX")
                .arg(ttl_secs)
                .query_async::<_, Option<String>>(&mut conn)
                .await?
                .is_some();
            if set {
                let expires_at = chrono::Utc::now().timestamp() + ttl_secs;
                return Ok((code, expires_at));
            }
        }
        Err(RelayError::KvUnavailable(
            "could not allocate a unique invite code".to_string(),
        ))
    }

    async fn resolve_invite(&self, code: &str) -> Result<Identity> {
        let mut conn = self.pool.get().await?;
        let identity: Option<String> = conn.get(invite_key(code)).await?;
        identity.ok_or(RelayError::InvalidOrExpired)
    }
}

/// In-memory implementation for tests; mirrors TTL semantics with an
/// explicit expiry timestamp rather than relying on Redis's own clock.
pub struct InMemoryInviteStore {
    codes: dashmap::DashMap<String, (Identity, i64)>,
}

impl InMemoryInviteStore {
    pub fn new() -> Self {
        Self {
            codes: dashmap::DashMap::new(),
        }
    }

    pub fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }
}

impl Default for InMemoryInviteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InviteStore for InMemoryInviteStore {
    async fn create_invite(&self, identity: &str, ttl_secs: i64) -> Result<(String, i64)> {
        let code = generate_code();
        let expires_at = Self::now() + ttl_secs;
        self.codes
            .insert(code.clone(), (identity.to_string(), expires_at));
        Ok((code, expires_at))
    }

    async fn resolve_invite(&self, code: &str) -> Result<Identity> {
        let entry = self.codes.get(code).ok_or(RelayError::InvalidOrExpired)?;
        let (identity, expires_at) = entry.clone();
        if Self::now() > expires_at {
            drop(entry);
            self.codes.remove(code);
            return Err(RelayError::InvalidOrExpired);
        }
        Ok(identity)
    }
}
