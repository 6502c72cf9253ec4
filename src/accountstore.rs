//! Account Store: the external collaborator that owns usernames, KDF
//! salts, and identity keys. The relay core only ever calls the
//! operations below — schema and durability are this collaborator's
//! concern, not the relay's.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::Result;
use crate::protocol::Identity;

#[derive(Debug, Clone)]
pub struct SaltRecord {
    pub identity: Identity,
    pub username: String,
    pub salt: String,
    pub kdf_params: serde_json::Value,
    pub public_key: Option<String>,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn lookup_salt(&self, username: &str) -> Result<Option<SaltRecord>>;

    async fn register(
        &self,
        identity: &str,
        username: &str,
        salt: &str,
        kdf_params: &serde_json::Value,
        public_key: Option<&str>,
    ) -> Result<()>;

    async fn username_exists(&self, username: &str) -> Result<bool>;

    /// `resolve_invite` joins invite resolution with account lookup to
    /// produce `{identity, username, salt, kdf_params}`.
    async fn lookup_by_identity(&self, identity: &str) -> Result<Option<SaltRecord>>;
}

pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn lookup_salt(&self, username: &str) -> Result<Option<SaltRecord>> {
        let row = sqlx::query_as::<_, (String, String, String, serde_json::Value, Option<String>)>(
            "SELECT identity, username, salt, kdf_params, public_key FROM accounts WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(identity, username, salt, kdf_params, public_key)| SaltRecord {
            identity,
            username,
            salt,
            kdf_params,
            public_key,
        }))
    }

    async fn register(
        &self,
        identity: &str,
        username: &str,
        salt: &str,
        kdf_params: &serde_json::Value,
        public_key: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO accounts (identity, username, salt, kdf_params, public_key) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(identity)
        .bind(username)
        .bind(salt)
        .bind(kdf_params)
        .bind(public_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn username_exists(&self, username: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM accounts WHERE username = $1")
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    async fn lookup_by_identity(&self, identity: &str) -> Result<Option<SaltRecord>> {
        let row = sqlx::query_as::<_, (String, String, String, serde_json::Value, Option<String>)>(
            "SELECT identity, username, salt, kdf_params, public_key FROM accounts WHERE identity = $1",
        )
        .bind(identity)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(identity, username, salt, kdf_params, public_key)| SaltRecord {
            identity,
            username,
            salt,
            kdf_params,
            public_key,
        }))
    }
}

/// In-memory implementation for tests and for boot without a
/// `DATABASE_URL` configured.
#[derive(Default)]
pub struct InMemoryAccountStore {
    by_username: dashmap::DashMap<String, SaltRecord>,
    by_identity: dashmap::DashMap<Identity, SaltRecord>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn lookup_salt(&self, username: &str) -> Result<Option<SaltRecord>> {
        Ok(self.by_username.get(username).map(|r| r.clone()))
    }

    async fn register(
        &self,
        identity: &str,
        username: &str,
        salt: &str,
        kdf_params: &serde_json::Value,
        public_key: Option<&str>,
    ) -> Result<()> {
        let record = SaltRecord {
            identity: identity.to_string(),
            username: username.to_string(),
            salt: salt.to_string(),
            kdf_params: kdf_params.clone(),
            public_key: public_key.map(|s| s.to_string()),
        };
        self.by_username
            .insert(username.to_string(), record.clone());
        self.by_identity.insert(identity.to_string(), record);
        Ok(())
    }

    async fn username_exists(&self, username: &str) -> Result<bool> {
        Ok(self.by_username.contains_key(username))
    }

    async fn lookup_by_identity(&self, identity: &str) -> Result<Option<SaltRecord>> {
        Ok(self.by_identity.get(identity).map(|r| r.clone()))
    }
}
