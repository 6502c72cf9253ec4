//! Boot-time configuration: CLI flags with env fallbacks, plus the tunable
//! constants that size the queue, rate limiter, and presence TTLs.

use clap::Parser;

/// 5 MiB — the relay-enforced payload ceiling (below the 10 MiB transport
/// frame cap; the transport itself rejects anything larger before it
/// reaches the dispatcher).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 5 * 1024 * 1024;

pub const DEFAULT_QUEUE_TTL_SECS: i64 = 1800;
pub const DEFAULT_MAX_QUEUE_LEN: usize = 100;
pub const DEFAULT_SYNC_CODE_TTL_SECS: i64 = 300;
pub const DEFAULT_PRESENCE_TTL_SECS: i64 = 3600;
pub const DEFAULT_MAX_TOKENS: f64 = 100.0;
pub const DEFAULT_REFILL_RATE: f64 = 10.0;

#[derive(Parser, Debug, Clone)]
#[command(name = "relaycore", version, about = "End-to-end-encrypted payload relay")]
pub struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 3000, env = "PORT")]
    pub port: u16,

    /// Redis connection URL (presence, queue, invites, pub/sub). Takes
    /// precedence over `redis_host`/`redis_port`/`redis_password` when set.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Redis host, used to build a connection URL when `REDIS_URL` is unset.
    #[arg(long, default_value = "127.0.0.1", env = "REDIS_HOST")]
    pub redis_host: String,

    /// Redis port, used to build a connection URL when `REDIS_URL` is unset.
    #[arg(long, default_value_t = 6379, env = "REDIS_PORT")]
    pub redis_port: u16,

    /// Redis password, used to build a connection URL when `REDIS_URL` is unset.
    #[arg(long, env = "REDIS_PASSWORD")]
    pub redis_password: Option<String>,

    /// Postgres-compatible account store URL.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Maximum relay payload size, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD_SIZE, env = "MAX_PAYLOAD_SIZE_BYTES")]
    pub max_payload_size: usize,

    /// Per-identity queue TTL, in seconds.
    #[arg(long, default_value_t = DEFAULT_QUEUE_TTL_SECS, env = "QUEUE_TTL_SECS")]
    pub queue_ttl_secs: i64,

    /// Maximum queued envelopes per identity.
    #[arg(long, default_value_t = DEFAULT_MAX_QUEUE_LEN, env = "MAX_QUEUE_LEN")]
    pub max_queue_len: usize,

    /// Pairing-code TTL, in seconds.
    #[arg(long, default_value_t = DEFAULT_SYNC_CODE_TTL_SECS, env = "SYNC_CODE_TTL_SECS")]
    pub sync_code_ttl_secs: i64,

    /// Presence record safety TTL, in seconds.
    #[arg(long, default_value_t = DEFAULT_PRESENCE_TTL_SECS, env = "PRESENCE_TTL_SECS")]
    pub presence_ttl_secs: i64,

    /// Token bucket capacity per session.
    #[arg(long, default_value_t = DEFAULT_MAX_TOKENS, env = "MAX_TOKENS")]
    pub max_tokens: f64,

    /// Token bucket refill rate, tokens/sec.
    #[arg(long, default_value_t = DEFAULT_REFILL_RATE, env = "REFILL_RATE_PER_SEC")]
    pub refill_rate: f64,

    /// This instance's identifier — defaults to a random UUID.
    /// Used to build `session_ref`s and tag pub/sub publishes.
    #[arg(long, env = "INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// How often to emit the local housekeeping heartbeat.
    #[arg(long, default_value_t = 60, env = "CLEANUP_INTERVAL_SECS")]
    pub cleanup_interval_secs: u64,
}

impl Args {
    /// Resolve the Redis connection URL: `REDIS_URL` verbatim if set,
    /// otherwise assembled from the discrete host/port/password fields.
    pub fn resolved_redis_url(&self) -> String {
        if let Some(url) = &self.redis_url {
            return url.clone();
        }
        match &self.redis_password {
            Some(password) => format!("redis://:{password}@{}:{}", self.redis_host, self.redis_port),
            None => format!("redis://{}:{}", self.redis_host, self.redis_port),
        }
    }
}

/// Resolved runtime configuration, derived once from [`Args`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub instance_id: String,
    pub max_payload_size: usize,
    pub queue_ttl_secs: i64,
    pub max_queue_len: usize,
    pub sync_code_ttl_secs: i64,
    pub presence_ttl_secs: i64,
    pub max_tokens: f64,
    pub refill_rate: f64,
    pub cleanup_interval_secs: u64,
}

impl From<&Args> for RelayConfig {
    fn from(args: &Args) -> Self {
        Self {
            port: args.port,
            instance_id: args
                .instance_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            max_payload_size: args.max_payload_size,
            queue_ttl_secs: args.queue_ttl_secs,
            max_queue_len: args.max_queue_len,
            sync_code_ttl_secs: args.sync_code_ttl_secs,
            presence_ttl_secs: args.presence_ttl_secs,
            max_tokens: args.max_tokens,
            refill_rate: args.refill_rate,
            cleanup_interval_secs: args.cleanup_interval_secs,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            instance_id: "test-instance".to_string(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            queue_ttl_secs: DEFAULT_QUEUE_TTL_SECS,
            max_queue_len: DEFAULT_MAX_QUEUE_LEN,
            sync_code_ttl_secs: DEFAULT_SYNC_CODE_TTL_SECS,
            presence_ttl_secs: DEFAULT_PRESENCE_TTL_SECS,
            max_tokens: DEFAULT_MAX_TOKENS,
            refill_rate: DEFAULT_REFILL_RATE,
            cleanup_interval_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_constants() {
        let config = RelayConfig::default();
        assert_eq!(config.max_payload_size, 5 * 1024 * 1024);
        assert_eq!(config.queue_ttl_secs, 1800);
        assert_eq!(config.max_queue_len, 100);
        assert_eq!(config.sync_code_ttl_secs, 300);
        assert_eq!(config.max_tokens, 100.0);
        assert_eq!(config.refill_rate, 10.0);
    }

    fn base_args() -> Args {
        Args::parse_from(["relaycore"])
    }

    #[test]
    fn redis_url_takes_precedence_over_discrete_fields() {
        let mut args = base_args();
        args.redis_url = Some("redis://custom:6380".to_string());
        args.redis_host = "ignored".to_string();
        assert_eq!(args.resolved_redis_url(), "redis://custom:6380");
    }

    #[test]
    fn discrete_fields_assemble_a_url_without_a_password() {
        let mut args = base_args();
        args.redis_url = None;
        args.redis_host = "redis.internal".to_string();
        args.redis_port = 7000;
        assert_eq!(args.resolved_redis_url(), "redis://redis.internal:7000");
    }

    #[test]
    fn discrete_fields_include_the_password_when_set() {
        let mut args = base_args();
        args.redis_url = None;
        args.redis_host = "redis.internal".to_string();
        args.redis_port = 6379;
        args.redis_password = Some("hunter2".to_string());
        assert_eq!(args.resolved_redis_url(), "redis://:hunter2@redis.internal:6379");
    }
}
