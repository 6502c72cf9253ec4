//! Error taxonomy for the relay core.
//!
//! Every variant maps onto one `error_msg { kind, message }` event sent back
//! to the client that triggered it. Handlers catch at the
//! per-event boundary; nothing here unwinds the connection task.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug, Clone)]
pub enum RelayError {
    /// No identity bound to this session yet.
    #[error("no identity bound to this session")]
    Unauthenticated,

    /// Missing `to`, `payload`, or otherwise malformed event.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Payload exceeds `MAX_PAYLOAD_SIZE`.
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    /// Token bucket depleted for this session.
    #[error("rate limit exceeded")]
    RateLimited,

    /// Username collision during registration/pairing.
    #[error("username already taken")]
    UsernameTaken,

    /// Unknown or expired invite/pairing code.
    #[error("invite code is invalid or expired")]
    InvalidOrExpired,

    /// Transient failure talking to the backing store (Redis, Postgres).
    /// The caller may retry.
    #[error("backing store unavailable: {0}")]
    KvUnavailable(String),
}

impl RelayError {
    /// The machine-readable `kind` field of `error_msg`.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Unauthenticated => "unauthenticated",
            RelayError::InvalidArgument(_) => "invalid_argument",
            RelayError::TooLarge { .. } => "too_large",
            RelayError::RateLimited => "rate_limited",
            RelayError::UsernameTaken => "username_taken",
            RelayError::InvalidOrExpired => "invalid_or_expired",
            RelayError::KvUnavailable(_) => "kv_unavailable",
        }
    }
}

impl From<deadpool_redis::PoolError> for RelayError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        RelayError::KvUnavailable(e.to_string())
    }
}

impl From<redis::RedisError> for RelayError {
    fn from(e: redis::RedisError) -> Self {
        RelayError::KvUnavailable(e.to_string())
    }
}

impl From<sqlx::Error> for RelayError {
    fn from(e: sqlx::Error) -> Self {
        RelayError::KvUnavailable(e.to_string())
    }
}
