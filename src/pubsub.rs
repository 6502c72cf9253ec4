//! Pub/Sub Fan-out: cross-instance delivery when the
//! recipient's local session lives on a different relay process.
//!
//! Every instance publishes to `deliver.{identity}` and holds one
//! long-lived subscriber connection pattern-subscribed to `deliver.*`.
//! A message published by instance A reaches instance B's subscriber
//! loop, which attempts local delivery and falls back to the queue if
//! the recipient isn't actually local anymore (e.g. disconnected
//! between the presence check and delivery).

use async_trait::async_trait;
use deadpool_redis::redis::AsyncCommands;
use deadpool_redis::Pool;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::protocol::{Envelope, Identity};

fn channel_for(identity: &str) -> String {
    format!("deliver.{identity}")
}

/// What travels over `deliver.{identity}`. A relayed envelope falls back
/// to the queue if the remote subscriber finds no local session; an ack
/// is best-effort only and is dropped silently on a miss.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FanoutMessage {
    Relay(Envelope),
    /// `to` is the delivery target — the original sender of the message
    /// being acknowledged, who is expected to hold the local session on
    /// the subscribing instance. `from` is the acker's own identity,
    /// carried through unchanged into the `MsgAckPush` the target sees.
    Ack {
        to: Identity,
        from: Identity,
        msg_id: String,
    },
}

#[async_trait]
pub trait Fanout: Send + Sync {
    /// Publish `message` for delivery to `identity` on whichever instance
    /// currently holds its local session.
    async fn publish(&self, identity: &str, message: &FanoutMessage) -> Result<()>;
}

pub struct RedisFanout {
    pool: Pool,
}

impl RedisFanout {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Fanout for RedisFanout {
    async fn publish(&self, identity: &str, message: &FanoutMessage) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let payload = serde_json::to_string(message)
            .map_err(|e| crate::error::RelayError::InvalidArgument(e.to_string()))?;
        let _: i64 = conn.publish(channel_for(identity), payload).await?;
        Ok(())
    }
}

/// Runs the long-lived `PSUBSCRIBE deliver.*` loop for this instance.
/// `on_message` receives every message published for a local identity
/// and is responsible for local delivery / queue fallback — mirrors the dispatcher's own delivery logic so a message
/// arriving via fan-out is handled identically to one relayed directly.
pub async fn run_subscriber<F, Fut>(redis_url: &str, on_message: F)
where
    F: Fn(FanoutMessage) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    loop {
        match subscribe_once(redis_url, &on_message).await {
            Ok(()) => {}
            Err(e) => warn!(error = %e, "pub/sub subscriber connection lost, reconnecting"),
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
}

async fn subscribe_once<F, Fut>(redis_url: &str, on_message: &F) -> Result<()>
where
    F: Fn(FanoutMessage) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send,
{
    let client = redis::Client::open(redis_url)
        .map_err(|e| crate::error::RelayError::KvUnavailable(e.to_string()))?;
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| crate::error::RelayError::KvUnavailable(e.to_string()))?;
    pubsub
        .psubscribe("deliver.*")
        .await
        .map_err(|e| crate::error::RelayError::KvUnavailable(e.to_string()))?;

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed pub/sub payload");
                continue;
            }
        };
        match serde_json::from_str::<FanoutMessage>(&payload) {
            Ok(message) => {
                debug!("received fan-out message");
                on_message(message).await;
            }
            Err(e) => warn!(error = %e, "failed to decode fan-out message"),
        }
    }
    Ok(())
}

/// In-memory fan-out used by tests: records published messages instead
/// of going over the network, since a single-process test has no second
/// instance to deliver to.
#[derive(Default)]
pub struct NullFanout {
    pub published: std::sync::Mutex<Vec<(String, FanoutMessage)>>,
}

impl NullFanout {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Fanout for NullFanout {
    async fn publish(&self, identity: &str, message: &FanoutMessage) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((identity.to_string(), message.clone()));
        Ok(())
    }
}
