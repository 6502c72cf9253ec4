//! Safety Log: the external collaborator behind `block_user`/
//! `report_user`. The relay core's only obligation is to record the
//! action and never re-deliver from a blocked sender — moderation
//! workflow lives outside this crate.

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;

#[async_trait]
pub trait SafetyLog: Send + Sync {
    async fn block(&self, actor: &str, target: &str, reason: Option<&str>) -> Result<()>;
    async fn report(&self, actor: &str, target: &str, reason: Option<&str>) -> Result<()>;
}

/// Emits structured `tracing` events rather than writing its own store —
/// the actual moderation system consumes these out-of-process.
pub struct TracingSafetyLog;

#[async_trait]
impl SafetyLog for TracingSafetyLog {
    async fn block(&self, actor: &str, target: &str, reason: Option<&str>) -> Result<()> {
        info!(actor, target, reason, event = "block_user", "safety action recorded");
        Ok(())
    }

    async fn report(&self, actor: &str, target: &str, reason: Option<&str>) -> Result<()> {
        info!(actor, target, reason, event = "report_user", "safety action recorded");
        Ok(())
    }
}
