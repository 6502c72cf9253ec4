//! Relay Dispatcher and shared server state.
//!
//! `RelayState` is the process-wide singleton every connection handler
//! is given a clone of (it is `Arc`-backed internally, cheap to clone).
//! It owns the local, in-process pieces — the session registry and each
//! session's outbound channel / rate bucket — and holds handles to the
//! shared, cross-instance collaborators (presence, queue, invites,
//! accounts, safety log, fan-out) behind their trait objects so Redis
//! and Postgres never leak past this module's boundary.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::accountstore::AccountStore;
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::pairing::InviteStore;
use crate::presence::{PresenceStore, SessionRef};
use crate::protocol::{
    DispatchStatus, Envelope, EnvelopeKind, Identity, Payload, PresenceStatus, RegistrationType,
    ServerMessage, SessionId,
};
use crate::pubsub::{Fanout, FanoutMessage};
use crate::queue::{MessageQueue, PushOutcome};
use crate::ratelimit::RateBucket;
use crate::safety::SafetyLog;
use crate::session::SessionRegistry;

/// A connected client's outbound channel.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

/// Local, in-process per-connection bookkeeping: the outbound channel
/// and the rate-limiter bucket.
struct Conn {
    sender: ClientSender,
    rate_bucket: Mutex<RateBucket>,
}

/// Shared server state and the seat of the Relay Dispatcher's logic.
#[derive(Clone)]
pub struct RelayState {
    registry: Arc<SessionRegistry>,
    conns: Arc<DashMap<SessionId, Conn>>,
    presence: Arc<dyn PresenceStore>,
    queue: Arc<dyn MessageQueue>,
    invites: Arc<dyn InviteStore>,
    accounts: Arc<dyn AccountStore>,
    safety: Arc<dyn SafetyLog>,
    fanout: Arc<dyn Fanout>,
    pub config: RelayConfig,
}

impl RelayState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RelayConfig,
        presence: Arc<dyn PresenceStore>,
        queue: Arc<dyn MessageQueue>,
        invites: Arc<dyn InviteStore>,
        accounts: Arc<dyn AccountStore>,
        safety: Arc<dyn SafetyLog>,
        fanout: Arc<dyn Fanout>,
    ) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            conns: Arc::new(DashMap::new()),
            presence,
            queue,
            invites,
            accounts,
            safety,
            fanout,
            config,
        }
    }

    // ── Connection lifecycle ──────────────────────────────────────────────

    /// Register a freshly-accepted transport connection. It has no
    /// identity yet — that happens on `register_master` / `link_pc`.
    pub fn connect(&self, session_id: SessionId, sender: ClientSender) {
        self.conns.insert(
            session_id,
            Conn {
                sender,
                rate_bucket: Mutex::new(RateBucket::new(self.config.max_tokens, self.config.refill_rate)),
            },
        );
    }

    /// Tear down a connection.
    /// Marks the identity offline if this was its last local session —
    /// see the module-level note on the presence/disconnect tradeoff.
    pub async fn disconnect(&self, session_id: &str) {
        self.conns.remove(session_id);
        let identity = self.registry.identity_of(session_id);
        self.registry.unbind(session_id);
        if let Some(identity) = identity {
            if !self.registry.has_local_session(&identity) {
                if let Err(e) = self.presence.set_offline(&identity).await {
                    tracing::warn!(identity = %identity, error = %e, "failed to clear presence on disconnect");
                }
            }
        }
    }

    /// Send a response directly to the session that asked for it — used
    /// by the connection handler for every request/response transport
    /// event, as opposed to [`Self::emit_to_identity`] which
    /// fans out to every local session of a recipient identity.
    pub fn reply(&self, session_id: &str, message: ServerMessage) -> bool {
        self.emit(session_id, message)
    }

    fn emit(&self, session_id: &str, message: ServerMessage) -> bool {
        self.conns
            .get(session_id)
            .map(|c| c.sender.send(message).is_ok())
            .unwrap_or(false)
    }

    /// Deliver `message` to every local session bound to `identity`.
    /// Returns `true` if at least one local session accepted it.
    fn emit_to_identity(&self, identity: &str, message: ServerMessage) -> bool {
        let mut delivered = false;
        for session_id in self.registry.enumerate_local_sessions(identity) {
            if self.emit(&session_id, message.clone()) {
                delivered = true;
            }
        }
        delivered
    }

    // ── Registration / pairing ────────────────────────────

    pub async fn get_salt(&self, username: &str) -> Result<ServerMessage> {
        match self.accounts.lookup_salt(username).await? {
            Some(record) => Ok(ServerMessage::SaltFound {
                identity: record.identity,
                salt: record.salt,
                kdf_params: record.kdf_params,
                public_key: record.public_key,
            }),
            None => Ok(ServerMessage::SaltNotFound),
        }
    }

    /// Bind `session_id` to `identity` as the primary device, registering
    /// a brand-new account when `username` is supplied. Always flushes
    /// the identity's queue.
    pub async fn register_master(
        &self,
        session_id: &str,
        identity: &str,
        username: Option<&str>,
        salt: Option<&str>,
        kdf_params: Option<&serde_json::Value>,
        public_key: Option<&str>,
    ) -> Result<(ServerMessage, Option<ServerMessage>)> {
        if let Some(username) = username {
            if self.accounts.username_exists(username).await? {
                return Err(RelayError::UsernameTaken);
            }
            let salt = salt.ok_or_else(|| RelayError::InvalidArgument("missing salt".into()))?;
            let kdf_params = kdf_params
                .cloned()
                .ok_or_else(|| RelayError::InvalidArgument("missing kdf_params".into()))?;
            self.accounts
                .register(identity, username, salt, &kdf_params, public_key)
                .await?;
        }

        let flushed = self.bind_and_flush(session_id, identity).await?;
        let registered = ServerMessage::Registered {
            kind: RegistrationType::Master,
            identity: identity.to_string(),
        };
        let flush_event = (!flushed.is_empty()).then_some(ServerMessage::QueueFlush { envelopes: flushed });
        Ok((registered, flush_event))
    }

    /// Issue a pairing code for the identity bound to `session_id`
    ///.
    pub async fn create_invite_code(&self, session_id: &str) -> Result<ServerMessage> {
        let identity = self
            .registry
            .identity_of(session_id)
            .ok_or(RelayError::Unauthenticated)?;
        let (code, expires_at) = self
            .invites
            .create_invite(&identity, self.config.sync_code_ttl_secs)
            .await?;
        Ok(ServerMessage::InviteCodeCreated { code, expires_at })
    }

    /// Resolve a pairing code to the account material needed to finish
    /// enrolling a secondary device.
    pub async fn resolve_invite_code(&self, code: &str) -> ServerMessage {
        match self.resolve_invite_inner(code).await {
            Ok(msg) => msg,
            Err(e) => ServerMessage::InviteCodeError { message: e.to_string() },
        }
    }

    async fn resolve_invite_inner(&self, code: &str) -> Result<ServerMessage> {
        let identity = self.invites.resolve_invite(code).await?;
        let record = self
            .accounts
            .lookup_by_identity(&identity)
            .await?
            .ok_or(RelayError::InvalidOrExpired)?;
        Ok(ServerMessage::InviteCodeResolved {
            identity: record.identity,
            username: Some(record.username),
            salt: record.salt,
            kdf_params: record.kdf_params,
        })
    }

    /// Validate a pairing code and bind this session as a secondary
    /// device on the same identity.
    pub async fn link_pc(&self, session_id: &str, code: &str) -> Result<(ServerMessage, Option<ServerMessage>)> {
        let identity = self.invites.resolve_invite(code).await?;
        let flushed = self.bind_and_flush(session_id, &identity).await?;
        let registered = ServerMessage::Registered {
            kind: RegistrationType::Slave,
            identity,
        };
        let flush_event = (!flushed.is_empty()).then_some(ServerMessage::QueueFlush { envelopes: flushed });
        Ok((registered, flush_event))
    }

    /// Shared by `register_master` and `link_pc`: bind the local session,
    /// publish presence, and flush any envelopes queued while the
    /// identity had no live session anywhere.
    async fn bind_and_flush(&self, session_id: &str, identity: &str) -> Result<Vec<Envelope>> {
        self.registry.bind(session_id.to_string(), identity.to_string());
        let session_ref = SessionRef::new(self.config.instance_id.clone(), session_id.to_string());
        self.presence
            .set_online(identity, &session_ref, self.config.presence_ttl_secs)
            .await?;
        let now = Utc::now().timestamp();
        let envelopes = self.queue.flush(identity, now).await?;
        Ok(envelopes)
    }

    // ── Relay dispatch ─────────────────────────────────────────

    /// The central operation: route an opaque payload from `from_session`
    /// to `to` — rate-limit, size-check, deliver-or-queue, then echo to
    /// the sender's other local sessions.
    pub async fn relay(
        &self,
        from_session: &str,
        to: &str,
        msg_id: String,
        payload: Payload,
    ) -> Result<DispatchStatus> {
        let from = self
            .registry
            .identity_of(from_session)
            .ok_or(RelayError::Unauthenticated)?;

        let admitted = self
            .conns
            .get(from_session)
            .ok_or(RelayError::Unauthenticated)?
            .rate_bucket
            .lock()
            .unwrap()
            .try_consume();
        if !admitted {
            return Err(RelayError::RateLimited);
        }

        let size = payload.size();
        if size > self.config.max_payload_size {
            return Err(RelayError::TooLarge {
                size,
                limit: self.config.max_payload_size,
            });
        }

        let envelope = Envelope {
            msg_id,
            from: from.clone(),
            to: to.to_string(),
            payload,
            timestamp: Utc::now().timestamp_millis(),
            kind: EnvelopeKind::Direct,
        };

        let status = self.deliver_or_queue(to, envelope.clone()).await?;
        self.echo_fanout(from_session, &from, &envelope).await;

        tracing::info!(
            sender = %from,
            recipient = %to,
            size,
            timestamp = envelope.timestamp,
            "relay dispatched"
        );

        Ok(status)
    }

    /// Look up the recipient's presence and either deliver locally,
    /// publish for a remote instance to pick up, or queue for later.
    async fn deliver_or_queue(&self, to: &str, envelope: Envelope) -> Result<DispatchStatus> {
        match self.presence.lookup(to).await? {
            None => self.push_to_queue(to, envelope).await,
            Some(r) if r.instance_id == self.config.instance_id => {
                if self.emit_to_identity(to, ServerMessage::RelayPush { envelope: envelope.clone() }) {
                    Ok(DispatchStatus::Delivered)
                } else {
                    // Presence said local, but the session is gone —
                    // the lookup-then-emit race. Close it by
                    // queueing instead of silently dropping.
                    self.push_to_queue(to, envelope).await
                }
            }
            Some(_remote) => {
                self.fanout.publish(to, &FanoutMessage::Relay(envelope)).await?;
                Ok(DispatchStatus::Delivered)
            }
        }
    }

    async fn push_to_queue(&self, to: &str, envelope: Envelope) -> Result<DispatchStatus> {
        let outcome = self
            .queue
            .push(to, envelope, self.config.queue_ttl_secs, self.config.max_queue_len)
            .await?;
        Ok(match outcome {
            PushOutcome::Queued => DispatchStatus::Queued,
            PushOutcome::Dropped => DispatchStatus::Dropped,
        })
    }

    /// Echo the sent envelope to the sender's *other* local sessions,
    /// excluding the originating one. Echoes are always best-effort and
    /// are never queued.
    async fn echo_fanout(&self, from_session: &str, from: &str, envelope: &Envelope) {
        let echo = Envelope {
            kind: EnvelopeKind::Echo,
            ..envelope.clone()
        };
        for session_id in self.registry.enumerate_local_sessions(from) {
            if session_id == from_session {
                continue;
            }
            self.emit(&session_id, ServerMessage::RelayPush { envelope: echo.clone() });
        }
    }

    /// ACK path: `to` is the *original sender* of the
    /// message being acknowledged. Best-effort, never queued.
    pub async fn msg_ack(&self, from_session: &str, to: &str, msg_id: String) -> Result<()> {
        let from = self
            .registry
            .identity_of(from_session)
            .ok_or(RelayError::Unauthenticated)?;

        match self.presence.lookup(to).await? {
            Some(r) if r.instance_id == self.config.instance_id => {
                let message = ServerMessage::MsgAckPush { from, msg_id };
                self.emit_to_identity(to, message);
            }
            Some(_remote) => {
                let fanout_msg = FanoutMessage::Ack {
                    to: to.to_string(),
                    from,
                    msg_id,
                };
                let _ = self.fanout.publish(to, &fanout_msg).await;
            }
            None => {
                // Nobody reachable — acks are best-effort, drop silently.
            }
        }
        Ok(())
    }

    pub async fn get_presence(&self, identity: &str) -> Result<ServerMessage> {
        let online = self.presence.is_online(identity).await?;
        Ok(ServerMessage::PresenceUpdate {
            identity: identity.to_string(),
            status: if online { PresenceStatus::Online } else { PresenceStatus::Offline },
        })
    }

    // ── Social safety (delegated) ───────────────────────────────────────────

    pub async fn block_user(&self, session_id: &str, target: &str, reason: Option<&str>) -> Result<ServerMessage> {
        let actor = self
            .registry
            .identity_of(session_id)
            .ok_or(RelayError::Unauthenticated)?;
        self.safety.block(&actor, target, reason).await?;
        Ok(ServerMessage::Blocked { identity: target.to_string() })
    }

    pub async fn report_user(&self, session_id: &str, target: &str, reason: Option<&str>) -> Result<ServerMessage> {
        let actor = self
            .registry
            .identity_of(session_id)
            .ok_or(RelayError::Unauthenticated)?;
        self.safety.report(&actor, target, reason).await?;
        Ok(ServerMessage::Reported { identity: target.to_string() })
    }

    // ── Fan-out inbound ─────────────────────────────────────────

    /// Handles a message this instance's subscriber received over its
    /// fan-out channel: attempt local delivery, falling back to the queue
    /// for a relayed envelope that no longer has a local target (the
    /// lookup-then-emit race). Acks never fall back.
    pub async fn handle_fanout_message(&self, message: FanoutMessage) {
        match message {
            FanoutMessage::Relay(envelope) => {
                let to = envelope.to.clone();
                if self.emit_to_identity(&to, ServerMessage::RelayPush { envelope: envelope.clone() }) {
                    return;
                }
                if let Err(e) = self.push_to_queue(&to, envelope).await {
                    tracing::warn!(identity = %to, error = %e, "failed to queue fanned-out envelope");
                }
            }
            FanoutMessage::Ack { to, from, msg_id } => {
                self.emit_to_identity(&to, ServerMessage::MsgAckPush { from, msg_id });
            }
        }
    }

    // ── Observability ────────────────────────────────────────────────────

    pub fn online_local_sessions(&self) -> usize {
        self.conns.len()
    }

    pub fn local_identity_of(&self, session_id: &str) -> Option<Identity> {
        self.registry.identity_of(session_id)
    }

    /// Periodic housekeeping hook. Presence, queue, and invite expiry all
    /// live in Redis key TTLs, so there is no local state to sweep — this
    /// just surfaces a heartbeat into the logs so an operator can see the
    /// instance is alive and how many sessions it's carrying.
    pub fn cleanup_expired(&self) {
        tracing::debug!(
            instance_id = %self.config.instance_id,
            local_sessions = self.online_local_sessions(),
            "housekeeping tick"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accountstore::InMemoryAccountStore;
    use crate::pairing::InMemoryInviteStore;
    use crate::presence::InMemoryPresenceStore;
    use crate::pubsub::NullFanout;
    use crate::queue::InMemoryMessageQueue;
    use crate::safety::TracingSafetyLog;

    fn test_state() -> RelayState {
        RelayState::new(
            RelayConfig::default(),
            Arc::new(InMemoryPresenceStore::new()),
            Arc::new(InMemoryMessageQueue::new()),
            Arc::new(InMemoryInviteStore::new()),
            Arc::new(InMemoryAccountStore::new()),
            Arc::new(TracingSafetyLog),
            Arc::new(NullFanout::new()),
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn online_direct_relay_between_two_registered_sessions() {
        let state = test_state();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        state.connect("s1".to_string(), tx_a);
        state.connect("s2".to_string(), tx_b);
        state.register_master("s1", "u1", None, None, None, None).await.unwrap();
        state.register_master("s2", "u2", None, None, None, None).await.unwrap();

        let status = state
            .relay("s1", "u2", "m1".to_string(), Payload::Text("hi".to_string()))
            .await
            .unwrap();
        assert_eq!(status, DispatchStatus::Delivered);

        let received = drain(&mut rx_b);
        assert_eq!(received.len(), 1);
        match &received[0] {
            ServerMessage::RelayPush { envelope } => {
                assert_eq!(envelope.from, "u1");
                assert_eq!(envelope.to, "u2");
                assert_eq!(envelope.msg_id, "m1");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn offline_relay_queues_then_flushes_on_register() {
        let state = test_state();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        state.connect("s1".to_string(), tx_a);
        state.register_master("s1", "u1", None, None, None, None).await.unwrap();

        let status = state
            .relay("s1", "u2", "m2".to_string(), Payload::Text("later".to_string()))
            .await
            .unwrap();
        assert_eq!(status, DispatchStatus::Queued);

        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        state.connect("s2".to_string(), tx_b);
        let (_registered, flush) = state.register_master("s2", "u2", None, None, None, None).await.unwrap();
        match flush {
            Some(ServerMessage::QueueFlush { envelopes }) => {
                assert_eq!(envelopes.len(), 1);
                assert_eq!(envelopes[0].msg_id, "m2");
            }
            other => panic!("expected a queue flush, got {other:?}"),
        }
        assert!(drain(&mut rx_b).is_empty());
        let _ = &mut rx_a;
    }

    #[tokio::test]
    async fn queue_overflow_drops_the_newest_message() {
        let mut state = test_state();
        state.config.max_queue_len = 3;
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        state.connect("s1".to_string(), tx_a);
        state.register_master("s1", "u1", None, None, None, None).await.unwrap();

        for i in 0..3 {
            let status = state
                .relay("s1", "u2", format!("m{i}"), Payload::Text("x".to_string()))
                .await
                .unwrap();
            assert_eq!(status, DispatchStatus::Queued);
        }
        let status = state
            .relay("s1", "u2", "overflow".to_string(), Payload::Text("x".to_string()))
            .await
            .unwrap();
        assert_eq!(status, DispatchStatus::Dropped);
    }

    #[tokio::test]
    async fn echo_reaches_secondary_device_not_the_originating_session() {
        let state = test_state();
        let (tx_s1, mut rx_s1) = mpsc::unbounded_channel();
        let (tx_s2, mut rx_s2) = mpsc::unbounded_channel();
        state.connect("s1".to_string(), tx_s1);
        state.connect("s2".to_string(), tx_s2);
        state.register_master("s1", "u1", None, None, None, None).await.unwrap();
        state.registry.bind("s2".to_string(), "u1".to_string());

        state
            .relay("s1", "u2", "m1".to_string(), Payload::Text("hi".to_string()))
            .await
            .unwrap();

        let s2_msgs = drain(&mut rx_s2);
        assert_eq!(s2_msgs.len(), 1);
        match &s2_msgs[0] {
            ServerMessage::RelayPush { envelope } => assert_eq!(envelope.kind, EnvelopeKind::Echo),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(drain(&mut rx_s1).is_empty());
    }

    #[tokio::test]
    async fn disconnect_clears_presence_when_last_local_session_leaves() {
        let state = test_state();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        state.connect("s1".to_string(), tx_a);
        state.register_master("s1", "u1", None, None, None, None).await.unwrap();

        let presence = state.get_presence("u1").await.unwrap();
        assert!(matches!(presence, ServerMessage::PresenceUpdate { status: PresenceStatus::Online, .. }));

        state.disconnect("s1").await;
        let presence = state.get_presence("u1").await.unwrap();
        assert!(matches!(presence, ServerMessage::PresenceUpdate { status: PresenceStatus::Offline, .. }));
    }

    #[tokio::test]
    async fn relay_without_registration_is_unauthenticated() {
        let state = test_state();
        let (tx, _rx) = mpsc::unbounded_channel();
        state.connect("s1".to_string(), tx);
        let err = state
            .relay("s1", "u2", "m1".to_string(), Payload::Text("hi".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unauthenticated");
    }

    #[tokio::test]
    async fn payload_over_limit_is_rejected() {
        let mut state = test_state();
        state.config.max_payload_size = 4;
        let (tx, _rx) = mpsc::unbounded_channel();
        state.connect("s1".to_string(), tx);
        state.register_master("s1", "u1", None, None, None, None).await.unwrap();
        let err = state
            .relay("s1", "u2", "m1".to_string(), Payload::Text("too long".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "too_large");
    }

    #[tokio::test]
    async fn rate_limit_denies_once_bucket_is_depleted() {
        let mut state = test_state();
        state.config.max_tokens = 2.0;
        state.config.refill_rate = 0.0;
        let (tx, _rx) = mpsc::unbounded_channel();
        state.connect("s1".to_string(), tx);
        state.register_master("s1", "u1", None, None, None, None).await.unwrap();

        for _ in 0..2 {
            state
                .relay("s1", "u2", "m".to_string(), Payload::Text("x".to_string()))
                .await
                .unwrap();
        }
        let err = state
            .relay("s1", "u2", "m3".to_string(), Payload::Text("x".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "rate_limited");
    }

    #[tokio::test]
    async fn invite_code_pairs_a_secondary_device() {
        let state = test_state();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        state.connect("s1".to_string(), tx_a);
        state.register_master("s1", "u1", None, None, None, None).await.unwrap();

        let created = state.create_invite_code("s1").await.unwrap();
        let code = match created {
            ServerMessage::InviteCodeCreated { code, .. } => code,
            other => panic!("unexpected: {other:?}"),
        };

        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        state.connect("s2".to_string(), tx_b);
        let (registered, _flush) = state.link_pc("s2", &code).await.unwrap();
        match registered {
            ServerMessage::Registered { kind: RegistrationType::Slave, identity } => {
                assert_eq!(identity, "u1");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(state.local_identity_of("s2"), Some("u1".to_string()));
    }

    #[tokio::test]
    async fn username_collision_is_rejected() {
        let state = test_state();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        state.connect("s1".to_string(), tx_a);
        state
            .register_master("s1", "u1", Some("alice"), Some("salt"), Some(&serde_json::json!({})), None)
            .await
            .unwrap();

        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        state.connect("s2".to_string(), tx_b);
        let err = state
            .register_master("s2", "u2", Some("alice"), Some("salt"), Some(&serde_json::json!({})), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "username_taken");
    }
}
