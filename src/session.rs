//! Session Registry: the only piece of state that lives
//! purely in-process. Maps a local WebSocket connection to the identity
//! it has authenticated as, and back.

use dashmap::DashMap;

use crate::protocol::{Identity, SessionId};

/// In-process `session_id -> identity` and `identity -> {session_id}`
/// index, sharded internally by `DashMap`. Never touches a
/// backing store; presence across instances lives in [`crate::presence`].
#[derive(Default)]
pub struct SessionRegistry {
    by_session: DashMap<SessionId, Identity>,
    by_identity: DashMap<Identity, Vec<SessionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `session_id` to `identity`. A session may rebind to a
    /// different identity only after unbinding first (the dispatcher
    /// enforces this; the registry itself is unconditional).
    pub fn bind(&self, session_id: SessionId, identity: Identity) {
        self.by_session
            .insert(session_id.clone(), identity.clone());
        self.by_identity
            .entry(identity)
            .or_default()
            .push(session_id);
    }

    /// Remove a session on disconnect. Idempotent.
    pub fn unbind(&self, session_id: &str) {
        if let Some((_, identity)) = self.by_session.remove(session_id) {
            if let Some(mut sessions) = self.by_identity.get_mut(&identity) {
                sessions.retain(|s| s != session_id);
            }
        }
    }

    pub fn identity_of(&self, session_id: &str) -> Option<Identity> {
        self.by_session.get(session_id).map(|r| r.clone())
    }

    /// All local session IDs currently bound to `identity` — used for
    /// multi-device echo fan-out.
    pub fn enumerate_local_sessions(&self, identity: &str) -> Vec<SessionId> {
        self.by_identity
            .get(identity)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn has_local_session(&self, identity: &str) -> bool {
        self.by_identity
            .get(identity)
            .map(|r| !r.is_empty())
            .unwrap_or(false)
    }
}
