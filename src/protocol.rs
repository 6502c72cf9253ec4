//! Wire protocol: one JSON-framed event per WebSocket message (binary
//! payloads travel base64-encoded inside the `text` or `binary` payload
//! variant, never as a raw WebSocket binary frame — see [`Payload`]).
//!
//! The relay never inspects payload bytes; it only routes, queues, and
//! echoes them. `Envelope` and `Payload` must round-trip through the
//! message queue without re-encoding.

use serde::{Deserialize, Serialize};

pub type Identity = String;
pub type SessionId = String;

// ── Opaque payload ────────────────────────────────────────────────────────────

/// A client payload, opaque to the relay. Preserves its variant through
/// queue round-trips — a binary blob is never re-encoded as text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "encoding", rename_all = "snake_case")]
pub enum Payload {
    Binary(#[serde(with = "base64_bytes")] Vec<u8>),
    Text(String),
    Structured(serde_json::Value),
}

impl Payload {
    /// Size in bytes, used for the `MAX_PAYLOAD_SIZE` check.
    pub fn size(&self) -> usize {
        match self {
            Payload::Binary(b) => b.len(),
            Payload::Text(s) => s.len(),
            Payload::Structured(v) => serde_json::to_vec(v).map(|b| b.len()).unwrap_or(0),
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

// ── Envelope ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Direct,
    Echo,
}

/// `{ msg_id, from, to, payload, timestamp, kind }`.
/// `msg_id` is client-chosen and opaque to the core — used only for ACK
/// correlation and client-side dedup. No ordering is promised between
/// distinct `msg_id`s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_id: String,
    pub from: Identity,
    pub to: Identity,
    pub payload: Payload,
    pub timestamp: i64,
    pub kind: EnvelopeKind,
}

/// `(envelope, expires_at)` — one entry in a per-recipient queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedItem {
    pub envelope: Envelope,
    pub expires_at: i64,
}

impl QueuedItem {
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }
}

// ── Client → Relay ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Resolve a username to its KDF salt before any identity is bound.
    GetSalt { username: String },

    /// Bind this session to an identity as the primary/master device.
    /// `username`/`salt`/`kdf_params`/`public_key` are present only when
    /// registering a brand-new identity (delegated to the account store).
    RegisterMaster {
        identity: Identity,
        username: Option<String>,
        salt: Option<String>,
        kdf_params: Option<serde_json::Value>,
        public_key: Option<String>,
    },

    /// Issue a short-lived pairing code for this identity.
    CreateInviteCode,

    /// Resolve an invite code's bound identity/account material.
    ResolveInviteCode { code: String },

    /// Bind this session to the identity owning `code` as a secondary
    /// device.
    LinkPc { code: String },

    /// Relay an opaque payload to another identity.
    Relay {
        msg_id: String,
        to: Identity,
        payload: Payload,
    },

    /// Acknowledge receipt of a previously relayed message.
    MsgAck { to: Identity, msg_id: String },

    /// Query whether an identity is currently online.
    GetPresence { identity: Identity },

    /// Block a user (delegated to the external safety log).
    BlockUser {
        identity: Identity,
        reason: Option<String>,
    },

    /// Report a user (delegated to the external safety log).
    ReportUser {
        identity: Identity,
        reason: Option<String>,
    },

    /// Application-level keepalive.
    Ping,
}

// ── Relay → Client ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Delivered,
    Queued,
    Dropped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationType {
    Master,
    Slave,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerMessage {
    SaltFound {
        identity: Identity,
        salt: String,
        kdf_params: serde_json::Value,
        public_key: Option<String>,
    },
    SaltNotFound,

    Registered {
        #[serde(rename = "type")]
        kind: RegistrationType,
        identity: Identity,
    },

    /// Queued envelopes flushed to a session on reconnect,
    /// delivered as a single batch event in FIFO order.
    QueueFlush { envelopes: Vec<Envelope> },

    InviteCodeCreated { code: String, expires_at: i64 },
    InviteCodeResolved {
        identity: Identity,
        username: Option<String>,
        salt: String,
        kdf_params: serde_json::Value,
    },
    InviteCodeError { message: String },

    DispatchStatus {
        to: Identity,
        msg_id: String,
        status: DispatchStatus,
    },

    /// A relayed message, delivered to the recipient or to an echo target.
    RelayPush {
        #[serde(flatten)]
        envelope: Envelope,
    },

    MsgAckPush { from: Identity, msg_id: String },

    PresenceUpdate {
        identity: Identity,
        status: PresenceStatus,
    },

    Blocked { identity: Identity },
    Reported { identity: Identity },

    Pong,

    /// `{kind, message}` — the sole error channel.
    ErrorMsg { kind: String, message: String },
}
