//! WebSocket connection handler.
//!
//! Each connection gets a freshly-minted local session id and is handed
//! to [`RelayState`] as soon as the transport upgrade completes — the
//! session exists (and can be rate-limited) before any identity is
//! bound to it, which is why `get_salt` and `register_master` can run
//! pre-auth while `relay`/`msg_ack`/etc. require a bound identity.
//!
//! Handlers run concurrently across sessions; within one session every
//! event is processed sequentially off a single `StreamExt::next` loop,
//! with one callback-style handler per client event type.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::RelayState;

/// Handle a single WebSocket connection for its entire lifetime.
pub async fn handle_websocket(socket: WebSocket, state: RelayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let session_id = Uuid::new_v4().to_string();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    state.connect(session_id.clone(), tx);
    tracing::debug!(session_id = %session_id, "connection accepted");

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!(error = %e, "failed to serialize server message"),
            }
        }
    });

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => dispatch(&state, &session_id, msg).await,
                Err(e) => {
                    state.reply(
                        &session_id,
                        ServerMessage::ErrorMsg {
                            kind: "invalid_argument".to_string(),
                            message: format!("malformed event: {e}"),
                        },
                    );
                }
            },
            Ok(Message::Binary(_)) => {
                // Payloads travel base64-encoded inside a JSON text frame
                // — a raw binary frame is not a valid event.
                state.reply(
                    &session_id,
                    ServerMessage::ErrorMsg {
                        kind: "invalid_argument".to_string(),
                        message: "binary frames are not a recognized event".to_string(),
                    },
                );
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) | Err(_) => break,
        }
    }

    state.disconnect(&session_id).await;
    sender_task.abort();
    tracing::debug!(session_id = %session_id, "connection closed");
}

/// Dispatch one parsed client event to the matching [`RelayState`]
/// operation and reply to the originating session` returning `{ok | err(kind, msg)}`).
async fn dispatch(state: &RelayState, session_id: &str, msg: ClientMessage) {
    match msg {
        ClientMessage::GetSalt { username } => {
            let reply = state.get_salt(&username).await.unwrap_or_else(error_reply);
            state.reply(session_id, reply);
        }

        ClientMessage::RegisterMaster {
            identity,
            username,
            salt,
            kdf_params,
            public_key,
        } => {
            match state
                .register_master(
                    session_id,
                    &identity,
                    username.as_deref(),
                    salt.as_deref(),
                    kdf_params.as_ref(),
                    public_key.as_deref(),
                )
                .await
            {
                Ok((registered, flush)) => {
                    state.reply(session_id, registered);
                    if let Some(flush) = flush {
                        state.reply(session_id, flush);
                    }
                }
                Err(e) => {
                    state.reply(session_id, error_reply(e));
                }
            }
        }

        ClientMessage::CreateInviteCode => {
            match state.create_invite_code(session_id).await {
                Ok(reply) => state.reply(session_id, reply),
                Err(e) => state.reply(session_id, error_reply(e)),
            };
        }

        ClientMessage::ResolveInviteCode { code } => {
            let reply = state.resolve_invite_code(&code).await;
            state.reply(session_id, reply);
        }

        ClientMessage::LinkPc { code } => match state.link_pc(session_id, &code).await {
            Ok((registered, flush)) => {
                state.reply(session_id, registered);
                if let Some(flush) = flush {
                    state.reply(session_id, flush);
                }
            }
            Err(e) => {
                state.reply(session_id, error_reply(e));
            }
        },

        ClientMessage::Relay { msg_id, to, payload } => {
            match state.relay(session_id, &to, msg_id.clone(), payload).await {
                Ok(status) => {
                    state.reply(session_id, ServerMessage::DispatchStatus { to, msg_id, status });
                }
                Err(e) => {
                    state.reply(session_id, error_reply(e));
                }
            }
        }

        ClientMessage::MsgAck { to, msg_id } => {
            if let Err(e) = state.msg_ack(session_id, &to, msg_id).await {
                state.reply(session_id, error_reply(e));
            }
        }

        ClientMessage::GetPresence { identity } => {
            let reply = state.get_presence(&identity).await.unwrap_or_else(error_reply);
            state.reply(session_id, reply);
        }

        ClientMessage::BlockUser { identity, reason } => {
            match state.block_user(session_id, &identity, reason.as_deref()).await {
                Ok(reply) => state.reply(session_id, reply),
                Err(e) => state.reply(session_id, error_reply(e)),
            };
        }

        ClientMessage::ReportUser { identity, reason } => {
            match state.report_user(session_id, &identity, reason.as_deref()).await {
                Ok(reply) => state.reply(session_id, reply),
                Err(e) => state.reply(session_id, error_reply(e)),
            };
        }

        ClientMessage::Ping => {
            state.reply(session_id, ServerMessage::Pong);
        }
    }
}

/// Every error surfaces to the client as a single `error_msg { kind, message }`.
fn error_reply(e: crate::error::RelayError) -> ServerMessage {
    ServerMessage::ErrorMsg {
        kind: e.kind().to_string(),
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_reply_carries_machine_kind_and_message() {
        let reply = error_reply(crate::error::RelayError::RateLimited);
        match reply {
            ServerMessage::ErrorMsg { kind, .. } => assert_eq!(kind, "rate_limited"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
