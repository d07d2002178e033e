use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{error, info, warn};
use uuid::Uuid;

use parley_types::api::Claims;
use parley_types::events::{GatewayCommand, GatewayEvent};

use crate::GatewayState;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long a fresh connection gets to present its `authenticate` frame.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle a single WebSocket connection: authenticate, register the session,
/// then pump events out and commands in until either side closes. Each
/// connection runs on its own tasks, so one slow client never stalls
/// delivery to others.
pub async fn handle_connection(socket: WebSocket, state: GatewayState) {
    let (mut sender, mut receiver) = socket.split();

    // Step 1: Wait for the authenticate command. The user id comes from the
    // validated token claims, never from anything the client asserts.
    let claims = match wait_for_authenticate(&mut receiver, &state.jwt_secret).await {
        Some(claims) => claims,
        None => {
            warn!("WebSocket client failed to authenticate, closing");
            let rejected = GatewayEvent::Error {
                error: "authentication failed".into(),
                conversation_id: None,
            };
            let _ = sender
                .send(Message::Text(serde_json::to_string(&rejected).unwrap().into()))
                .await;
            return;
        }
    };
    let user_id = claims.sub;
    let username = claims.username;

    // Step 2: Confirm, then register the session.
    let authenticated = GatewayEvent::Authenticated { user_id };
    if sender
        .send(Message::Text(serde_json::to_string(&authenticated).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    let (session_id, mut session_rx) = state.dispatcher.register_session(user_id).await;
    info!(
        "{} ({}) connected to gateway ({} live sessions)",
        username,
        user_id,
        state.dispatcher.session_count(user_id).await
    );

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward targeted events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = session_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let state_recv = state.clone();
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    match serde_json::from_str::<GatewayCommand>(&text) {
                        Ok(cmd) => {
                            handle_command(&state_recv, user_id, session_id, &username_recv, cmd)
                                .await;
                        }
                        Err(e) => {
                            warn!(
                                "{} ({}) bad command: {} -- raw: {}",
                                username_recv,
                                user_id,
                                e,
                                log_snippet(&text)
                            );
                            state_recv
                                .dispatcher
                                .send_to_session(
                                    user_id,
                                    session_id,
                                    GatewayEvent::Error {
                                        error: "malformed command".into(),
                                        conversation_id: None,
                                    },
                                )
                                .await;
                        }
                    }
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.dispatcher.unregister_session(user_id, session_id).await;
    info!("{} ({}) disconnected from gateway", username, user_id);
}

/// Head of a frame for log lines, truncated on a char boundary so multibyte
/// input can never panic the formatter.
fn log_snippet(text: &str) -> &str {
    const MAX_CHARS: usize = 200;
    match text.char_indices().nth(MAX_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

async fn wait_for_authenticate(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<Claims> {
    use jsonwebtoken::{DecodingKey, Validation, decode};

    let timeout = tokio::time::timeout(AUTH_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Authenticate { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some(token_data.claims);
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

async fn handle_command(
    state: &GatewayState,
    user_id: Uuid,
    session_id: Uuid,
    username: &str,
    cmd: GatewayCommand,
) {
    match cmd {
        GatewayCommand::Authenticate { .. } => {} // Already handled

        GatewayCommand::ChatMessage {
            conversation_id,
            body,
            attachments,
        } => {
            handle_chat_message(state, user_id, session_id, username, conversation_id, body, attachments)
                .await;
        }
    }
}

/// Authorize, persist and fan out one chat message. The send-order lock is
/// held from persistence through fanout, so two messages accepted into the
/// same conversation are always enqueued to every session in id order.
async fn handle_chat_message(
    state: &GatewayState,
    user_id: Uuid,
    session_id: Uuid,
    username: &str,
    conversation_id: Uuid,
    body: String,
    attachments: Vec<String>,
) {
    let _order = state.dispatcher.send_order().await;

    let db = state.db.clone();
    let stored = tokio::task::spawn_blocking(move || {
        db.store_chat_message(conversation_id, user_id, &body, &attachments)
    })
    .await;

    let (row, participants) = match stored {
        Ok(Ok(stored)) => stored,
        Ok(Err(e)) => {
            warn!("{} ({}) chat rejected: {}", username, user_id, e.detail());
            state
                .dispatcher
                .send_to_session(
                    user_id,
                    session_id,
                    GatewayEvent::Error {
                        error: e.to_string(),
                        conversation_id: Some(conversation_id),
                    },
                )
                .await;
            return;
        }
        Err(e) => {
            error!("spawn_blocking join error: {}", e);
            state
                .dispatcher
                .send_to_session(
                    user_id,
                    session_id,
                    GatewayEvent::Error {
                        error: "internal error".into(),
                        conversation_id: Some(conversation_id),
                    },
                )
                .await;
            return;
        }
    };

    let message = row.to_api();
    let message_id = message.id;
    let event = GatewayEvent::NewMessage {
        message: message.clone(),
    };
    let reached = state.dispatcher.fan_out(&participants, &event).await;

    // Receipts for recipients that got the frame, notification rows for
    // participants with no live session. The sender needs neither.
    let delivered: Vec<Uuid> = reached.iter().filter(|p| **p != user_id).copied().collect();
    let offline: Vec<Uuid> = participants
        .iter()
        .filter(|p| **p != user_id && !reached.contains(p))
        .copied()
        .collect();

    let db = state.db.clone();
    match tokio::task::spawn_blocking(move || db.record_delivery(&message, &delivered, &offline))
        .await
    {
        Ok(Err(e)) => warn!("Delivery bookkeeping failed for message {}: {}", message_id, e),
        Err(e) => error!("spawn_blocking join error: {}", e),
        Ok(Ok(())) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_snippet_truncates_on_char_boundaries() {
        // 300 two-byte chars: byte 200 falls mid-sequence
        let multibyte: String = "é".repeat(300);
        let snippet = log_snippet(&multibyte);
        assert_eq!(snippet.chars().count(), 200);

        let ascii = "x".repeat(300);
        assert_eq!(log_snippet(&ascii).len(), 200);

        assert_eq!(log_snippet("short"), "short");
    }
}
