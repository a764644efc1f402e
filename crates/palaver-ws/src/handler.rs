use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use palaver_core::error::CoreError;
use palaver_core::events::ServerEvent;
use palaver_core::{
    auth, conversation, delivery, message, sidebar, visibility, AppConfig, AppState,
};
use palaver_models::conversation::ConversationKind;
use palaver_models::gateway::*;
use serde_json::{json, Value};
use std::num::NonZeroU32;
use std::sync::OnceLock;
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::session::Session;

const HEARTBEAT_INTERVAL_MS: u64 = 41250;
const HEARTBEAT_TIMEOUT_MS: u64 = 90000;
const IDENTIFY_TIMEOUT_SECS: u64 = 30;
const HEARTBEAT_ACK_MSG: &str = r#"{"op":11}"#;
const HELLO_MSG_PREFIX: &str = r#"{"op":10,"d":{"heartbeat_interval":"#;
const HELLO_MSG_SUFFIX: &str = r#"}}"#;

/// User-level rate limiters shared across connections. Heartbeats are never
/// rate limited; typing events have their own, stricter bucket.
struct UserRateLimits {
    messages: DefaultKeyedRateLimiter<i64>,
    typing: DefaultKeyedRateLimiter<i64>,
}

static USER_RATE_LIMITS: OnceLock<UserRateLimits> = OnceLock::new();

fn user_rate_limits(config: &AppConfig) -> &'static UserRateLimits {
    let messages_per_minute = config.max_messages_per_minute.max(1);
    let typing_per_minute = config.max_typing_events_per_minute.max(1);
    USER_RATE_LIMITS.get_or_init(|| {
        // Periodic cleanup of stale entries so the keyed state stays bounded.
        tokio::spawn(async {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            interval.tick().await; // skip immediate first tick
            loop {
                interval.tick().await;
                if let Some(rl) = USER_RATE_LIMITS.get() {
                    rl.messages.retain_recent();
                    rl.typing.retain_recent();
                    rl.messages.shrink_to_fit();
                    rl.typing.shrink_to_fit();
                }
            }
        });

        UserRateLimits {
            messages: RateLimiter::keyed(Quota::per_minute(
                NonZeroU32::new(messages_per_minute).unwrap(),
            )),
            typing: RateLimiter::keyed(Quota::per_minute(
                NonZeroU32::new(typing_per_minute).unwrap(),
            )),
        }
    })
}

impl UserRateLimits {
    /// `Ok(())` when the event is allowed, `Err(retry_after_ms)` otherwise.
    fn check(&self, user_id: i64, event_type: &str) -> Result<(), u64> {
        let limiter = if matches!(event_type, CLIENT_TYPING_START | CLIENT_TYPING_STOP) {
            &self.typing
        } else {
            &self.messages
        };
        match limiter.check_key(&user_id) {
            Ok(()) => Ok(()),
            Err(not_until) => {
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                Err(wait.as_millis().max(1) as u64)
            }
        }
    }
}

async fn send_text(sender: &mut (impl SinkExt<Message> + Unpin), payload: String) -> Result<(), ()> {
    sender
        .send(Message::Text(payload.into()))
        .await
        .map_err(|_| ())
}

async fn send_close(
    sender: &mut (impl SinkExt<Message> + Unpin),
    code: u16,
    reason: &str,
) -> Result<(), ()> {
    sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await
        .map_err(|_| ())
}

async fn send_dispatch(
    sender: &mut (impl SinkExt<Message> + Unpin),
    session: &mut Session,
    event_type: &str,
    payload: &Value,
) -> Result<(), ()> {
    let seq = session.next_sequence();
    let msg = json!({
        "op": OP_DISPATCH,
        "t": event_type,
        "s": seq,
        "d": payload,
    });
    send_text(sender, msg.to_string()).await
}

/// Errors go to the originating connection only.
async fn send_error(
    sender: &mut (impl SinkExt<Message> + Unpin),
    session: &mut Session,
    code: &str,
    detail: &str,
    client_event: &str,
) {
    let _ = send_dispatch(
        sender,
        session,
        EVENT_ERROR,
        &json!({
            "code": code,
            "message": detail,
            "event": client_event,
        }),
    )
    .await;
}

/// Map a core failure to a wire error code. `missing` distinguishes what
/// kind of id turned out to be unknown for this particular event.
fn error_code(err: &CoreError, missing: &'static str) -> &'static str {
    match err {
        CoreError::NotFound => missing,
        CoreError::Forbidden => ERR_NOT_PARTICIPANT,
        CoreError::BadRequest(_) => ERR_BAD_PAYLOAD,
        CoreError::Invariant(_) | CoreError::Database(_) => ERR_INTERNAL,
    }
}

/// Conversation/message ids arrive as JSON numbers or strings.
fn id_field(d: &Value, key: &str) -> Option<i64> {
    let value = d.get(key)?;
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

pub async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Send HELLO
    let hello_msg = format!(
        "{}{}{}",
        HELLO_MSG_PREFIX, HEARTBEAT_INTERVAL_MS, HELLO_MSG_SUFFIX
    );
    if send_text(&mut sender, hello_msg).await.is_err() {
        return;
    }

    // Wait for IDENTIFY. A missing or invalid token is the one fatal
    // handshake failure; everything after this point degrades gracefully.
    let user_id = match tokio::time::timeout(
        Duration::from_secs(IDENTIFY_TIMEOUT_SECS),
        wait_for_identify(&mut receiver, &state),
    )
    .await
    {
        Ok(Some(user_id)) => user_id,
        _ => {
            let _ = send_text(
                &mut sender,
                json!({"op": OP_INVALID_SESSION, "d": false}).to_string(),
            )
            .await;
            return;
        }
    };

    let connection_id = Uuid::new_v4();
    let mut session = Session::new(user_id, connection_id);

    // Subscribe before registering so the session sees its own user_online.
    let event_rx = state.event_bus.subscribe();

    let replaced = state.registry.register(user_id, connection_id);
    if replaced.is_some() {
        // Tell the superseded session loop to shut down; the payload names
        // the new connection so the new loop ignores its own notice.
        state.event_bus.dispatch_to_user(
            EVENT_SESSION_REPLACED,
            json!({ "connection_id": connection_id.to_string() }),
            user_id,
        );
        tracing::debug!(user_id, "existing connection displaced by a new session");
    } else {
        state.presence.mark_online(user_id, None).await;
        state
            .event_bus
            .broadcast(EVENT_USER_ONLINE, json!({ "user_id": user_id }));
    }

    tracing::info!(user_id, session_id = %session.session_id, "client connected");

    run_session(&mut sender, &mut receiver, &mut session, &state, event_rx).await;

    // Idempotent teardown: only the still-live connection emits offline
    // side effects; a displaced one cleans up silently.
    if let Some(live_user) = state.registry.unregister(connection_id) {
        state.presence.mark_offline(live_user).await;
        state
            .event_bus
            .broadcast(EVENT_USER_OFFLINE, json!({ "user_id": live_user }));
    }
}

async fn wait_for_identify(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    state: &AppState,
) -> Option<i64> {
    while let Some(Ok(msg)) = receiver.next().await {
        if let Message::Text(text) = msg {
            let Ok(payload) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            if payload.get("op").and_then(|v| v.as_u64()) != Some(OP_IDENTIFY as u64) {
                continue;
            }
            let token = payload
                .get("d")
                .and_then(|d| d.get("token"))
                .and_then(|v| v.as_str())?;
            let claims = auth::validate_token(token, &state.config.jwt_secret).ok()?;
            return Some(claims.sub);
        }
    }
    None
}

async fn run_session(
    sender: &mut (impl SinkExt<Message> + Unpin),
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    session: &mut Session,
    state: &AppState,
    mut event_rx: broadcast::Receiver<ServerEvent>,
) {
    // READY carries everything the client needs to render its first frame.
    let conversations = match sidebar::sidebar_for_user(state, session.user_id).await {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(user_id = session.user_id, %err, "sidebar build failed for ready payload");
            Vec::new()
        }
    };
    let ready = json!({
        "user_id": session.user_id,
        "session_id": &session.session_id,
        "conversations": conversations,
        "online_user_ids": state.registry.online_user_ids(),
    });
    if send_dispatch(sender, session, EVENT_READY, &ready).await.is_err() {
        return;
    }

    // Flush notifications queued while the user was offline, oldest first.
    for queued in state.pending.drain(session.user_id) {
        if send_dispatch(sender, session, &queued.event_type, &queued.payload)
            .await
            .is_err()
        {
            return;
        }
    }

    let heartbeat_timeout = Duration::from_millis(HEARTBEAT_TIMEOUT_MS);
    let rate_limits = user_rate_limits(&state.config);
    let mut ws_ping_interval = tokio::time::interval(Duration::from_secs(20));
    ws_ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let heartbeat_sleep = tokio::time::sleep(heartbeat_timeout);
    tokio::pin!(heartbeat_sleep);

    let disconnect_reason = loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(payload) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        let op = payload.get("op").and_then(|v| v.as_u64()).unwrap_or(255) as u8;
                        match op {
                            OP_HEARTBEAT => {
                                let _ = send_text(sender, HEARTBEAT_ACK_MSG.to_string()).await;
                                state.presence.refresh(session.user_id).await;
                                heartbeat_sleep.as_mut().reset(Instant::now() + heartbeat_timeout);
                            }
                            OP_DISPATCH => {
                                let event_type = payload
                                    .get("t")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("")
                                    .to_string();
                                let d = payload.get("d").cloned().unwrap_or(Value::Null);

                                if let Err(retry_after_ms) = rate_limits.check(session.user_id, &event_type) {
                                    if matches!(event_type.as_str(), CLIENT_TYPING_START | CLIENT_TYPING_STOP) {
                                        // Silent drop for high-frequency events
                                        tracing::debug!(
                                            user_id = session.user_id,
                                            event_type,
                                            "rate limited (silent drop)"
                                        );
                                    } else {
                                        send_error(
                                            sender,
                                            session,
                                            ERR_RATE_LIMITED,
                                            &format!("retry after {retry_after_ms}ms"),
                                            &event_type,
                                        )
                                        .await;
                                    }
                                    continue;
                                }

                                handle_client_event(&event_type, &d, sender, session, state).await;
                            }
                            _ => {
                                tracing::debug!(
                                    user_id = session.user_id,
                                    op,
                                    "unknown opcode from client"
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        break "client close frame".to_string();
                    }
                    Some(Err(err)) => {
                        break format!("websocket receive error: {err}");
                    }
                    None => {
                        break "websocket stream ended".to_string();
                    }
                    _ => {}
                }
            }
            event = event_rx.recv() => {
                match event {
                    Ok(event) => {
                        if !session.should_receive_event(&event) {
                            continue;
                        }

                        if event.event_type == EVENT_SESSION_REPLACED {
                            let new_connection = event
                                .payload
                                .get("connection_id")
                                .and_then(|v| v.as_str())
                                .unwrap_or("");
                            if new_connection == session.connection_id.to_string() {
                                // Our own registration notice.
                                continue;
                            }
                            let _ = send_dispatch(sender, session, &event.event_type, &event.payload).await;
                            let _ = send_close(sender, 4000, "session replaced by a newer connection").await;
                            break "session replaced".to_string();
                        }

                        if send_dispatch(sender, session, &event.event_type, &event.payload)
                            .await
                            .is_err()
                        {
                            break "websocket send error".to_string();
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            user_id = session.user_id,
                            skipped,
                            "event stream lagged, forcing reconnect"
                        );
                        let _ = send_close(sender, 1013, "gateway fell behind; reconnect required").await;
                        break format!("event stream lagged by {skipped} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break "event stream closed".to_string();
                    }
                }
            }
            () = &mut heartbeat_sleep => {
                break format!("heartbeat timeout after {HEARTBEAT_TIMEOUT_MS}ms");
            }
            _ = ws_ping_interval.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break "websocket ping send error".to_string();
                }
            }
        }
    };

    tracing::info!(
        user_id = session.user_id,
        session_id = %session.session_id,
        disconnect_reason,
        "client disconnected"
    );
}

async fn handle_client_event(
    event_type: &str,
    d: &Value,
    sender: &mut (impl SinkExt<Message> + Unpin),
    session: &mut Session,
    state: &AppState,
) {
    match event_type {
        CLIENT_JOIN_CONVERSATION => {
            let Some(conversation_id) = id_field(d, "conversation_id") else {
                send_error(sender, session, ERR_BAD_PAYLOAD, "conversation_id required", event_type).await;
                return;
            };
            match conversation::require_active_participant(state, conversation_id, session.user_id)
                .await
            {
                Ok(_) => {
                    state.registry.join_room(session.user_id, conversation_id);
                    session.joined_conversations.insert(conversation_id);
                }
                Err(err) => {
                    send_error(
                        sender,
                        session,
                        error_code(&err, ERR_UNKNOWN_CONVERSATION),
                        &err.to_string(),
                        event_type,
                    )
                    .await;
                }
            }
        }
        CLIENT_LEAVE_CONVERSATION => {
            if let Some(conversation_id) = id_field(d, "conversation_id") {
                state.registry.leave_room(session.user_id, conversation_id);
                session.joined_conversations.remove(&conversation_id);
            }
        }
        CLIENT_CONVERSATION_VIEWED => {
            // Null clears the active view (user navigated away).
            let conversation_id = id_field(d, "conversation_id");
            state
                .registry
                .set_active_conversation(session.user_id, conversation_id);
        }
        CLIENT_SEND_MESSAGE => {
            let Some(conversation_id) = id_field(d, "conversation_id") else {
                send_error(sender, session, ERR_BAD_PAYLOAD, "conversation_id required", event_type).await;
                return;
            };
            let content = d
                .get("content")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            let file_info = d.get("file_info").filter(|v| !v.is_null()).cloned();
            if let Err(err) = message::send_message(
                state,
                conversation_id,
                session.user_id,
                content,
                file_info,
            )
            .await
            {
                send_error(
                    sender,
                    session,
                    error_code(&err, ERR_UNKNOWN_CONVERSATION),
                    &err.to_string(),
                    event_type,
                )
                .await;
            }
        }
        CLIENT_MESSAGE_DELIVERED => {
            let Some(message_id) = id_field(d, "message_id") else {
                send_error(sender, session, ERR_BAD_PAYLOAD, "message_id required", event_type).await;
                return;
            };
            if let Err(err) = delivery::ack_delivered(state, message_id, session.user_id).await {
                send_error(
                    sender,
                    session,
                    error_code(&err, ERR_UNKNOWN_MESSAGE),
                    &err.to_string(),
                    event_type,
                )
                .await;
            }
        }
        CLIENT_MESSAGE_SEEN => {
            let Some(message_id) = id_field(d, "message_id") else {
                send_error(sender, session, ERR_BAD_PAYLOAD, "message_id required", event_type).await;
                return;
            };
            if let Err(err) = delivery::ack_seen(state, message_id, session.user_id).await {
                send_error(
                    sender,
                    session,
                    error_code(&err, ERR_UNKNOWN_MESSAGE),
                    &err.to_string(),
                    event_type,
                )
                .await;
            }
        }
        CLIENT_MARK_CONVERSATION_READ => {
            let Some(conversation_id) = id_field(d, "conversation_id") else {
                send_error(sender, session, ERR_BAD_PAYLOAD, "conversation_id required", event_type).await;
                return;
            };
            if let Err(err) =
                delivery::mark_conversation_read(state, conversation_id, session.user_id).await
            {
                send_error(
                    sender,
                    session,
                    error_code(&err, ERR_UNKNOWN_CONVERSATION),
                    &err.to_string(),
                    event_type,
                )
                .await;
            }
        }
        CLIENT_TYPING_START | CLIENT_TYPING_STOP => {
            let Some(conversation_id) = id_field(d, "conversation_id") else {
                return;
            };
            // Room membership implies the participant check already passed
            // at join time; typing from unjoined rooms is dropped.
            if !session.joined_conversations.contains(&conversation_id) {
                return;
            }
            let server_event = if event_type == CLIENT_TYPING_START {
                EVENT_TYPING_START
            } else {
                EVENT_TYPING_STOP
            };
            state.event_bus.dispatch_to_room(
                server_event,
                json!({
                    "conversation_id": conversation_id,
                    "user_id": session.user_id,
                    "timestamp": chrono::Utc::now().timestamp(),
                }),
                conversation_id,
                Some(session.user_id),
            );
        }
        CLIENT_CREATE_DIRECT => {
            let Some(peer_id) = id_field(d, "user_id") else {
                send_error(sender, session, ERR_BAD_PAYLOAD, "user_id required", event_type).await;
                return;
            };
            match conversation::create_direct(state, session.user_id, peer_id).await {
                Ok(conv) => match conversation::snapshot(state, conv.id).await {
                    Ok(snapshot) => {
                        let _ = send_dispatch(sender, session, EVENT_CONVERSATION_UPDATED, &snapshot).await;
                    }
                    Err(err) => {
                        send_error(sender, session, ERR_INTERNAL, &err.to_string(), event_type).await;
                    }
                },
                Err(err) => {
                    send_error(
                        sender,
                        session,
                        error_code(&err, ERR_UNKNOWN_CONVERSATION),
                        &err.to_string(),
                        event_type,
                    )
                    .await;
                }
            }
        }
        CLIENT_CREATE_GROUP => {
            let name = d.get("name").and_then(|v| v.as_str()).unwrap_or("");
            let kind = match d.get("kind").and_then(|v| v.as_str()) {
                Some("broadcast") => ConversationKind::Broadcast,
                _ => ConversationKind::Group,
            };
            let member_ids: Vec<i64> = d
                .get("member_ids")
                .and_then(|v| v.as_array())
                .map(|list| {
                    list.iter()
                        .filter_map(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
                        .collect()
                })
                .unwrap_or_default();
            if let Err(err) =
                conversation::create_group(state, session.user_id, kind, name, &member_ids).await
            {
                send_error(
                    sender,
                    session,
                    error_code(&err, ERR_UNKNOWN_CONVERSATION),
                    &err.to_string(),
                    event_type,
                )
                .await;
            }
        }
        CLIENT_RENAME_CONVERSATION => {
            let Some(conversation_id) = id_field(d, "conversation_id") else {
                send_error(sender, session, ERR_BAD_PAYLOAD, "conversation_id required", event_type).await;
                return;
            };
            let name = d.get("name").and_then(|v| v.as_str()).unwrap_or("");
            if let Err(err) = conversation::rename(state, conversation_id, session.user_id, name).await {
                send_error(
                    sender,
                    session,
                    error_code(&err, ERR_UNKNOWN_CONVERSATION),
                    &err.to_string(),
                    event_type,
                )
                .await;
            }
        }
        CLIENT_ADD_MEMBER => {
            let (Some(conversation_id), Some(member_id)) =
                (id_field(d, "conversation_id"), id_field(d, "user_id"))
            else {
                send_error(sender, session, ERR_BAD_PAYLOAD, "conversation_id and user_id required", event_type).await;
                return;
            };
            if let Err(err) =
                conversation::add_member(state, conversation_id, session.user_id, member_id).await
            {
                send_error(
                    sender,
                    session,
                    error_code(&err, ERR_UNKNOWN_CONVERSATION),
                    &err.to_string(),
                    event_type,
                )
                .await;
            }
        }
        CLIENT_REMOVE_MEMBER => {
            let (Some(conversation_id), Some(member_id)) =
                (id_field(d, "conversation_id"), id_field(d, "user_id"))
            else {
                send_error(sender, session, ERR_BAD_PAYLOAD, "conversation_id and user_id required", event_type).await;
                return;
            };
            if let Err(err) =
                conversation::remove_member(state, conversation_id, session.user_id, member_id).await
            {
                send_error(
                    sender,
                    session,
                    error_code(&err, ERR_UNKNOWN_CONVERSATION),
                    &err.to_string(),
                    event_type,
                )
                .await;
            }
        }
        CLIENT_HIDE_CONVERSATION => {
            let Some(conversation_id) = id_field(d, "conversation_id") else {
                send_error(sender, session, ERR_BAD_PAYLOAD, "conversation_id required", event_type).await;
                return;
            };
            if let Err(err) =
                visibility::hide_conversation(state, conversation_id, session.user_id).await
            {
                send_error(
                    sender,
                    session,
                    error_code(&err, ERR_UNKNOWN_CONVERSATION),
                    &err.to_string(),
                    event_type,
                )
                .await;
            }
        }
        CLIENT_UNHIDE_CONVERSATION => {
            let Some(conversation_id) = id_field(d, "conversation_id") else {
                send_error(sender, session, ERR_BAD_PAYLOAD, "conversation_id required", event_type).await;
                return;
            };
            if let Err(err) =
                visibility::unhide_conversation(state, conversation_id, session.user_id).await
            {
                send_error(
                    sender,
                    session,
                    error_code(&err, ERR_UNKNOWN_CONVERSATION),
                    &err.to_string(),
                    event_type,
                )
                .await;
            }
        }
        CLIENT_CLEAR_HISTORY => {
            let Some(conversation_id) = id_field(d, "conversation_id") else {
                send_error(sender, session, ERR_BAD_PAYLOAD, "conversation_id required", event_type).await;
                return;
            };
            if let Err(err) =
                visibility::clear_history(state, conversation_id, session.user_id).await
            {
                send_error(
                    sender,
                    session,
                    error_code(&err, ERR_UNKNOWN_CONVERSATION),
                    &err.to_string(),
                    event_type,
                )
                .await;
            }
        }
        CLIENT_LEAVE_GROUP => {
            let Some(conversation_id) = id_field(d, "conversation_id") else {
                send_error(sender, session, ERR_BAD_PAYLOAD, "conversation_id required", event_type).await;
                return;
            };
            match visibility::leave_conversation(state, conversation_id, session.user_id).await {
                Ok(()) => {
                    state.registry.leave_room(session.user_id, conversation_id);
                    session.joined_conversations.remove(&conversation_id);
                    if state.registry.active_conversation(session.user_id) == Some(conversation_id)
                    {
                        state.registry.set_active_conversation(session.user_id, None);
                    }
                }
                Err(err) => {
                    send_error(
                        sender,
                        session,
                        error_code(&err, ERR_UNKNOWN_CONVERSATION),
                        &err.to_string(),
                        event_type,
                    )
                    .await;
                }
            }
        }
        _ => {
            tracing::debug!(
                user_id = session.user_id,
                event_type,
                "unknown client event"
            );
        }
    }
}
