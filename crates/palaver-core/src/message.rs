use crate::error::CoreError;
use crate::{conversation, delivery, sidebar, visibility, AppState};
use palaver_db::messages::MessageRow;
use palaver_models::conversation::ConversationKind;
use palaver_models::gateway::EVENT_NEW_MESSAGE;
use palaver_models::message::DeliveryStatus;
use serde_json::json;

pub const MAX_CONTENT_LENGTH: usize = 4000;

/// Persist and fan out a new message. The write drives the whole pipeline:
/// hidden copies of the conversation reappear, delivery receipts are taken
/// for connected recipients, cached sidebars and unread counters are
/// refreshed, and every active participant is notified.
pub async fn send_message(
    state: &AppState,
    conversation_id: i64,
    sender_id: i64,
    content: Option<String>,
    file_info: Option<serde_json::Value>,
) -> Result<MessageRow, CoreError> {
    let content = content.filter(|c| !c.trim().is_empty());
    if content.is_none() && file_info.is_none() {
        return Err(CoreError::BadRequest(
            "message needs content or a file attachment".into(),
        ));
    }
    if let Some(text) = &content {
        if text.chars().count() > MAX_CONTENT_LENGTH {
            return Err(CoreError::BadRequest(format!(
                "message content exceeds {MAX_CONTENT_LENGTH} characters"
            )));
        }
    }

    let conv = conversation::require_conversation(state, conversation_id).await?;
    let sender = conversation::require_active_participant(state, conversation_id, sender_id).await?;

    // Broadcast channels only accept posts from the admin or co-admins;
    // everyone else is read-only.
    let kind = ConversationKind::from_i16(conv.kind).unwrap_or(ConversationKind::Direct);
    if kind == ConversationKind::Broadcast && !conversation::is_admin(&conv, &sender) {
        return Err(CoreError::Forbidden);
    }

    let id = palaver_util::snowflake::generate(state.config.worker_id);
    let message = palaver_db::messages::create_message(
        &state.db,
        id,
        conversation_id,
        sender_id,
        content.as_deref(),
        file_info.as_ref(),
    )
    .await?;

    tracing::debug!(
        message_id = message.id,
        conversation_id,
        sender_id,
        "message persisted"
    );

    // Activity revives hidden copies before anyone is notified, so the
    // reappearance snapshot and the new-message event arrive in that order.
    visibility::reappear_on_activity(state, conversation_id, sender_id).await?;

    let participants =
        palaver_db::conversations::get_participants(&state.db, conversation_id).await?;
    let active: Vec<_> = participants.iter().filter(|p| p.is_active()).collect();

    let recipient_ids: Vec<i64> = active.iter().map(|p| p.user_id).collect();
    state.event_bus.dispatch_to_users(
        EVENT_NEW_MESSAGE,
        json!({
            "message_id": message.id,
            "conversation_id": conversation_id,
            "sender_id": sender_id,
            "content": message.content,
            "file_info": message.file_info,
            "status": DeliveryStatus::from_i16(message.status),
            "created_at": message.created_at,
        }),
        recipient_ids,
    );

    delivery::dispatch_message(state, &message, &participants).await?;

    for p in &active {
        sidebar::invalidate(state, p.user_id).await;
        if p.user_id != sender_id {
            sidebar::bump_unread(state, p.user_id, conversation_id).await;
        }
    }

    Ok(message)
}
