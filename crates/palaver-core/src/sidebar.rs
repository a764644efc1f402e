use crate::error::CoreError;
use crate::AppState;
use palaver_models::conversation::{ConversationKind, ConversationSummary, MessagePreview};
use std::time::Duration;

fn sidebar_key(user_id: i64) -> String {
    format!("sidebar:{user_id}")
}

fn unread_key(user_id: i64, conversation_id: i64) -> String {
    format!("unread:{user_id}:{conversation_id}")
}

/// Read-through sidebar lookup. Serves the cached snapshot when present,
/// otherwise rebuilds from the database and caches the result with the
/// configured TTL.
pub async fn sidebar_for_user(
    state: &AppState,
    user_id: i64,
) -> Result<Vec<ConversationSummary>, CoreError> {
    let key = sidebar_key(user_id);
    if let Some(cached) = state.cache.get(&key).await {
        if let Ok(entries) = serde_json::from_value::<Vec<ConversationSummary>>(cached) {
            return Ok(entries);
        }
        // Unparseable snapshot, fall through to a rebuild.
        state.cache.delete(&key).await;
    }

    let entries = build_sidebar(state, user_id).await?;
    if let Ok(value) = serde_json::to_value(&entries) {
        state
            .cache
            .set_with_ttl(&key, value, Duration::from_secs(state.config.sidebar_ttl_secs))
            .await;
    }
    Ok(entries)
}

async fn build_sidebar(
    state: &AppState,
    user_id: i64,
) -> Result<Vec<ConversationSummary>, CoreError> {
    let conversations = palaver_db::conversations::list_visible_for_user(&state.db, user_id).await?;
    let mut entries = Vec::with_capacity(conversations.len());

    for conversation in conversations {
        let unread_count = unread_count(state, user_id, conversation.id).await?;

        let last_message = palaver_db::messages::last_message(&state.db, conversation.id)
            .await?
            .map(|msg| MessagePreview {
                message_id: msg.id,
                sender_id: msg.sender_id,
                content: msg.content,
                created_at: msg.created_at,
            });

        let participants =
            palaver_db::conversations::get_participants(&state.db, conversation.id).await?;
        let mut online_participant_ids = Vec::new();
        for p in participants.iter().filter(|p| p.is_active()) {
            if p.user_id != user_id && state.presence.is_online(p.user_id).await {
                online_participant_ids.push(p.user_id);
            }
        }

        entries.push(ConversationSummary {
            conversation_id: conversation.id,
            kind: ConversationKind::from_i16(conversation.kind)
                .unwrap_or(ConversationKind::Direct),
            name: conversation.name,
            admin_id: conversation.admin_id,
            unread_count,
            last_message,
            online_participant_ids,
        });
    }

    Ok(entries)
}

/// Read-through per-conversation unread counter.
pub async fn unread_count(
    state: &AppState,
    user_id: i64,
    conversation_id: i64,
) -> Result<i64, CoreError> {
    let key = unread_key(user_id, conversation_id);
    if let Some(cached) = state.cache.get(&key).await {
        if let Some(count) = cached.as_i64() {
            return Ok(count);
        }
    }

    let count = palaver_db::messages::count_unread(&state.db, conversation_id, user_id).await?;
    state
        .cache
        .set_with_ttl(
            &key,
            count.into(),
            Duration::from_secs(state.config.unread_ttl_secs),
        )
        .await;
    Ok(count)
}

/// Bump a cached unread counter for a new message. Only touches counters
/// already in the cache; an absent counter is rebuilt from the database on
/// the next read, so incrementing it here would double-count.
pub async fn bump_unread(state: &AppState, user_id: i64, conversation_id: i64) {
    let key = unread_key(user_id, conversation_id);
    if let Some(cached) = state.cache.get(&key).await {
        if let Some(count) = cached.as_i64() {
            state
                .cache
                .set_with_ttl(
                    &key,
                    (count + 1).into(),
                    Duration::from_secs(state.config.unread_ttl_secs),
                )
                .await;
        }
    }
}

/// Counters are never decremented in place: any event that lowers a count
/// resets it and lets the next read rebuild from the database.
pub async fn reset_unread(state: &AppState, user_id: i64, conversation_id: i64) {
    state
        .cache
        .set_with_ttl(
            &unread_key(user_id, conversation_id),
            0.into(),
            Duration::from_secs(state.config.unread_ttl_secs),
        )
        .await;
}

pub async fn invalidate(state: &AppState, user_id: i64) {
    state.cache.delete(&sidebar_key(user_id)).await;
}

pub async fn invalidate_many(state: &AppState, user_ids: &[i64]) {
    for &user_id in user_ids {
        invalidate(state, user_id).await;
    }
}
