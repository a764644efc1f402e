use crate::error::CoreError;
use crate::{conversation, sidebar, succession, AppState};
use chrono::Utc;
use palaver_models::conversation::ConversationKind;
use palaver_models::gateway::EVENT_CONVERSATION_REAPPEARED;

/// Hide a conversation from the caller's own sidebar. Membership, message
/// flow and other participants are untouched; new activity brings it back.
pub async fn hide_conversation(
    state: &AppState,
    conversation_id: i64,
    user_id: i64,
) -> Result<(), CoreError> {
    conversation::require_conversation(state, conversation_id).await?;
    conversation::require_active_participant(state, conversation_id, user_id).await?;

    palaver_db::conversations::set_hidden(&state.db, conversation_id, user_id, true, Utc::now())
        .await?;
    sidebar::invalidate(state, user_id).await;
    Ok(())
}

pub async fn unhide_conversation(
    state: &AppState,
    conversation_id: i64,
    user_id: i64,
) -> Result<(), CoreError> {
    conversation::require_conversation(state, conversation_id).await?;
    conversation::require_active_participant(state, conversation_id, user_id).await?;

    palaver_db::conversations::set_hidden(&state.db, conversation_id, user_id, false, Utc::now())
        .await?;
    sidebar::invalidate(state, user_id).await;
    Ok(())
}

/// Erase the conversation's history for the caller only. The messages stay
/// in place for everyone else; for this user they stop counting as unread
/// and are filtered from history reads.
pub async fn clear_history(
    state: &AppState,
    conversation_id: i64,
    user_id: i64,
) -> Result<u64, CoreError> {
    conversation::require_conversation(state, conversation_id).await?;
    conversation::require_active_participant(state, conversation_id, user_id).await?;

    let cleared =
        palaver_db::messages::clear_all_for_user(&state.db, conversation_id, user_id).await?;
    sidebar::reset_unread(state, user_id, conversation_id).await;
    sidebar::invalidate(state, user_id).await;
    Ok(cleared)
}

/// New activity in a conversation un-hides it for every participant who had
/// hidden it (except the author). Online participants get a full snapshot
/// immediately; offline ones get it queued for their next connect. Cleared
/// history markers are left alone: the conversation reappears, erased
/// messages do not.
pub async fn reappear_on_activity(
    state: &AppState,
    conversation_id: i64,
    author_id: i64,
) -> Result<Vec<i64>, CoreError> {
    let affected =
        palaver_db::conversations::unhide_all_except(&state.db, conversation_id, author_id).await?;
    if affected.is_empty() {
        return Ok(affected);
    }

    let snapshot = conversation::snapshot(state, conversation_id).await?;
    for &user_id in &affected {
        sidebar::invalidate(state, user_id).await;
        if state.registry.is_online(user_id) {
            state.event_bus.dispatch_to_user(
                EVENT_CONVERSATION_REAPPEARED,
                snapshot.clone(),
                user_id,
            );
        } else {
            state
                .pending
                .push(user_id, EVENT_CONVERSATION_REAPPEARED, snapshot.clone());
        }
    }

    tracing::debug!(
        conversation_id,
        affected = affected.len(),
        "conversation reappeared after activity"
    );
    Ok(affected)
}

/// Leave a group or broadcast conversation. Departure of the last
/// participant deletes the conversation outright; departure of the admin
/// runs succession first so the conversation never lacks an admin.
pub async fn leave_conversation(
    state: &AppState,
    conversation_id: i64,
    user_id: i64,
) -> Result<(), CoreError> {
    let conv = conversation::require_conversation(state, conversation_id).await?;
    let kind = ConversationKind::from_i16(conv.kind).unwrap_or(ConversationKind::Direct);
    if !kind.requires_admin() {
        return Err(CoreError::BadRequest(
            "direct conversations cannot be left, hide them instead".into(),
        ));
    }
    conversation::require_active_participant(state, conversation_id, user_id).await?;

    palaver_db::conversations::mark_left(&state.db, conversation_id, user_id, Utc::now()).await?;
    sidebar::invalidate(state, user_id).await;

    let participants =
        palaver_db::conversations::get_participants(&state.db, conversation_id).await?;
    let remaining: Vec<i64> = participants
        .iter()
        .filter(|p| p.is_active())
        .map(|p| p.user_id)
        .collect();

    if remaining.is_empty() {
        palaver_db::conversations::delete_conversation(&state.db, conversation_id).await?;
        tracing::info!(conversation_id, "last participant left, conversation deleted");
        return Ok(());
    }

    if conv.admin_id == Some(user_id) {
        succession::transfer_admin(state, conversation_id, user_id).await?;
    }

    conversation::notify_updated(state, conversation_id).await?;
    Ok(())
}
