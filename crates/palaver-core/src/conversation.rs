use crate::error::CoreError;
use crate::{sidebar, AppState};
use palaver_db::conversations::{ConversationRow, ParticipantRow};
use palaver_models::conversation::{ConversationKind, ParticipantRole, ParticipantView};
use palaver_models::gateway::EVENT_CONVERSATION_UPDATED;
use serde_json::json;

/// Look up a conversation or report it unknown.
pub async fn require_conversation(
    state: &AppState,
    conversation_id: i64,
) -> Result<ConversationRow, CoreError> {
    palaver_db::conversations::get_conversation(&state.db, conversation_id)
        .await?
        .ok_or(CoreError::NotFound)
}

/// Membership guard: the user must be a participant who never left. Hidden
/// participants pass; hiding affects visibility, not membership.
pub async fn require_active_participant(
    state: &AppState,
    conversation_id: i64,
    user_id: i64,
) -> Result<ParticipantRow, CoreError> {
    let participant =
        palaver_db::conversations::get_participant(&state.db, conversation_id, user_id)
            .await?
            .ok_or(CoreError::Forbidden)?;
    if !participant.is_active() {
        return Err(CoreError::Forbidden);
    }
    Ok(participant)
}

/// Admin privileges: the primary admin or any co-admin.
pub fn is_admin(conversation: &ConversationRow, participant: &ParticipantRow) -> bool {
    conversation.admin_id == Some(participant.user_id) || participant.co_admin
}

/// Create (or return the existing) direct conversation between two users.
/// Directs are deduplicated: a second create for the same pair yields the
/// original row.
pub async fn create_direct(
    state: &AppState,
    user_a: i64,
    user_b: i64,
) -> Result<ConversationRow, CoreError> {
    if user_a == user_b {
        return Err(CoreError::BadRequest(
            "cannot open a direct conversation with yourself".into(),
        ));
    }

    if let Some(existing) =
        palaver_db::conversations::find_direct_between(&state.db, user_a, user_b).await?
    {
        return Ok(existing);
    }

    let id = palaver_util::snowflake::generate(state.config.worker_id);
    let conversation = palaver_db::conversations::create_conversation(
        &state.db,
        id,
        ConversationKind::Direct.as_i16(),
        None,
        None,
    )
    .await?;
    for user_id in [user_a, user_b] {
        palaver_db::conversations::add_participant(
            &state.db,
            id,
            user_id,
            ParticipantRole::Member.as_i16(),
            false,
        )
        .await?;
    }

    tracing::info!(conversation_id = id, user_a, user_b, "direct conversation created");
    Ok(conversation)
}

/// Create a group or broadcast conversation. The creator becomes the
/// primary admin and a co-admin.
pub async fn create_group(
    state: &AppState,
    creator_id: i64,
    kind: ConversationKind,
    name: &str,
    member_ids: &[i64],
) -> Result<ConversationRow, CoreError> {
    if !kind.requires_admin() {
        return Err(CoreError::BadRequest(
            "direct conversations are created per user pair".into(),
        ));
    }
    if name.trim().is_empty() {
        return Err(CoreError::BadRequest("conversation name is required".into()));
    }

    let id = palaver_util::snowflake::generate(state.config.worker_id);
    let conversation = palaver_db::conversations::create_conversation(
        &state.db,
        id,
        kind.as_i16(),
        Some(name),
        Some(creator_id),
    )
    .await?;

    palaver_db::conversations::add_participant(
        &state.db,
        id,
        creator_id,
        ParticipantRole::Admin.as_i16(),
        true,
    )
    .await?;
    for &member_id in member_ids {
        if member_id == creator_id {
            continue;
        }
        palaver_db::conversations::add_participant(
            &state.db,
            id,
            member_id,
            ParticipantRole::Member.as_i16(),
            false,
        )
        .await?;
    }

    let member_count = member_ids.len() + 1;
    tracing::info!(conversation_id = id, creator_id, member_count, "conversation created");

    notify_updated(state, id).await?;
    Ok(conversation)
}

/// Rename a group or broadcast conversation. Admin-gated.
pub async fn rename(
    state: &AppState,
    conversation_id: i64,
    actor_id: i64,
    name: &str,
) -> Result<(), CoreError> {
    let conversation = require_conversation(state, conversation_id).await?;
    let actor = require_active_participant(state, conversation_id, actor_id).await?;
    if !is_admin(&conversation, &actor) {
        return Err(CoreError::Forbidden);
    }
    if name.trim().is_empty() {
        return Err(CoreError::BadRequest("conversation name is required".into()));
    }

    palaver_db::conversations::update_name(&state.db, conversation_id, name).await?;
    notify_updated(state, conversation_id).await?;
    Ok(())
}

/// Add a member to a group or broadcast conversation. Admin-gated. Adding a
/// former participant back re-activates their row.
pub async fn add_member(
    state: &AppState,
    conversation_id: i64,
    actor_id: i64,
    new_member_id: i64,
) -> Result<(), CoreError> {
    let conversation = require_conversation(state, conversation_id).await?;
    let kind = ConversationKind::from_i16(conversation.kind).unwrap_or(ConversationKind::Direct);
    if !kind.requires_admin() {
        return Err(CoreError::BadRequest(
            "direct conversations have a fixed pair of participants".into(),
        ));
    }
    let actor = require_active_participant(state, conversation_id, actor_id).await?;
    if !is_admin(&conversation, &actor) {
        return Err(CoreError::Forbidden);
    }

    palaver_db::conversations::add_participant(
        &state.db,
        conversation_id,
        new_member_id,
        ParticipantRole::Member.as_i16(),
        false,
    )
    .await?;

    sidebar::invalidate(state, new_member_id).await;
    notify_updated(state, conversation_id).await?;
    Ok(())
}

/// Remove a member. Admin-gated; the primary admin cannot be removed, they
/// leave instead (which runs succession).
pub async fn remove_member(
    state: &AppState,
    conversation_id: i64,
    actor_id: i64,
    target_id: i64,
) -> Result<(), CoreError> {
    let conversation = require_conversation(state, conversation_id).await?;
    let actor = require_active_participant(state, conversation_id, actor_id).await?;
    if !is_admin(&conversation, &actor) {
        return Err(CoreError::Forbidden);
    }
    if conversation.admin_id == Some(target_id) {
        return Err(CoreError::BadRequest(
            "the admin leaves rather than being removed".into(),
        ));
    }
    require_active_participant(state, conversation_id, target_id).await?;

    palaver_db::conversations::mark_left(&state.db, conversation_id, target_id, chrono::Utc::now())
        .await?;

    sidebar::invalidate(state, target_id).await;
    notify_updated(state, conversation_id).await?;
    Ok(())
}

/// Full conversation snapshot as carried by `conversation_updated` and
/// `conversation_reappeared` payloads.
pub async fn snapshot(
    state: &AppState,
    conversation_id: i64,
) -> Result<serde_json::Value, CoreError> {
    let conversation = require_conversation(state, conversation_id).await?;
    let participants =
        palaver_db::conversations::get_participants(&state.db, conversation_id).await?;
    let views: Vec<ParticipantView> = participants
        .iter()
        .filter(|p| p.is_active())
        .map(|p| ParticipantView {
            user_id: p.user_id,
            role: ParticipantRole::from_i16(p.role),
            co_admin: p.co_admin,
            is_hidden: p.is_hidden,
            joined_at: p.joined_at,
        })
        .collect();
    let last_message = palaver_db::messages::last_message(&state.db, conversation_id).await?;

    Ok(json!({
        "conversation_id": conversation.id,
        "kind": ConversationKind::from_i16(conversation.kind),
        "name": conversation.name,
        "admin_id": conversation.admin_id,
        "participants": views,
        "last_message": last_message.map(|m| json!({
            "message_id": m.id,
            "sender_id": m.sender_id,
            "content": m.content,
            "created_at": m.created_at,
        })),
        "created_at": conversation.created_at,
    }))
}

/// Push a fresh snapshot to every active participant and drop their cached
/// sidebars.
pub async fn notify_updated(state: &AppState, conversation_id: i64) -> Result<(), CoreError> {
    let participants =
        palaver_db::conversations::get_participants(&state.db, conversation_id).await?;
    let active_ids: Vec<i64> = participants
        .iter()
        .filter(|p| p.is_active())
        .map(|p| p.user_id)
        .collect();

    sidebar::invalidate_many(state, &active_ids).await;

    let payload = snapshot(state, conversation_id).await?;
    state
        .event_bus
        .dispatch_to_users(EVENT_CONVERSATION_UPDATED, payload, active_ids);
    Ok(())
}
