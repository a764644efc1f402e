use crate::error::CoreError;
use crate::AppState;
use palaver_models::gateway::{EVENT_ADMIN_TRANSFERRED, EVENT_PROMOTED_TO_ADMIN};
use serde_json::json;

/// Hand the primary-admin slot to a successor after `departing_id` leaves
/// an admin-requiring conversation. Preference order: the earliest-joined
/// co-admin, then the earliest-joined remaining participant. The caller
/// guarantees at least one active participant remains; finding none means
/// the admin invariant already broke, which is fatal for the operation.
///
/// Returns the new admin's user id.
pub async fn transfer_admin(
    state: &AppState,
    conversation_id: i64,
    departing_id: i64,
) -> Result<i64, CoreError> {
    let participants =
        palaver_db::conversations::get_participants(&state.db, conversation_id).await?;
    // Rows arrive ordered by join time, so "first match" is "earliest joined".
    let remaining: Vec<_> = participants
        .iter()
        .filter(|p| p.is_active() && p.user_id != departing_id)
        .collect();

    let successor = remaining
        .iter()
        .find(|p| p.co_admin)
        .or_else(|| remaining.first())
        .map(|p| p.user_id)
        .ok_or_else(|| {
            tracing::error!(
                conversation_id,
                departing_id,
                "admin succession found no candidate in a non-empty conversation"
            );
            CoreError::Invariant(format!(
                "no admin successor in conversation {conversation_id}"
            ))
        })?;

    palaver_db::conversations::set_admin(&state.db, conversation_id, successor).await?;

    tracing::info!(
        conversation_id,
        old_admin_id = departing_id,
        new_admin_id = successor,
        "admin transferred"
    );

    let remaining_ids: Vec<i64> = remaining.iter().map(|p| p.user_id).collect();
    state.event_bus.dispatch_to_users(
        EVENT_ADMIN_TRANSFERRED,
        json!({
            "conversation_id": conversation_id,
            "old_admin_id": departing_id,
            "new_admin_id": successor,
        }),
        remaining_ids,
    );
    state.event_bus.dispatch_to_user(
        EVENT_PROMOTED_TO_ADMIN,
        json!({ "conversation_id": conversation_id }),
        successor,
    );

    Ok(successor)
}
