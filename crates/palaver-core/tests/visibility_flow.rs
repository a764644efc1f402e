use palaver_core::{conversation, message, visibility, AppConfig, AppState};
use palaver_models::conversation::ConversationKind;
use palaver_models::gateway::EVENT_CONVERSATION_REAPPEARED;
use uuid::Uuid;

async fn test_state() -> AppState {
    let pool = palaver_db::create_pool("sqlite::memory:", 1)
        .await
        .expect("pool");
    palaver_db::run_migrations(&pool).await.expect("migrations");
    AppState::new(pool, AppConfig::default())
}

async fn visible_ids(state: &AppState, user_id: i64) -> Vec<i64> {
    palaver_db::conversations::list_visible_for_user(&state.db, user_id)
        .await
        .expect("visible")
        .into_iter()
        .map(|c| c.id)
        .collect()
}

#[tokio::test]
async fn new_activity_unhides_for_other_participants() {
    let state = test_state().await;
    let conv = conversation::create_direct(&state, 1, 2).await.expect("direct");

    visibility::hide_conversation(&state, conv.id, 2)
        .await
        .expect("hide");
    assert!(visible_ids(&state, 2).await.is_empty());

    let _ = state.registry.register(2, Uuid::new_v4());
    let mut rx = state.event_bus.subscribe();

    message::send_message(&state, conv.id, 1, Some("knock knock".into()), None)
        .await
        .expect("send");

    assert_eq!(visible_ids(&state, 2).await, vec![conv.id]);

    let mut reappeared = false;
    while let Ok(event) = rx.try_recv() {
        if event.event_type == EVENT_CONVERSATION_REAPPEARED {
            assert_eq!(event.target_user_ids, Some(vec![2]));
            assert_eq!(event.payload["conversation_id"].as_i64(), Some(conv.id));
            reappeared = true;
        }
    }
    assert!(reappeared);
}

#[tokio::test]
async fn reappearance_is_queued_for_offline_participants() {
    let state = test_state().await;
    let conv = conversation::create_direct(&state, 1, 2).await.expect("direct");

    visibility::hide_conversation(&state, conv.id, 2)
        .await
        .expect("hide");

    // User 2 is offline; the snapshot waits in their pending queue.
    message::send_message(&state, conv.id, 1, Some("hello?".into()), None)
        .await
        .expect("send");

    assert_eq!(state.pending.queued_count(2), 1);
    let queued = state.pending.drain(2);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].event_type, EVENT_CONVERSATION_REAPPEARED);
    assert_eq!(state.pending.queued_count(2), 0);
}

#[tokio::test]
async fn cleared_history_survives_reappearance() {
    let state = test_state().await;
    let conv = conversation::create_direct(&state, 1, 2).await.expect("direct");

    message::send_message(&state, conv.id, 1, Some("old".into()), None)
        .await
        .expect("send");
    let cleared = visibility::clear_history(&state, conv.id, 2)
        .await
        .expect("clear");
    assert_eq!(cleared, 1);

    visibility::hide_conversation(&state, conv.id, 2)
        .await
        .expect("hide");
    message::send_message(&state, conv.id, 1, Some("new".into()), None)
        .await
        .expect("send");

    // The conversation is back, the erased message is not.
    assert_eq!(visible_ids(&state, 2).await, vec![conv.id]);
    assert_eq!(
        palaver_db::messages::count_unread(&state.db, conv.id, 2)
            .await
            .expect("count"),
        1
    );
    assert_eq!(
        palaver_db::messages::cleared_ids_for_user(&state.db, conv.id, 2)
            .await
            .expect("cleared")
            .len(),
        1
    );
}

#[tokio::test]
async fn hiding_own_copy_leaves_others_untouched() {
    let state = test_state().await;
    let conv = conversation::create_direct(&state, 1, 2).await.expect("direct");

    visibility::hide_conversation(&state, conv.id, 2)
        .await
        .expect("hide");

    assert_eq!(visible_ids(&state, 1).await, vec![conv.id]);
    visibility::unhide_conversation(&state, conv.id, 2)
        .await
        .expect("unhide");
    assert_eq!(visible_ids(&state, 2).await, vec![conv.id]);
}

#[tokio::test]
async fn direct_conversations_cannot_be_left() {
    let state = test_state().await;
    let conv = conversation::create_direct(&state, 1, 2).await.expect("direct");
    assert!(visibility::leave_conversation(&state, conv.id, 2)
        .await
        .is_err());
}

#[tokio::test]
async fn last_departure_deletes_the_conversation() {
    let state = test_state().await;
    let conv = conversation::create_group(&state, 1, ConversationKind::Group, "solo", &[])
        .await
        .expect("group");

    visibility::leave_conversation(&state, conv.id, 1)
        .await
        .expect("leave");

    assert!(
        palaver_db::conversations::get_conversation(&state.db, conv.id)
            .await
            .expect("get")
            .is_none()
    );
}

#[tokio::test]
async fn admin_departure_prefers_co_admin_successor() {
    let state = test_state().await;
    let conv = conversation::create_group(&state, 1, ConversationKind::Group, "team", &[2, 3])
        .await
        .expect("group");

    // Promote user 3 to co-admin; user 2 joined earlier but holds no badge.
    palaver_db::conversations::add_participant(
        &state.db,
        conv.id,
        3,
        palaver_models::conversation::ParticipantRole::Member.as_i16(),
        true,
    )
    .await
    .expect("promote");

    visibility::leave_conversation(&state, conv.id, 1)
        .await
        .expect("leave");

    let updated = palaver_db::conversations::get_conversation(&state.db, conv.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(updated.admin_id, Some(3));
}

#[tokio::test]
async fn admin_departure_falls_back_to_earliest_joined() {
    let state = test_state().await;
    let conv = conversation::create_group(&state, 1, ConversationKind::Group, "team", &[2, 3])
        .await
        .expect("group");

    visibility::leave_conversation(&state, conv.id, 1)
        .await
        .expect("leave");

    let updated = palaver_db::conversations::get_conversation(&state.db, conv.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(updated.admin_id, Some(2));

    let successor = palaver_db::conversations::get_participant(&state.db, conv.id, 2)
        .await
        .expect("get")
        .expect("exists");
    assert!(successor.co_admin);
}

#[tokio::test]
async fn departed_member_cannot_send() {
    let state = test_state().await;
    let conv = conversation::create_group(&state, 1, ConversationKind::Group, "team", &[2])
        .await
        .expect("group");

    visibility::leave_conversation(&state, conv.id, 2)
        .await
        .expect("leave");

    assert!(
        message::send_message(&state, conv.id, 2, Some("still here?".into()), None)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn broadcast_posting_is_admin_only() {
    let state = test_state().await;
    let conv = conversation::create_group(&state, 1, ConversationKind::Broadcast, "announce", &[2])
        .await
        .expect("broadcast");

    assert!(
        message::send_message(&state, conv.id, 2, Some("hi all".into()), None)
            .await
            .is_err()
    );
    assert!(
        message::send_message(&state, conv.id, 1, Some("release shipped".into()), None)
            .await
            .is_ok()
    );
}
