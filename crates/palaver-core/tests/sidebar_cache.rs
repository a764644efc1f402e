use palaver_core::{conversation, delivery, message, sidebar, visibility, AppConfig, AppState};

async fn test_state(cache_enabled: bool) -> AppState {
    let pool = palaver_db::create_pool("sqlite::memory:", 1)
        .await
        .expect("pool");
    palaver_db::run_migrations(&pool).await.expect("migrations");
    AppState::new(
        pool,
        AppConfig {
            cache_enabled,
            ..AppConfig::default()
        },
    )
}

#[tokio::test]
async fn sidebar_carries_unread_and_preview() {
    let state = test_state(true).await;
    let conv = conversation::create_direct(&state, 1, 2).await.expect("direct");
    message::send_message(&state, conv.id, 1, Some("first".into()), None)
        .await
        .expect("send");
    message::send_message(&state, conv.id, 1, Some("second".into()), None)
        .await
        .expect("send");

    let entries = sidebar::sidebar_for_user(&state, 2).await.expect("sidebar");
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.conversation_id, conv.id);
    assert_eq!(entry.unread_count, 2);
    let preview = entry.last_message.as_ref().expect("preview");
    assert_eq!(preview.content.as_deref(), Some("second"));
    assert_eq!(preview.sender_id, 1);
}

#[tokio::test]
async fn hidden_conversations_stay_out_of_the_sidebar() {
    let state = test_state(true).await;
    let conv = conversation::create_direct(&state, 1, 2).await.expect("direct");

    assert_eq!(sidebar::sidebar_for_user(&state, 2).await.expect("before").len(), 1);

    visibility::hide_conversation(&state, conv.id, 2)
        .await
        .expect("hide");
    assert!(sidebar::sidebar_for_user(&state, 2).await.expect("after").is_empty());
}

#[tokio::test]
async fn unread_counter_resets_after_mark_read() {
    let state = test_state(true).await;
    let conv = conversation::create_direct(&state, 1, 2).await.expect("direct");
    message::send_message(&state, conv.id, 1, Some("hello".into()), None)
        .await
        .expect("send");

    assert_eq!(sidebar::unread_count(&state, 2, conv.id).await.expect("count"), 1);

    delivery::mark_conversation_read(&state, conv.id, 2)
        .await
        .expect("mark read");

    assert_eq!(sidebar::unread_count(&state, 2, conv.id).await.expect("count"), 0);
}

#[tokio::test]
async fn cached_counter_bumps_on_new_message() {
    let state = test_state(true).await;
    let conv = conversation::create_direct(&state, 1, 2).await.expect("direct");

    // Prime the counter cache, then send while it is warm.
    assert_eq!(sidebar::unread_count(&state, 2, conv.id).await.expect("count"), 0);
    message::send_message(&state, conv.id, 1, Some("ping".into()), None)
        .await
        .expect("send");

    assert_eq!(sidebar::unread_count(&state, 2, conv.id).await.expect("count"), 1);
}

#[tokio::test]
async fn clear_history_zeroes_the_counter() {
    let state = test_state(true).await;
    let conv = conversation::create_direct(&state, 1, 2).await.expect("direct");
    message::send_message(&state, conv.id, 1, Some("a".into()), None)
        .await
        .expect("send");
    message::send_message(&state, conv.id, 1, Some("b".into()), None)
        .await
        .expect("send");

    visibility::clear_history(&state, conv.id, 2)
        .await
        .expect("clear");

    assert_eq!(sidebar::unread_count(&state, 2, conv.id).await.expect("count"), 0);
    let entries = sidebar::sidebar_for_user(&state, 2).await.expect("sidebar");
    assert_eq!(entries[0].unread_count, 0);
}

#[tokio::test]
async fn everything_works_with_the_cache_disabled() {
    let state = test_state(false).await;
    assert!(!state.cache.is_enabled());

    let conv = conversation::create_direct(&state, 1, 2).await.expect("direct");
    message::send_message(&state, conv.id, 1, Some("hello".into()), None)
        .await
        .expect("send");

    let entries = sidebar::sidebar_for_user(&state, 2).await.expect("sidebar");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].unread_count, 1);

    delivery::mark_conversation_read(&state, conv.id, 2)
        .await
        .expect("mark read");
    assert_eq!(sidebar::unread_count(&state, 2, conv.id).await.expect("count"), 0);
}
