use palaver_core::{conversation, delivery, message, AppConfig, AppState};
use palaver_db::messages::{RECEIPT_DELIVERED, RECEIPT_READ};
use palaver_models::gateway::EVENT_MESSAGES_SEEN_BULK;
use palaver_models::message::DeliveryStatus;
use uuid::Uuid;

async fn test_state() -> AppState {
    let pool = palaver_db::create_pool("sqlite::memory:", 1)
        .await
        .expect("pool");
    palaver_db::run_migrations(&pool).await.expect("migrations");
    AppState::new(pool, AppConfig::default())
}

#[tokio::test]
async fn delivery_ack_is_idempotent() {
    let state = test_state().await;
    let conv = conversation::create_direct(&state, 1, 2).await.expect("direct");
    let msg = message::send_message(&state, conv.id, 1, Some("hello".into()), None)
        .await
        .expect("send");

    delivery::ack_delivered(&state, msg.id, 2).await.expect("first ack");
    delivery::ack_delivered(&state, msg.id, 2).await.expect("duplicate ack");

    let receipts = palaver_db::messages::get_receipts(&state.db, msg.id)
        .await
        .expect("receipts");
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].kind, RECEIPT_DELIVERED);

    let stored = palaver_db::messages::get_message(&state.db, msg.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(stored.status, DeliveryStatus::Delivered.as_i16());
}

#[tokio::test]
async fn read_ack_backfills_delivered_receipt() {
    let state = test_state().await;
    let conv = conversation::create_direct(&state, 1, 2).await.expect("direct");
    let msg = message::send_message(&state, conv.id, 1, Some("hello".into()), None)
        .await
        .expect("send");

    // Client skipped the delivered ack and went straight to read.
    delivery::ack_seen(&state, msg.id, 2).await.expect("seen");

    let receipts = palaver_db::messages::get_receipts(&state.db, msg.id)
        .await
        .expect("receipts");
    let kinds: Vec<i16> = receipts.iter().map(|r| r.kind).collect();
    assert!(kinds.contains(&RECEIPT_DELIVERED));
    assert!(kinds.contains(&RECEIPT_READ));

    let stored = palaver_db::messages::get_message(&state.db, msg.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(stored.status, DeliveryStatus::Read.as_i16());
}

#[tokio::test]
async fn sender_cannot_ack_own_message() {
    let state = test_state().await;
    let conv = conversation::create_direct(&state, 1, 2).await.expect("direct");
    let msg = message::send_message(&state, conv.id, 1, Some("hello".into()), None)
        .await
        .expect("send");

    assert!(delivery::ack_delivered(&state, msg.id, 1).await.is_err());
    assert!(delivery::ack_seen(&state, msg.id, 1).await.is_err());
}

#[tokio::test]
async fn connected_recipient_gets_delivered_on_send() {
    let state = test_state().await;
    let conv = conversation::create_direct(&state, 1, 2).await.expect("direct");

    let _ = state.registry.register(2, Uuid::new_v4());

    let msg = message::send_message(&state, conv.id, 1, Some("hello".into()), None)
        .await
        .expect("send");

    let stored = palaver_db::messages::get_message(&state.db, msg.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(stored.status, DeliveryStatus::Delivered.as_i16());
}

#[tokio::test]
async fn viewing_recipient_reads_on_arrival() {
    let state = test_state().await;
    let conv = conversation::create_direct(&state, 1, 2).await.expect("direct");

    let _ = state.registry.register(2, Uuid::new_v4());
    state.registry.set_active_conversation(2, Some(conv.id));

    let msg = message::send_message(&state, conv.id, 1, Some("hello".into()), None)
        .await
        .expect("send");

    let stored = palaver_db::messages::get_message(&state.db, msg.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(stored.status, DeliveryStatus::Read.as_i16());

    let receipts = palaver_db::messages::get_receipts(&state.db, msg.id)
        .await
        .expect("receipts");
    assert!(receipts
        .iter()
        .any(|r| r.user_id == 2 && r.kind == RECEIPT_READ));
}

#[tokio::test]
async fn bulk_read_notifies_each_sender_once() {
    let state = test_state().await;
    let conv = conversation::create_group(
        &state,
        1,
        palaver_models::conversation::ConversationKind::Group,
        "standup",
        &[2, 3],
    )
    .await
    .expect("group");

    message::send_message(&state, conv.id, 1, Some("one".into()), None)
        .await
        .expect("send");
    message::send_message(&state, conv.id, 1, Some("two".into()), None)
        .await
        .expect("send");
    message::send_message(&state, conv.id, 3, Some("three".into()), None)
        .await
        .expect("send");

    let mut rx = state.event_bus.subscribe();
    let marked = delivery::mark_conversation_read(&state, conv.id, 2)
        .await
        .expect("mark read");
    assert_eq!(marked.len(), 3);

    let mut bulk_events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if event.event_type == EVENT_MESSAGES_SEEN_BULK {
            bulk_events.push(event);
        }
    }
    // One batch per sender, not one per message.
    assert_eq!(bulk_events.len(), 2);
    for event in &bulk_events {
        let seen_by = event.payload["seen_by"].as_i64().expect("seen_by");
        assert_eq!(seen_by, 2);
        let ids = event.payload["message_ids"].as_array().expect("ids");
        let target = event.target_user_ids.as_ref().expect("targeted");
        match target.as_slice() {
            [1] => assert_eq!(ids.len(), 2),
            [3] => assert_eq!(ids.len(), 1),
            other => panic!("unexpected target {other:?}"),
        }
    }
}

#[tokio::test]
async fn repeated_mark_read_is_coalesced() {
    let state = test_state().await;
    let conv = conversation::create_direct(&state, 1, 2).await.expect("direct");
    message::send_message(&state, conv.id, 1, Some("hello".into()), None)
        .await
        .expect("send");

    let first = delivery::mark_conversation_read(&state, conv.id, 2)
        .await
        .expect("first");
    assert_eq!(first.len(), 1);

    // Second trigger lands inside the coalescing window.
    message::send_message(&state, conv.id, 1, Some("again".into()), None)
        .await
        .expect("send");
    let second = delivery::mark_conversation_read(&state, conv.id, 2)
        .await
        .expect("second");
    assert!(second.is_empty());
}

#[tokio::test]
async fn mark_read_skips_erased_messages() {
    let state = test_state().await;
    let conv = conversation::create_direct(&state, 1, 2).await.expect("direct");
    message::send_message(&state, conv.id, 1, Some("one".into()), None)
        .await
        .expect("send");
    message::send_message(&state, conv.id, 1, Some("two".into()), None)
        .await
        .expect("send");

    palaver_core::visibility::clear_history(&state, conv.id, 2)
        .await
        .expect("clear");

    // Erased messages are not part of the batch and no sender is told
    // they were seen.
    let mut rx = state.event_bus.subscribe();
    let marked = delivery::mark_conversation_read(&state, conv.id, 2)
        .await
        .expect("mark read");
    assert!(marked.is_empty());

    while let Ok(event) = rx.try_recv() {
        assert_ne!(event.event_type, EVENT_MESSAGES_SEEN_BULK);
    }
}

#[tokio::test]
async fn non_participant_cannot_mark_read() {
    let state = test_state().await;
    let conv = conversation::create_direct(&state, 1, 2).await.expect("direct");
    assert!(delivery::mark_conversation_read(&state, conv.id, 99)
        .await
        .is_err());
}
