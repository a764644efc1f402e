use crate::error::CoreError;
use crate::{sidebar, AppState};
use chrono::Utc;
use palaver_db::conversations::ParticipantRow;
use palaver_db::messages::{MessageRow, RECEIPT_DELIVERED, RECEIPT_READ};
use palaver_models::gateway::{EVENT_MESSAGES_SEEN_BULK, EVENT_MESSAGE_STATUS_UPDATE};
use palaver_models::message::{DeliveryStatus, Receipt};
use serde_json::json;
use std::collections::BTreeMap;

/// Notify the sender that a message's aggregate status changed. Carries the
/// full delivered-to / read-by sets so the client can render per-recipient
/// detail without another round trip.
async fn notify_sender(state: &AppState, message_id: i64) -> Result<(), CoreError> {
    let Some(message) = palaver_db::messages::get_message(&state.db, message_id).await? else {
        return Ok(());
    };

    let receipts = palaver_db::messages::get_receipts(&state.db, message_id).await?;
    let delivered_to: Vec<Receipt> = receipts
        .iter()
        .filter(|r| r.kind == RECEIPT_DELIVERED)
        .map(|r| Receipt {
            user_id: r.user_id,
            at: r.at,
        })
        .collect();
    let read_by: Vec<Receipt> = receipts
        .iter()
        .filter(|r| r.kind == RECEIPT_READ)
        .map(|r| Receipt {
            user_id: r.user_id,
            at: r.at,
        })
        .collect();

    state.event_bus.dispatch_to_user(
        EVENT_MESSAGE_STATUS_UPDATE,
        json!({
            "message_id": message.id,
            "conversation_id": message.conversation_id,
            "status": DeliveryStatus::from_i16(message.status),
            "delivered_to": delivered_to,
            "read_by": read_by,
        }),
        message.sender_id,
    );
    Ok(())
}

/// Initial delivery pass for a freshly persisted message: record delivered
/// receipts for recipients who are connected right now, and read receipts
/// for those actively viewing the conversation. Raises the aggregate status
/// accordingly and notifies the sender once if anything changed.
pub async fn dispatch_message(
    state: &AppState,
    message: &MessageRow,
    participants: &[ParticipantRow],
) -> Result<DeliveryStatus, CoreError> {
    let now = Utc::now();
    let mut target = DeliveryStatus::Sent;

    for participant in participants {
        if !participant.is_active() || participant.user_id == message.sender_id {
            continue;
        }
        if !state.registry.is_online(participant.user_id) {
            continue;
        }

        palaver_db::messages::add_receipt(
            &state.db,
            message.id,
            participant.user_id,
            RECEIPT_DELIVERED,
            now,
        )
        .await?;
        target = target.max(DeliveryStatus::Delivered);

        // Viewing the conversation right now counts as reading on arrival.
        if state.registry.active_conversation(participant.user_id) == Some(message.conversation_id)
        {
            palaver_db::messages::add_receipt(
                &state.db,
                message.id,
                participant.user_id,
                RECEIPT_READ,
                now,
            )
            .await?;
            target = DeliveryStatus::Read;
        }
    }

    if target > DeliveryStatus::Sent
        && palaver_db::messages::raise_status(&state.db, message.id, target.as_i16()).await?
    {
        notify_sender(state, message.id).await?;
    }

    Ok(target)
}

/// A recipient's device confirmed the message arrived.
pub async fn ack_delivered(
    state: &AppState,
    message_id: i64,
    user_id: i64,
) -> Result<(), CoreError> {
    let message = palaver_db::messages::get_message(&state.db, message_id)
        .await?
        .ok_or(CoreError::NotFound)?;
    guard_recipient(state, &message, user_id).await?;

    let inserted = palaver_db::messages::add_receipt(
        &state.db,
        message_id,
        user_id,
        RECEIPT_DELIVERED,
        Utc::now(),
    )
    .await?;
    if !inserted {
        // Duplicate ack, absorbed without notification.
        return Ok(());
    }

    if palaver_db::messages::raise_status(&state.db, message_id, DeliveryStatus::Delivered.as_i16())
        .await?
    {
        notify_sender(state, message_id).await?;
    }
    Ok(())
}

/// A recipient read the message (it became visible on screen).
pub async fn ack_seen(state: &AppState, message_id: i64, user_id: i64) -> Result<(), CoreError> {
    let message = palaver_db::messages::get_message(&state.db, message_id)
        .await?
        .ok_or(CoreError::NotFound)?;
    guard_recipient(state, &message, user_id).await?;

    let now = Utc::now();
    // Reading implies delivery; backfill the delivered receipt for clients
    // that skipped the intermediate ack.
    palaver_db::messages::add_receipt(&state.db, message_id, user_id, RECEIPT_DELIVERED, now)
        .await?;
    let inserted =
        palaver_db::messages::add_receipt(&state.db, message_id, user_id, RECEIPT_READ, now)
            .await?;
    if !inserted {
        return Ok(());
    }

    if palaver_db::messages::raise_status(&state.db, message_id, DeliveryStatus::Read.as_i16())
        .await?
    {
        notify_sender(state, message_id).await?;
    }
    Ok(())
}

/// Mark every unread message in a conversation as read for `user_id`.
/// Triggers inside the coalescing window of a previous call are no-ops.
/// Senders are notified once each with the full batch of their message ids,
/// not once per message. Returns the ids that were marked.
pub async fn mark_conversation_read(
    state: &AppState,
    conversation_id: i64,
    user_id: i64,
) -> Result<Vec<i64>, CoreError> {
    let conversation = palaver_db::conversations::get_conversation(&state.db, conversation_id)
        .await?
        .ok_or(CoreError::NotFound)?;
    let participant =
        palaver_db::conversations::get_participant(&state.db, conversation_id, user_id)
            .await?
            .ok_or(CoreError::Forbidden)?;
    if !participant.is_active() {
        return Err(CoreError::Forbidden);
    }

    if !state.read_coalescer.allow(user_id, conversation_id) {
        return Ok(Vec::new());
    }

    let unread = palaver_db::messages::unread_for_user(&state.db, conversation_id, user_id).await?;
    if unread.is_empty() {
        sidebar::reset_unread(state, user_id, conversation_id).await;
        return Ok(Vec::new());
    }

    let ids: Vec<i64> = unread.iter().map(|(id, _)| *id).collect();
    palaver_db::messages::mark_read_bulk(&state.db, &ids, user_id, Utc::now()).await?;

    let high_water = conversation
        .last_message_id
        .unwrap_or_else(|| *ids.last().unwrap_or(&0))
        .max(*ids.last().unwrap_or(&0));
    palaver_db::conversations::set_last_read(&state.db, conversation_id, user_id, high_water)
        .await?;

    sidebar::reset_unread(state, user_id, conversation_id).await;
    sidebar::invalidate(state, user_id).await;

    // Group the batch by sender; one notification per sender no matter how
    // many of their messages were read.
    let mut by_sender: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for (id, sender_id) in &unread {
        if *sender_id != user_id {
            by_sender.entry(*sender_id).or_default().push(*id);
        }
    }
    for (sender_id, message_ids) in by_sender {
        state.event_bus.dispatch_to_user(
            EVENT_MESSAGES_SEEN_BULK,
            json!({
                "conversation_id": conversation_id,
                "message_ids": message_ids,
                "seen_by": user_id,
            }),
            sender_id,
        );
    }

    Ok(ids)
}

/// Receipt acks are only valid from active participants other than the
/// sender. Violations are rejected before any state changes.
async fn guard_recipient(
    state: &AppState,
    message: &MessageRow,
    user_id: i64,
) -> Result<(), CoreError> {
    if message.sender_id == user_id {
        return Err(CoreError::Forbidden);
    }
    let participant =
        palaver_db::conversations::get_participant(&state.db, message.conversation_id, user_id)
            .await?
            .ok_or(CoreError::Forbidden)?;
    if !participant.is_active() {
        return Err(CoreError::Forbidden);
    }
    Ok(())
}
