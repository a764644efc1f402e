use crate::{datetime_from_db_text, datetime_to_db_text, json_from_db_text, DbError, DbPool};
use chrono::{DateTime, Utc};
use sqlx::Row;

pub const RECEIPT_DELIVERED: i16 = 0;
pub const RECEIPT_READ: i16 = 1;

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: i64,
    pub conversation_id: i64,
    pub sender_id: i64,
    pub content: Option<String>,
    pub file_info: Option<serde_json::Value>,
    pub status: i16,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for MessageRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let created_at_raw: String = row.try_get("created_at")?;
        let file_info_raw: Option<String> = row.try_get("file_info")?;
        Ok(Self {
            id: row.try_get("id")?,
            conversation_id: row.try_get("conversation_id")?,
            sender_id: row.try_get("sender_id")?,
            content: row.try_get("content")?,
            file_info: file_info_raw.as_deref().map(json_from_db_text).transpose()?,
            status: row.try_get("status")?,
            created_at: datetime_from_db_text(&created_at_raw)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ReceiptRow {
    pub user_id: i64,
    pub kind: i16,
    pub at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for ReceiptRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let at_raw: String = row.try_get("at")?;
        Ok(Self {
            user_id: row.try_get("user_id")?,
            kind: row.try_get("kind")?,
            at: datetime_from_db_text(&at_raw)?,
        })
    }
}

const MESSAGE_COLS: &str =
    "id, conversation_id, sender_id, content, file_info, status, created_at";

pub async fn create_message(
    pool: &DbPool,
    id: i64,
    conversation_id: i64,
    sender_id: i64,
    content: Option<&str>,
    file_info: Option<&serde_json::Value>,
) -> Result<MessageRow, DbError> {
    let row = sqlx::query_as::<_, MessageRow>(&format!(
        "INSERT INTO messages (id, conversation_id, sender_id, content, file_info, status)
         VALUES ($1, $2, $3, $4, $5, 0)
         RETURNING {MESSAGE_COLS}"
    ))
    .bind(id)
    .bind(conversation_id)
    .bind(sender_id)
    .bind(content)
    .bind(file_info.map(|v| v.to_string()))
    .fetch_one(pool)
    .await?;

    // Keep the conversation's activity pointer current.
    let _ = sqlx::query("UPDATE conversations SET last_message_id = $1 WHERE id = $2")
        .bind(row.id)
        .bind(conversation_id)
        .execute(pool)
        .await;

    Ok(row)
}

pub async fn get_message(pool: &DbPool, id: i64) -> Result<Option<MessageRow>, DbError> {
    let row = sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLS} FROM messages WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn last_message(
    pool: &DbPool,
    conversation_id: i64,
) -> Result<Option<MessageRow>, DbError> {
    let row = sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLS} FROM messages
         WHERE conversation_id = $1
         ORDER BY id DESC LIMIT 1"
    ))
    .bind(conversation_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Atomic set-add for the delivered-to / read-by sets. Returns whether a new
/// entry was inserted; a duplicate is absorbed by the conflict clause.
pub async fn add_receipt(
    pool: &DbPool,
    message_id: i64,
    user_id: i64,
    kind: i16,
    at: DateTime<Utc>,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        "INSERT INTO message_receipts (message_id, user_id, kind, at)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (message_id, user_id, kind) DO NOTHING",
    )
    .bind(message_id)
    .bind(user_id)
    .bind(kind)
    .bind(datetime_to_db_text(at))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_receipts(
    pool: &DbPool,
    message_id: i64,
) -> Result<Vec<ReceiptRow>, DbError> {
    let rows = sqlx::query_as::<_, ReceiptRow>(
        "SELECT user_id, kind, at FROM message_receipts
         WHERE message_id = $1
         ORDER BY at ASC, user_id ASC",
    )
    .bind(message_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Raise the aggregate status, never lower it. Returns whether a transition
/// actually happened.
pub async fn raise_status(pool: &DbPool, message_id: i64, status: i16) -> Result<bool, DbError> {
    let result = sqlx::query("UPDATE messages SET status = $2 WHERE id = $1 AND status < $2")
        .bind(message_id)
        .bind(status)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Messages in a conversation the user has not read yet: (id, sender_id)
/// pairs where the user is a recipient, no read receipt exists, and the
/// user has not erased the message. Matches `count_unread`.
pub async fn unread_for_user(
    pool: &DbPool,
    conversation_id: i64,
    user_id: i64,
) -> Result<Vec<(i64, i64)>, DbError> {
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT m.id, m.sender_id FROM messages m
         WHERE m.conversation_id = $1 AND m.sender_id != $2
           AND NOT EXISTS (SELECT 1 FROM message_receipts r
                           WHERE r.message_id = m.id AND r.user_id = $2 AND r.kind = 1)
           AND NOT EXISTS (SELECT 1 FROM message_cleared c
                           WHERE c.message_id = m.id AND c.user_id = $2)
         ORDER BY m.id ASC",
    )
    .bind(conversation_id)
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Bulk mark-read: delivered+read receipts for every id, status raised to
/// read, all inside one transaction so readers never observe a half batch.
pub async fn mark_read_bulk(
    pool: &DbPool,
    message_ids: &[i64],
    user_id: i64,
    at: DateTime<Utc>,
) -> Result<(), DbError> {
    let at_text = datetime_to_db_text(at);
    let mut tx = pool.begin().await?;

    for &id in message_ids {
        sqlx::query(
            "INSERT INTO message_receipts (message_id, user_id, kind, at)
             VALUES ($1, $2, 0, $3), ($1, $2, 1, $3)
             ON CONFLICT (message_id, user_id, kind) DO NOTHING",
        )
        .bind(id)
        .bind(user_id)
        .bind(&at_text)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE messages SET status = 2 WHERE id = $1 AND status < 2")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Unread count for the sidebar. Cleared messages do not count.
pub async fn count_unread(
    pool: &DbPool,
    conversation_id: i64,
    user_id: i64,
) -> Result<i64, DbError> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM messages m
         WHERE m.conversation_id = $1 AND m.sender_id != $2
           AND NOT EXISTS (SELECT 1 FROM message_receipts r
                           WHERE r.message_id = m.id AND r.user_id = $2 AND r.kind = 1)
           AND NOT EXISTS (SELECT 1 FROM message_cleared c
                           WHERE c.message_id = m.id AND c.user_id = $2)",
    )
    .bind(conversation_id)
    .bind(user_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Soft-erase the whole conversation history for one user. Other
/// participants and the hidden/left flags are unaffected.
pub async fn clear_all_for_user(
    pool: &DbPool,
    conversation_id: i64,
    user_id: i64,
) -> Result<u64, DbError> {
    let result = sqlx::query(
        "INSERT INTO message_cleared (message_id, user_id)
         SELECT id, $2 FROM messages WHERE conversation_id = $1
         ON CONFLICT (message_id, user_id) DO NOTHING",
    )
    .bind(conversation_id)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn cleared_ids_for_user(
    pool: &DbPool,
    conversation_id: i64,
    user_id: i64,
) -> Result<Vec<i64>, DbError> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT c.message_id FROM message_cleared c
         INNER JOIN messages m ON m.id = c.message_id
         WHERE m.conversation_id = $1 AND c.user_id = $2
         ORDER BY c.message_id ASC",
    )
    .bind(conversation_id)
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{conversations, create_pool, run_migrations};

    async fn seeded_pool() -> DbPool {
        let pool = create_pool("sqlite::memory:", 1).await.expect("pool");
        run_migrations(&pool).await.expect("migrations");
        conversations::create_conversation(&pool, 10, 1, Some("room"), Some(1))
            .await
            .expect("conversation");
        conversations::add_participant(&pool, 10, 1, 2, true)
            .await
            .expect("participant");
        conversations::add_participant(&pool, 10, 2, 0, false)
            .await
            .expect("participant");
        pool
    }

    #[tokio::test]
    async fn receipt_insert_is_idempotent() {
        let pool = seeded_pool().await;
        create_message(&pool, 100, 10, 1, Some("hi"), None)
            .await
            .expect("message");

        let now = Utc::now();
        assert!(add_receipt(&pool, 100, 2, RECEIPT_DELIVERED, now)
            .await
            .expect("first"));
        assert!(!add_receipt(&pool, 100, 2, RECEIPT_DELIVERED, now)
            .await
            .expect("duplicate"));

        let receipts = get_receipts(&pool, 100).await.expect("receipts");
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].user_id, 2);
    }

    #[tokio::test]
    async fn status_never_regresses() {
        let pool = seeded_pool().await;
        create_message(&pool, 100, 10, 1, Some("hi"), None)
            .await
            .expect("message");

        assert!(raise_status(&pool, 100, 2).await.expect("to read"));
        assert!(!raise_status(&pool, 100, 1).await.expect("back to delivered"));

        let msg = get_message(&pool, 100).await.expect("get").expect("exists");
        assert_eq!(msg.status, 2);
    }

    #[tokio::test]
    async fn unread_excludes_own_and_read_messages() {
        let pool = seeded_pool().await;
        create_message(&pool, 100, 10, 1, Some("a"), None).await.unwrap();
        create_message(&pool, 101, 10, 1, Some("b"), None).await.unwrap();
        create_message(&pool, 102, 10, 2, Some("mine"), None).await.unwrap();

        add_receipt(&pool, 100, 2, RECEIPT_READ, Utc::now())
            .await
            .unwrap();

        let unread = unread_for_user(&pool, 10, 2).await.expect("unread");
        assert_eq!(unread, vec![(101, 1)]);
        assert_eq!(count_unread(&pool, 10, 2).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn cleared_messages_do_not_count_as_unread() {
        let pool = seeded_pool().await;
        create_message(&pool, 100, 10, 1, Some("a"), None).await.unwrap();
        create_message(&pool, 101, 10, 1, Some("b"), None).await.unwrap();

        clear_all_for_user(&pool, 10, 2).await.expect("clear");

        assert_eq!(count_unread(&pool, 10, 2).await.expect("count"), 0);
        assert!(unread_for_user(&pool, 10, 2).await.expect("unread").is_empty());
        assert_eq!(
            cleared_ids_for_user(&pool, 10, 2).await.expect("cleared"),
            vec![100, 101]
        );
    }
}
