use crate::{bool_from_any_row, datetime_from_db_text, datetime_to_db_text, DbError, DbPool};
use chrono::{DateTime, Utc};
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub id: i64,
    pub kind: i16,
    pub name: Option<String>,
    pub admin_id: Option<i64>,
    pub last_message_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for ConversationRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let created_at_raw: String = row.try_get("created_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            name: row.try_get("name")?,
            admin_id: row.try_get("admin_id")?,
            last_message_id: row.try_get("last_message_id")?,
            created_at: datetime_from_db_text(&created_at_raw)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ParticipantRow {
    pub conversation_id: i64,
    pub user_id: i64,
    pub role: i16,
    pub co_admin: bool,
    pub is_hidden: bool,
    pub hidden_at: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
    pub last_read_message_id: Option<i64>,
    pub joined_at: DateTime<Utc>,
}

impl ParticipantRow {
    /// Active membership: never left. Hidden participants are still active.
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for ParticipantRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let hidden_at_raw: Option<String> = row.try_get("hidden_at")?;
        let left_at_raw: Option<String> = row.try_get("left_at")?;
        let joined_at_raw: String = row.try_get("joined_at")?;
        Ok(Self {
            conversation_id: row.try_get("conversation_id")?,
            user_id: row.try_get("user_id")?,
            role: row.try_get("role")?,
            co_admin: bool_from_any_row(row, "co_admin")?,
            is_hidden: bool_from_any_row(row, "is_hidden")?,
            hidden_at: hidden_at_raw
                .as_deref()
                .map(datetime_from_db_text)
                .transpose()?,
            left_at: left_at_raw
                .as_deref()
                .map(datetime_from_db_text)
                .transpose()?,
            last_read_message_id: row.try_get("last_read_message_id")?,
            joined_at: datetime_from_db_text(&joined_at_raw)?,
        })
    }
}

const CONVERSATION_COLS: &str =
    "id, kind, name, admin_id, last_message_id, created_at";
const PARTICIPANT_COLS: &str = "conversation_id, user_id, role, co_admin, is_hidden, \
     hidden_at, left_at, last_read_message_id, joined_at";

pub async fn create_conversation(
    pool: &DbPool,
    id: i64,
    kind: i16,
    name: Option<&str>,
    admin_id: Option<i64>,
) -> Result<ConversationRow, DbError> {
    let row = sqlx::query_as::<_, ConversationRow>(&format!(
        "INSERT INTO conversations (id, kind, name, admin_id)
         VALUES ($1, $2, $3, $4)
         RETURNING {CONVERSATION_COLS}"
    ))
    .bind(id)
    .bind(kind)
    .bind(name)
    .bind(admin_id)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn get_conversation(
    pool: &DbPool,
    id: i64,
) -> Result<Option<ConversationRow>, DbError> {
    let row = sqlx::query_as::<_, ConversationRow>(&format!(
        "SELECT {CONVERSATION_COLS} FROM conversations WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Direct conversation both users participate in, if one exists.
pub async fn find_direct_between(
    pool: &DbPool,
    user_a: i64,
    user_b: i64,
) -> Result<Option<ConversationRow>, DbError> {
    let row = sqlx::query_as::<_, ConversationRow>(
        "SELECT c.id, c.kind, c.name, c.admin_id, c.last_message_id, c.created_at
         FROM conversations c
         INNER JOIN participants a ON a.conversation_id = c.id AND a.user_id = $1
         INNER JOIN participants b ON b.conversation_id = c.id AND b.user_id = $2
         WHERE c.kind = 0
         LIMIT 1",
    )
    .bind(user_a)
    .bind(user_b)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn add_participant(
    pool: &DbPool,
    conversation_id: i64,
    user_id: i64,
    role: i16,
    co_admin: bool,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO participants (conversation_id, user_id, role, co_admin)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (conversation_id, user_id)
         DO UPDATE SET left_at = NULL, is_hidden = 0, hidden_at = NULL, role = $3, co_admin = $4",
    )
    .bind(conversation_id)
    .bind(user_id)
    .bind(role)
    .bind(if co_admin { 1_i32 } else { 0 })
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_participant(
    pool: &DbPool,
    conversation_id: i64,
    user_id: i64,
) -> Result<Option<ParticipantRow>, DbError> {
    let row = sqlx::query_as::<_, ParticipantRow>(&format!(
        "SELECT {PARTICIPANT_COLS} FROM participants
         WHERE conversation_id = $1 AND user_id = $2"
    ))
    .bind(conversation_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// All participant rows for a conversation, ordered by join time. Includes
/// departed rows; callers filter with `is_active` when they need membership.
pub async fn get_participants(
    pool: &DbPool,
    conversation_id: i64,
) -> Result<Vec<ParticipantRow>, DbError> {
    let rows = sqlx::query_as::<_, ParticipantRow>(&format!(
        "SELECT {PARTICIPANT_COLS} FROM participants
         WHERE conversation_id = $1
         ORDER BY joined_at ASC, user_id ASC"
    ))
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Conversations visible in a user's sidebar: active membership, not hidden,
/// most recent activity first.
pub async fn list_visible_for_user(
    pool: &DbPool,
    user_id: i64,
) -> Result<Vec<ConversationRow>, DbError> {
    let rows = sqlx::query_as::<_, ConversationRow>(
        "SELECT c.id, c.kind, c.name, c.admin_id, c.last_message_id, c.created_at
         FROM conversations c
         INNER JOIN participants p ON p.conversation_id = c.id AND p.user_id = $1
         WHERE p.left_at IS NULL AND p.is_hidden = 0
         ORDER BY CASE WHEN c.last_message_id IS NULL THEN 1 ELSE 0 END,
                  c.last_message_id DESC, c.id DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn set_hidden(
    pool: &DbPool,
    conversation_id: i64,
    user_id: i64,
    hidden: bool,
    at: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE participants SET is_hidden = $3, hidden_at = $4
         WHERE conversation_id = $1 AND user_id = $2",
    )
    .bind(conversation_id)
    .bind(user_id)
    .bind(if hidden { 1_i32 } else { 0 })
    .bind(if hidden {
        Some(datetime_to_db_text(at))
    } else {
        None
    })
    .execute(pool)
    .await?;
    Ok(())
}

/// Reappearance: clear the hidden flag for every hidden, still-active
/// participant other than the author. Returns the affected user ids.
pub async fn unhide_all_except(
    pool: &DbPool,
    conversation_id: i64,
    author_id: i64,
) -> Result<Vec<i64>, DbError> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "UPDATE participants SET is_hidden = 0, hidden_at = NULL
         WHERE conversation_id = $1 AND user_id != $2
           AND is_hidden = 1 AND left_at IS NULL
         RETURNING user_id",
    )
    .bind(conversation_id)
    .bind(author_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn mark_left(
    pool: &DbPool,
    conversation_id: i64,
    user_id: i64,
    at: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE participants SET left_at = $3, is_hidden = 1
         WHERE conversation_id = $1 AND user_id = $2",
    )
    .bind(conversation_id)
    .bind(user_id)
    .bind(datetime_to_db_text(at))
    .execute(pool)
    .await?;
    Ok(())
}

/// Hand the primary-admin slot to a new participant. Updates the
/// conversation row and the participant's role/co-admin flags in one
/// transaction so the admin invariant never observes a half state.
pub async fn set_admin(
    pool: &DbPool,
    conversation_id: i64,
    new_admin_id: i64,
) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE conversations SET admin_id = $2 WHERE id = $1")
        .bind(conversation_id)
        .bind(new_admin_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "UPDATE participants SET role = 2, co_admin = 1
         WHERE conversation_id = $1 AND user_id = $2",
    )
    .bind(conversation_id)
    .bind(new_admin_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

pub async fn update_name(
    pool: &DbPool,
    conversation_id: i64,
    name: &str,
) -> Result<(), DbError> {
    sqlx::query("UPDATE conversations SET name = $2 WHERE id = $1")
        .bind(conversation_id)
        .bind(name)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_last_read(
    pool: &DbPool,
    conversation_id: i64,
    user_id: i64,
    message_id: i64,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE participants SET last_read_message_id = $3
         WHERE conversation_id = $1 AND user_id = $2",
    )
    .bind(conversation_id)
    .bind(user_id)
    .bind(message_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Terminal deletion: the conversation emptied out, so the row and all of
/// its messages, receipts and cleared markers go with it.
pub async fn delete_conversation(pool: &DbPool, conversation_id: i64) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "DELETE FROM message_receipts WHERE message_id IN
         (SELECT id FROM messages WHERE conversation_id = $1)",
    )
    .bind(conversation_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "DELETE FROM message_cleared WHERE message_id IN
         (SELECT id FROM messages WHERE conversation_id = $1)",
    )
    .bind(conversation_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM messages WHERE conversation_id = $1")
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM participants WHERE conversation_id = $1")
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM conversations WHERE id = $1")
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}
