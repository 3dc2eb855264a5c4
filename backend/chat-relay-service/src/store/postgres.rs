use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::Row;

use super::ChatStore;
use crate::error::StoreError;
use crate::models::{
    CallRecord, CallStatus, CallType, ChatMessage, Identity, MessagePreview, Role, Room, RoomKey,
    RoomSummary,
};

const MESSAGE_COLUMNS: &str = "id, room_id, sender_email, sender_role, body, sent_at, read_status";
const CALL_COLUMNS: &str = "id, room_id, caller_email, caller_role, call_type, status, \
                            started_at, ended_at, duration_seconds";

/// PostgreSQL-backed store over a deadpool connection pool.
#[derive(Clone)]
pub struct PgChatStore {
    pool: Pool,
}

impl PgChatStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn parse_column<T>(row: &Row, column: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|e: String| StoreError::Corrupt(format!("{column}: {e}")))
}

fn room_from_row(row: &Row) -> Result<Room, StoreError> {
    Ok(Room {
        room_id: row.try_get("room_id")?,
        dealer_email: row.try_get("dealer_email")?,
        technician_email: row.try_get("technician_email")?,
        scope_id: row.try_get("scope_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn message_from_row(row: &Row) -> Result<ChatMessage, StoreError> {
    Ok(ChatMessage {
        id: row.try_get("id")?,
        room_id: row.try_get("room_id")?,
        sender_email: row.try_get("sender_email")?,
        sender_role: parse_column::<Role>(row, "sender_role")?,
        body: row.try_get("body")?,
        sent_at: row.try_get("sent_at")?,
        read_status: row.try_get("read_status")?,
    })
}

fn call_from_row(row: &Row) -> Result<CallRecord, StoreError> {
    Ok(CallRecord {
        id: row.try_get("id")?,
        room_id: row.try_get("room_id")?,
        caller_email: row.try_get("caller_email")?,
        caller_role: parse_column::<Role>(row, "caller_role")?,
        call_type: parse_column::<CallType>(row, "call_type")?,
        status: parse_column::<CallStatus>(row, "status")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
    })
}

fn summary_from_row(row: &Row) -> Result<RoomSummary, StoreError> {
    let last_id: Option<i64> = row.try_get("last_id")?;
    let last_message = match last_id {
        Some(id) => Some(MessagePreview {
            id,
            sender_email: row.try_get("last_sender_email")?,
            body: row.try_get("last_body")?,
            sent_at: row.try_get("last_sent_at")?,
        }),
        None => None,
    };

    Ok(RoomSummary {
        room_id: row.try_get("room_id")?,
        dealer_email: row.try_get("dealer_email")?,
        technician_email: row.try_get("technician_email")?,
        scope_id: row.try_get("scope_id")?,
        last_message,
        unread_count: row.try_get("unread_count")?,
    })
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn create_room_if_absent(&self, key: &RoomKey) -> Result<Room, StoreError> {
        let client = self.pool.get().await?;
        let room_id = key.room_id();

        client
            .execute(
                "INSERT INTO chat_rooms (room_id, dealer_email, technician_email, scope_id) \
                 VALUES ($1, $2, $3, $4) ON CONFLICT (room_id) DO NOTHING",
                &[
                    &room_id,
                    &key.dealer_email,
                    &key.technician_email,
                    &key.scope_id,
                ],
            )
            .await?;

        let row = client
            .query_one(
                "SELECT room_id, dealer_email, technician_email, scope_id, created_at \
                 FROM chat_rooms WHERE room_id = $1",
                &[&room_id],
            )
            .await?;
        room_from_row(&row)
    }

    async fn find_room(&self, room_id: &str) -> Result<Option<Room>, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT room_id, dealer_email, technician_email, scope_id, created_at \
                 FROM chat_rooms WHERE room_id = $1",
                &[&room_id],
            )
            .await?;
        row.as_ref().map(room_from_row).transpose()
    }

    async fn insert_message(
        &self,
        room_id: &str,
        sender: &Identity,
        body: &str,
    ) -> Result<ChatMessage, StoreError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "INSERT INTO chat_messages (room_id, sender_email, sender_role, body) \
             VALUES ($1, $2, $3, $4) RETURNING {MESSAGE_COLUMNS}"
        );
        let row = client
            .query_one(
                sql.as_str(),
                &[&room_id, &sender.email, &sender.role.as_str(), &body],
            )
            .await?;
        message_from_row(&row)
    }

    async fn list_messages(
        &self,
        room_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages \
             WHERE room_id = $1 ORDER BY sent_at ASC, id ASC LIMIT $2 OFFSET $3"
        );
        let rows = client
            .query(sql.as_str(), &[&room_id, &limit, &offset])
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn mark_message_read(&self, message_id: i64) -> Result<Option<String>, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "UPDATE chat_messages SET read_status = TRUE WHERE id = $1 RETURNING room_id",
                &[&message_id],
            )
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("room_id")?),
            None => None,
        })
    }

    async fn mark_room_read(&self, room_id: &str, reader_email: &str) -> Result<u64, StoreError> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE chat_messages SET read_status = TRUE \
                 WHERE room_id = $1 AND sender_email <> $2 AND read_status = FALSE",
                &[&room_id, &reader_email],
            )
            .await?;
        Ok(updated)
    }

    async fn insert_call(
        &self,
        room_id: &str,
        caller: &Identity,
        call_type: CallType,
    ) -> Result<CallRecord, StoreError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "INSERT INTO call_logs (room_id, caller_email, caller_role, call_type, status) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {CALL_COLUMNS}"
        );
        let row = client
            .query_one(
                sql.as_str(),
                &[
                    &room_id,
                    &caller.email,
                    &caller.role.as_str(),
                    &call_type.as_str(),
                    &CallStatus::Initiated.as_str(),
                ],
            )
            .await?;
        call_from_row(&row)
    }

    async fn update_call_status(
        &self,
        call_id: i64,
        status: CallStatus,
        ended_at: Option<DateTime<Utc>>,
        duration_seconds: Option<i64>,
    ) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE call_logs SET status = $2, \
                 ended_at = COALESCE($3, ended_at), \
                 duration_seconds = COALESCE($4, duration_seconds) \
                 WHERE id = $1",
                &[&call_id, &status.as_str(), &ended_at, &duration_seconds],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("call {call_id}")));
        }
        Ok(())
    }

    async fn find_call(&self, call_id: i64) -> Result<Option<CallRecord>, StoreError> {
        let client = self.pool.get().await?;
        let sql = format!("SELECT {CALL_COLUMNS} FROM call_logs WHERE id = $1");
        let row = client.query_opt(sql.as_str(), &[&call_id]).await?;
        row.as_ref().map(call_from_row).transpose()
    }

    async fn find_call_started_at(
        &self,
        call_id: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT started_at FROM call_logs WHERE id = $1",
                &[&call_id],
            )
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("started_at")?),
            None => None,
        })
    }

    async fn unread_count(&self, email: &str) -> Result<i64, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) AS unread FROM chat_messages m \
                 JOIN chat_rooms r ON r.room_id = m.room_id \
                 WHERE (r.dealer_email = $1 OR r.technician_email = $1) \
                   AND m.sender_email <> $1 AND m.read_status = FALSE",
                &[&email],
            )
            .await?;
        Ok(row.try_get("unread")?)
    }

    async fn list_rooms_for(&self, email: &str) -> Result<Vec<RoomSummary>, StoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT r.room_id, r.dealer_email, r.technician_email, r.scope_id, \
                        last.id AS last_id, last.sender_email AS last_sender_email, \
                        last.body AS last_body, last.sent_at AS last_sent_at, \
                        (SELECT COUNT(*) FROM chat_messages u \
                          WHERE u.room_id = r.room_id AND u.sender_email <> $1 \
                            AND u.read_status = FALSE) AS unread_count \
                 FROM chat_rooms r \
                 LEFT JOIN LATERAL ( \
                     SELECT id, sender_email, body, sent_at FROM chat_messages \
                     WHERE room_id = r.room_id ORDER BY sent_at DESC, id DESC LIMIT 1 \
                 ) last ON TRUE \
                 WHERE r.dealer_email = $1 OR r.technician_email = $1 \
                 ORDER BY COALESCE(last.sent_at, r.created_at) DESC, r.room_id ASC",
                &[&email],
            )
            .await?;
        rows.iter().map(summary_from_row).collect()
    }
}
