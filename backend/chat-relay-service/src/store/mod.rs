//! Persistence boundary of the relay.
//!
//! The relay only depends on [`ChatStore`]. Production wires in
//! [`PgChatStore`]; a process started without `DATABASE_URL`, and every test,
//! uses [`InMemoryChatStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{
    CallRecord, CallStatus, CallType, ChatMessage, Identity, Room, RoomKey, RoomSummary,
};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryChatStore;
pub use postgres::PgChatStore;

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Idempotent upsert. Existing rooms are returned unchanged.
    async fn create_room_if_absent(&self, key: &RoomKey) -> Result<Room, StoreError>;

    async fn find_room(&self, room_id: &str) -> Result<Option<Room>, StoreError>;

    /// Persist a message; id and `sent_at` are assigned here.
    async fn insert_message(
        &self,
        room_id: &str,
        sender: &Identity,
        body: &str,
    ) -> Result<ChatMessage, StoreError>;

    /// Oldest to newest.
    async fn list_messages(
        &self,
        room_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    /// Flip one message to read. Returns its room, or `None` for an unknown id.
    async fn mark_message_read(&self, message_id: i64) -> Result<Option<String>, StoreError>;

    /// Flip every unread message in the room not sent by `reader_email`.
    /// Returns the number of rows changed.
    async fn mark_room_read(&self, room_id: &str, reader_email: &str) -> Result<u64, StoreError>;

    /// Persist a new call in `INITIATED`.
    async fn insert_call(
        &self,
        room_id: &str,
        caller: &Identity,
        call_type: CallType,
    ) -> Result<CallRecord, StoreError>;

    async fn update_call_status(
        &self,
        call_id: i64,
        status: CallStatus,
        ended_at: Option<DateTime<Utc>>,
        duration_seconds: Option<i64>,
    ) -> Result<(), StoreError>;

    async fn find_call(&self, call_id: i64) -> Result<Option<CallRecord>, StoreError>;

    async fn find_call_started_at(
        &self,
        call_id: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Unread messages addressed to `email` across all of its rooms.
    async fn unread_count(&self, email: &str) -> Result<i64, StoreError>;

    /// Rooms `email` participates in, most recent activity first.
    async fn list_rooms_for(&self, email: &str) -> Result<Vec<RoomSummary>, StoreError>;
}
