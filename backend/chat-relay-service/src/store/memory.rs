use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use super::ChatStore;
use crate::error::StoreError;
use crate::models::{
    CallRecord, CallStatus, CallType, ChatMessage, Identity, MessagePreview, Room, RoomKey,
    RoomSummary,
};

#[derive(Default)]
struct MemoryInner {
    rooms: HashMap<String, Room>,
    messages: BTreeMap<i64, ChatMessage>,
    calls: BTreeMap<i64, CallRecord>,
    next_message_id: i64,
    next_call_id: i64,
}

/// Process-local store.
///
/// Used when no database is configured and by the test suites. Writes can be
/// made to fail on demand with [`InMemoryChatStore::fail_next_writes`].
#[derive(Default)]
pub struct InMemoryChatStore {
    inner: RwLock<MemoryInner>,
    failing_writes: AtomicUsize,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` write operations return [`StoreError::Unavailable`].
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<(), StoreError> {
        let tripped = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(StoreError::Unavailable("injected write failure".into()))
        } else {
            Ok(())
        }
    }

    pub async fn message_count(&self) -> usize {
        self.inner.read().await.messages.len()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }

    pub async fn messages_in(&self, room_id: &str) -> Vec<ChatMessage> {
        let guard = self.inner.read().await;
        guard
            .messages
            .values()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect()
    }

    /// Shift a call's start into the past, for duration checks.
    pub async fn backdate_call(&self, call_id: i64, by: Duration) {
        let mut guard = self.inner.write().await;
        if let Some(call) = guard.calls.get_mut(&call_id) {
            call.started_at -= by;
        }
    }

    fn summarize(inner: &MemoryInner, room: &Room, email: &str) -> RoomSummary {
        let in_room = move || {
            inner
                .messages
                .values()
                .filter(move |m| m.room_id == room.room_id)
        };
        let last = in_room().max_by_key(|m| (m.sent_at, m.id));
        let unread = in_room()
            .filter(|m| !m.read_status && m.sender_email != email)
            .count();

        RoomSummary {
            room_id: room.room_id.clone(),
            dealer_email: room.dealer_email.clone(),
            technician_email: room.technician_email.clone(),
            scope_id: room.scope_id.clone(),
            last_message: last.map(MessagePreview::from),
            unread_count: unread as i64,
        }
    }
}

fn involves(room: &Room, email: &str) -> bool {
    room.dealer_email == email || room.technician_email == email
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn create_room_if_absent(&self, key: &RoomKey) -> Result<Room, StoreError> {
        self.check_write()?;
        let mut guard = self.inner.write().await;
        let room = guard.rooms.entry(key.room_id()).or_insert_with(|| Room {
            room_id: key.room_id(),
            dealer_email: key.dealer_email.clone(),
            technician_email: key.technician_email.clone(),
            scope_id: key.scope_id.clone(),
            created_at: Utc::now(),
        });
        Ok(room.clone())
    }

    async fn find_room(&self, room_id: &str) -> Result<Option<Room>, StoreError> {
        Ok(self.inner.read().await.rooms.get(room_id).cloned())
    }

    async fn insert_message(
        &self,
        room_id: &str,
        sender: &Identity,
        body: &str,
    ) -> Result<ChatMessage, StoreError> {
        self.check_write()?;
        let mut guard = self.inner.write().await;
        if !guard.rooms.contains_key(room_id) {
            return Err(StoreError::NotFound(format!("room {room_id}")));
        }
        guard.next_message_id += 1;
        let message = ChatMessage {
            id: guard.next_message_id,
            room_id: room_id.to_string(),
            sender_email: sender.email.clone(),
            sender_role: sender.role,
            body: body.to_string(),
            sent_at: Utc::now(),
            read_status: false,
        };
        guard.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn list_messages(
        &self,
        room_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let guard = self.inner.read().await;
        let mut messages: Vec<ChatMessage> = guard
            .messages
            .values()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| (m.sent_at, m.id));
        Ok(messages
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn mark_message_read(&self, message_id: i64) -> Result<Option<String>, StoreError> {
        self.check_write()?;
        let mut guard = self.inner.write().await;
        Ok(guard.messages.get_mut(&message_id).map(|m| {
            m.read_status = true;
            m.room_id.clone()
        }))
    }

    async fn mark_room_read(&self, room_id: &str, reader_email: &str) -> Result<u64, StoreError> {
        self.check_write()?;
        let mut guard = self.inner.write().await;
        let mut updated = 0;
        for message in guard.messages.values_mut() {
            if message.room_id == room_id && message.sender_email != reader_email && !message.read_status
            {
                message.read_status = true;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn insert_call(
        &self,
        room_id: &str,
        caller: &Identity,
        call_type: CallType,
    ) -> Result<CallRecord, StoreError> {
        self.check_write()?;
        let mut guard = self.inner.write().await;
        if !guard.rooms.contains_key(room_id) {
            return Err(StoreError::NotFound(format!("room {room_id}")));
        }
        guard.next_call_id += 1;
        let call = CallRecord {
            id: guard.next_call_id,
            room_id: room_id.to_string(),
            caller_email: caller.email.clone(),
            caller_role: caller.role,
            call_type,
            status: CallStatus::Initiated,
            started_at: Utc::now(),
            ended_at: None,
            duration_seconds: None,
        };
        guard.calls.insert(call.id, call.clone());
        Ok(call)
    }

    async fn update_call_status(
        &self,
        call_id: i64,
        status: CallStatus,
        ended_at: Option<DateTime<Utc>>,
        duration_seconds: Option<i64>,
    ) -> Result<(), StoreError> {
        self.check_write()?;
        let mut guard = self.inner.write().await;
        let call = guard
            .calls
            .get_mut(&call_id)
            .ok_or_else(|| StoreError::NotFound(format!("call {call_id}")))?;
        call.status = status;
        if ended_at.is_some() {
            call.ended_at = ended_at;
        }
        if duration_seconds.is_some() {
            call.duration_seconds = duration_seconds;
        }
        Ok(())
    }

    async fn find_call(&self, call_id: i64) -> Result<Option<CallRecord>, StoreError> {
        Ok(self.inner.read().await.calls.get(&call_id).cloned())
    }

    async fn find_call_started_at(
        &self,
        call_id: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .calls
            .get(&call_id)
            .map(|c| c.started_at))
    }

    async fn unread_count(&self, email: &str) -> Result<i64, StoreError> {
        let guard = self.inner.read().await;
        let count = guard
            .messages
            .values()
            .filter(|m| !m.read_status && m.sender_email != email)
            .filter(|m| {
                guard
                    .rooms
                    .get(&m.room_id)
                    .map(|room| involves(room, email))
                    .unwrap_or(false)
            })
            .count();
        Ok(count as i64)
    }

    async fn list_rooms_for(&self, email: &str) -> Result<Vec<RoomSummary>, StoreError> {
        let guard = self.inner.read().await;
        let mut rooms: Vec<(DateTime<Utc>, RoomSummary)> = guard
            .rooms
            .values()
            .filter(|room| involves(room, email))
            .map(|room| {
                let summary = Self::summarize(&guard, room, email);
                let activity = summary
                    .last_message
                    .as_ref()
                    .map(|m| m.sent_at)
                    .unwrap_or(room.created_at);
                (activity, summary)
            })
            .collect();
        rooms.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.room_id.cmp(&b.1.room_id)));
        Ok(rooms.into_iter().map(|(_, summary)| summary).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    fn key() -> RoomKey {
        RoomKey::new("dealer@x.com", "tech@x.com", None).unwrap()
    }

    fn dealer() -> Identity {
        Identity::new("dealer@x.com", Role::Dealer)
    }

    fn tech() -> Identity {
        Identity::new("tech@x.com", Role::Technician)
    }

    #[tokio::test]
    async fn create_room_is_idempotent() {
        let store = InMemoryChatStore::new();
        let first = store.create_room_if_absent(&key()).await.unwrap();
        let second = store.create_room_if_absent(&key()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.room_count().await, 1);
    }

    #[tokio::test]
    async fn mark_room_read_skips_own_messages() {
        let store = InMemoryChatStore::new();
        let room = store.create_room_if_absent(&key()).await.unwrap();
        store.insert_message(&room.room_id, &dealer(), "hi").await.unwrap();
        store.insert_message(&room.room_id, &tech(), "hello").await.unwrap();

        let updated = store.mark_room_read(&room.room_id, "tech@x.com").await.unwrap();
        assert_eq!(updated, 1);

        for message in store.messages_in(&room.room_id).await {
            assert_eq!(message.read_status, message.sender_email == "dealer@x.com");
        }
    }

    #[tokio::test]
    async fn list_messages_pages_oldest_first() {
        let store = InMemoryChatStore::new();
        let room = store.create_room_if_absent(&key()).await.unwrap();
        for body in ["one", "two", "three"] {
            store.insert_message(&room.room_id, &dealer(), body).await.unwrap();
        }

        let page = store.list_messages(&room.room_id, 2, 1).await.unwrap();
        let bodies: Vec<&str> = page.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["two", "three"]);
    }

    #[tokio::test]
    async fn room_summaries_carry_unread_and_preview() {
        let store = InMemoryChatStore::new();
        let room = store.create_room_if_absent(&key()).await.unwrap();
        store.insert_message(&room.room_id, &dealer(), "first").await.unwrap();
        store.insert_message(&room.room_id, &dealer(), "latest").await.unwrap();

        let rooms = store.list_rooms_for("tech@x.com").await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].unread_count, 2);
        assert_eq!(rooms[0].last_message.as_ref().unwrap().body, "latest");

        assert_eq!(store.unread_count("tech@x.com").await.unwrap(), 2);
        assert_eq!(store.unread_count("dealer@x.com").await.unwrap(), 0);
        assert!(store.list_rooms_for("nobody@x.com").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_failures_only_hit_writes() {
        let store = InMemoryChatStore::new();
        store.fail_next_writes(1);
        assert!(store.create_room_if_absent(&key()).await.is_err());
        assert!(store.find_room("dealer@x.com:tech@x.com").await.unwrap().is_none());
        assert!(store.create_room_if_absent(&key()).await.is_ok());
    }

    #[tokio::test]
    async fn call_status_updates_keep_end_fields() {
        let store = InMemoryChatStore::new();
        let room = store.create_room_if_absent(&key()).await.unwrap();
        let call = store
            .insert_call(&room.room_id, &dealer(), CallType::Video)
            .await
            .unwrap();
        assert_eq!(call.status, CallStatus::Initiated);

        let ended = Utc::now();
        store
            .update_call_status(call.id, CallStatus::Ended, Some(ended), Some(12))
            .await
            .unwrap();
        let stored = store.find_call(call.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Ended);
        assert_eq!(stored.duration_seconds, Some(12));

        let missing = store
            .update_call_status(999, CallStatus::Ended, None, None)
            .await
            .unwrap_err();
        assert!(matches!(missing, StoreError::NotFound(_)));
    }
}
