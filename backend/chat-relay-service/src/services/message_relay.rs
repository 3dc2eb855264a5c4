use std::collections::HashSet;
use std::sync::Arc;

use crate::error::RelayError;
use crate::models::{ChatMessage, Identity, RoomKey};
use crate::services::room_router::RoomRouter;
use crate::store::ChatStore;
use crate::websocket::{ConnectionId, ConnectionRegistry, Outbox, WsOutboundEvent};

/// Persist-then-fan-out for chat messages and read receipts.
#[derive(Clone)]
pub struct MessageRelay {
    registry: ConnectionRegistry,
    store: Arc<dyn ChatStore>,
    router: RoomRouter,
}

impl MessageRelay {
    pub fn new(registry: ConnectionRegistry, store: Arc<dyn ChatStore>, router: RoomRouter) -> Self {
        Self {
            registry,
            store,
            router,
        }
    }

    /// Persist one message and deliver it.
    ///
    /// Connections joined to the room get `newMessage`. Any other live
    /// connection of either participant gets `chatNotification`. No
    /// connection receives both.
    pub async fn send(
        &self,
        outbox: &mut Outbox,
        sender: &Identity,
        key: &RoomKey,
        body: &str,
    ) -> Result<ChatMessage, RelayError> {
        if body.trim().is_empty() {
            return Err(RelayError::Validation("message body is empty".into()));
        }

        let room = self.router.ensure_room_exists(key).await?;
        let message = self
            .store
            .insert_message(&room.room_id, sender, body)
            .await?;

        let in_room = self.registry.room_members(&room.room_id).await;
        let mut participants: HashSet<ConnectionId> = HashSet::new();
        for email in key.participants() {
            participants.extend(self.registry.find_connections_by_email(email).await);
        }
        let notify_only: Vec<ConnectionId> = participants.difference(&in_room).copied().collect();

        outbox.send(
            notify_only,
            WsOutboundEvent::ChatNotification {
                room_id: room.room_id.clone(),
                message: message.clone(),
            },
        );
        outbox.send(
            in_room,
            WsOutboundEvent::NewMessage {
                message: message.clone(),
            },
        );

        tracing::debug!(
            room_id = %room.room_id,
            message_id = message.id,
            sender = %sender.email,
            "message relayed"
        );
        Ok(message)
    }

    /// Flip one message to read and tell the room.
    pub async fn mark_read(
        &self,
        outbox: &mut Outbox,
        reader: Option<&Identity>,
        message_id: i64,
    ) -> Result<String, RelayError> {
        let room_id = self
            .store
            .mark_message_read(message_id)
            .await?
            .ok_or_else(|| RelayError::Validation(format!("message {message_id} not found")))?;

        let members = self.registry.room_members(&room_id).await;
        outbox.send(
            members,
            WsOutboundEvent::MessageRead {
                message_id,
                room_id: room_id.clone(),
                read_by: reader.map(|r| r.email.clone()),
            },
        );
        Ok(room_id)
    }

    /// Mark everything the reader did not send as read.
    ///
    /// Only the reader's own connections are told, so its other devices can
    /// clear their badges.
    pub async fn mark_room_read(
        &self,
        outbox: &mut Outbox,
        reader: &Identity,
        room_id: &str,
    ) -> Result<u64, RelayError> {
        if room_id.trim().is_empty() {
            return Err(RelayError::Validation("roomId is required".into()));
        }

        let updated = self.store.mark_room_read(room_id, &reader.email).await?;
        let devices = self.registry.find_connections_by_email(&reader.email).await;
        outbox.send(
            devices,
            WsOutboundEvent::RoomMarkedRead {
                room_id: room_id.to_string(),
                reader_email: reader.email.clone(),
                updated,
            },
        );
        Ok(updated)
    }
}
