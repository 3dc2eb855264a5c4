use crate::error::RelayError;
use crate::models::Identity;
use crate::websocket::{ConnectionId, ConnectionRegistry, Outbox, WsOutboundEvent};

/// Join/leave/typing notices. Nothing here is persisted.
#[derive(Clone)]
pub struct Presence {
    registry: ConnectionRegistry,
}

impl Presence {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    pub fn joined<I>(&self, outbox: &mut Outbox, room_id: &str, identity: &Identity, peers: I)
    where
        I: IntoIterator<Item = ConnectionId>,
    {
        outbox.send(
            peers,
            WsOutboundEvent::UserJoined {
                room_id: room_id.to_string(),
                email: identity.email.clone(),
                role: identity.role,
            },
        );
    }

    pub fn left<I>(&self, outbox: &mut Outbox, room_id: &str, identity: &Identity, peers: I)
    where
        I: IntoIterator<Item = ConnectionId>,
    {
        outbox.send(
            peers,
            WsOutboundEvent::UserLeft {
                room_id: room_id.to_string(),
                email: identity.email.clone(),
                role: identity.role,
            },
        );
    }

    /// Tell the rest of the sender's chat room that it is (not) typing.
    pub async fn typing(
        &self,
        outbox: &mut Outbox,
        connection_id: ConnectionId,
        identity: &Identity,
        is_typing: bool,
    ) -> Result<(), RelayError> {
        let room_id = match self.registry.memberships(connection_id).await {
            Some(memberships) => memberships.chat_room,
            None => None,
        };
        let Some(room_id) = room_id else {
            tracing::debug!(connection_id = %connection_id, "typing outside a room ignored");
            return Ok(());
        };

        // Chat members only; call-only connections are skipped.
        let mut peers = self.registry.chat_members(&room_id).await;
        peers.remove(&connection_id);

        outbox.send(
            peers,
            WsOutboundEvent::UserTyping {
                room_id,
                email: identity.email.clone(),
                role: identity.role,
                is_typing,
            },
        );
        Ok(())
    }
}
