use std::sync::Arc;

use crate::error::RelayError;
use crate::models::{Identity, Room, RoomKey};
use crate::services::presence::Presence;
use crate::store::ChatStore;
use crate::websocket::{ConnectionId, ConnectionRegistry, MembershipKind, Outbox, WsOutboundEvent};

/// Room id derivation, chat room membership and lazy room persistence.
#[derive(Clone)]
pub struct RoomRouter {
    registry: ConnectionRegistry,
    store: Arc<dyn ChatStore>,
    presence: Presence,
}

impl RoomRouter {
    pub fn new(registry: ConnectionRegistry, store: Arc<dyn ChatStore>, presence: Presence) -> Self {
        Self {
            registry,
            store,
            presence,
        }
    }

    /// Work out the participants of `room_id`.
    ///
    /// Explicit participants win; the composite id is only parsed when
    /// neither is supplied. When given, they must reproduce `room_id`.
    pub fn resolve_key(
        room_id: &str,
        dealer_email: Option<&str>,
        technician_email: Option<&str>,
        scope_id: Option<&str>,
    ) -> Result<RoomKey, RelayError> {
        if room_id.trim().is_empty() {
            return Err(RelayError::Validation("roomId is required".into()));
        }

        match (dealer_email, technician_email) {
            (Some(dealer), Some(technician)) => {
                let key = RoomKey::new(dealer, technician, scope_id)?;
                if key.room_id() != room_id {
                    return Err(RelayError::InvalidParticipants(format!(
                        "participants resolve to {}, not {room_id}",
                        key.room_id()
                    )));
                }
                Ok(key)
            }
            (None, None) => RoomKey::parse(room_id),
            _ => Err(RelayError::Validation(
                "dealerEmail and technicianEmail must be sent together".into(),
            )),
        }
    }

    /// Make sure the room has a persisted row. Safe to call repeatedly.
    pub async fn ensure_room_exists(&self, key: &RoomKey) -> Result<Room, RelayError> {
        Ok(self.store.create_room_if_absent(key).await?)
    }

    /// Move the connection's chat slot into the room for these participants,
    /// creating the persisted room first if needed.
    ///
    /// The joiner gets `roomJoined`; the room it left (if any) hears
    /// `userLeft` and the room it joined hears `userJoined`.
    pub async fn join(
        &self,
        outbox: &mut Outbox,
        connection_id: ConnectionId,
        identity: &Identity,
        key: &RoomKey,
    ) -> Result<String, RelayError> {
        let room_id = self.ensure_room_exists(key).await?.room_id;
        let outcome = self
            .registry
            .join(connection_id, &room_id, MembershipKind::Chat)
            .await?;

        if let Some(left) = &outcome.left {
            self.presence
                .left(outbox, &left.room_id, identity, left.peers.iter().copied());
        }

        outbox.send_one(
            connection_id,
            WsOutboundEvent::RoomJoined {
                room_id: room_id.clone(),
            },
        );

        if !outcome.already_member {
            self.presence
                .joined(outbox, &room_id, identity, outcome.peers.iter().copied());
        }

        tracing::debug!(connection_id = %connection_id, room_id = %room_id, "joined chat room");
        Ok(room_id)
    }

    /// Clear the connection's chat slot. Returns the room it left.
    pub async fn leave(
        &self,
        outbox: &mut Outbox,
        connection_id: ConnectionId,
        identity: Option<&Identity>,
    ) -> Option<String> {
        let exit = self
            .registry
            .leave(connection_id, MembershipKind::Chat)
            .await?;

        outbox.send_one(
            connection_id,
            WsOutboundEvent::RoomLeft {
                room_id: exit.room_id.clone(),
            },
        );
        if let Some(identity) = identity {
            self.presence
                .left(outbox, &exit.room_id, identity, exit.peers.iter().copied());
        }
        Some(exit.room_id)
    }

    /// Bind the connection into a call room without touching its chat room.
    pub async fn bind_call_room(
        &self,
        connection_id: ConnectionId,
        room_id: &str,
    ) -> Result<(), RelayError> {
        self.registry
            .join(connection_id, room_id, MembershipKind::Call)
            .await?;
        Ok(())
    }
}
