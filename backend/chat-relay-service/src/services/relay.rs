use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::Config;
use crate::error::RelayError;
use crate::models::{Identity, Role, RoomKey};
use crate::services::{
    call_signaling::CallSignaling, message_relay::MessageRelay, presence::Presence,
    room_router::RoomRouter,
};
use crate::store::ChatStore;
use crate::websocket::{
    ConnectionId, ConnectionRegistry, Outbox, RegistryStats, SignalKind, WsInboundEvent,
    WsOutboundEvent,
};

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub ring_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for RelaySettings {
    fn from(config: &Config) -> Self {
        Self {
            ring_timeout: config.call_ring_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    #[serde(flatten)]
    pub registry: RegistryStats,
    pub active_calls: usize,
}

/// Single owner of all live relay state.
///
/// Sessions hand every decoded frame to [`Relay::handle_event`]; whatever the
/// handler queued is dispatched afterwards, even if it failed part way, and a
/// reportable failure is sent back to the originating connection as an
/// `error` event.
#[derive(Clone)]
pub struct Relay {
    registry: ConnectionRegistry,
    store: Arc<dyn ChatStore>,
    router: RoomRouter,
    presence: Presence,
    messages: MessageRelay,
    calls: CallSignaling,
}

impl Relay {
    pub fn new(store: Arc<dyn ChatStore>, settings: RelaySettings) -> Self {
        let registry = ConnectionRegistry::new();
        let presence = Presence::new(registry.clone());
        let router = RoomRouter::new(registry.clone(), store.clone(), presence.clone());
        let messages = MessageRelay::new(registry.clone(), store.clone(), router.clone());
        let calls = CallSignaling::new(
            registry.clone(),
            store.clone(),
            router.clone(),
            settings.ring_timeout,
        );

        Self {
            registry,
            store,
            router,
            presence,
            messages,
            calls,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    pub fn calls(&self) -> &CallSignaling {
        &self.calls
    }

    pub async fn connect(&self) -> (ConnectionId, UnboundedReceiver<String>) {
        let (id, rx) = self.registry.connect().await;
        tracing::info!(connection_id = %id, "connection opened");
        (id, rx)
    }

    /// Decode and handle one text frame. Malformed frames are answered with
    /// a `validation_error`.
    pub async fn handle_text(&self, connection_id: ConnectionId, text: &str) {
        match serde_json::from_str::<WsInboundEvent>(text) {
            Ok(event) => {
                // Failures were already reported to the connection.
                let _ = self.handle_event(connection_id, event).await;
            }
            Err(e) => {
                tracing::warn!(connection_id = %connection_id, error = %e, "malformed frame");
                let err = RelayError::Validation(format!("malformed event: {e}"));
                self.report(connection_id, "unknown", &err).await;
            }
        }
    }

    pub async fn handle_event(
        &self,
        connection_id: ConnectionId,
        event: WsInboundEvent,
    ) -> Result<(), RelayError> {
        let event_type = event.event_type();
        let mut outbox = Outbox::new();
        let result = self.route(&mut outbox, connection_id, event).await;

        self.registry.dispatch_all(outbox).await;

        if let Err(err) = &result {
            self.report(connection_id, event_type, err).await;
        }
        result
    }

    /// Transport closed: drop the connection everywhere and tell its rooms.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        let Some(departure) = self.registry.unregister(connection_id).await else {
            return;
        };

        let mut outbox = Outbox::new();
        if let Some(identity) = &departure.identity {
            if let Some(chat) = &departure.chat {
                self.presence
                    .left(&mut outbox, &chat.room_id, identity, chat.peers.iter().copied());
            }
            if let Some(call) = &departure.call {
                let same_room = departure
                    .chat
                    .as_ref()
                    .is_some_and(|chat| chat.room_id == call.room_id);
                if !same_room {
                    self.presence
                        .left(&mut outbox, &call.room_id, identity, call.peers.iter().copied());
                }
            }
        }
        if let Some(call) = &departure.call {
            if self.registry.call_members(&call.room_id).await.is_empty() {
                let ended_by = departure
                    .identity
                    .as_ref()
                    .map(|identity| identity.email.as_str())
                    .unwrap_or_default();
                self.calls
                    .abandon_room(&mut outbox, ended_by, &call.room_id)
                    .await;
            }
        }
        self.registry.dispatch_all(outbox).await;

        tracing::info!(
            connection_id = %connection_id,
            email = departure.identity.as_ref().map(|i| i.email.as_str()),
            "connection closed"
        );
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            registry: self.registry.stats().await,
            active_calls: self.calls.active_calls().await,
        }
    }

    async fn identity_of(&self, connection_id: ConnectionId) -> Result<Identity, RelayError> {
        self.registry
            .identity(connection_id)
            .await
            .ok_or(RelayError::UnregisteredSender)
    }

    async fn route(
        &self,
        outbox: &mut Outbox,
        connection_id: ConnectionId,
        event: WsInboundEvent,
    ) -> Result<(), RelayError> {
        match event {
            WsInboundEvent::Register { email, role } => {
                self.register(outbox, connection_id, email, role).await
            }

            WsInboundEvent::JoinRoom {
                dealer_email,
                technician_email,
                scope_id,
            } => {
                let identity = self.identity_of(connection_id).await?;
                let key = RoomKey::new(&dealer_email, &technician_email, scope_id.as_deref())?;
                self.router
                    .join(outbox, connection_id, &identity, &key)
                    .await?;
                Ok(())
            }

            WsInboundEvent::LeaveRoom => {
                let identity = self.registry.identity(connection_id).await;
                if self
                    .router
                    .leave(outbox, connection_id, identity.as_ref())
                    .await
                    .is_none()
                {
                    tracing::debug!(connection_id = %connection_id, "leaveRoom without a room");
                }
                Ok(())
            }

            WsInboundEvent::SendMessage {
                room_id,
                body,
                dealer_email,
                technician_email,
                scope_id,
            } => {
                let sender = self.identity_of(connection_id).await?;
                let key = RoomRouter::resolve_key(
                    &room_id,
                    dealer_email.as_deref(),
                    technician_email.as_deref(),
                    scope_id.as_deref(),
                )?;
                self.messages.send(outbox, &sender, &key, &body).await?;
                Ok(())
            }

            WsInboundEvent::MarkRead { message_id } => {
                let reader = self.registry.identity(connection_id).await;
                self.messages
                    .mark_read(outbox, reader.as_ref(), message_id)
                    .await?;
                Ok(())
            }

            WsInboundEvent::MarkRoomRead { room_id } => {
                let reader = self.identity_of(connection_id).await?;
                self.messages
                    .mark_room_read(outbox, &reader, &room_id)
                    .await?;
                Ok(())
            }

            WsInboundEvent::Typing { is_typing } => {
                let identity = self.identity_of(connection_id).await?;
                self.presence
                    .typing(outbox, connection_id, &identity, is_typing)
                    .await
            }

            WsInboundEvent::CallInitiate {
                room_id,
                call_type,
                target_email,
                dealer_email,
                technician_email,
                scope_id,
            } => {
                let caller = self.identity_of(connection_id).await?;
                let key = RoomRouter::resolve_key(
                    &room_id,
                    dealer_email.as_deref(),
                    technician_email.as_deref(),
                    scope_id.as_deref(),
                )?;
                self.calls
                    .initiate(outbox, connection_id, &caller, &key, &target_email, call_type)
                    .await?;
                Ok(())
            }

            WsInboundEvent::CallAccept { call_id, room_id } => {
                let identity = self.identity_of(connection_id).await?;
                self.calls
                    .accept(outbox, connection_id, &identity, call_id, &room_id)
                    .await
            }

            WsInboundEvent::CallReject { call_id, room_id } => {
                let identity = self.identity_of(connection_id).await?;
                self.calls
                    .reject(outbox, connection_id, &identity, call_id, &room_id)
                    .await
            }

            WsInboundEvent::CallEnd { call_id, room_id } => {
                let identity = self.identity_of(connection_id).await?;
                self.calls.end(outbox, &identity, call_id, &room_id).await
            }

            WsInboundEvent::IceCandidate { room_id, payload } => {
                self.signal(outbox, connection_id, SignalKind::IceCandidate, &room_id, payload)
                    .await
            }
            WsInboundEvent::Offer { room_id, payload } => {
                self.signal(outbox, connection_id, SignalKind::Offer, &room_id, payload)
                    .await
            }
            WsInboundEvent::Answer { room_id, payload } => {
                self.signal(outbox, connection_id, SignalKind::Answer, &room_id, payload)
                    .await
            }
        }
    }

    async fn register(
        &self,
        outbox: &mut Outbox,
        connection_id: ConnectionId,
        email: Option<String>,
        role: Option<String>,
    ) -> Result<(), RelayError> {
        let email = email.map(|e| e.trim().to_string()).filter(|e| !e.is_empty());
        let role = role.filter(|r| !r.trim().is_empty());
        let (Some(email), Some(role)) = (email, role) else {
            tracing::warn!(connection_id = %connection_id, "register without email or role ignored");
            return Ok(());
        };

        if email.contains(':') {
            return Err(RelayError::Validation("email must not contain ':'".into()));
        }
        let role: Role = role.trim().parse().map_err(RelayError::Validation)?;
        let identity = Identity::new(email, role);

        let newly_bound = self
            .registry
            .register(connection_id, identity.clone())
            .await?;
        if newly_bound {
            tracing::info!(
                connection_id = %connection_id,
                email = %identity.email,
                role = %identity.role,
                "connection registered"
            );
        }

        outbox.send_one(
            connection_id,
            WsOutboundEvent::Registered {
                email: identity.email,
                role: identity.role,
            },
        );
        Ok(())
    }

    async fn signal(
        &self,
        outbox: &mut Outbox,
        connection_id: ConnectionId,
        kind: SignalKind,
        room_id: &str,
        payload: serde_json::Value,
    ) -> Result<(), RelayError> {
        let sender = self.identity_of(connection_id).await?;
        self.calls
            .relay_signal(outbox, connection_id, &sender, kind, room_id, payload)
            .await
    }

    async fn report(&self, connection_id: ConnectionId, event_type: &str, err: &RelayError) {
        match err {
            RelayError::InvalidStateTransition { .. } => {
                tracing::debug!(connection_id = %connection_id, event = event_type, error = %err, "ignored");
            }
            RelayError::TargetUnavailable(_) => {
                tracing::info!(connection_id = %connection_id, event = event_type, error = %err, "target offline");
            }
            RelayError::Persistence(_) => {
                tracing::error!(connection_id = %connection_id, event = event_type, error = %err, "persistence failure");
            }
            _ => {
                tracing::warn!(connection_id = %connection_id, event = event_type, error = %err, "event rejected");
            }
        }

        if err.is_reportable() {
            self.registry
                .send_to(
                    connection_id,
                    WsOutboundEvent::Error {
                        code: err.code().to_string(),
                        message: err.client_message(),
                    },
                )
                .await;
        }
    }
}
