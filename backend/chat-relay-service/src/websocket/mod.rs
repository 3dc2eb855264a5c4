use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    RwLock,
};
use uuid::Uuid;

use crate::error::RelayError;
use crate::models::Identity;

pub mod dispatch;
pub mod message_types;

pub use dispatch::{Broadcast, Outbox};
pub use message_types::{SignalKind, WsInboundEvent, WsOutboundEvent};

/// Unique identifier for a live WebSocket connection
///
/// Each connection gets a fresh id on connect; it is never reused, so stale
/// ids held by in-flight tasks can only ever miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which of a connection's two room slots a join targets.
///
/// Chat and call membership are independent: joining a call room never
/// evicts the chat room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipKind {
    Chat,
    Call,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Memberships {
    pub chat_room: Option<String>,
    pub call_room: Option<String>,
}

impl Memberships {
    fn slot(&mut self, kind: MembershipKind) -> &mut Option<String> {
        match kind {
            MembershipKind::Chat => &mut self.chat_room,
            MembershipKind::Call => &mut self.call_room,
        }
    }
}

/// A room the connection was removed from, with whoever is still in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomExit {
    pub room_id: String,
    pub peers: HashSet<ConnectionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Room the same slot held before, if it was a different room.
    pub left: Option<RoomExit>,
    /// Other members of the joined room, snapshotted under the lock.
    pub peers: HashSet<ConnectionId>,
    /// The connection already held this room in this slot.
    pub already_member: bool,
}

/// Everything removed when a connection goes away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub identity: Option<Identity>,
    pub chat: Option<RoomExit>,
    pub call: Option<RoomExit>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub connections: usize,
    pub identities: usize,
    pub rooms: usize,
}

struct ConnectionEntry {
    sender: UnboundedSender<String>,
    identity: Option<Identity>,
    memberships: Memberships,
}

#[derive(Default)]
struct RoomMembers {
    chat: HashSet<ConnectionId>,
    call: HashSet<ConnectionId>,
}

impl RoomMembers {
    fn set(&mut self, kind: MembershipKind) -> &mut HashSet<ConnectionId> {
        match kind {
            MembershipKind::Chat => &mut self.chat,
            MembershipKind::Call => &mut self.call,
        }
    }

    fn all(&self) -> HashSet<ConnectionId> {
        self.chat.union(&self.call).copied().collect()
    }

    fn is_empty(&self) -> bool {
        self.chat.is_empty() && self.call.is_empty()
    }
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    by_email: HashMap<String, HashSet<ConnectionId>>,
    rooms: HashMap<String, RoomMembers>,
}

impl RegistryInner {
    /// Drop `id` from `room_id`'s `kind` set; empty rooms are forgotten.
    fn remove_member(
        &mut self,
        room_id: &str,
        id: ConnectionId,
        kind: MembershipKind,
    ) -> HashSet<ConnectionId> {
        let Some(members) = self.rooms.get_mut(room_id) else {
            return HashSet::new();
        };
        members.set(kind).remove(&id);

        let mut peers = members.all();
        peers.remove(&id);

        if members.is_empty() {
            self.rooms.remove(room_id);
            tracing::debug!(room_id, "removed empty room from registry");
        }
        peers
    }
}

/// Connection registry for WebSocket sessions
///
/// Owns every live connection: its outbound channel, its identity once
/// registered, and its chat and call room memberships. A single lock guards
/// all three maps so disconnect cleanup is one atomic step.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new connection.
    ///
    /// Returns the connection id and the receiver the session drains into
    /// its socket.
    pub async fn connect(&self) -> (ConnectionId, UnboundedReceiver<String>) {
        let (tx, rx) = unbounded_channel();
        let id = ConnectionId::new();

        let mut guard = self.inner.write().await;
        guard.connections.insert(
            id,
            ConnectionEntry {
                sender: tx,
                identity: None,
                memberships: Memberships::default(),
            },
        );
        tracing::debug!(
            connection_id = %id,
            total = guard.connections.len(),
            "connection added"
        );

        (id, rx)
    }

    /// Bind an identity to a connection.
    ///
    /// Returns `true` when the identity was newly bound and `false` when the
    /// same identity was already in place. An identity can never change.
    pub async fn register(&self, id: ConnectionId, identity: Identity) -> Result<bool, RelayError> {
        let mut guard = self.inner.write().await;
        let entry = guard
            .connections
            .get_mut(&id)
            .ok_or_else(|| RelayError::Validation("unknown connection".into()))?;

        match &entry.identity {
            Some(existing) if *existing == identity => return Ok(false),
            Some(existing) => {
                return Err(RelayError::Validation(format!(
                    "connection is already registered as {existing}"
                )));
            }
            None => entry.identity = Some(identity.clone()),
        }

        guard
            .by_email
            .entry(identity.email.clone())
            .or_default()
            .insert(id);
        Ok(true)
    }

    pub async fn identity(&self, id: ConnectionId) -> Option<Identity> {
        let guard = self.inner.read().await;
        guard.connections.get(&id).and_then(|e| e.identity.clone())
    }

    pub async fn memberships(&self, id: ConnectionId) -> Option<Memberships> {
        let guard = self.inner.read().await;
        guard.connections.get(&id).map(|e| e.memberships.clone())
    }

    /// Live connections registered under `email`; empty when offline.
    pub async fn find_connections_by_email(&self, email: &str) -> HashSet<ConnectionId> {
        let guard = self.inner.read().await;
        guard.by_email.get(email).cloned().unwrap_or_default()
    }

    /// Put a connection into a room slot, leaving whatever that slot held.
    pub async fn join(
        &self,
        id: ConnectionId,
        room_id: &str,
        kind: MembershipKind,
    ) -> Result<JoinOutcome, RelayError> {
        let mut guard = self.inner.write().await;
        let entry = guard
            .connections
            .get_mut(&id)
            .ok_or_else(|| RelayError::Validation("unknown connection".into()))?;

        let previous = entry.memberships.slot(kind).replace(room_id.to_string());
        let already_member = previous.as_deref() == Some(room_id);

        let left = match previous {
            Some(prev) if prev != room_id => {
                let peers = guard.remove_member(&prev, id, kind);
                Some(RoomExit {
                    room_id: prev,
                    peers,
                })
            }
            _ => None,
        };

        let members = guard.rooms.entry(room_id.to_string()).or_default();
        members.set(kind).insert(id);
        let mut peers = members.all();
        peers.remove(&id);

        Ok(JoinOutcome {
            left,
            peers,
            already_member,
        })
    }

    /// Empty a room slot. `None` when the slot was already empty.
    pub async fn leave(&self, id: ConnectionId, kind: MembershipKind) -> Option<RoomExit> {
        let mut guard = self.inner.write().await;
        let room_id = guard.connections.get_mut(&id)?.memberships.slot(kind).take()?;
        let peers = guard.remove_member(&room_id, id, kind);
        Some(RoomExit { room_id, peers })
    }

    /// Remove a connection from identity, chat room and call room at once.
    ///
    /// Dropping the entry also drops its sender, which ends the session's
    /// outbound stream.
    pub async fn unregister(&self, id: ConnectionId) -> Option<Departure> {
        let mut guard = self.inner.write().await;
        let entry = guard.connections.remove(&id)?;

        if let Some(identity) = &entry.identity {
            if let Some(ids) = guard.by_email.get_mut(&identity.email) {
                ids.remove(&id);
                if ids.is_empty() {
                    guard.by_email.remove(&identity.email);
                }
            }
        }

        let chat = entry.memberships.chat_room.map(|room_id| RoomExit {
            peers: guard.remove_member(&room_id, id, MembershipKind::Chat),
            room_id,
        });
        let call = entry.memberships.call_room.map(|room_id| RoomExit {
            peers: guard.remove_member(&room_id, id, MembershipKind::Call),
            room_id,
        });

        tracing::debug!(
            connection_id = %id,
            remaining = guard.connections.len(),
            "connection removed"
        );

        Some(Departure {
            identity: entry.identity,
            chat,
            call,
        })
    }

    /// Snapshot of every connection in the room, chat or call.
    pub async fn room_members(&self, room_id: &str) -> HashSet<ConnectionId> {
        let guard = self.inner.read().await;
        guard.rooms.get(room_id).map(RoomMembers::all).unwrap_or_default()
    }

    /// Connections whose chat slot holds `room_id`.
    pub async fn chat_members(&self, room_id: &str) -> HashSet<ConnectionId> {
        self.members_of(room_id, MembershipKind::Chat).await
    }

    /// Connections bound into `room_id` for a call.
    pub async fn call_members(&self, room_id: &str) -> HashSet<ConnectionId> {
        self.members_of(room_id, MembershipKind::Call).await
    }

    async fn members_of(&self, room_id: &str, kind: MembershipKind) -> HashSet<ConnectionId> {
        let guard = self.inner.read().await;
        guard
            .rooms
            .get(room_id)
            .map(|members| match kind {
                MembershipKind::Chat => members.chat.clone(),
                MembershipKind::Call => members.call.clone(),
            })
            .unwrap_or_default()
    }

    /// Deliver one broadcast. Returns how many connections accepted it.
    pub async fn dispatch(&self, broadcast: &Broadcast) -> usize {
        let payload = match serde_json::to_string(&broadcast.event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    event = broadcast.event.event_type(),
                    "failed to serialize outbound event"
                );
                return 0;
            }
        };

        let guard = self.inner.read().await;
        let mut delivered = 0;
        for id in &broadcast.targets {
            match guard.connections.get(id) {
                Some(entry) if entry.sender.send(payload.clone()).is_ok() => delivered += 1,
                // Gone or closing; cleanup belongs to unregister.
                _ => {}
            }
        }

        tracing::trace!(
            event = broadcast.event.event_type(),
            targets = broadcast.targets.len(),
            delivered,
            "dispatched"
        );
        delivered
    }

    pub async fn dispatch_all(&self, outbox: Outbox) -> usize {
        let mut delivered = 0;
        for broadcast in outbox.into_broadcasts() {
            delivered += self.dispatch(&broadcast).await;
        }
        delivered
    }

    pub async fn send_to(&self, id: ConnectionId, event: WsOutboundEvent) -> bool {
        self.dispatch(&Broadcast::one(id, event)).await == 1
    }

    pub async fn stats(&self) -> RegistryStats {
        let guard = self.inner.read().await;
        RegistryStats {
            connections: guard.connections.len(),
            identities: guard.by_email.len(),
            rooms: guard.rooms.len(),
        }
    }
}
