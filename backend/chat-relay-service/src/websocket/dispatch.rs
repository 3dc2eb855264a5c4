//! Fan-out as a value.
//!
//! Services never write to sockets. They describe who should receive what
//! (a [`Broadcast`]) and collect those in an [`Outbox`]; the relay hands the
//! outbox to [`ConnectionRegistry::dispatch_all`](super::ConnectionRegistry::dispatch_all)
//! once the event has been handled, including when handling failed halfway.

use std::collections::BTreeSet;

use super::message_types::WsOutboundEvent;
use super::ConnectionId;

#[derive(Debug, Clone, PartialEq)]
pub struct Broadcast {
    pub targets: BTreeSet<ConnectionId>,
    pub event: WsOutboundEvent,
}

impl Broadcast {
    pub fn new<I>(targets: I, event: WsOutboundEvent) -> Self
    where
        I: IntoIterator<Item = ConnectionId>,
    {
        Self {
            targets: targets.into_iter().collect(),
            event,
        }
    }

    pub fn one(target: ConnectionId, event: WsOutboundEvent) -> Self {
        Self::new([target], event)
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Outbox {
    broadcasts: Vec<Broadcast>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a broadcast. Broadcasts without targets are dropped.
    pub fn push(&mut self, broadcast: Broadcast) {
        if !broadcast.is_empty() {
            self.broadcasts.push(broadcast);
        }
    }

    pub fn send<I>(&mut self, targets: I, event: WsOutboundEvent)
    where
        I: IntoIterator<Item = ConnectionId>,
    {
        self.push(Broadcast::new(targets, event));
    }

    pub fn send_one(&mut self, target: ConnectionId, event: WsOutboundEvent) {
        self.push(Broadcast::one(target, event));
    }

    pub fn is_empty(&self) -> bool {
        self.broadcasts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.broadcasts.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Broadcast> {
        self.broadcasts.iter()
    }

    pub fn into_broadcasts(self) -> Vec<Broadcast> {
        self.broadcasts
    }
}
