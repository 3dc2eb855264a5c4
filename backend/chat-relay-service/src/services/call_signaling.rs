//! Call lifecycle
//!
//! ```text
//! INITIATED ──┬──> ANSWERED ──> ENDED
//!             ├──> REJECTED
//!             └──> MISSED   (target offline, or ring timer expired)
//! ```
//!
//! The live map below is the source of truth for transitions. Every check and
//! status change happens under one lock, and the ring timer is cancelled in
//! that same critical section, so a timeout can never race an accept. The
//! store is written afterwards; if that write fails the live state is kept,
//! the broadcast still goes out and the acting connection gets an error.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::error::RelayError;
use crate::models::{call_duration_seconds, CallRecord, CallStatus, CallType, Identity, RoomKey};
use crate::services::room_router::RoomRouter;
use crate::store::ChatStore;
use crate::websocket::{
    Broadcast, ConnectionId, ConnectionRegistry, Outbox, SignalKind, WsOutboundEvent,
};

pub const TIMEOUT_REASON: &str = "no answer — timed out";
pub const TARGET_UNAVAILABLE_REASON: &str = "user not available";

/// Finished calls stay in the live map this long so late accept/reject/end
/// frames resolve as no-ops without a store lookup.
const TOMBSTONE_TTL: Duration = Duration::from_secs(600);

struct LiveCall {
    room_id: String,
    target_email: Option<String>,
    status: CallStatus,
    started_at: DateTime<Utc>,
    ring_timer: Option<AbortHandle>,
    finished_at: Option<Instant>,
}

impl LiveCall {
    fn from_record(record: &CallRecord, target_email: Option<String>) -> Self {
        let finished_at = record.status.is_terminal().then(Instant::now);
        Self {
            room_id: record.room_id.clone(),
            target_email,
            status: record.status,
            started_at: record.started_at,
            ring_timer: None,
            finished_at,
        }
    }

    fn apply(&mut self, next: CallStatus) {
        self.status = next;
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
        if next.is_terminal() {
            self.finished_at = Some(Instant::now());
        }
    }
}

/// What a transition needs to know after the lock is released.
struct Transitioned {
    target_email: Option<String>,
    started_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct CallSignaling {
    registry: ConnectionRegistry,
    store: Arc<dyn ChatStore>,
    router: RoomRouter,
    calls: Arc<Mutex<HashMap<i64, LiveCall>>>,
    ring_timeout: Duration,
}

impl CallSignaling {
    pub fn new(
        registry: ConnectionRegistry,
        store: Arc<dyn ChatStore>,
        router: RoomRouter,
        ring_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            router,
            calls: Arc::new(Mutex::new(HashMap::new())),
            ring_timeout,
        }
    }

    /// Start a call from `caller` to `target_email` inside the room for `key`.
    ///
    /// With the target offline the call is recorded as MISSED right away, the
    /// caller gets `callFailed` and this returns `TargetUnavailable`.
    pub async fn initiate(
        &self,
        outbox: &mut Outbox,
        connection_id: ConnectionId,
        caller: &Identity,
        key: &RoomKey,
        target_email: &str,
        call_type: CallType,
    ) -> Result<CallRecord, RelayError> {
        let target_email = target_email.trim();
        if target_email.is_empty() {
            return Err(RelayError::Validation("targetEmail is required".into()));
        }
        if target_email == caller.email {
            return Err(RelayError::Validation("cannot call yourself".into()));
        }
        if !key.involves(target_email) {
            return Err(RelayError::InvalidParticipants(format!(
                "{target_email} is not a participant of {}",
                key.room_id()
            )));
        }

        let room = self.router.ensure_room_exists(key).await?;
        self.router
            .bind_call_room(connection_id, &room.room_id)
            .await?;
        let mut record = self
            .store
            .insert_call(&room.room_id, caller, call_type)
            .await?;

        let ringing = self.registry.find_connections_by_email(target_email).await;

        if ringing.is_empty() {
            let ended_at = Utc::now();
            record.status = CallStatus::Missed;
            record.ended_at = Some(ended_at);
            {
                let mut calls = self.calls.lock().await;
                prune_finished(&mut calls);
                calls.insert(
                    record.id,
                    LiveCall::from_record(&record, Some(target_email.to_string())),
                );
            }

            outbox.send_one(
                connection_id,
                WsOutboundEvent::CallFailed {
                    call_id: Some(record.id),
                    room_id: room.room_id.clone(),
                    target_email: target_email.to_string(),
                    reason: TARGET_UNAVAILABLE_REASON.to_string(),
                },
            );
            self.persist(record.id, CallStatus::Missed, Some(ended_at), None)
                .await?;
            return Err(RelayError::TargetUnavailable(target_email.to_string()));
        }

        {
            let mut calls = self.calls.lock().await;
            prune_finished(&mut calls);
            let mut live = LiveCall::from_record(&record, Some(target_email.to_string()));
            live.ring_timer = Some(self.spawn_ring_timer(record.id));
            calls.insert(record.id, live);
        }

        outbox.send(
            ringing,
            WsOutboundEvent::IncomingCall {
                call_id: record.id,
                room_id: room.room_id.clone(),
                caller_email: caller.email.clone(),
                caller_role: caller.role,
                call_type,
            },
        );
        outbox.send_one(
            connection_id,
            WsOutboundEvent::CallInitiated {
                call_id: record.id,
                room_id: room.room_id.clone(),
                target_email: target_email.to_string(),
                call_type,
            },
        );

        tracing::info!(
            call_id = record.id,
            room_id = %room.room_id,
            caller = %caller.email,
            target = target_email,
            "call initiated"
        );
        Ok(record)
    }

    pub async fn accept(
        &self,
        outbox: &mut Outbox,
        connection_id: ConnectionId,
        accepter: &Identity,
        call_id: i64,
        room_id: &str,
    ) -> Result<(), RelayError> {
        let moved = self
            .transition(call_id, room_id, CallStatus::Answered)
            .await?;
        self.bind_after_transition(connection_id, call_id, room_id).await;
        let persisted = self
            .persist(call_id, CallStatus::Answered, None, None)
            .await;

        let targets = self
            .room_and_ringing(room_id, moved.target_email.as_deref())
            .await;
        outbox.send(
            targets,
            WsOutboundEvent::CallAccepted {
                call_id,
                room_id: room_id.to_string(),
                accepted_by: accepter.email.clone(),
                timestamp: Utc::now().to_rfc3339(),
            },
        );

        tracing::info!(call_id, room_id, by = %accepter.email, "call accepted");
        persisted
    }

    pub async fn reject(
        &self,
        outbox: &mut Outbox,
        connection_id: ConnectionId,
        rejecter: &Identity,
        call_id: i64,
        room_id: &str,
    ) -> Result<(), RelayError> {
        let moved = self
            .transition(call_id, room_id, CallStatus::Rejected)
            .await?;
        self.bind_after_transition(connection_id, call_id, room_id).await;
        let ended_at = Utc::now();
        let persisted = self
            .persist(call_id, CallStatus::Rejected, Some(ended_at), None)
            .await;

        let targets = self
            .room_and_ringing(room_id, moved.target_email.as_deref())
            .await;
        outbox.send(
            targets,
            WsOutboundEvent::CallRejected {
                call_id,
                room_id: room_id.to_string(),
                rejected_by: Some(rejecter.email.clone()),
                reason: None,
                timestamp: ended_at.to_rfc3339(),
            },
        );

        tracing::info!(call_id, room_id, by = %rejecter.email, "call rejected");
        persisted
    }

    pub async fn end(
        &self,
        outbox: &mut Outbox,
        ender: &Identity,
        call_id: i64,
        room_id: &str,
    ) -> Result<(), RelayError> {
        let moved = self.transition(call_id, room_id, CallStatus::Ended).await?;
        let ended_at = Utc::now();
        let started_at = self.started_at(call_id, moved.started_at).await;
        let duration_seconds = call_duration_seconds(started_at, ended_at);

        let persisted = self
            .persist(
                call_id,
                CallStatus::Ended,
                Some(ended_at),
                Some(duration_seconds),
            )
            .await;

        let members = self.registry.room_members(room_id).await;
        outbox.send(
            members,
            WsOutboundEvent::CallEnded {
                call_id,
                room_id: room_id.to_string(),
                ended_by: ender.email.clone(),
                duration_seconds,
                timestamp: ended_at.to_rfc3339(),
            },
        );

        tracing::info!(call_id, room_id, duration_seconds, "call ended");
        persisted
    }

    /// Forward an offer, answer or ICE candidate to the rest of the room.
    pub async fn relay_signal(
        &self,
        outbox: &mut Outbox,
        connection_id: ConnectionId,
        sender: &Identity,
        kind: SignalKind,
        room_id: &str,
        payload: Value,
    ) -> Result<(), RelayError> {
        if room_id.trim().is_empty() {
            return Err(RelayError::Validation("roomId is required".into()));
        }

        let mut peers = self.registry.room_members(room_id).await;
        peers.remove(&connection_id);
        if peers.is_empty() {
            tracing::debug!(room_id, ?kind, "signal with no peers dropped");
            return Ok(());
        }

        outbox.send(
            peers,
            WsOutboundEvent::signal(
                kind,
                room_id.to_string(),
                sender.email.clone(),
                sender.role,
                payload,
            ),
        );
        Ok(())
    }

    /// Every call-room connection of `room_id` is gone. Connected calls there
    /// end with the duration they reached; ringing calls are left to their
    /// timers.
    pub async fn abandon_room(&self, outbox: &mut Outbox, ended_by: &str, room_id: &str) {
        let abandoned: Vec<(i64, DateTime<Utc>)> = {
            let mut calls = self.calls.lock().await;
            calls
                .iter_mut()
                .filter(|(_, call)| {
                    call.room_id == room_id && call.status == CallStatus::Answered
                })
                .map(|(call_id, call)| {
                    call.apply(CallStatus::Ended);
                    (*call_id, call.started_at)
                })
                .collect()
        };

        for (call_id, live_started_at) in abandoned {
            let ended_at = Utc::now();
            let started_at = self.started_at(call_id, live_started_at).await;
            let duration_seconds = call_duration_seconds(started_at, ended_at);

            // Divergence is logged inside persist; the leaver is already gone.
            let _ = self
                .persist(
                    call_id,
                    CallStatus::Ended,
                    Some(ended_at),
                    Some(duration_seconds),
                )
                .await;

            let members = self.registry.room_members(room_id).await;
            outbox.send(
                members,
                WsOutboundEvent::CallEnded {
                    call_id,
                    room_id: room_id.to_string(),
                    ended_by: ended_by.to_string(),
                    duration_seconds,
                    timestamp: ended_at.to_rfc3339(),
                },
            );

            tracing::info!(call_id, room_id, duration_seconds, "call ended, no legs left");
        }
    }

    pub async fn status(&self, call_id: i64) -> Option<CallStatus> {
        self.calls.lock().await.get(&call_id).map(|c| c.status)
    }

    /// Calls that are ringing or connected.
    pub async fn active_calls(&self) -> usize {
        self.calls
            .lock()
            .await
            .values()
            .filter(|c| !c.status.is_terminal())
            .count()
    }

    fn spawn_ring_timer(&self, call_id: i64) -> AbortHandle {
        let this = self.clone();
        let ring_timeout = self.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(ring_timeout).await;
            this.expire(call_id).await;
        })
        .abort_handle()
    }

    /// Ring timer fired: the call becomes MISSED and everyone involved is
    /// told it was rejected for lack of an answer.
    async fn expire(&self, call_id: i64) {
        let (room_id, target_email) = {
            let mut calls = self.calls.lock().await;
            let Some(call) = calls.get_mut(&call_id) else {
                return;
            };
            if call.status != CallStatus::Initiated {
                return;
            }
            // This task is the timer; dropping the handle does not abort it.
            call.ring_timer = None;
            call.apply(CallStatus::Missed);
            (call.room_id.clone(), call.target_email.clone())
        };

        tracing::info!(call_id, room_id = %room_id, "call not answered in time");

        let ended_at = Utc::now();
        // Divergence is logged inside persist; nobody is waiting on the result.
        let _ = self
            .persist(call_id, CallStatus::Missed, Some(ended_at), None)
            .await;

        let targets = self
            .room_and_ringing(&room_id, target_email.as_deref())
            .await;
        self.registry
            .dispatch(&Broadcast::new(
                targets,
                WsOutboundEvent::CallRejected {
                    call_id,
                    room_id,
                    rejected_by: None,
                    reason: Some(TIMEOUT_REASON.to_string()),
                    timestamp: ended_at.to_rfc3339(),
                },
            ))
            .await;
    }

    /// Check and apply one transition under the live-map lock.
    async fn transition(
        &self,
        call_id: i64,
        room_id: &str,
        next: CallStatus,
    ) -> Result<Transitioned, RelayError> {
        self.adopt_if_unknown(call_id).await?;

        let mut calls = self.calls.lock().await;
        let call = calls
            .get_mut(&call_id)
            .ok_or_else(|| RelayError::Validation(format!("call {call_id} not found")))?;

        if call.room_id != room_id {
            return Err(RelayError::Validation(format!(
                "call {call_id} does not belong to room {room_id}"
            )));
        }
        if !call.status.can_transition_to(next) {
            return Err(RelayError::InvalidStateTransition {
                call_id,
                from: call.status,
                to: next,
            });
        }

        call.apply(next);
        Ok(Transitioned {
            target_email: call.target_email.clone(),
            started_at: call.started_at,
        })
    }

    /// Load a call this process has not seen, e.g. one started before a
    /// restart. Terminal calls come back as tombstones.
    async fn adopt_if_unknown(&self, call_id: i64) -> Result<(), RelayError> {
        if self.calls.lock().await.contains_key(&call_id) {
            return Ok(());
        }

        let record = self
            .store
            .find_call(call_id)
            .await?
            .ok_or_else(|| RelayError::Validation(format!("call {call_id} not found")))?;

        let target_email = RoomKey::parse(&record.room_id).ok().and_then(|key| {
            key.participants()
                .into_iter()
                .find(|email| *email != record.caller_email)
                .map(str::to_string)
        });

        let mut calls = self.calls.lock().await;
        calls
            .entry(call_id)
            .or_insert_with(|| LiveCall::from_record(&record, target_email));
        Ok(())
    }

    /// The stored start wins; the live copy covers a missing or failed read.
    async fn started_at(&self, call_id: i64, live: DateTime<Utc>) -> DateTime<Utc> {
        match self.store.find_call_started_at(call_id).await {
            Ok(Some(started_at)) => started_at,
            Ok(None) => {
                tracing::warn!(call_id, "call start missing from store, using live copy");
                live
            }
            Err(e) => {
                tracing::warn!(call_id, error = %e, "call start lookup failed, using live copy");
                live
            }
        }
    }

    /// The transition is already committed, so a connection that vanished in
    /// between only loses its call-room slot; the broadcast still goes out.
    async fn bind_after_transition(
        &self,
        connection_id: ConnectionId,
        call_id: i64,
        room_id: &str,
    ) {
        if let Err(e) = self.router.bind_call_room(connection_id, room_id).await {
            tracing::warn!(
                call_id,
                room_id,
                connection_id = %connection_id,
                error = %e,
                "acting connection left before it could join the call room"
            );
        }
    }

    async fn persist(
        &self,
        call_id: i64,
        status: CallStatus,
        ended_at: Option<DateTime<Utc>>,
        duration_seconds: Option<i64>,
    ) -> Result<(), RelayError> {
        match self
            .store
            .update_call_status(call_id, status, ended_at, duration_seconds)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(
                    call_id,
                    status = %status,
                    error = %e,
                    "call status not persisted; live state diverges from store"
                );
                Err(e.into())
            }
        }
    }

    /// Everyone in the call room plus every device of the callee, so devices
    /// that are still ringing stop.
    async fn room_and_ringing(
        &self,
        room_id: &str,
        target_email: Option<&str>,
    ) -> HashSet<ConnectionId> {
        let mut targets = self.registry.room_members(room_id).await;
        if let Some(email) = target_email {
            targets.extend(self.registry.find_connections_by_email(email).await);
        }
        targets
    }
}

fn prune_finished(calls: &mut HashMap<i64, LiveCall>) {
    calls.retain(|_, call| {
        call.finished_at
            .map_or(true, |finished| finished.elapsed() < TOMBSTONE_TTL)
    });
}
