// Relay flow tests
//
// Drive the public Relay API end to end with the in-memory store and real
// registry channels. Each fake client drains its channel with try_recv, so
// every assertion sees exactly what a socket would have been sent.

use chat_relay_service::error::RelayError;
use chat_relay_service::models::{CallStatus, CallType, Identity, Role};
use chat_relay_service::services::{Relay, RelaySettings, TIMEOUT_REASON};
use chat_relay_service::store::{ChatStore, InMemoryChatStore};
use chat_relay_service::websocket::{ConnectionId, Outbox, WsInboundEvent};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

const DEALER: &str = "dealer@x.com";
const TECH: &str = "tech@x.com";
const ROOM: &str = "dealer@x.com:tech@x.com";

struct Client {
    id: ConnectionId,
    rx: UnboundedReceiver<String>,
}

impl Client {
    fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(serde_json::from_str(&frame).expect("frames are JSON"));
        }
        frames
    }
}

fn of_type<'a>(frames: &'a [Value], event_type: &str) -> Vec<&'a Value> {
    frames.iter().filter(|f| f["type"] == event_type).collect()
}

fn setup() -> (Relay, Arc<InMemoryChatStore>) {
    let store = Arc::new(InMemoryChatStore::new());
    let relay = Relay::new(store.clone(), RelaySettings::default());
    (relay, store)
}

async fn client(relay: &Relay, email: &str, role: &str) -> Client {
    let (id, rx) = relay.connect().await;
    let mut client = Client { id, rx };
    relay
        .handle_event(
            id,
            WsInboundEvent::Register {
                email: Some(email.to_string()),
                role: Some(role.to_string()),
            },
        )
        .await
        .expect("register");
    let frames = client.drain();
    assert_eq!(of_type(&frames, "registered").len(), 1);
    client
}

async fn join(relay: &Relay, client: &Client) {
    relay
        .handle_event(
            client.id,
            WsInboundEvent::JoinRoom {
                dealer_email: DEALER.to_string(),
                technician_email: TECH.to_string(),
                scope_id: None,
            },
        )
        .await
        .expect("join");
}

async fn send(relay: &Relay, client: &Client, body: &str) -> Result<(), RelayError> {
    relay
        .handle_event(
            client.id,
            WsInboundEvent::SendMessage {
                room_id: ROOM.to_string(),
                body: body.to_string(),
                dealer_email: None,
                technician_email: None,
                scope_id: None,
            },
        )
        .await
}

async fn initiate(relay: &Relay, caller: &Client, target: &str) -> Result<(), RelayError> {
    relay
        .handle_event(
            caller.id,
            WsInboundEvent::CallInitiate {
                room_id: ROOM.to_string(),
                call_type: CallType::Video,
                target_email: target.to_string(),
                dealer_email: Some(DEALER.to_string()),
                technician_email: Some(TECH.to_string()),
                scope_id: None,
            },
        )
        .await
}

fn call_id_from(frames: &[Value], event_type: &str) -> i64 {
    of_type(frames, event_type)[0]["callId"]
        .as_i64()
        .expect("callId")
}

async fn ringing_call(relay: &Relay, caller: &mut Client, callee: &mut Client) -> i64 {
    initiate(relay, caller, TECH).await.expect("initiate");
    let call_id = call_id_from(&caller.drain(), "callInitiated");
    assert_eq!(call_id_from(&callee.drain(), "incomingCall"), call_id);
    call_id
}

// ============================================================================
// Message relay
// ============================================================================

#[tokio::test]
async fn every_device_gets_exactly_one_copy() {
    let (relay, store) = setup();
    let mut dealer = client(&relay, DEALER, "DEALER").await;
    let mut tech_a = client(&relay, TECH, "TECHNICIAN").await;
    let mut tech_b = client(&relay, TECH, "TECHNICIAN").await;

    join(&relay, &dealer).await;
    join(&relay, &tech_a).await;
    dealer.drain();
    tech_a.drain();

    send(&relay, &dealer, "wheel bearing is in").await.unwrap();

    let a = tech_a.drain();
    let b = tech_b.drain();
    let d = dealer.drain();

    // A is in the room, B is not.
    assert_eq!(of_type(&a, "newMessage").len(), 1);
    assert_eq!(of_type(&a, "chatNotification").len(), 0);
    assert_eq!(of_type(&b, "newMessage").len(), 0);
    assert_eq!(of_type(&b, "chatNotification").len(), 1);
    assert_eq!(of_type(&d, "newMessage").len(), 1);
    assert_eq!(a.len() + b.len() + d.len(), 3);

    let message = &of_type(&b, "chatNotification")[0]["message"];
    assert_eq!(message["body"], "wheel bearing is in");
    assert_eq!(message["senderRole"], "DEALER");
    assert_eq!(message["readStatus"], false);

    assert_eq!(store.message_count().await, 1);
}

#[tokio::test]
async fn devices_outside_the_room_each_get_one_notification() {
    let (relay, store) = setup();
    let mut dealer = client(&relay, DEALER, "DEALER").await;
    let mut tech_a = client(&relay, TECH, "TECHNICIAN").await;
    let mut tech_b = client(&relay, TECH, "TECHNICIAN").await;

    join(&relay, &dealer).await;
    send(&relay, &dealer, "ping").await.unwrap();

    for frames in [tech_a.drain(), tech_b.drain()] {
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "chatNotification");
        assert_eq!(frames[0]["roomId"], ROOM);
    }
    assert_eq!(of_type(&dealer.drain(), "newMessage").len(), 1);
    assert!(store.find_room(ROOM).await.unwrap().is_some());
}

#[tokio::test]
async fn empty_body_is_rejected_without_persisting() {
    let (relay, store) = setup();
    let mut dealer = client(&relay, DEALER, "DEALER").await;

    let err = send(&relay, &dealer, "   ").await.unwrap_err();
    assert!(matches!(err, RelayError::Validation(_)));

    let frames = dealer.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["code"], "validation_error");
    assert_eq!(store.message_count().await, 0);
}

#[tokio::test]
async fn unregistered_sender_gets_an_error_event() {
    let (relay, store) = setup();
    let (id, rx) = relay.connect().await;
    let mut anon = Client { id, rx };

    let err = send(&relay, &anon, "hello?").await.unwrap_err();
    assert!(matches!(err, RelayError::UnregisteredSender));

    let frames = anon.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "error");
    assert_eq!(frames[0]["code"], "unregistered_sender");
    assert_eq!(store.message_count().await, 0);
}

#[tokio::test]
async fn mark_room_read_leaves_readers_own_messages_alone() {
    let (relay, store) = setup();
    let dealer = client(&relay, DEALER, "DEALER").await;
    let mut tech_a = client(&relay, TECH, "TECHNICIAN").await;
    let mut tech_b = client(&relay, TECH, "TECHNICIAN").await;

    send(&relay, &dealer, "from dealer").await.unwrap();
    send(&relay, &tech_a, "from tech").await.unwrap();
    tech_a.drain();
    tech_b.drain();

    relay
        .handle_event(
            tech_a.id,
            WsInboundEvent::MarkRoomRead {
                room_id: ROOM.to_string(),
            },
        )
        .await
        .unwrap();

    for message in store.messages_in(ROOM).await {
        if message.sender_email == TECH {
            assert!(!message.read_status, "reader's own message flipped");
        } else {
            assert!(message.read_status);
        }
    }

    // Both of the reader's devices hear about it.
    for frames in [tech_a.drain(), tech_b.drain()] {
        let marked = of_type(&frames, "roomMarkedRead");
        assert_eq!(marked.len(), 1);
        assert_eq!(marked[0]["updated"], 1);
        assert_eq!(marked[0]["readerEmail"], TECH);
    }
}

#[tokio::test]
async fn mark_read_tells_the_room() {
    let (relay, store) = setup();
    let mut dealer = client(&relay, DEALER, "DEALER").await;
    let mut tech = client(&relay, TECH, "TECHNICIAN").await;
    join(&relay, &dealer).await;
    join(&relay, &tech).await;

    send(&relay, &dealer, "read me").await.unwrap();
    let message_id = store.messages_in(ROOM).await[0].id;
    dealer.drain();
    tech.drain();

    relay
        .handle_event(tech.id, WsInboundEvent::MarkRead { message_id })
        .await
        .unwrap();

    let seen = dealer.drain();
    let read = of_type(&seen, "messageRead");
    assert_eq!(read.len(), 1);
    assert_eq!(read[0]["messageId"], message_id);
    assert_eq!(read[0]["readBy"], TECH);
    assert!(store.messages_in(ROOM).await[0].read_status);

    let err = relay
        .handle_event(tech.id, WsInboundEvent::MarkRead { message_id: 4242 })
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Validation(_)));
}

#[tokio::test]
async fn malformed_frames_are_answered_with_validation_error() {
    let (relay, _store) = setup();
    let mut dealer = client(&relay, DEALER, "DEALER").await;

    relay.handle_text(dealer.id, "{not json").await;
    relay
        .handle_text(dealer.id, r#"{"type":"sendMessage","roomId":"a:b"}"#)
        .await;

    let frames = dealer.drain();
    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|f| f["code"] == "validation_error"));
}

// ============================================================================
// Rooms and presence
// ============================================================================

#[tokio::test]
async fn register_without_role_is_a_silent_no_op() {
    let (relay, _store) = setup();
    let (id, rx) = relay.connect().await;
    let mut anon = Client { id, rx };

    relay
        .handle_event(
            id,
            WsInboundEvent::Register {
                email: Some(DEALER.to_string()),
                role: None,
            },
        )
        .await
        .unwrap();

    assert!(anon.drain().is_empty());
    assert!(relay.registry().identity(id).await.is_none());
}

#[tokio::test]
async fn join_announces_to_others_but_not_the_joiner() {
    let (relay, _store) = setup();
    let mut dealer = client(&relay, DEALER, "DEALER").await;
    let mut tech = client(&relay, TECH, "TECHNICIAN").await;

    join(&relay, &dealer).await;
    let own = dealer.drain();
    assert_eq!(own.len(), 1);
    assert_eq!(own[0]["type"], "roomJoined");
    assert_eq!(own[0]["roomId"], ROOM);

    join(&relay, &tech).await;
    let tech_frames = tech.drain();
    assert_eq!(of_type(&tech_frames, "roomJoined").len(), 1);
    assert_eq!(of_type(&tech_frames, "userJoined").len(), 0);

    let dealer_frames = dealer.drain();
    let joined = of_type(&dealer_frames, "userJoined");
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0]["email"], TECH);
    assert_eq!(joined[0]["role"], "TECHNICIAN");
}

#[tokio::test]
async fn switching_rooms_leaves_the_previous_one() {
    let (relay, _store) = setup();
    let mut dealer = client(&relay, DEALER, "DEALER").await;
    let tech = client(&relay, TECH, "TECHNICIAN").await;
    join(&relay, &dealer).await;
    join(&relay, &tech).await;
    dealer.drain();

    relay
        .handle_event(
            tech.id,
            WsInboundEvent::JoinRoom {
                dealer_email: DEALER.to_string(),
                technician_email: TECH.to_string(),
                scope_id: Some("77".to_string()),
            },
        )
        .await
        .unwrap();

    let frames = dealer.drain();
    let left = of_type(&frames, "userLeft");
    assert_eq!(left.len(), 1);
    assert_eq!(left[0]["roomId"], ROOM);

    let memberships = relay.registry().memberships(tech.id).await.unwrap();
    assert_eq!(
        memberships.chat_room.as_deref(),
        Some("dealer@x.com:tech@x.com:POST_77")
    );
}

#[tokio::test]
async fn typing_reaches_everyone_else_in_the_room() {
    let (relay, _store) = setup();
    let mut dealer = client(&relay, DEALER, "DEALER").await;
    let mut tech = client(&relay, TECH, "TECHNICIAN").await;
    let mut outsider = client(&relay, TECH, "TECHNICIAN").await;
    join(&relay, &dealer).await;
    join(&relay, &tech).await;
    dealer.drain();
    tech.drain();

    relay
        .handle_event(tech.id, WsInboundEvent::Typing { is_typing: true })
        .await
        .unwrap();

    let frames = dealer.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "userTyping");
    assert_eq!(frames[0]["isTyping"], true);
    assert!(tech.drain().is_empty());
    assert!(outsider.drain().is_empty());

    // Not in a room: nothing happens, nothing is reported.
    relay
        .handle_event(outsider.id, WsInboundEvent::Typing { is_typing: true })
        .await
        .unwrap();
    assert!(outsider.drain().is_empty());
}

#[tokio::test]
async fn typing_skips_connections_only_on_a_call() {
    let (relay, _store) = setup();
    let mut on_call = client(&relay, DEALER, "DEALER").await;
    let mut tech = client(&relay, TECH, "TECHNICIAN").await;
    join(&relay, &tech).await;
    tech.drain();

    // The dealer's first device is in the call room but never joined the chat.
    initiate(&relay, &on_call, TECH).await.unwrap();
    on_call.drain();
    tech.drain();

    let mut chatting = client(&relay, DEALER, "DEALER").await;
    join(&relay, &chatting).await;
    chatting.drain();
    tech.drain();
    on_call.drain();
    assert!(relay
        .registry()
        .call_members(ROOM)
        .await
        .contains(&on_call.id));

    relay
        .handle_event(tech.id, WsInboundEvent::Typing { is_typing: true })
        .await
        .unwrap();

    assert_eq!(of_type(&chatting.drain(), "userTyping").len(), 1);
    assert!(on_call.drain().is_empty());
}

#[tokio::test]
async fn disconnect_keeps_the_persisted_room() {
    let (relay, store) = setup();
    let dealer = client(&relay, DEALER, "DEALER").await;
    join(&relay, &dealer).await;

    relay.disconnect(dealer.id).await;

    assert!(relay.registry().room_members(ROOM).await.is_empty());
    assert!(store.find_room(ROOM).await.unwrap().is_some());
    assert!(relay
        .registry()
        .find_connections_by_email(DEALER)
        .await
        .is_empty());

    let mut again = client(&relay, DEALER, "DEALER").await;
    join(&relay, &again).await;
    let frames = again.drain();
    assert_eq!(frames[0]["type"], "roomJoined");
    assert_eq!(frames[0]["roomId"], ROOM);
    assert_eq!(store.room_count().await, 1);
}

#[tokio::test]
async fn joining_creates_the_room() {
    let (relay, store) = setup();
    let mut tech = client(&relay, TECH, "TECHNICIAN").await;

    relay
        .handle_event(
            tech.id,
            WsInboundEvent::JoinRoom {
                dealer_email: format!(" {DEALER} "),
                technician_email: TECH.to_string(),
                scope_id: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(tech.drain()[0]["roomId"], ROOM);

    let room = store.find_room(ROOM).await.unwrap().expect("room persisted");
    assert_eq!(room.dealer_email, DEALER);
    assert_eq!(room.technician_email, TECH);

    let rooms = store.list_rooms_for(DEALER).await.unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].room_id, ROOM);
    assert!(rooms[0].last_message.is_none());
    assert_eq!(store.message_count().await, 0);
}

#[tokio::test]
async fn join_fails_cleanly_when_the_room_cannot_be_saved() {
    let (relay, store) = setup();
    let mut dealer = client(&relay, DEALER, "DEALER").await;

    store.fail_next_writes(1);
    relay
        .handle_text(
            dealer.id,
            &json!({
                "type": "joinRoom",
                "dealerEmail": DEALER,
                "technicianEmail": TECH,
            })
            .to_string(),
        )
        .await;

    let frames = dealer.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["code"], "persistence_failure");
    let memberships = relay.registry().memberships(dealer.id).await.unwrap();
    assert!(memberships.chat_room.is_none());
}

#[tokio::test]
async fn disconnect_announces_departure_to_the_room() {
    let (relay, _store) = setup();
    let mut dealer = client(&relay, DEALER, "DEALER").await;
    let tech = client(&relay, TECH, "TECHNICIAN").await;
    join(&relay, &dealer).await;
    join(&relay, &tech).await;
    dealer.drain();

    relay.disconnect(tech.id).await;

    let frames = dealer.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "userLeft");
    assert_eq!(frames[0]["email"], TECH);

    // Second disconnect of the same id is harmless.
    relay.disconnect(tech.id).await;
    assert!(dealer.drain().is_empty());
}

// ============================================================================
// Call signaling
// ============================================================================

#[tokio::test]
async fn calling_an_offline_user_is_missed_immediately() {
    let (relay, store) = setup();
    let mut dealer = client(&relay, DEALER, "DEALER").await;
    let mut bystander = client(&relay, "other@x.com", "TECHNICIAN").await;

    let err = initiate(&relay, &dealer, TECH).await.unwrap_err();
    assert!(matches!(err, RelayError::TargetUnavailable(_)));

    let frames = dealer.drain();
    assert_eq!(frames.len(), 1, "no error event on top of callFailed");
    assert_eq!(frames[0]["type"], "callFailed");
    assert_eq!(frames[0]["reason"], "user not available");
    assert!(bystander.drain().is_empty());

    let call_id = frames[0]["callId"].as_i64().unwrap();
    let record = store.find_call(call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Missed);
    assert!(record.ended_at.is_some());
}

#[tokio::test]
async fn ended_call_reports_floored_duration() {
    let (relay, store) = setup();
    let mut dealer = client(&relay, DEALER, "DEALER").await;
    let mut tech = client(&relay, TECH, "TECHNICIAN").await;
    let call_id = ringing_call(&relay, &mut dealer, &mut tech).await;

    relay
        .handle_event(
            tech.id,
            WsInboundEvent::CallAccept {
                call_id,
                room_id: ROOM.to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(of_type(&dealer.drain(), "callAccepted").len(), 1);
    assert_eq!(of_type(&tech.drain(), "callAccepted").len(), 1);

    store
        .backdate_call(call_id, chrono::Duration::milliseconds(7500))
        .await;

    relay
        .handle_event(
            dealer.id,
            WsInboundEvent::CallEnd {
                call_id,
                room_id: ROOM.to_string(),
            },
        )
        .await
        .unwrap();

    for frames in [dealer.drain(), tech.drain()] {
        let ended = of_type(&frames, "callEnded");
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0]["durationSeconds"], 7);
    }

    let record = store.find_call(call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Ended);
    assert_eq!(record.duration_seconds, Some(7));
}

#[tokio::test]
async fn finished_calls_ignore_late_transitions() {
    let (relay, store) = setup();
    let mut dealer = client(&relay, DEALER, "DEALER").await;
    let mut tech = client(&relay, TECH, "TECHNICIAN").await;
    let call_id = ringing_call(&relay, &mut dealer, &mut tech).await;

    relay
        .handle_event(
            tech.id,
            WsInboundEvent::CallReject {
                call_id,
                room_id: ROOM.to_string(),
            },
        )
        .await
        .unwrap();
    let rejected = dealer.drain();
    assert_eq!(of_type(&rejected, "callRejected")[0]["rejectedBy"], TECH);
    tech.drain();

    let late = [
        WsInboundEvent::CallAccept {
            call_id,
            room_id: ROOM.to_string(),
        },
        WsInboundEvent::CallReject {
            call_id,
            room_id: ROOM.to_string(),
        },
        WsInboundEvent::CallEnd {
            call_id,
            room_id: ROOM.to_string(),
        },
    ];
    for event in late {
        let err = relay.handle_event(tech.id, event).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidStateTransition { .. }));
    }

    // No duplicate broadcasts and nothing surfaced to the client.
    assert!(dealer.drain().is_empty());
    assert!(tech.drain().is_empty());
    assert_eq!(
        store.find_call(call_id).await.unwrap().unwrap().status,
        CallStatus::Rejected
    );
}

#[tokio::test]
async fn end_before_answer_is_ignored() {
    let (relay, _store) = setup();
    let mut dealer = client(&relay, DEALER, "DEALER").await;
    let mut tech = client(&relay, TECH, "TECHNICIAN").await;
    let call_id = ringing_call(&relay, &mut dealer, &mut tech).await;

    let err = relay
        .handle_event(
            dealer.id,
            WsInboundEvent::CallEnd {
                call_id,
                room_id: ROOM.to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RelayError::InvalidStateTransition {
            from: CallStatus::Initiated,
            to: CallStatus::Ended,
            ..
        }
    ));
    assert_eq!(
        relay.calls().status(call_id).await,
        Some(CallStatus::Initiated)
    );
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out() {
    let (relay, store) = setup();
    let mut dealer = client(&relay, DEALER, "DEALER").await;
    let mut tech = client(&relay, TECH, "TECHNICIAN").await;
    let call_id = ringing_call(&relay, &mut dealer, &mut tech).await;

    tokio::time::sleep(Duration::from_secs(31)).await;

    let caller_frames = dealer.drain();
    let rejected = of_type(&caller_frames, "callRejected");
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0]["reason"], TIMEOUT_REASON);
    assert_eq!(rejected[0]["rejectedBy"], Value::Null);

    // The ringing device stops too.
    assert_eq!(of_type(&tech.drain(), "callRejected").len(), 1);

    let record = store.find_call(call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Missed);
    assert!(!matches!(record.status, CallStatus::Initiated));

    let err = relay
        .handle_event(
            tech.id,
            WsInboundEvent::CallAccept {
                call_id,
                room_id: ROOM.to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::InvalidStateTransition { .. }));
    assert_eq!(relay.stats().await.active_calls, 0);
}

#[tokio::test(start_paused = true)]
async fn answering_cancels_the_ring_timer() {
    let (relay, store) = setup();
    let mut dealer = client(&relay, DEALER, "DEALER").await;
    let mut tech = client(&relay, TECH, "TECHNICIAN").await;
    let call_id = ringing_call(&relay, &mut dealer, &mut tech).await;

    relay
        .handle_event(
            tech.id,
            WsInboundEvent::CallAccept {
                call_id,
                room_id: ROOM.to_string(),
            },
        )
        .await
        .unwrap();
    dealer.drain();
    tech.drain();

    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(of_type(&dealer.drain(), "callRejected").is_empty());
    assert_eq!(
        store.find_call(call_id).await.unwrap().unwrap().status,
        CallStatus::Answered
    );
    assert_eq!(relay.stats().await.active_calls, 1);
}

#[tokio::test]
async fn accept_reaches_every_ringing_device() {
    let (relay, _store) = setup();
    let mut dealer = client(&relay, DEALER, "DEALER").await;
    let mut tech_a = client(&relay, TECH, "TECHNICIAN").await;
    let mut tech_b = client(&relay, TECH, "TECHNICIAN").await;

    initiate(&relay, &dealer, TECH).await.unwrap();
    let call_id = call_id_from(&dealer.drain(), "callInitiated");
    assert_eq!(of_type(&tech_a.drain(), "incomingCall").len(), 1);
    assert_eq!(of_type(&tech_b.drain(), "incomingCall").len(), 1);

    relay
        .handle_event(
            tech_a.id,
            WsInboundEvent::CallAccept {
                call_id,
                room_id: ROOM.to_string(),
            },
        )
        .await
        .unwrap();

    for frames in [dealer.drain(), tech_a.drain(), tech_b.drain()] {
        assert_eq!(of_type(&frames, "callAccepted").len(), 1);
    }
}

#[tokio::test]
async fn persistence_failure_keeps_live_state_and_reports() {
    let (relay, store) = setup();
    let mut dealer = client(&relay, DEALER, "DEALER").await;
    let mut tech = client(&relay, TECH, "TECHNICIAN").await;
    let call_id = ringing_call(&relay, &mut dealer, &mut tech).await;

    store.fail_next_writes(1);
    let err = relay
        .handle_event(
            tech.id,
            WsInboundEvent::CallAccept {
                call_id,
                room_id: ROOM.to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Persistence(_)));

    // The broadcast still went out; only the actor hears about the failure.
    assert_eq!(of_type(&dealer.drain(), "callAccepted").len(), 1);
    let tech_frames = tech.drain();
    assert_eq!(of_type(&tech_frames, "callAccepted").len(), 1);
    let errors = of_type(&tech_frames, "error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["code"], "persistence_failure");

    assert_eq!(relay.calls().status(call_id).await, Some(CallStatus::Answered));
    assert_eq!(
        store.find_call(call_id).await.unwrap().unwrap().status,
        CallStatus::Initiated
    );
}

#[tokio::test]
async fn calls_from_a_previous_process_are_adopted() {
    let store = Arc::new(InMemoryChatStore::new());
    let before = Relay::new(store.clone(), RelaySettings::default());
    let mut dealer = client(&before, DEALER, "DEALER").await;
    let mut tech = client(&before, TECH, "TECHNICIAN").await;
    let call_id = ringing_call(&before, &mut dealer, &mut tech).await;

    // Fresh relay over the same store, as after a restart.
    let after = Relay::new(store.clone(), RelaySettings::default());
    let mut tech = client(&after, TECH, "TECHNICIAN").await;

    after
        .handle_event(
            tech.id,
            WsInboundEvent::CallAccept {
                call_id,
                room_id: ROOM.to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(of_type(&tech.drain(), "callAccepted").len(), 1);
    assert_eq!(
        store.find_call(call_id).await.unwrap().unwrap().status,
        CallStatus::Answered
    );

    let err = after
        .handle_event(
            tech.id,
            WsInboundEvent::CallAccept {
                call_id: 9999,
                room_id: ROOM.to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Validation(_)));
}

#[tokio::test]
async fn answered_call_ends_when_every_leg_disconnects() {
    let (relay, store) = setup();
    let mut dealer = client(&relay, DEALER, "DEALER").await;
    let mut tech = client(&relay, TECH, "TECHNICIAN").await;
    let mut watcher = client(&relay, TECH, "TECHNICIAN").await;
    join(&relay, &watcher).await;
    let call_id = ringing_call(&relay, &mut dealer, &mut tech).await;
    relay
        .handle_event(
            tech.id,
            WsInboundEvent::CallAccept {
                call_id,
                room_id: ROOM.to_string(),
            },
        )
        .await
        .unwrap();
    store
        .backdate_call(call_id, chrono::Duration::milliseconds(4200))
        .await;
    watcher.drain();

    // One leg left: the call is still up.
    relay.disconnect(dealer.id).await;
    assert_eq!(relay.calls().status(call_id).await, Some(CallStatus::Answered));
    assert!(of_type(&watcher.drain(), "callEnded").is_empty());

    relay.disconnect(tech.id).await;

    assert_eq!(relay.calls().status(call_id).await, Some(CallStatus::Ended));
    assert_eq!(relay.stats().await.active_calls, 0);
    let record = store.find_call(call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Ended);
    assert_eq!(record.duration_seconds, Some(4));
    assert!(record.ended_at.is_some());

    // The chat-only device still in the room hears about it once.
    let ended = watcher.drain();
    let ended = of_type(&ended, "callEnded");
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0]["durationSeconds"], 4);
    assert_eq!(ended[0]["endedBy"], TECH);
}

#[tokio::test]
async fn ringing_call_is_left_to_its_timer_when_the_caller_leaves() {
    let (relay, store) = setup();
    let mut dealer = client(&relay, DEALER, "DEALER").await;
    let mut tech = client(&relay, TECH, "TECHNICIAN").await;
    let call_id = ringing_call(&relay, &mut dealer, &mut tech).await;

    relay.disconnect(dealer.id).await;

    assert_eq!(
        relay.calls().status(call_id).await,
        Some(CallStatus::Initiated)
    );
    assert_eq!(
        store.find_call(call_id).await.unwrap().unwrap().status,
        CallStatus::Initiated
    );
}

#[tokio::test]
async fn accept_still_broadcasts_if_the_accepter_is_gone() {
    let (relay, store) = setup();
    let mut dealer = client(&relay, DEALER, "DEALER").await;
    let mut tech = client(&relay, TECH, "TECHNICIAN").await;
    let call_id = ringing_call(&relay, &mut dealer, &mut tech).await;

    let accepter = Identity {
        email: TECH.to_string(),
        role: Role::Technician,
    };
    relay.disconnect(tech.id).await;

    let mut outbox = Outbox::new();
    relay
        .calls()
        .accept(&mut outbox, tech.id, &accepter, call_id, ROOM)
        .await
        .unwrap();
    relay.registry().dispatch_all(outbox).await;

    let accepted = dealer.drain();
    let accepted = of_type(&accepted, "callAccepted");
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0]["acceptedBy"], TECH);
    assert_eq!(relay.calls().status(call_id).await, Some(CallStatus::Answered));
    assert_eq!(
        store.find_call(call_id).await.unwrap().unwrap().status,
        CallStatus::Answered
    );
}

#[tokio::test]
async fn signaling_payloads_are_relayed_verbatim_to_peers() {
    let (relay, _store) = setup();
    let mut dealer = client(&relay, DEALER, "DEALER").await;
    let mut tech = client(&relay, TECH, "TECHNICIAN").await;
    let call_id = ringing_call(&relay, &mut dealer, &mut tech).await;
    relay
        .handle_event(
            tech.id,
            WsInboundEvent::CallAccept {
                call_id,
                room_id: ROOM.to_string(),
            },
        )
        .await
        .unwrap();
    dealer.drain();
    tech.drain();

    let sdp = json!({"type": "offer", "sdp": "v=0\r\no=- 1 1 IN IP4 0.0.0.0"});
    relay
        .handle_event(
            dealer.id,
            WsInboundEvent::Offer {
                room_id: ROOM.to_string(),
                payload: sdp.clone(),
            },
        )
        .await
        .unwrap();

    let frames = tech.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "offer");
    assert_eq!(frames[0]["payload"], sdp);
    assert_eq!(frames[0]["fromEmail"], DEALER);
    assert_eq!(frames[0]["fromRole"], "DEALER");
    assert!(dealer.drain().is_empty());
}

#[tokio::test]
async fn cannot_call_yourself_or_outsiders() {
    let (relay, _store) = setup();
    let mut dealer = client(&relay, DEALER, "DEALER").await;

    let err = initiate(&relay, &dealer, DEALER).await.unwrap_err();
    assert!(matches!(err, RelayError::Validation(_)));

    let err = initiate(&relay, &dealer, "stranger@x.com").await.unwrap_err();
    assert!(matches!(err, RelayError::InvalidParticipants(_)));

    let codes: Vec<Value> = dealer.drain().into_iter().map(|f| f["code"].clone()).collect();
    assert_eq!(codes, vec![json!("validation_error"), json!("invalid_participants")]);
}

#[tokio::test]
async fn roles_parse_case_insensitively_on_register() {
    let (relay, _store) = setup();
    let tech = client(&relay, TECH, "technician").await;
    let identity = relay.registry().identity(tech.id).await.unwrap();
    assert_eq!(identity.role, Role::Technician);
}
