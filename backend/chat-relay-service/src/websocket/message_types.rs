use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{CallType, ChatMessage, Role};

/// Inbound WebSocket events from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WsInboundEvent {
    // ============================================================
    // Session
    // ============================================================
    /// Bind an identity to this connection. Missing fields make this a no-op.
    #[serde(rename_all = "camelCase")]
    Register {
        #[serde(default)]
        email: Option<String>,
        #[serde(default)]
        role: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    JoinRoom {
        dealer_email: String,
        technician_email: String,
        #[serde(default)]
        scope_id: Option<String>,
    },

    LeaveRoom,

    // ============================================================
    // Messaging
    // ============================================================
    /// Participants are optional; without them they are parsed from `room_id`.
    #[serde(rename_all = "camelCase")]
    SendMessage {
        room_id: String,
        body: String,
        #[serde(default)]
        dealer_email: Option<String>,
        #[serde(default)]
        technician_email: Option<String>,
        #[serde(default)]
        scope_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    MarkRead { message_id: i64 },

    #[serde(rename_all = "camelCase")]
    MarkRoomRead { room_id: String },

    #[serde(rename_all = "camelCase")]
    Typing { is_typing: bool },

    // ============================================================
    // Calls
    // ============================================================
    #[serde(rename_all = "camelCase")]
    CallInitiate {
        room_id: String,
        call_type: CallType,
        target_email: String,
        #[serde(default)]
        dealer_email: Option<String>,
        #[serde(default)]
        technician_email: Option<String>,
        #[serde(default)]
        scope_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    CallAccept { call_id: i64, room_id: String },

    #[serde(rename_all = "camelCase")]
    CallReject { call_id: i64, room_id: String },

    #[serde(rename_all = "camelCase")]
    CallEnd { call_id: i64, room_id: String },

    // WebRTC signaling, relayed verbatim
    #[serde(rename_all = "camelCase")]
    IceCandidate { room_id: String, payload: Value },

    #[serde(rename_all = "camelCase")]
    Offer { room_id: String, payload: Value },

    #[serde(rename_all = "camelCase")]
    Answer { room_id: String, payload: Value },
}

impl WsInboundEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::JoinRoom { .. } => "joinRoom",
            Self::LeaveRoom => "leaveRoom",
            Self::SendMessage { .. } => "sendMessage",
            Self::MarkRead { .. } => "markRead",
            Self::MarkRoomRead { .. } => "markRoomRead",
            Self::Typing { .. } => "typing",
            Self::CallInitiate { .. } => "callInitiate",
            Self::CallAccept { .. } => "callAccept",
            Self::CallReject { .. } => "callReject",
            Self::CallEnd { .. } => "callEnd",
            Self::IceCandidate { .. } => "iceCandidate",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
        }
    }
}

/// Kind of an opaque WebRTC signaling frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    IceCandidate,
    Offer,
    Answer,
}

/// Outbound WebSocket events from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WsOutboundEvent {
    // ============================================================
    // Session
    // ============================================================
    #[serde(rename_all = "camelCase")]
    Registered { email: String, role: Role },

    #[serde(rename_all = "camelCase")]
    RoomJoined { room_id: String },

    #[serde(rename_all = "camelCase")]
    RoomLeft { room_id: String },

    // ============================================================
    // Messaging
    // ============================================================
    /// Sent to connections joined to the room.
    #[serde(rename_all = "camelCase")]
    NewMessage { message: ChatMessage },

    /// Sent to a participant's other connections that are not in the room.
    #[serde(rename_all = "camelCase")]
    ChatNotification { room_id: String, message: ChatMessage },

    #[serde(rename_all = "camelCase")]
    MessageRead {
        message_id: i64,
        room_id: String,
        read_by: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    RoomMarkedRead {
        room_id: String,
        reader_email: String,
        updated: u64,
    },

    // ============================================================
    // Presence
    // ============================================================
    #[serde(rename_all = "camelCase")]
    UserTyping {
        room_id: String,
        email: String,
        role: Role,
        is_typing: bool,
    },

    #[serde(rename_all = "camelCase")]
    UserJoined {
        room_id: String,
        email: String,
        role: Role,
    },

    #[serde(rename_all = "camelCase")]
    UserLeft {
        room_id: String,
        email: String,
        role: Role,
    },

    // ============================================================
    // Calls
    // ============================================================
    #[serde(rename_all = "camelCase")]
    IncomingCall {
        call_id: i64,
        room_id: String,
        caller_email: String,
        caller_role: Role,
        call_type: CallType,
    },

    #[serde(rename_all = "camelCase")]
    CallInitiated {
        call_id: i64,
        room_id: String,
        target_email: String,
        call_type: CallType,
    },

    #[serde(rename_all = "camelCase")]
    CallAccepted {
        call_id: i64,
        room_id: String,
        accepted_by: String,
        timestamp: String,
    },

    /// `rejected_by` is empty when the ring timer expired.
    #[serde(rename_all = "camelCase")]
    CallRejected {
        call_id: i64,
        room_id: String,
        rejected_by: Option<String>,
        reason: Option<String>,
        timestamp: String,
    },

    #[serde(rename_all = "camelCase")]
    CallEnded {
        call_id: i64,
        room_id: String,
        ended_by: String,
        duration_seconds: i64,
        timestamp: String,
    },

    #[serde(rename_all = "camelCase")]
    CallFailed {
        call_id: Option<i64>,
        room_id: String,
        target_email: String,
        reason: String,
    },

    // ============================================================
    // WebRTC passthrough
    // ============================================================
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        room_id: String,
        from_email: String,
        from_role: Role,
        payload: Value,
    },

    #[serde(rename_all = "camelCase")]
    Offer {
        room_id: String,
        from_email: String,
        from_role: Role,
        payload: Value,
    },

    #[serde(rename_all = "camelCase")]
    Answer {
        room_id: String,
        from_email: String,
        from_role: Role,
        payload: Value,
    },

    Error { code: String, message: String },
}

impl WsOutboundEvent {
    pub fn signal(
        kind: SignalKind,
        room_id: String,
        from_email: String,
        from_role: Role,
        payload: Value,
    ) -> Self {
        match kind {
            SignalKind::IceCandidate => Self::IceCandidate {
                room_id,
                from_email,
                from_role,
                payload,
            },
            SignalKind::Offer => Self::Offer {
                room_id,
                from_email,
                from_role,
                payload,
            },
            SignalKind::Answer => Self::Answer {
                room_id,
                from_email,
                from_role,
                payload,
            },
        }
    }

    /// Wire name of the event, as found in the `type` field.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::RoomJoined { .. } => "roomJoined",
            Self::RoomLeft { .. } => "roomLeft",
            Self::NewMessage { .. } => "newMessage",
            Self::ChatNotification { .. } => "chatNotification",
            Self::MessageRead { .. } => "messageRead",
            Self::RoomMarkedRead { .. } => "roomMarkedRead",
            Self::UserTyping { .. } => "userTyping",
            Self::UserJoined { .. } => "userJoined",
            Self::UserLeft { .. } => "userLeft",
            Self::IncomingCall { .. } => "incomingCall",
            Self::CallInitiated { .. } => "callInitiated",
            Self::CallAccepted { .. } => "callAccepted",
            Self::CallRejected { .. } => "callRejected",
            Self::CallEnded { .. } => "callEnded",
            Self::CallFailed { .. } => "callFailed",
            Self::IceCandidate { .. } => "iceCandidate",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Error { .. } => "error",
        }
    }
}
