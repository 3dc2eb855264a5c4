pub mod call;
pub mod identity;
pub mod message;
pub mod room;

pub use call::{call_duration_seconds, CallRecord, CallStatus, CallType};
pub use identity::{Identity, Role};
pub use message::{ChatMessage, MessagePreview, RoomSummary};
pub use room::{compute_room_id, Room, RoomKey};
