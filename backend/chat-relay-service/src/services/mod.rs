pub mod call_signaling;
pub mod message_relay;
pub mod presence;
pub mod relay;
pub mod room_router;

pub use call_signaling::{CallSignaling, TARGET_UNAVAILABLE_REASON, TIMEOUT_REASON};
pub use message_relay::MessageRelay;
pub use presence::Presence;
pub use relay::{Relay, RelaySettings, RelayStats};
pub use room_router::RoomRouter;
