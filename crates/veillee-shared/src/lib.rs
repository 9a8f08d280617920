// Wire types shared between the room hub and its clients.

pub mod constants;
pub mod protocol;
pub mod room;

pub use protocol::{ClientFrame, Participant, ServerFrame};
pub use room::{validate_room_id, RoomIdError};
