//! Types shared by every layer of the souk realtime core: identifiers,
//! connection state, the live-channel wire protocol and its constants.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use protocol::{ClientEvent, Frame, PresenceDelta, PresenceStatus, ServerEvent, WireChatMessage};
pub use types::{ConnectionState, Identity, RoomId, TempId, UserId};
