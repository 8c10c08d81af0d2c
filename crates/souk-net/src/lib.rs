// Live-channel networking: one persistent WebSocket per session, fanned out
// to in-process consumers, plus the presence tracker built on top of it.

pub mod backoff;
pub mod connection;
pub mod error;
pub mod memory;
pub mod presence;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use connection::{ConnectionEvent, ConnectionHandle, ConnectionManager, Subscription};
pub use error::NetError;
pub use memory::{memory_transport, MemoryConnector, MemoryHub, MemoryPeer};
pub use presence::{Presence, PresenceSet, PresenceTracker};
pub use transport::{Connector, Link, WsConnector};
