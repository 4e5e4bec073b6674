//! MCP wire protocol and upstream client transports.

pub mod protocol;
pub mod transport;

pub use protocol::*;
pub use transport::{Transport, TransportLike, new_transport};
