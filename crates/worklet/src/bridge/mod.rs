//! Wire-level concerns: message framing, the frame codec, the connection
//! state machine, and the named local transport.

pub mod codec;
pub mod connection;
pub mod message;
pub mod transport;
