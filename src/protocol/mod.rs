//! Wire protocol: RFC 6455 framing, the upgrade handshake, the receive
//! buffer, and the JSON message vocabulary.

pub mod buffer;
pub mod frame;
pub mod handshake;
pub mod messages;

pub use buffer::ConnectionBuffer;
pub use frame::{Decoded, Frame, Opcode};
pub use messages::{ClientMessage, ErrorCode, ServerMessage};
