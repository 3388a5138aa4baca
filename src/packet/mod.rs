//! Packet layer: length-delimited framing with tag validation, plus the
//! one-time handshake discipline on top of the stream engine.

mod endpoint;
pub mod frame;
mod framer;
mod link;

pub use endpoint::{PacketClient, PacketServer, PacketServerHooks};
pub use frame::{encode_frame, MAX_FRAME_SIZE};
pub use framer::Framer;
pub use link::{NoopPacketHooks, PacketHooks, PacketLink};
