//! Wire layout of a packet frame.
//!
//! ```text
//! +-----------+----------------+---------+--------+
//! | PN_PACKET | payload length | payload | <~PN>  |
//! |  9 bytes  | u64 LE, 8 bytes| n bytes | 5 bytes|
//! +-----------+----------------+---------+--------+
//! ```
//!
//! The length field counts payload bytes only and is always little-endian,
//! independent of host byte order. A zero-length payload is a valid frame.

use bytes::{BufMut, Bytes, BytesMut};

/// Marker that opens every frame.
pub const HEAD_TAG: &[u8; 9] = b"PN_PACKET";
/// Marker that closes every frame.
pub const END_TAG: &[u8; 5] = b"<~PN>";
/// Bytes before the payload: head tag plus length field.
pub const PREFIX_SIZE: usize = HEAD_TAG.len() + 8;
/// Framing bytes around a payload.
pub const FRAME_OVERHEAD: usize = PREFIX_SIZE + END_TAG.len();
/// Upper bound on a whole frame, tags and length field included.
pub const MAX_FRAME_SIZE: u64 = 64 * 1024 * 1024;

/// Wrap a payload in a complete frame.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + payload.len());
    buf.put_slice(HEAD_TAG);
    buf.put_u64_le(payload.len() as u64);
    buf.put_slice(payload);
    buf.put_slice(END_TAG);
    buf.freeze()
}
