//! Engine state bitmask.
//!
//! All connectivity and loop-activity state lives in a single atomic `u8`;
//! individual bits are ORed in and masked out as the engine moves through
//! its lifecycle. Offline is the absence of every bit.

/// No state bits set.
pub const OFFLINE: u8 = 0;
/// A live socket is installed.
pub const ONLINE: u8 = 1 << 0;
/// Name resolution is in flight (client only).
pub const RESOLVING: u8 = 1 << 1;
/// A connect attempt is in flight (client only).
pub const CONNECTING: u8 = 1 << 2;
/// The read loop is running.
pub const IN_READ: u8 = 1 << 3;
/// The read loop has been asked to stop at the next boundary.
pub const STOP_READ: u8 = 1 << 4;
/// The write loop is running.
pub const IN_WRITE: u8 = 1 << 5;
/// The write loop has been asked to stop at the next boundary.
pub const STOP_WRITE: u8 = 1 << 6;

/// Bits that mean the engine has, or is acquiring, a connection.
pub const CONNECTIVITY: u8 = ONLINE | RESOLVING | CONNECTING;
