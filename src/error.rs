//! Error types for streamnet.

use thiserror::Error;

/// Main error type for all streamnet operations.
#[derive(Debug, Error)]
pub enum NetError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire framing violation (bad tag, oversized frame).
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Record decode failure.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// Result type alias using NetError.
pub type Result<T> = std::result::Result<T, NetError>;

/// Protocol violations detected by the packet framer.
///
/// Any of these forces an immediate disconnect and a full discard of the
/// inbound buffer; there is no resynchronization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The head tag did not match `PN_PACKET`.
    #[error("head tag mismatch")]
    BadHeadTag,

    /// The end tag did not match `<~PN>`.
    #[error("end tag mismatch")]
    BadEndTag,

    /// The declared payload length makes the frame exceed the maximum.
    #[error("declared frame size {declared} exceeds maximum {max}")]
    Oversized { declared: u64, max: u64 },
}

/// Record decode failures.
///
/// Propagated through every enclosing field level; a record that failed to
/// decode is left in an indeterminate state and must be discarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The buffer ended before a required field.
    #[error("short buffer: needed {needed} bytes, {remaining} remaining")]
    ShortBuffer { needed: usize, remaining: usize },

    /// A string field held invalid UTF-8.
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    /// A length or count prefix does not fit in usize.
    #[error("length prefix {0} overflows usize")]
    LengthOverflow(u64),
}

/// Kind tag carried by the error hook alongside the underlying system error.
///
/// Transport failures are funneled through a single
/// [`on_error`](crate::engine::EngineHooks::on_error) hook; this tag tells
/// the embedder which operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Resolve or connect was requested while already online.
    AlreadyConnected,
    /// Server start was requested while already online.
    AlreadyStarted,
    /// DNS resolution failed.
    ResolveFailed,
    /// Every candidate endpoint refused the connection.
    ConnectFailed,
    /// Binding the listening socket failed.
    BindFailed,
    /// Accepting a pending connection failed.
    AcceptFailed,
    /// The peer closed the connection gracefully.
    ConnectionClosed,
    /// A local cancellation interrupted the operation.
    Aborted,
    /// A read failed for any other reason.
    ReadFailed,
    /// A write failed for any other reason.
    WriteFailed,
    /// Socket shutdown failed during teardown (reported, never fatal).
    ShutdownFailed,
    /// Socket close failed during teardown (reported, never fatal).
    CloseFailed,
    /// The packet framer rejected the inbound stream.
    ProtocolViolation,
}

impl ErrorKind {
    /// Classify a read-side I/O error per the transport taxonomy.
    pub(crate) fn from_read_error(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => ErrorKind::ConnectionClosed,
            std::io::ErrorKind::Interrupted => ErrorKind::Aborted,
            _ => ErrorKind::ReadFailed,
        }
    }

    /// Classify a write-side I/O error per the transport taxonomy.
    pub(crate) fn from_write_error(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
                ErrorKind::ConnectionClosed
            }
            std::io::ErrorKind::Interrupted => ErrorKind::Aborted,
            _ => ErrorKind::WriteFailed,
        }
    }
}
