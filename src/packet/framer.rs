//! Inbound frame accumulator.
//!
//! Bytes arrive in arbitrary chunks; the framer buffers them and extracts
//! complete frames. Validation is strict and in order: the head tag is
//! checked as soon as 17 bytes are available, the declared size is bounded
//! before any payload is waited for, and the end tag is checked once the
//! whole frame is buffered. Any violation is terminal for the stream; the
//! caller must discard the buffer and drop the connection.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::FrameError;
use crate::packet::frame::{END_TAG, FRAME_OVERHEAD, HEAD_TAG, MAX_FRAME_SIZE, PREFIX_SIZE};

#[derive(Default)]
pub struct Framer {
    buf: BytesMut,
}

impl Framer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Append bytes and extract every complete frame now available.
    ///
    /// Returns the extracted payloads in stream order. An error means the
    /// stream is corrupt; the buffer contents are unspecified afterwards
    /// and [`clear`](Self::clear) must be called before reuse.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>, FrameError> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        while let Some(payload) = self.try_extract()? {
            frames.push(payload);
        }
        Ok(frames)
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn try_extract(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.buf.len() < PREFIX_SIZE {
            return Ok(None);
        }
        if &self.buf[..HEAD_TAG.len()] != HEAD_TAG {
            return Err(FrameError::BadHeadTag);
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&self.buf[HEAD_TAG.len()..PREFIX_SIZE]);
        let payload_len = u64::from_le_bytes(len_bytes);

        if payload_len > MAX_FRAME_SIZE - FRAME_OVERHEAD as u64 {
            return Err(FrameError::Oversized {
                declared: payload_len.saturating_add(FRAME_OVERHEAD as u64),
                max: MAX_FRAME_SIZE,
            });
        }
        let total = FRAME_OVERHEAD + payload_len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        let end_start = PREFIX_SIZE + payload_len as usize;
        if &self.buf[end_start..total] != END_TAG {
            return Err(FrameError::BadEndTag);
        }

        let mut frame = self.buf.split_to(total);
        frame.advance(PREFIX_SIZE);
        frame.truncate(payload_len as usize);
        Ok(Some(frame.freeze()))
    }
}
