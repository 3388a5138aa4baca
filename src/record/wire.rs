//! Field-level wire encoding.
//!
//! Every value encodes to a fixed, host-independent layout: scalars as
//! little-endian bytes, strings and collections with a `u64` little-endian
//! length or count prefix. Decoding never reads past the buffer; a
//! truncated field fails with `ShortBuffer` at whatever nesting depth it
//! occurs.

use std::collections::HashMap;
use std::hash::Hash;

use crate::error::DecodeError;

/// Read-only cursor over an encoded buffer.
pub struct WireCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes left to consume.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Consume exactly `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::ShortBuffer {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Consume a `u64` length/count prefix, checked against usize.
    pub fn read_len(&mut self) -> Result<usize, DecodeError> {
        let raw = u64::decode(self)?;
        usize::try_from(raw).map_err(|_| DecodeError::LengthOverflow(raw))
    }
}

/// Append a value's wire bytes to a buffer. Encoding is infallible.
pub trait WireEncode {
    fn encode(&self, out: &mut Vec<u8>);
}

/// Reconstruct a value from a cursor, consuming exactly the bytes the
/// matching encode produced.
pub trait WireDecode: Sized {
    fn decode(cur: &mut WireCursor<'_>) -> Result<Self, DecodeError>;
}

macro_rules! impl_wire_scalar {
    ($($ty:ty),* $(,)?) => {$(
        impl WireEncode for $ty {
            fn encode(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }

        impl WireDecode for $ty {
            fn decode(cur: &mut WireCursor<'_>) -> Result<Self, DecodeError> {
                const N: usize = std::mem::size_of::<$ty>();
                let raw = cur.take(N)?;
                let mut bytes = [0u8; N];
                bytes.copy_from_slice(raw);
                Ok(<$ty>::from_le_bytes(bytes))
            }
        }
    )*};
}

impl_wire_scalar!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl WireEncode for bool {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }
}

impl WireDecode for bool {
    fn decode(cur: &mut WireCursor<'_>) -> Result<Self, DecodeError> {
        Ok(u8::decode(cur)? != 0)
    }
}

impl WireEncode for String {
    fn encode(&self, out: &mut Vec<u8>) {
        (self.len() as u64).encode(out);
        out.extend_from_slice(self.as_bytes());
    }
}

impl WireDecode for String {
    fn decode(cur: &mut WireCursor<'_>) -> Result<Self, DecodeError> {
        let len = cur.read_len()?;
        let raw = cur.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }
}

impl<T: WireEncode> WireEncode for Vec<T> {
    fn encode(&self, out: &mut Vec<u8>) {
        (self.len() as u64).encode(out);
        for item in self {
            item.encode(out);
        }
    }
}

impl<T: WireDecode> WireDecode for Vec<T> {
    fn decode(cur: &mut WireCursor<'_>) -> Result<Self, DecodeError> {
        let count = cur.read_len()?;
        // Every element occupies at least one byte, so a count beyond the
        // remaining bytes is corrupt; reject before allocating.
        if count > cur.remaining() {
            return Err(DecodeError::ShortBuffer {
                needed: count,
                remaining: cur.remaining(),
            });
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::decode(cur)?);
        }
        Ok(items)
    }
}

impl<K, V> WireEncode for HashMap<K, V>
where
    K: WireEncode,
    V: WireEncode,
{
    /// Pair order is whatever the map iterates in; decoders must not rely
    /// on it.
    fn encode(&self, out: &mut Vec<u8>) {
        (self.len() as u64).encode(out);
        for (key, value) in self {
            key.encode(out);
            value.encode(out);
        }
    }
}

impl<K, V> WireDecode for HashMap<K, V>
where
    K: WireDecode + Eq + Hash,
    V: WireDecode,
{
    fn decode(cur: &mut WireCursor<'_>) -> Result<Self, DecodeError> {
        let count = cur.read_len()?;
        if count > cur.remaining() {
            return Err(DecodeError::ShortBuffer {
                needed: count,
                remaining: cur.remaining(),
            });
        }
        let mut map = HashMap::with_capacity(count);
        for _ in 0..count {
            let key = K::decode(cur)?;
            let value = V::decode(cur)?;
            map.insert(key, value);
        }
        Ok(map)
    }
}
