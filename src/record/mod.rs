//! Structural record serializer.
//!
//! Records are plain structs whose fields encode in declaration order with
//! no field names, tags or version markers on the wire; both sides must
//! agree on the field list. The [`wire_record!`] macro generates the
//! [`Record`] implementation plus the field-level codec impls, so records
//! nest inside other records, vectors and maps.
//!
//! ```ignore
//! wire_record! {
//!     #[derive(Debug, Clone, PartialEq)]
//!     pub struct ChatMessage {
//!         pub sender: String,
//!         pub body: String,
//!         pub sent_at: u64,
//!     }
//! }
//!
//! let bytes = msg.to_bytes();
//! let back = ChatMessage::from_bytes(&bytes)?;
//! ```

mod wire;

pub use wire::{WireCursor, WireDecode, WireEncode};

/// A struct with a flat, field-ordered wire form.
///
/// `decode_fields` fills fields in place and stops at the first failure;
/// there is no rollback, so a partially decoded record must be discarded.
pub trait Record: Default {
    /// Append every field's wire bytes in declaration order.
    fn encode_fields(&self, out: &mut Vec<u8>);

    /// Fill every field from the cursor in declaration order.
    fn decode_fields(&mut self, cur: &mut WireCursor<'_>) -> Result<(), crate::error::DecodeError>;

    /// Encode to a standalone buffer, ready to go out as a packet payload.
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_fields(&mut out);
        out
    }

    /// Decode a buffer produced by [`to_bytes`](Self::to_bytes).
    fn from_bytes(data: &[u8]) -> Result<Self, crate::error::DecodeError> {
        let mut value = Self::default();
        let mut cur = WireCursor::new(data);
        value.decode_fields(&mut cur)?;
        Ok(value)
    }
}

/// Define a record struct and derive its wire codec.
///
/// The macro adds `#[derive(Default)]`; other derives go in the attribute
/// list as usual. As a field of another record, a record encodes as a
/// `u64` little-endian length prefix followed by its field bytes.
#[macro_export]
macro_rules! wire_record {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $(#[$fmeta:meta])* $fvis:vis $field:ident : $ftype:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Default)]
        $vis struct $name {
            $( $(#[$fmeta])* $fvis $field: $ftype, )*
        }

        impl $crate::record::Record for $name {
            fn encode_fields(&self, out: &mut ::std::vec::Vec<u8>) {
                $( $crate::record::WireEncode::encode(&self.$field, out); )*
            }

            fn decode_fields(
                &mut self,
                cur: &mut $crate::record::WireCursor<'_>,
            ) -> ::std::result::Result<(), $crate::error::DecodeError> {
                $( self.$field = $crate::record::WireDecode::decode(cur)?; )*
                Ok(())
            }
        }

        impl $crate::record::WireEncode for $name {
            fn encode(&self, out: &mut ::std::vec::Vec<u8>) {
                let mut body = ::std::vec::Vec::new();
                $crate::record::Record::encode_fields(self, &mut body);
                $crate::record::WireEncode::encode(&(body.len() as u64), out);
                out.extend_from_slice(&body);
            }
        }

        impl $crate::record::WireDecode for $name {
            fn decode(
                cur: &mut $crate::record::WireCursor<'_>,
            ) -> ::std::result::Result<Self, $crate::error::DecodeError> {
                let len = cur.read_len()?;
                let body = cur.take(len)?;
                let mut sub = $crate::record::WireCursor::new(body);
                let mut value = <Self as ::std::default::Default>::default();
                $crate::record::Record::decode_fields(&mut value, &mut sub)?;
                Ok(value)
            }
        }
    };
}
