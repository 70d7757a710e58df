//! MsgPack codec for serde types using `rmp-serde`.
//!
//! Structs are written with `to_vec_named`, so they travel as maps keyed by
//! field name. Error descriptors use this form so a peer can read `kind` and
//! `message` without knowing the field order.
//!
//! # Example
//!
//! ```
//! use callbridge::codec::MsgPackCodec;
//! use callbridge::ErrorDescriptor;
//!
//! let desc = ErrorDescriptor::remote("disk full");
//! let encoded = MsgPackCodec::encode(&desc).unwrap();
//! let decoded: ErrorDescriptor = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, desc);
//! ```

use crate::error::Result;

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes, structs as maps.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
