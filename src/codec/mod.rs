//! Codec module - typed values to transport-neutral bytes.
//!
//! - [`Codec`] - schema-driven MessagePack for call arguments and results
//! - [`MsgPackCodec`] - serde MessagePack (struct-as-map) for error descriptors
//! - [`Value`], [`Schema`], [`Wire`] - the dynamic value model
//!
//! # Example
//!
//! ```
//! use callbridge::codec::{Codec, Schema, Value};
//!
//! let codec = Codec::default();
//! let bytes = codec.encode(&Value::I64(i64::MIN), &Schema::I64).unwrap();
//! assert_eq!(codec.decode(&bytes, &Schema::I64).unwrap(), Value::I64(i64::MIN));
//! ```

mod msgpack;
mod schema_codec;
mod value;

pub use msgpack::MsgPackCodec;
pub use schema_codec::Codec;
pub use value::{FromValue, RecordValue, Schema, Value, Wire};
