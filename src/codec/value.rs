//! Dynamic values and their schemas.
//!
//! [`Value`] is what the codec reads and writes. [`Schema`] describes the
//! shape a value must have. Rust types take part through [`Wire`], which maps
//! a type to its schema and converts to and from [`Value`].

use std::fmt;

use bytes::Bytes;
use serde::ser::{SerializeSeq, SerializeTuple};
use serde::{Serialize, Serializer};

use crate::error::{BridgeError, Result};
use crate::record::RecordRegistry;

/// Declared shape of an encoded value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Schema {
    Unit,
    Bool,
    /// Signed 64-bit integer.
    I64,
    /// Unsigned 64-bit integer.
    U64,
    /// UTF-8 text.
    Text,
    /// Opaque binary payload.
    Binary,
    Optional(Box<Schema>),
    List(Box<Schema>),
    /// A record type identified by its registry tag.
    Record(&'static str),
}

impl Schema {
    pub fn optional(inner: Schema) -> Self {
        Schema::Optional(Box::new(inner))
    }

    pub fn list(inner: Schema) -> Self {
        Schema::List(Box::new(inner))
    }

    /// Check that `value` has this shape.
    ///
    /// Record fields are checked against the schema held by `registry`.
    pub fn check(&self, value: &Value, registry: &RecordRegistry) -> Result<()> {
        match (self, value) {
            (Schema::Unit, Value::Unit)
            | (Schema::Bool, Value::Bool(_))
            | (Schema::I64, Value::I64(_))
            | (Schema::U64, Value::U64(_))
            | (Schema::Text, Value::Text(_))
            | (Schema::Binary, Value::Binary(_)) => Ok(()),
            (Schema::Optional(_), Value::Optional(None)) => Ok(()),
            (Schema::Optional(inner), Value::Optional(Some(v))) => inner.check(v, registry),
            (Schema::List(inner), Value::List(items)) => {
                items.iter().try_for_each(|item| inner.check(item, registry))
            }
            (Schema::Record(tag), Value::Record(record)) => {
                if record.tag != *tag {
                    return Err(BridgeError::SchemaMismatch(format!(
                        "expected record `{}`, found record `{}`",
                        tag, record.tag
                    )));
                }
                let schema = registry.get(tag).ok_or_else(|| {
                    BridgeError::SchemaMismatch(format!("record `{}` is not registered", tag))
                })?;
                if schema.fields.len() != record.fields.len() {
                    return Err(BridgeError::SchemaMismatch(format!(
                        "record `{}` has {} fields, value has {}",
                        tag,
                        schema.fields.len(),
                        record.fields.len()
                    )));
                }
                for (field, value) in schema.fields.iter().zip(&record.fields) {
                    field.schema.check(value, registry).map_err(|e| match e {
                        BridgeError::SchemaMismatch(detail) => BridgeError::SchemaMismatch(
                            format!("{}.{}: {}", tag, field.name, detail),
                        ),
                        other => other,
                    })?;
                }
                Ok(())
            }
            (schema, value) => Err(BridgeError::SchemaMismatch(format!(
                "expected {}, found {}",
                schema,
                value.kind()
            ))),
        }
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schema::Unit => f.write_str("unit"),
            Schema::Bool => f.write_str("bool"),
            Schema::I64 => f.write_str("i64"),
            Schema::U64 => f.write_str("u64"),
            Schema::Text => f.write_str("text"),
            Schema::Binary => f.write_str("binary"),
            Schema::Optional(inner) => write!(f, "optional<{}>", inner),
            Schema::List(inner) => write!(f, "list<{}>", inner),
            Schema::Record(tag) => write!(f, "record `{}`", tag),
        }
    }
}

/// A record instance: registry tag plus fields in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordValue {
    pub tag: &'static str,
    pub fields: Vec<Value>,
}

/// A decoded (or to-be-encoded) value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unit,
    Bool(bool),
    I64(i64),
    U64(u64),
    Text(String),
    Binary(Bytes),
    Optional(Option<Box<Value>>),
    List(Vec<Value>),
    Record(RecordValue),
}

impl Value {
    /// Short name of the value's shape, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::I64(_) => "i64",
            Value::U64(_) => "u64",
            Value::Text(_) => "text",
            Value::Binary(_) => "binary",
            Value::Optional(_) => "optional",
            Value::List(_) => "list",
            Value::Record(_) => "record",
        }
    }
}

// Wire layout. Unit is an empty array so that `Optional(Unit)` stays
// distinguishable from `None`; a present optional whose value is itself
// optional is wrapped in a one-element array for the same reason; records
// are `[tag, [fields...]]`.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Unit => serializer.serialize_tuple(0)?.end(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::I64(n) => serializer.serialize_i64(*n),
            Value::U64(n) => serializer.serialize_u64(*n),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Binary(b) => serde_bytes::Bytes::new(b).serialize(serializer),
            Value::Optional(None) => serializer.serialize_none(),
            Value::Optional(Some(v)) => match v.as_ref() {
                nested @ Value::Optional(_) => {
                    let mut tuple = serializer.serialize_tuple(1)?;
                    tuple.serialize_element(nested)?;
                    tuple.end()
                }
                other => serializer.serialize_some(other),
            },
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Record(record) => {
                let mut tuple = serializer.serialize_tuple(2)?;
                tuple.serialize_element(record.tag)?;
                tuple.serialize_element(&record.fields)?;
                tuple.end()
            }
        }
    }
}

/// Conversion out of a decoded [`Value`].
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

/// A Rust type with a fixed wire schema.
pub trait Wire: FromValue + Send + 'static {
    /// Schema every value of this type encodes under.
    fn schema() -> Schema;

    fn into_value(self) -> Value;

    /// Register any record types this type refers to.
    fn register(_registry: &mut RecordRegistry) {}
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

fn unexpected<T>(expected: Schema, found: &Value) -> Result<T> {
    Err(BridgeError::SchemaMismatch(format!(
        "expected {}, found {}",
        expected,
        found.kind()
    )))
}

impl FromValue for () {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Unit => Ok(()),
            other => unexpected(Schema::Unit, &other),
        }
    }
}

impl Wire for () {
    fn schema() -> Schema {
        Schema::Unit
    }

    fn into_value(self) -> Value {
        Value::Unit
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(b),
            other => unexpected(Schema::Bool, &other),
        }
    }
}

impl Wire for bool {
    fn schema() -> Schema {
        Schema::Bool
    }

    fn into_value(self) -> Value {
        Value::Bool(self)
    }
}

macro_rules! wire_int {
    ($($ty:ty => $schema:ident / $variant:ident / $wide:ty),* $(,)?) => {$(
        impl FromValue for $ty {
            fn from_value(value: Value) -> Result<Self> {
                match value {
                    Value::$variant(n) => <$ty>::try_from(n).map_err(|_| {
                        BridgeError::Decode(format!(
                            "{} does not fit in {}",
                            n,
                            stringify!($ty)
                        ))
                    }),
                    other => unexpected(Schema::$schema, &other),
                }
            }
        }

        impl Wire for $ty {
            fn schema() -> Schema {
                Schema::$schema
            }

            fn into_value(self) -> Value {
                Value::$variant(<$wide>::from(self))
            }
        }
    )*};
}

wire_int! {
    i64 => I64 / I64 / i64,
    i32 => I64 / I64 / i64,
    i16 => I64 / I64 / i64,
    u64 => U64 / U64 / u64,
    u32 => U64 / U64 / u64,
    u16 => U64 / U64 / u64,
    u8 => U64 / U64 / u64,
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s),
            other => unexpected(Schema::Text, &other),
        }
    }
}

impl Wire for String {
    fn schema() -> Schema {
        Schema::Text
    }

    fn into_value(self) -> Value {
        Value::Text(self)
    }
}

impl FromValue for Bytes {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Binary(b) => Ok(b),
            other => unexpected(Schema::Binary, &other),
        }
    }
}

impl Wire for Bytes {
    fn schema() -> Schema {
        Schema::Binary
    }

    fn into_value(self) -> Value {
        Value::Binary(self)
    }
}

impl<T: Wire> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Optional(None) => Ok(None),
            Value::Optional(Some(inner)) => T::from_value(*inner).map(Some),
            other => unexpected(Self::schema(), &other),
        }
    }
}

impl<T: Wire> Wire for Option<T> {
    fn schema() -> Schema {
        Schema::optional(T::schema())
    }

    fn into_value(self) -> Value {
        Value::Optional(self.map(|v| Box::new(v.into_value())))
    }

    fn register(registry: &mut RecordRegistry) {
        T::register(registry);
    }
}

impl<T: Wire> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::List(items) => items.into_iter().map(T::from_value).collect(),
            other => unexpected(Self::schema(), &other),
        }
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn schema() -> Schema {
        Schema::list(T::schema())
    }

    fn into_value(self) -> Value {
        Value::List(self.into_iter().map(Wire::into_value).collect())
    }

    fn register(registry: &mut RecordRegistry) {
        T::register(registry);
    }
}
