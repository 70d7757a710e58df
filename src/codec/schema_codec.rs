//! Schema-driven MessagePack codec.
//!
//! Encoding validates the value against its schema first, so a mismatch never
//! produces bytes. Decoding is driven by the expected schema through serde
//! seeds; record tags are resolved through the frozen [`RecordRegistry`].

use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::{self, DeserializeSeed, IgnoredAny, SeqAccess, Visitor};
use serde::Deserializer;

use super::value::{RecordValue, Schema, Value, Wire};
use crate::error::{BridgeError, Result};
use crate::record::{RecordRegistry, RecordSchema};

/// Converts [`Value`]s to bytes and back under a [`Schema`].
///
/// Cheap to clone; the only state is the shared registry.
#[derive(Debug, Clone)]
pub struct Codec {
    registry: Arc<RecordRegistry>,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(Arc::new(RecordRegistry::new()))
    }
}

impl Codec {
    pub fn new(registry: Arc<RecordRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &RecordRegistry {
        &self.registry
    }

    /// Encode one value.
    ///
    /// # Errors
    ///
    /// `SchemaMismatch` if `value` does not have the shape of `schema`.
    pub fn encode(&self, value: &Value, schema: &Schema) -> Result<Bytes> {
        schema.check(value, &self.registry)?;
        Ok(Bytes::from(rmp_serde::to_vec(value)?))
    }

    /// Decode one value. The whole input must be consumed.
    pub fn decode(&self, bytes: &[u8], schema: &Schema) -> Result<Value> {
        self.decode_seed(
            bytes,
            SchemaSeed {
                schema,
                registry: &self.registry,
            },
        )
    }

    /// Encode an argument list as a single array, element `i` under `schemas[i]`.
    pub fn encode_args(&self, args: &[Value], schemas: &[Schema]) -> Result<Bytes> {
        if args.len() != schemas.len() {
            return Err(BridgeError::SchemaMismatch(format!(
                "expected {} arguments, got {}",
                schemas.len(),
                args.len()
            )));
        }
        for (i, (arg, schema)) in args.iter().zip(schemas).enumerate() {
            schema.check(arg, &self.registry).map_err(|e| match e {
                BridgeError::SchemaMismatch(detail) => {
                    BridgeError::SchemaMismatch(format!("argument {}: {}", i, detail))
                }
                other => other,
            })?;
        }
        Ok(Bytes::from(rmp_serde::to_vec(args)?))
    }

    /// Decode an argument array. Arity must match exactly.
    pub fn decode_args(&self, bytes: &[u8], schemas: &[Schema]) -> Result<Vec<Value>> {
        self.decode_seed(
            bytes,
            ArgsSeed {
                schemas,
                registry: &self.registry,
            },
        )
    }

    /// Encode a typed value under its own schema.
    pub fn encode_typed<T: Wire>(&self, value: T) -> Result<Bytes> {
        self.encode(&value.into_value(), &T::schema())
    }

    /// Decode a typed value under its own schema.
    pub fn decode_typed<T: Wire>(&self, bytes: &[u8]) -> Result<T> {
        T::from_value(self.decode(bytes, &T::schema())?)
    }

    fn decode_seed<S, T>(&self, bytes: &[u8], seed: S) -> Result<T>
    where
        S: for<'de> DeserializeSeed<'de, Value = T>,
    {
        let mut cursor = Cursor::new(bytes);
        let value = {
            let mut de = rmp_serde::Deserializer::new(&mut cursor);
            seed.deserialize(&mut de)?
        };
        let consumed = cursor.position() as usize;
        if consumed != bytes.len() {
            return Err(BridgeError::Decode(format!(
                "{} trailing bytes after value",
                bytes.len() - consumed
            )));
        }
        Ok(value)
    }
}

/// Decodes one value under a schema.
struct SchemaSeed<'a> {
    schema: &'a Schema,
    registry: &'a RecordRegistry,
}

impl<'de, 'a> DeserializeSeed<'de> for SchemaSeed<'a> {
    type Value = Value;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<Value, D::Error> {
        match self.schema {
            Schema::Optional(inner) => deserializer.deserialize_option(OptionalVisitor {
                inner,
                registry: self.registry,
            }),
            _ => deserializer.deserialize_any(ValueVisitor {
                schema: self.schema,
                registry: self.registry,
            }),
        }
    }
}

struct OptionalVisitor<'a> {
    inner: &'a Schema,
    registry: &'a RecordRegistry,
}

impl<'de, 'a> Visitor<'de> for OptionalVisitor<'a> {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "optional<{}>", self.inner)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Optional(None))
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Optional(None))
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<Value, D::Error> {
        let seed = SchemaSeed {
            schema: self.inner,
            registry: self.registry,
        };
        let inner = match self.inner {
            Schema::Optional(_) => deserializer.deserialize_seq(WrappedVisitor { seed })?,
            _ => seed.deserialize(deserializer)?,
        };
        Ok(Value::Optional(Some(Box::new(inner))))
    }
}

/// A present optional holding another optional: a one-element array.
struct WrappedVisitor<'a> {
    seed: SchemaSeed<'a>,
}

impl<'de, 'a> Visitor<'de> for WrappedVisitor<'a> {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a one-element array holding {}", self.seed.schema)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Value, A::Error> {
        let value = seq
            .next_element_seed(self.seed)?
            .ok_or_else(|| de::Error::custom("nested optional is missing its value"))?;
        if seq.next_element::<IgnoredAny>()?.is_some() {
            return Err(de::Error::custom("nested optional holds more than one value"));
        }
        Ok(value)
    }
}

/// Visitor for every non-optional schema.
struct ValueVisitor<'a> {
    schema: &'a Schema,
    registry: &'a RecordRegistry,
}

impl<'a> ValueVisitor<'a> {
    fn mismatch<E: de::Error>(&self, found: &str) -> E {
        E::custom(format!("expected {}, found {}", self.schema, found))
    }
}

impl<'de, 'a> Visitor<'de> for ValueVisitor<'a> {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.schema)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Value, E> {
        match self.schema {
            Schema::Bool => Ok(Value::Bool(v)),
            _ => Err(self.mismatch("bool")),
        }
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Value, E> {
        match self.schema {
            Schema::I64 => Ok(Value::I64(v)),
            Schema::U64 => u64::try_from(v)
                .map(Value::U64)
                .map_err(|_| E::custom(format!("{} is out of range for u64", v))),
            _ => Err(self.mismatch("integer")),
        }
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Value, E> {
        match self.schema {
            Schema::U64 => Ok(Value::U64(v)),
            Schema::I64 => i64::try_from(v)
                .map(Value::I64)
                .map_err(|_| E::custom(format!("{} is out of range for i64", v))),
            _ => Err(self.mismatch("integer")),
        }
    }

    fn visit_f64<E: de::Error>(self, _v: f64) -> std::result::Result<Value, E> {
        Err(self.mismatch("float"))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Value, E> {
        match self.schema {
            Schema::Text => Ok(Value::Text(v.to_owned())),
            _ => Err(self.mismatch("text")),
        }
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Value, E> {
        match self.schema {
            Schema::Text => Ok(Value::Text(v)),
            _ => Err(self.mismatch("text")),
        }
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Value, E> {
        match self.schema {
            Schema::Binary => Ok(Value::Binary(Bytes::copy_from_slice(v))),
            Schema::Text => Err(E::custom("text is not valid UTF-8")),
            _ => Err(self.mismatch("binary")),
        }
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> std::result::Result<Value, E> {
        match self.schema {
            Schema::Binary => Ok(Value::Binary(Bytes::from(v))),
            Schema::Text => Err(E::custom("text is not valid UTF-8")),
            _ => Err(self.mismatch("binary")),
        }
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Value, E> {
        Err(self.mismatch("nil"))
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Value, E> {
        Err(self.mismatch("nil"))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Value, A::Error> {
        match self.schema {
            Schema::Unit => {
                if seq.next_element::<IgnoredAny>()?.is_some() {
                    return Err(de::Error::custom("expected unit (empty array)"));
                }
                Ok(Value::Unit)
            }
            Schema::List(inner) => {
                let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(4096));
                while let Some(item) = seq.next_element_seed(SchemaSeed {
                    schema: inner,
                    registry: self.registry,
                })? {
                    items.push(item);
                }
                Ok(Value::List(items))
            }
            Schema::Record(expected) => {
                let tag: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::custom("record is missing its tag"))?;
                let schema = self.registry.get(&tag).ok_or_else(|| {
                    de::Error::custom(format!("unknown record tag `{}`", tag))
                })?;
                if schema.tag != *expected {
                    return Err(de::Error::custom(format!(
                        "expected record `{}`, found record `{}`",
                        expected, schema.tag
                    )));
                }
                let fields = seq
                    .next_element_seed(FieldsSeed {
                        schema,
                        registry: self.registry,
                    })?
                    .ok_or_else(|| {
                        de::Error::custom(format!("record `{}` is missing its fields", tag))
                    })?;
                while seq.next_element::<IgnoredAny>()?.is_some() {}
                Ok(Value::Record(RecordValue {
                    tag: schema.tag,
                    fields,
                }))
            }
            _ => Err(self.mismatch("array")),
        }
    }

    fn visit_map<A: de::MapAccess<'de>>(self, _map: A) -> std::result::Result<Value, A::Error> {
        Err(self.mismatch("map"))
    }
}

/// Decodes the field array of a record, applying the evolution rules:
/// extra trailing fields are skipped, missing trailing optional fields are
/// filled with `None`.
struct FieldsSeed<'a> {
    schema: &'a RecordSchema,
    registry: &'a RecordRegistry,
}

impl<'de, 'a> DeserializeSeed<'de> for FieldsSeed<'a> {
    type Value = Vec<Value>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<Vec<Value>, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, 'a> Visitor<'de> for FieldsSeed<'a> {
    type Value = Vec<Value>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fields of record `{}`", self.schema.tag)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Vec<Value>, A::Error> {
        let mut values = Vec::with_capacity(self.schema.fields.len());
        let mut exhausted = false;

        for field in &self.schema.fields {
            if !exhausted {
                let next = seq.next_element_seed(SchemaSeed {
                    schema: &field.schema,
                    registry: self.registry,
                })?;
                match next {
                    Some(value) => {
                        values.push(value);
                        continue;
                    }
                    None => exhausted = true,
                }
            }
            match field.schema {
                Schema::Optional(_) => values.push(Value::Optional(None)),
                _ => {
                    return Err(de::Error::custom(format!(
                        "record `{}` is missing field `{}`",
                        self.schema.tag, field.name
                    )))
                }
            }
        }

        if !exhausted {
            while seq.next_element::<IgnoredAny>()?.is_some() {}
        }
        Ok(values)
    }
}

/// Decodes an argument array with exact arity.
struct ArgsSeed<'a> {
    schemas: &'a [Schema],
    registry: &'a RecordRegistry,
}

impl<'de, 'a> DeserializeSeed<'de> for ArgsSeed<'a> {
    type Value = Vec<Value>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<Vec<Value>, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, 'a> Visitor<'de> for ArgsSeed<'a> {
    type Value = Vec<Value>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "an array of {} arguments", self.schemas.len())
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Vec<Value>, A::Error> {
        let mut args = Vec::with_capacity(self.schemas.len());
        for (i, schema) in self.schemas.iter().enumerate() {
            let arg = seq
                .next_element_seed(SchemaSeed {
                    schema,
                    registry: self.registry,
                })?
                .ok_or_else(|| {
                    de::Error::custom(format!(
                        "expected {} arguments, got {}",
                        self.schemas.len(),
                        i
                    ))
                })?;
            args.push(arg);
        }
        if seq.next_element::<IgnoredAny>()?.is_some() {
            return Err(de::Error::custom(format!(
                "expected {} arguments, got more",
                self.schemas.len()
            )));
        }
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Field;

    fn codec_with_people() -> Codec {
        let mut registry = RecordRegistry::new();
        registry.insert(RecordSchema {
            tag: "Person",
            fields: vec![
                Field::new("rowid", Schema::optional(Schema::I64)),
                Field::new("name", Schema::optional(Schema::Text)),
            ],
        });
        registry.insert(RecordSchema {
            tag: "Pet",
            fields: vec![Field::new("name", Schema::Text)],
        });
        Codec::new(Arc::new(registry))
    }

    fn person(rowid: Option<i64>, name: Option<&str>) -> Value {
        Value::Record(RecordValue {
            tag: "Person",
            fields: vec![
                Value::Optional(rowid.map(|r| Box::new(Value::I64(r)))),
                Value::Optional(name.map(|n| Box::new(Value::Text(n.into())))),
            ],
        })
    }

    #[test]
    fn test_integer_boundaries() {
        let codec = Codec::default();
        for n in [i64::MIN, -1, 0, 1, i64::MAX] {
            let bytes = codec.encode(&Value::I64(n), &Schema::I64).unwrap();
            assert_eq!(codec.decode(&bytes, &Schema::I64).unwrap(), Value::I64(n));
        }
        for n in [0, u64::from(u32::MAX), u64::MAX] {
            let bytes = codec.encode(&Value::U64(n), &Schema::U64).unwrap();
            assert_eq!(codec.decode(&bytes, &Schema::U64).unwrap(), Value::U64(n));
        }
    }

    #[test]
    fn test_u64_max_does_not_fit_i64() {
        let codec = Codec::default();
        let bytes = codec.encode(&Value::U64(u64::MAX), &Schema::U64).unwrap();
        let err = codec.decode(&bytes, &Schema::I64).unwrap_err();
        assert!(matches!(err, BridgeError::Decode(ref m) if m.contains("out of range")));
    }

    #[test]
    fn test_text_and_binary() {
        let codec = Codec::default();

        let text = Value::Text("héllo".into());
        let bytes = codec.encode(&text, &Schema::Text).unwrap();
        assert_eq!(codec.decode(&bytes, &Schema::Text).unwrap(), text);

        let bin = Value::Binary(Bytes::from_static(&[0, 1, 0xff]));
        let bytes = codec.encode(&bin, &Schema::Binary).unwrap();
        assert_eq!(bytes[0], 0xc4, "binary must use the msgpack bin family");
        assert_eq!(codec.decode(&bytes, &Schema::Binary).unwrap(), bin);
    }

    #[test]
    fn test_optional_unit_is_distinguishable() {
        let codec = Codec::default();
        let schema = Schema::optional(Schema::Unit);

        let some = Value::Optional(Some(Box::new(Value::Unit)));
        let none = Value::Optional(None);

        let some_bytes = codec.encode(&some, &schema).unwrap();
        let none_bytes = codec.encode(&none, &schema).unwrap();
        assert_ne!(some_bytes, none_bytes);
        assert_eq!(codec.decode(&some_bytes, &schema).unwrap(), some);
        assert_eq!(codec.decode(&none_bytes, &schema).unwrap(), none);
    }

    #[test]
    fn test_nested_optional_keeps_inner_none() {
        let codec = Codec::default();
        let schema = Schema::optional(Schema::optional(Schema::I64));

        let none = Value::Optional(None);
        let some_none = Value::Optional(Some(Box::new(Value::Optional(None))));
        let some_some = Value::Optional(Some(Box::new(Value::Optional(Some(Box::new(
            Value::I64(5),
        ))))));

        let encoded: Vec<_> = [&none, &some_none, &some_some]
            .iter()
            .map(|v| codec.encode(v, &schema).unwrap())
            .collect();
        assert_ne!(encoded[0], encoded[1]);
        assert_eq!(codec.decode(&encoded[0], &schema).unwrap(), none);
        assert_eq!(codec.decode(&encoded[1], &schema).unwrap(), some_none);
        assert_eq!(codec.decode(&encoded[2], &schema).unwrap(), some_some);
    }

    #[test]
    fn test_nested_optional_typed() {
        let codec = Codec::default();
        for value in [None, Some(None), Some(Some(-3i64))] {
            let bytes = codec.encode_typed(value).unwrap();
            assert_eq!(codec.decode_typed::<Option<Option<i64>>>(&bytes).unwrap(), value);
        }

        let triple: Option<Option<Option<String>>> = Some(Some(None));
        let bytes = codec.encode_typed(triple.clone()).unwrap();
        assert_eq!(codec.decode_typed::<Option<Option<Option<String>>>>(&bytes).unwrap(), triple);
    }

    #[test]
    fn test_nested_optional_rejects_bare_value() {
        let codec = Codec::default();
        let bytes = rmp_serde::to_vec(&5i64).unwrap();
        let schema = Schema::optional(Schema::optional(Schema::I64));
        assert!(matches!(codec.decode(&bytes, &schema), Err(BridgeError::Decode(_))));
    }

    #[test]
    fn test_record_round_trip() {
        let codec = codec_with_people();
        let schema = Schema::Record("Person");
        let bob = person(Some(7), Some("Bob"));

        let bytes = codec.encode(&bob, &schema).unwrap();
        assert_eq!(codec.decode(&bytes, &schema).unwrap(), bob);

        let empty = person(None, None);
        let bytes = codec.encode(&empty, &schema).unwrap();
        assert_eq!(codec.decode(&bytes, &schema).unwrap(), empty);
    }

    #[test]
    fn test_unknown_record_tag_names_tag() {
        let codec = codec_with_people();
        let bytes = rmp_serde::to_vec(&("Alien", ((),))).unwrap();
        let err = codec.decode(&bytes, &Schema::Record("Person")).unwrap_err();
        assert!(matches!(err, BridgeError::Decode(ref m) if m.contains("Alien")));
    }

    #[test]
    fn test_other_known_tag_is_decode_error() {
        let codec = codec_with_people();
        let pet = Value::Record(RecordValue {
            tag: "Pet",
            fields: vec![Value::Text("Rex".into())],
        });
        let bytes = codec.encode(&pet, &Schema::Record("Pet")).unwrap();
        let err = codec.decode(&bytes, &Schema::Record("Person")).unwrap_err();
        assert!(matches!(err, BridgeError::Decode(ref m) if m.contains("Pet") && m.contains("Person")));
    }

    #[test]
    fn test_missing_trailing_optional_field_is_none() {
        let codec = codec_with_people();
        let bytes = rmp_serde::to_vec(&("Person", (Some(3i64),))).unwrap();
        let decoded = codec.decode(&bytes, &Schema::Record("Person")).unwrap();
        assert_eq!(decoded, person(Some(3), None));
    }

    #[test]
    fn test_extra_trailing_field_ignored() {
        let codec = codec_with_people();
        let bytes = rmp_serde::to_vec(&("Person", (Some(3i64), Some("Ann"), true, "later"))).unwrap();
        let decoded = codec.decode(&bytes, &Schema::Record("Person")).unwrap();
        assert_eq!(decoded, person(Some(3), Some("Ann")));

        // Fields both sides know re-encode identically.
        let again = codec.encode(&decoded, &Schema::Record("Person")).unwrap();
        let expected = rmp_serde::to_vec(&("Person", (Some(3i64), Some("Ann")))).unwrap();
        assert_eq!(again.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_missing_required_field_fails() {
        let codec = codec_with_people();
        let bytes = rmp_serde::to_vec(&("Pet", Vec::<i64>::new())).unwrap();
        let err = codec.decode(&bytes, &Schema::Record("Pet")).unwrap_err();
        assert!(err.to_string().contains("missing field `name`"));
    }

    #[test]
    fn test_encode_mismatch_produces_no_bytes() {
        let codec = Codec::default();
        let err = codec.encode(&Value::Text("x".into()), &Schema::U64).unwrap_err();
        assert!(matches!(err, BridgeError::SchemaMismatch(_)));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let codec = Codec::default();
        let mut bytes = codec.encode(&Value::Bool(true), &Schema::Bool).unwrap().to_vec();
        bytes.push(0xc0);
        let err = codec.decode(&bytes, &Schema::Bool).unwrap_err();
        assert!(err.to_string().contains("trailing"));
    }

    #[test]
    fn test_args_arity() {
        let codec = Codec::default();
        let schemas = [Schema::I64, Schema::Text];
        let args = [Value::I64(1), Value::Text("a".into())];

        let bytes = codec.encode_args(&args, &schemas).unwrap();
        assert_eq!(codec.decode_args(&bytes, &schemas).unwrap(), args.to_vec());

        assert!(codec.encode_args(&args[..1], &schemas).is_err());
        assert!(codec.decode_args(&bytes, &schemas[..1]).is_err());
        assert!(codec.decode_args(&bytes, &[Schema::I64, Schema::Text, Schema::Bool]).is_err());
    }

    #[test]
    fn test_typed_helpers() {
        let codec = Codec::default();
        let bytes = codec.encode_typed(vec![Some(1u32), None]).unwrap();
        let back: Vec<Option<u32>> = codec.decode_typed(&bytes).unwrap();
        assert_eq!(back, vec![Some(1), None]);
    }
}
