//! Record registry.
//!
//! Maps a record tag to its ordered field schema. The registry is filled while
//! the bridge is built and then frozen behind an `Arc`, so the codec can read
//! it from any task without locking.
//!
//! Records are normally declared with [`record!`](crate::record!), which
//! generates the struct together with its [`Record`] and
//! [`Wire`](crate::codec::Wire) impls:
//!
//! ```
//! use callbridge::record;
//! use callbridge::record::RecordRegistry;
//!
//! record! {
//!     #[derive(Debug, Clone, PartialEq)]
//!     pub struct Person {
//!         pub rowid: Option<i64>,
//!         pub name: Option<String>,
//!     }
//! }
//!
//! let mut registry = RecordRegistry::new();
//! registry.register::<Person>();
//! assert_eq!(registry.get("Person").unwrap().fields.len(), 2);
//! ```
//!
//! The tag defaults to the struct name. Types from different modules that
//! share a name need an explicit tag, `pub struct Person as "crm.Person"`;
//! two distinct types under one tag make the builders fail with
//! `RecordConflict`.

use std::any::TypeId;
use std::collections::HashMap;

use tracing::warn;

use crate::codec::{Schema, Value, Wire};
use crate::error::{BridgeError, Result};

/// One named, typed record field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub schema: Schema,
}

impl Field {
    pub fn new(name: &'static str, schema: Schema) -> Self {
        Self { name, schema }
    }
}

/// Ordered field list of one record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    pub tag: &'static str,
    pub fields: Vec<Field>,
}

/// A Rust type that encodes as a record.
pub trait Record: Sized + Send + 'static {
    /// Wire tag. Unique per registry.
    const TAG: &'static str;

    /// Fields in declaration order.
    fn fields() -> Vec<Field>;

    /// Register the records referenced by this record's fields.
    fn register_fields(registry: &mut RecordRegistry);

    fn into_fields(self) -> Vec<Value>;

    fn from_fields(fields: Vec<Value>) -> Result<Self>;
}

/// Record tag -> field schema.
#[derive(Debug, Default)]
pub struct RecordRegistry {
    records: HashMap<&'static str, RecordSchema>,
    owners: HashMap<&'static str, TypeId>,
    conflicts: Vec<&'static str>,
}

impl RecordRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `R` and, recursively, every record its fields refer to.
    ///
    /// A different type already registered under `R::TAG` is recorded as a
    /// conflict, reported by [`verify`](Self::verify).
    pub fn register<R: Record>(&mut self) {
        let type_id = TypeId::of::<R>();
        match self.owners.get(R::TAG) {
            Some(owner) if *owner == type_id => return,
            Some(_) => {
                warn!(tag = R::TAG, "two record types share one tag");
                self.conflict(R::TAG);
                return;
            }
            None => {
                self.owners.insert(R::TAG, type_id);
            }
        }

        let fresh = self.insert(RecordSchema {
            tag: R::TAG,
            fields: R::fields(),
        });
        // Skipping known tags also stops self-referencing records.
        if fresh {
            R::register_fields(self);
        }
    }

    /// Insert a schema. Returns `false` when the tag was already present.
    ///
    /// A conflicting schema for an existing tag is not inserted; it is
    /// recorded as a conflict and the first registration stays in place.
    pub fn insert(&mut self, schema: RecordSchema) -> bool {
        match self.records.get(schema.tag) {
            Some(existing) => {
                if *existing != schema {
                    warn!(tag = schema.tag, "conflicting record schema");
                    self.conflict(schema.tag);
                }
                false
            }
            None => {
                self.records.insert(schema.tag, schema);
                true
            }
        }
    }

    fn conflict(&mut self, tag: &'static str) {
        if !self.conflicts.contains(&tag) {
            self.conflicts.push(tag);
        }
    }

    /// Tags claimed by more than one definition.
    pub fn conflicts(&self) -> &[&'static str] {
        &self.conflicts
    }

    /// # Errors
    ///
    /// `RecordConflict` naming the first tag with two definitions.
    pub fn verify(&self) -> Result<()> {
        match self.conflicts.first() {
            Some(tag) => Err(BridgeError::RecordConflict(tag.to_string())),
            None => Ok(()),
        }
    }

    pub fn get(&self, tag: &str) -> Option<&RecordSchema> {
        self.records.get(tag)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.records.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Registered tags, in no particular order.
    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.records.keys().copied()
    }
}

/// Pull the next field out of a decoded record. Used by [`record!`](crate::record!).
#[doc(hidden)]
pub fn next_field<T: Wire>(
    fields: &mut impl Iterator<Item = Value>,
    tag: &'static str,
    name: &'static str,
) -> Result<T> {
    let value = fields.next().ok_or_else(|| {
        BridgeError::SchemaMismatch(format!("record `{}` is missing field `{}`", tag, name))
    })?;
    T::from_value(value).map_err(|e| match e {
        BridgeError::SchemaMismatch(detail) => {
            BridgeError::SchemaMismatch(format!("{}.{}: {}", tag, name, detail))
        }
        other => other,
    })
}

/// Convert a decoded value into record `R`. Used by [`record!`](crate::record!).
#[doc(hidden)]
pub fn from_record_value<R: Record>(value: Value) -> Result<R> {
    match value {
        Value::Record(record) if record.tag == R::TAG => R::from_fields(record.fields),
        Value::Record(record) => Err(BridgeError::SchemaMismatch(format!(
            "expected record `{}`, found record `{}`",
            R::TAG,
            record.tag
        ))),
        other => Err(BridgeError::SchemaMismatch(format!(
            "expected record `{}`, found {}",
            R::TAG,
            other.kind()
        ))),
    }
}

/// Declare a record struct.
///
/// The tag is the struct name unless given after `as`, and fields encode in
/// declaration order. Every field type must implement
/// [`Wire`](crate::codec::Wire).
///
/// ```text
/// record! {
///     pub struct Person as "crm.Person" {
///         pub name: String,
///     }
/// }
/// ```
#[macro_export]
macro_rules! record {
    (
        @define [$tag:expr]
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$fmeta:meta])*
                $fvis:vis $field:ident : $ty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $(
                $(#[$fmeta])*
                $fvis $field: $ty,
            )*
        }

        impl $crate::record::Record for $name {
            const TAG: &'static str = $tag;

            fn fields() -> ::std::vec::Vec<$crate::record::Field> {
                ::std::vec![
                    $($crate::record::Field::new(
                        stringify!($field),
                        <$ty as $crate::codec::Wire>::schema(),
                    )),*
                ]
            }

            #[allow(unused_variables)]
            fn register_fields(registry: &mut $crate::record::RecordRegistry) {
                $(<$ty as $crate::codec::Wire>::register(registry);)*
            }

            fn into_fields(self) -> ::std::vec::Vec<$crate::codec::Value> {
                ::std::vec![$($crate::codec::Wire::into_value(self.$field)),*]
            }

            #[allow(unused_mut, unused_variables)]
            fn from_fields(
                fields: ::std::vec::Vec<$crate::codec::Value>,
            ) -> $crate::Result<Self> {
                let mut fields = fields.into_iter();
                Ok(Self {
                    $($field: $crate::record::next_field(
                        &mut fields,
                        <Self as $crate::record::Record>::TAG,
                        stringify!($field),
                    )?,)*
                })
            }
        }

        impl $crate::codec::FromValue for $name {
            fn from_value(value: $crate::codec::Value) -> $crate::Result<Self> {
                $crate::record::from_record_value(value)
            }
        }

        impl $crate::codec::Wire for $name {
            fn schema() -> $crate::codec::Schema {
                $crate::codec::Schema::Record(<Self as $crate::record::Record>::TAG)
            }

            fn into_value(self) -> $crate::codec::Value {
                $crate::codec::Value::Record($crate::codec::RecordValue {
                    tag: <Self as $crate::record::Record>::TAG,
                    fields: $crate::record::Record::into_fields(self),
                })
            }

            fn register(registry: &mut $crate::record::RecordRegistry) {
                registry.register::<Self>();
            }
        }
    };

    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident as $tag:literal {
            $($body:tt)*
        }
    ) => {
        $crate::record! {
            @define [$tag]
            $(#[$meta])*
            $vis struct $name { $($body)* }
        }
    };

    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $($body:tt)*
        }
    ) => {
        $crate::record! {
            @define [stringify!($name)]
            $(#[$meta])*
            $vis struct $name { $($body)* }
        }
    };
}
