//! Typed function descriptors and the stub table.
//!
//! Each callable function is described by a zero-sized type implementing
//! [`Function`]: its wire name, where it runs, and the Rust types of its
//! arguments and result. Typed call sites name the descriptor, so no string
//! lookup happens on the hot path. The [`StubTable`] keeps the same
//! information keyed by name for dynamic calls.
//!
//! Functions that yield a sequence of results implement [`StreamFunction`]
//! instead and are declared with [`stream_function!`](crate::stream_function).
//!
//! # Example
//!
//! ```
//! use callbridge::function::{Function, Locality};
//! use callbridge::codec::Schema;
//!
//! callbridge::function! {
//!     /// Adds two numbers on the server.
//!     pub remote fn add(a: i64, b: i64) -> i64 as Add;
//!     local fn greet(name: String) -> String as Greet;
//! }
//!
//! assert_eq!(Add::NAME, "add");
//! assert_eq!(Add::LOCALITY, Locality::Remote);
//! assert_eq!(Add::signature().args, vec![Schema::I64, Schema::I64]);
//! assert_eq!(Greet::LOCALITY, Locality::Local);
//! ```

use std::collections::HashMap;

use tracing::warn;

use crate::codec::{Schema, Value, Wire};
use crate::error::{BridgeError, Result};
use crate::record::RecordRegistry;

/// Where a function executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Locality {
    /// In this process, through the local invoker.
    Local,
    /// On the peer, over the connection.
    Remote,
}

/// Name, argument schemas, result schema and routing of one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: &'static str,
    pub args: Vec<Schema>,
    /// Schema of the result, or of each item for a streaming function.
    pub output: Schema,
    pub locality: Locality,
    pub streaming: bool,
}

/// An argument list: a tuple of [`Wire`] types.
pub trait WireArgs: Send + Sized + 'static {
    fn schemas() -> Vec<Schema>;

    fn into_values(self) -> Vec<Value>;

    fn from_values(values: Vec<Value>) -> Result<Self>;

    fn register(registry: &mut RecordRegistry);
}

macro_rules! wire_args {
    ($($ty:ident),*) => {
        impl<$($ty: Wire),*> WireArgs for ($($ty,)*) {
            fn schemas() -> Vec<Schema> {
                vec![$($ty::schema()),*]
            }

            #[allow(non_snake_case)]
            fn into_values(self) -> Vec<Value> {
                let ($($ty,)*) = self;
                vec![$($ty.into_value()),*]
            }

            #[allow(unused_mut)]
            fn from_values(values: Vec<Value>) -> Result<Self> {
                const ARITY: usize = <[&str]>::len(&[$(stringify!($ty)),*]);
                if values.len() != ARITY {
                    return Err(BridgeError::SchemaMismatch(format!(
                        "expected {} arguments, got {}",
                        ARITY,
                        values.len()
                    )));
                }
                let mut values = values.into_iter();
                Ok(($(
                    $ty::from_value(values.next().ok_or_else(|| {
                        BridgeError::SchemaMismatch("missing argument".to_string())
                    })?)?,
                )*))
            }

            #[allow(unused_variables)]
            fn register(registry: &mut RecordRegistry) {
                $($ty::register(registry);)*
            }
        }
    };
}

wire_args!();
wire_args!(A);
wire_args!(A, B);
wire_args!(A, B, C);
wire_args!(A, B, C, D);
wire_args!(A, B, C, D, E);
wire_args!(A, B, C, D, E, F);

/// Descriptor of one callable function.
pub trait Function: Send + Sync + 'static {
    /// Name on the wire.
    const NAME: &'static str;
    const LOCALITY: Locality;
    type Args: WireArgs;
    type Output: Wire;

    fn signature() -> Signature {
        Signature {
            name: Self::NAME,
            args: <Self::Args as WireArgs>::schemas(),
            output: <Self::Output as Wire>::schema(),
            locality: Self::LOCALITY,
            streaming: false,
        }
    }

    /// Register every record type used by the arguments or the result.
    fn register_records(registry: &mut RecordRegistry) {
        <Self::Args as WireArgs>::register(registry);
        <Self::Output as Wire>::register(registry);
    }
}

/// Descriptor of a function yielding a stream of `Item`s.
pub trait StreamFunction: Send + Sync + 'static {
    const NAME: &'static str;
    const LOCALITY: Locality;
    type Args: WireArgs;
    type Item: Wire;

    fn signature() -> Signature {
        Signature {
            name: Self::NAME,
            args: <Self::Args as WireArgs>::schemas(),
            output: <Self::Item as Wire>::schema(),
            locality: Self::LOCALITY,
            streaming: true,
        }
    }

    fn register_records(registry: &mut RecordRegistry) {
        <Self::Args as WireArgs>::register(registry);
        <Self::Item as Wire>::register(registry);
    }
}

/// Name -> signature for every function the bridge knows.
///
/// Filled while the bridge is built, read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct StubTable {
    stubs: HashMap<&'static str, Signature>,
}

impl StubTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a signature. A second signature under the same name replaces the
    /// first with a warning.
    pub fn insert(&mut self, signature: Signature) {
        if let Some(previous) = self.stubs.insert(signature.name, signature) {
            warn!(function = previous.name, "function declared twice, keeping the later one");
        }
    }

    pub fn insert_function<F: Function>(&mut self) {
        self.insert(F::signature());
    }

    pub fn insert_stream_function<F: StreamFunction>(&mut self) {
        self.insert(F::signature());
    }

    pub fn get(&self, name: &str) -> Option<&Signature> {
        self.stubs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stubs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Signature> {
        self.stubs.values()
    }
}

/// Declare function descriptors.
///
/// ```text
/// function! {
///     pub remote fn get_person(rowid: i64) -> Option<Person> as GetPerson;
///     local fn render(count: u32) -> String as Render;
/// }
/// ```
///
/// Each line produces a unit struct implementing [`Function`] plus an
/// inherent `call` method taking the arguments positionally.
#[macro_export]
macro_rules! function {
    (@locality remote) => { $crate::function::Locality::Remote };
    (@locality local) => { $crate::function::Locality::Local };

    ($(
        $(#[$meta:meta])*
        $vis:vis $locality:ident fn $fname:ident ( $($arg:ident : $ty:ty),* $(,)? ) -> $out:ty as $name:ident ;
    )*) => {$(
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        $vis struct $name;

        impl $crate::function::Function for $name {
            const NAME: &'static str = stringify!($fname);
            const LOCALITY: $crate::function::Locality = $crate::function!(@locality $locality);
            type Args = ($($ty,)*);
            type Output = $out;
        }

        impl $name {
            /// Call through `bridge`.
            #[allow(dead_code)]
            $vis fn call(bridge: &$crate::Bridge $(, $arg: $ty)*) -> $crate::Call<$out> {
                bridge.call::<Self>(($($arg,)*))
            }
        }
    )*};
}

/// Declare streaming function descriptors.
///
/// Same syntax as [`function!`](crate::function); the type after `->` is the
/// item type and `call` returns a [`CallStream`](crate::CallStream).
///
/// ```
/// use callbridge::function::StreamFunction;
///
/// callbridge::stream_function! {
///     pub remote fn tail(path: String, lines: u32) -> String as Tail;
/// }
///
/// assert_eq!(Tail::NAME, "tail");
/// assert!(Tail::signature().streaming);
/// ```
#[macro_export]
macro_rules! stream_function {
    ($(
        $(#[$meta:meta])*
        $vis:vis $locality:ident fn $fname:ident ( $($arg:ident : $ty:ty),* $(,)? ) -> $item:ty as $name:ident ;
    )*) => {$(
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        $vis struct $name;

        impl $crate::function::StreamFunction for $name {
            const NAME: &'static str = stringify!($fname);
            const LOCALITY: $crate::function::Locality = $crate::function!(@locality $locality);
            type Args = ($($ty,)*);
            type Item = $item;
        }

        impl $name {
            /// Open the stream through `bridge`.
            #[allow(dead_code)]
            $vis fn call(bridge: &$crate::Bridge $(, $arg: $ty)*) -> $crate::CallStream<$item> {
                bridge.stream::<Self>(($($arg,)*))
            }
        }
    )*};
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::function! {
        remote fn get_person(rowid: i64) -> Option<String> as GetPerson;
        local fn nothing() -> () as Nothing;
        pub remote fn many(a: i64, b: u64, c: bool, d: String, e: Option<i64>, f: Vec<u32>) -> u64 as Many;
    }

    crate::stream_function! {
        local fn ticks(every_ms: u64) -> u64 as Ticks;
    }

    #[test]
    fn test_descriptor_constants() {
        assert_eq!(GetPerson::NAME, "get_person");
        assert_eq!(GetPerson::LOCALITY, Locality::Remote);
        assert_eq!(Nothing::LOCALITY, Locality::Local);
    }

    #[test]
    fn test_signature() {
        let sig = GetPerson::signature();
        assert_eq!(sig.name, "get_person");
        assert_eq!(sig.args, vec![Schema::I64]);
        assert_eq!(sig.output, Schema::optional(Schema::Text));

        assert!(!sig.streaming);

        assert!(Nothing::signature().args.is_empty());
        assert_eq!(Many::signature().args.len(), 6);
    }

    #[test]
    fn test_stream_signature() {
        let sig = Ticks::signature();
        assert_eq!(sig.name, "ticks");
        assert_eq!(sig.locality, Locality::Local);
        assert_eq!(sig.args, vec![Schema::U64]);
        assert_eq!(sig.output, Schema::U64);
        assert!(sig.streaming);
    }

    #[test]
    fn test_args_values_round_trip() {
        let args = (3i64, 4u64, true, "x".to_string(), None::<i64>, vec![1u32]);
        let values = args.clone().into_values();
        assert_eq!(values.len(), 6);
        let back = <(i64, u64, bool, String, Option<i64>, Vec<u32>)>::from_values(values).unwrap();
        assert_eq!(back, args);
    }

    #[test]
    fn test_args_arity_mismatch() {
        let err = <(i64, i64)>::from_values(vec![Value::I64(1)]).unwrap_err();
        assert!(matches!(err, BridgeError::SchemaMismatch(_)));
    }

    #[test]
    fn test_stub_table() {
        let mut table = StubTable::new();
        table.insert_function::<GetPerson>();
        table.insert_function::<Nothing>();
        table.insert_stream_function::<Ticks>();

        assert_eq!(table.len(), 3);
        assert!(table.get("ticks").unwrap().streaming);
        assert_eq!(table.get("get_person").unwrap().locality, Locality::Remote);
        assert!(table.get("unknown").is_none());
    }
}
