//! Function registry for dispatching calls by name.
//!
//! Each entry pairs a [`Handler`] or a [`StreamHandler`] with the function's
//! [`Signature`]. Handlers take encoded arguments and return an encoded
//! result (or a stream of them) or an [`ErrorDescriptor`]; decoding and
//! encoding happen inside the handler so the callers (local invoker, server)
//! only move bytes.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::codec::{Codec, Wire};
use crate::error::{ErrorDescriptor, ErrorKind};
use crate::function::{Function, Signature, StreamFunction, WireArgs};

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of executing one call: encoded return value or failure.
pub type Outcome = std::result::Result<Bytes, ErrorDescriptor>;

/// Items of a streaming call, each encoded or failed.
pub type ItemStream = BoxStream<'static, Outcome>;

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    /// Run the function on encoded arguments.
    fn call(&self, codec: &Codec, args: &[u8]) -> BoxFuture<'static, Outcome>;
}

/// Wrapper that decodes arguments before calling the closure and encodes
/// its result afterwards.
///
/// Closure errors only need `Display`; they reach the caller as
/// `ErrorKind::Remote` with the rendered message.
pub struct TypedHandler<F, H, Fut, E> {
    handler: H,
    _phantom: PhantomData<fn(F) -> (Fut, E)>,
}

impl<F, H, Fut, E> TypedHandler<F, H, Fut, E>
where
    F: Function,
    H: Fn(F::Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<F::Output, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, H, Fut, E> Handler for TypedHandler<F, H, Fut, E>
where
    F: Function,
    H: Fn(F::Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<F::Output, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    fn call(&self, codec: &Codec, args: &[u8]) -> BoxFuture<'static, Outcome> {
        let parsed = codec
            .decode_args(args, &<F::Args as WireArgs>::schemas())
            .and_then(<F::Args as WireArgs>::from_values);
        let parsed = match parsed {
            Ok(v) => v,
            Err(e) => {
                debug!(function = F::NAME, error = %e, "rejecting undecodable arguments");
                return Box::pin(std::future::ready(Err(ErrorDescriptor::from_error(&e))));
            }
        };

        let fut = (self.handler)(parsed);
        let codec = codec.clone();
        Box::pin(async move {
            match fut.await {
                Ok(output) => codec
                    .encode(&output.into_value(), &<F::Output as Wire>::schema())
                    .map_err(|e| ErrorDescriptor::from_error(&e)),
                Err(e) => Err(ErrorDescriptor::remote(e.to_string())),
            }
        })
    }
}

/// Trait for streaming handler functions.
pub trait StreamHandler: Send + Sync + 'static {
    /// Decode the arguments and start the stream.
    fn open(&self, codec: &Codec, args: &[u8]) -> std::result::Result<ItemStream, ErrorDescriptor>;
}

/// Streaming counterpart of [`TypedHandler`].
///
/// A failed item reaches the caller as `ErrorKind::Remote` and the stream
/// goes on.
pub struct TypedStreamHandler<F, H, S, E> {
    handler: H,
    _phantom: PhantomData<fn(F) -> (S, E)>,
}

impl<F, H, S, E> TypedStreamHandler<F, H, S, E>
where
    F: StreamFunction,
    H: Fn(F::Args) -> S + Send + Sync + 'static,
    S: Stream<Item = std::result::Result<F::Item, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, H, S, E> StreamHandler for TypedStreamHandler<F, H, S, E>
where
    F: StreamFunction,
    H: Fn(F::Args) -> S + Send + Sync + 'static,
    S: Stream<Item = std::result::Result<F::Item, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    fn open(&self, codec: &Codec, args: &[u8]) -> std::result::Result<ItemStream, ErrorDescriptor> {
        let parsed = codec
            .decode_args(args, &<F::Args as WireArgs>::schemas())
            .and_then(<F::Args as WireArgs>::from_values)
            .map_err(|e| {
                debug!(function = F::NAME, error = %e, "rejecting undecodable arguments");
                ErrorDescriptor::from_error(&e)
            })?;

        let codec = codec.clone();
        let items = (self.handler)(parsed).map(move |item| match item {
            Ok(item) => codec
                .encode(&item.into_value(), &<F::Item as Wire>::schema())
                .map_err(|e| ErrorDescriptor::from_error(&e)),
            Err(e) => Err(ErrorDescriptor::remote(e.to_string())),
        });
        Ok(items.boxed())
    }
}

enum Callable {
    Unary(Box<dyn Handler>),
    Stream(Box<dyn StreamHandler>),
}

/// Entry for a registered function.
struct FunctionEntry {
    callable: Callable,
    signature: Signature,
}

/// Registry mapping function names to handlers.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<&'static str, FunctionEntry>,
}

impl FunctionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the implementation of `F`.
    ///
    /// Registering the same name twice replaces the first handler.
    pub fn register<F, H, Fut, E>(&mut self, handler: H)
    where
        F: Function,
        H: Fn(F::Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<F::Output, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.insert(F::signature(), Box::new(TypedHandler::<F, H, Fut, E>::new(handler)));
    }

    /// Register the implementation of the streaming function `F`.
    pub fn register_stream<F, H, S, E>(&mut self, handler: H)
    where
        F: StreamFunction,
        H: Fn(F::Args) -> S + Send + Sync + 'static,
        S: Stream<Item = std::result::Result<F::Item, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let handler = TypedStreamHandler::<F, H, S, E>::new(handler);
        self.add(F::signature(), Callable::Stream(Box::new(handler)));
    }

    /// Register an already boxed handler under `signature.name`.
    pub fn insert(&mut self, signature: Signature, handler: Box<dyn Handler>) {
        self.add(signature, Callable::Unary(handler));
    }

    fn add(&mut self, signature: Signature, callable: Callable) {
        let name = signature.name;
        if self
            .functions
            .insert(name, FunctionEntry { callable, signature })
            .is_some()
        {
            warn!(function = name, "handler registered twice, keeping the later one");
        }
    }

    /// Get a unary handler by function name.
    pub fn get(&self, name: &str) -> Option<&dyn Handler> {
        match self.functions.get(name).map(|e| &e.callable) {
            Some(Callable::Unary(handler)) => Some(handler.as_ref()),
            _ => None,
        }
    }

    /// The registered `'static` name equal to `name`, if any.
    pub fn resolve(&self, name: &str) -> Option<&'static str> {
        self.functions.get_key_value(name).map(|(name, _)| *name)
    }

    /// Get the signature of a registered function.
    pub fn signature(&self, name: &str) -> Option<&Signature> {
        self.functions.get(name).map(|e| &e.signature)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Names of all registered functions.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.functions.keys().copied()
    }

    /// Dispatch a call to the handler registered under `name`.
    ///
    /// An unknown name resolves to an `UnknownFunction` descriptor, a
    /// streaming function to a `SchemaMismatch` one.
    pub fn dispatch(&self, codec: &Codec, name: &str, args: &[u8]) -> BoxFuture<'static, Outcome> {
        let failed = |desc| -> BoxFuture<'static, Outcome> { Box::pin(std::future::ready(Err(desc))) };
        match self.functions.get(name).map(|e| &e.callable) {
            Some(Callable::Unary(handler)) => handler.call(codec, args),
            Some(Callable::Stream(_)) => failed(ErrorDescriptor::new(
                ErrorKind::SchemaMismatch,
                format!("`{}` is a streaming function", name),
            )),
            None => failed(ErrorDescriptor::new(ErrorKind::UnknownFunction, name)),
        }
    }

    /// Start the streaming function registered under `name`.
    pub fn open_stream(
        &self,
        codec: &Codec,
        name: &str,
        args: &[u8],
    ) -> std::result::Result<ItemStream, ErrorDescriptor> {
        match self.functions.get(name).map(|e| &e.callable) {
            Some(Callable::Stream(handler)) => handler.open(codec, args),
            Some(Callable::Unary(_)) => Err(ErrorDescriptor::new(
                ErrorKind::SchemaMismatch,
                format!("`{}` is not a streaming function", name),
            )),
            None => Err(ErrorDescriptor::new(ErrorKind::UnknownFunction, name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::codec::Schema;
    use crate::error::BridgeError;

    crate::function! {
        remote fn echo(text: String) -> String as Echo;
        remote fn divide(a: i64, b: i64) -> i64 as Divide;
    }

    crate::stream_function! {
        remote fn countdown(from: u64) -> u64 as Countdown;
    }

    fn registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        registry.register::<Echo, _, _, std::convert::Infallible>(|(text,)| async move { Ok(text) });
        registry.register::<Divide, _, _, String>(|(a, b)| async move {
            if b == 0 {
                Err("division by zero".to_string())
            } else {
                Ok(a / b)
            }
        });
        registry.register_stream::<Countdown, _, _, String>(|(from,)| {
            futures::stream::iter((0..=from).rev().map(|n| {
                if n == 1 {
                    Err("skipped one".to_string())
                } else {
                    Ok(n)
                }
            }))
        });
        registry
    }

    #[test]
    fn test_register_function() {
        let registry = registry();

        assert!(registry.get("echo").is_some());
        assert_eq!(registry.signature("divide").unwrap().args.len(), 2);
        assert_eq!(registry.len(), 3);
        assert!(registry.get("nonexistent").is_none());
        assert!(registry.get("countdown").is_none());
        assert_eq!(registry.resolve("countdown"), Some("countdown"));
        assert!(registry.signature("countdown").unwrap().streaming);
    }

    #[tokio::test]
    async fn test_open_stream_items_and_errors() {
        let registry = registry();
        let codec = Codec::default();
        let args = codec.encode_args(&[Value::U64(2)], &[Schema::U64]).unwrap();

        let items: Vec<_> = registry
            .open_stream(&codec, "countdown", &args)
            .unwrap()
            .collect()
            .await;

        assert_eq!(items.len(), 3);
        let first = items[0].as_ref().unwrap();
        assert_eq!(codec.decode_typed::<u64>(first).unwrap(), 2);
        assert_eq!(items[1], Err(ErrorDescriptor::remote("skipped one")));
        let last = items[2].as_ref().unwrap();
        assert_eq!(codec.decode_typed::<u64>(last).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stream_and_unary_kinds_do_not_mix() {
        let registry = registry();
        let codec = Codec::default();
        let args = codec.encode_args(&[Value::U64(1)], &[Schema::U64]).unwrap();

        let desc = registry.dispatch(&codec, "countdown", &args).await.unwrap_err();
        assert_eq!(desc.kind, ErrorKind::SchemaMismatch);

        let desc = registry.open_stream(&codec, "echo", &args).err().unwrap();
        assert_eq!(desc.kind, ErrorKind::SchemaMismatch);

        let desc = registry.open_stream(&codec, "missing", &args).err().unwrap();
        assert_eq!(desc.kind, ErrorKind::UnknownFunction);

        let bad = codec.encode_args(&[Value::Text("x".into())], &[Schema::Text]).unwrap();
        let desc = registry.open_stream(&codec, "countdown", &bad).err().unwrap();
        assert_eq!(desc.kind, ErrorKind::Decode);
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let registry = registry();
        let codec = Codec::default();
        let args = codec
            .encode_args(&[Value::I64(9), Value::I64(3)], &[Schema::I64, Schema::I64])
            .unwrap();

        let out = registry.dispatch(&codec, "divide", &args).await.unwrap();
        assert_eq!(codec.decode(&out, &Schema::I64).unwrap(), Value::I64(3));
    }

    #[tokio::test]
    async fn test_dispatch_handler_error_is_remote() {
        let registry = registry();
        let codec = Codec::default();
        let args = codec
            .encode_args(&[Value::I64(1), Value::I64(0)], &[Schema::I64, Schema::I64])
            .unwrap();

        let desc = registry.dispatch(&codec, "divide", &args).await.unwrap_err();
        assert_eq!(desc, ErrorDescriptor::remote("division by zero"));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_function() {
        let registry = registry();
        let codec = Codec::default();

        let desc = registry.dispatch(&codec, "missing", &[0x90]).await.unwrap_err();
        assert!(matches!(desc.into_error(), BridgeError::UnknownFunction(n) if n == "missing"));
    }

    #[tokio::test]
    async fn test_dispatch_bad_arguments() {
        let registry = registry();
        let codec = Codec::default();
        let args = codec
            .encode_args(&[Value::Bool(true)], &[Schema::Bool])
            .unwrap();

        let desc = registry.dispatch(&codec, "echo", &args).await.unwrap_err();
        assert_eq!(desc.kind, ErrorKind::Decode);
    }
}
