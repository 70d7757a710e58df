//! Handler module - executing registered functions.
//!
//! Provides:
//! - [`FunctionRegistry`] - maps function names to handlers
//! - [`TypedHandler`] - decodes arguments, runs a typed closure, encodes the result
//! - [`TypedStreamHandler`] - the same for functions yielding a stream of results
//! - [`CallContext`] - which call is running, and for whom
//!
//! The registry is shared by the local invoker and the server, so a function
//! produces the same bytes and the same failure shapes on both paths.
//!
//! # Example
//!
//! ```
//! use callbridge::codec::Codec;
//! use callbridge::handler::FunctionRegistry;
//!
//! callbridge::function! {
//!     remote fn double(n: i64) -> i64 as Double;
//! }
//!
//! let mut registry = FunctionRegistry::new();
//! registry.register::<Double, _, _, std::convert::Infallible>(|(n,)| async move { Ok(n * 2) });
//!
//! assert!(registry.contains("double"));
//! ```

mod context;
mod registry;

pub use context::{CallContext, Origin, ScopedStream};
pub use registry::{
    BoxFuture, FunctionRegistry, Handler, ItemStream, Outcome, StreamHandler, TypedHandler,
    TypedStreamHandler,
};
