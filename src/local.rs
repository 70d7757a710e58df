//! In-process execution of local functions.
//!
//! Local calls travel through the same codec as remote ones: arguments are
//! encoded by the dispatcher, decoded here, and the result is encoded again
//! before the caller decodes it. A function can therefore move between the
//! two sides without any difference in what the caller observes.
//!
//! Handlers run with a [`CallContext`] of origin [`Origin::Local`].

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tracing::debug;

use crate::codec::Codec;
use crate::correlation::CallId;
use crate::error::ErrorDescriptor;
use crate::handler::{BoxFuture, CallContext, FunctionRegistry, ItemStream, Origin, Outcome};

/// Runs registered functions in this process.
#[derive(Clone)]
pub struct LocalInvoker {
    functions: Arc<FunctionRegistry>,
    codec: Codec,
}

impl LocalInvoker {
    pub fn new(functions: Arc<FunctionRegistry>, codec: Codec) -> Self {
        Self { functions, codec }
    }

    /// Whether a local implementation of `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains(name)
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Run `name` on encoded arguments.
    ///
    /// `call_id` only tags log lines; local calls never enter the
    /// connection's correlation table.
    pub fn invoke(&self, call_id: CallId, name: &str, args: Bytes) -> BoxFuture<'static, Outcome> {
        debug!(call_id, function = name, "invoking locally");
        let Some(function) = self.functions.resolve(name) else {
            return self.functions.dispatch(&self.codec, name, &args);
        };
        let ctx = CallContext::new(call_id, function, Origin::Local);
        let fut = ctx
            .clone()
            .sync_scope(|| self.functions.dispatch(&self.codec, function, &args));
        Box::pin(ctx.scope(fut))
    }

    /// Start the streaming function `name` on encoded arguments.
    pub fn open_stream(
        &self,
        call_id: CallId,
        name: &str,
        args: Bytes,
    ) -> std::result::Result<ItemStream, ErrorDescriptor> {
        debug!(call_id, function = name, "opening local stream");
        let Some(function) = self.functions.resolve(name) else {
            return self.functions.open_stream(&self.codec, name, &args);
        };
        let ctx = CallContext::new(call_id, function, Origin::Local);
        let items = ctx
            .clone()
            .sync_scope(|| self.functions.open_stream(&self.codec, function, &args))?;
        Ok(ctx.scope_stream(items).boxed())
    }
}
