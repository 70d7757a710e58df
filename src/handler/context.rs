//! Per-call context visible to function implementations.
//!
//! Handlers keep their plain typed signatures; whatever runs inside one can
//! ask [`CallContext::current`] which call it is serving and, for calls that
//! arrived over a socket, where the caller is.
//!
//! # Example
//!
//! ```
//! use callbridge::handler::CallContext;
//! use callbridge::Server;
//!
//! callbridge::function! {
//!     pub remote fn whoami() -> String as WhoAmI;
//! }
//!
//! let server = Server::builder()
//!     .function::<WhoAmI, _, _, std::convert::Infallible>(|()| async move {
//!         let peer = CallContext::current().and_then(|ctx| ctx.remote_addr());
//!         Ok(peer.map(|addr| addr.to_string()).unwrap_or_default())
//!     })
//!     .build();
//! assert!(server.is_ok());
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};

use crate::correlation::CallId;

tokio::task_local! {
    static CURRENT: CallContext;
}

/// Where a call came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Run in this process by the local invoker.
    Local,
    /// Received over a connection. The address is known for TCP peers.
    Remote(Option<SocketAddr>),
}

/// Identity of the call being executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    call_id: CallId,
    function: &'static str,
    origin: Origin,
}

impl CallContext {
    pub fn new(call_id: CallId, function: &'static str, origin: Origin) -> Self {
        Self {
            call_id,
            function,
            origin,
        }
    }

    /// Context of the call running in the current task, if any.
    pub fn current() -> Option<CallContext> {
        CURRENT.try_with(|ctx| ctx.clone()).ok()
    }

    /// Correlation id. Ids of remote calls are the caller's.
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn function(&self) -> &'static str {
        self.function
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Socket address of the calling peer; `None` for local calls and
    /// Unix socket peers.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        match self.origin {
            Origin::Remote(addr) => addr,
            Origin::Local => None,
        }
    }

    pub fn is_local(&self) -> bool {
        self.origin == Origin::Local
    }

    /// Run `fut` with this context current.
    pub fn scope<F: Future>(self, fut: F) -> impl Future<Output = F::Output> {
        CURRENT.scope(self, fut)
    }

    /// Run `start` with this context current, e.g. to create a handler
    /// future whose synchronous part already needs the context.
    pub fn sync_scope<R>(self, start: impl FnOnce() -> R) -> R {
        CURRENT.sync_scope(self, start)
    }

    /// Poll `stream` with this context current.
    pub fn scope_stream<S>(self, stream: S) -> ScopedStream<S>
    where
        S: Stream + Unpin,
    {
        ScopedStream { ctx: self, stream }
    }
}

/// A stream whose every poll runs inside a [`CallContext`].
pub struct ScopedStream<S> {
    ctx: CallContext,
    stream: S,
}

impl<S> Stream for ScopedStream<S>
where
    S: Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<S::Item>> {
        let this = self.get_mut();
        let stream = &mut this.stream;
        CURRENT.sync_scope(this.ctx.clone(), || stream.poll_next_unpin(cx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn test_current_inside_scope_only() {
        assert!(CallContext::current().is_none());

        let addr: SocketAddr = "10.0.0.7:4100".parse().unwrap();
        let ctx = CallContext::new(9, "lookup", Origin::Remote(Some(addr)));
        let seen = ctx
            .clone()
            .scope(async { CallContext::current() })
            .await
            .unwrap();

        assert_eq!(seen, ctx);
        assert_eq!(seen.remote_addr(), Some(addr));
        assert!(!seen.is_local());
        assert!(CallContext::current().is_none());
    }

    #[test]
    fn test_sync_scope_and_local_origin() {
        let ctx = CallContext::new(1, "render", Origin::Local);
        let (id, local, addr) = ctx.sync_scope(|| {
            let current = CallContext::current().unwrap();
            (current.call_id(), current.is_local(), current.remote_addr())
        });
        assert_eq!((id, local, addr), (1, true, None));
    }

    #[tokio::test]
    async fn test_scoped_stream_sees_context() {
        let ctx = CallContext::new(4, "count", Origin::Local);
        let items = stream::iter(0..3).map(|n| (n, CallContext::current().map(|c| c.call_id())));

        let collected: Vec<_> = ctx.scope_stream(Box::pin(items)).collect().await;
        assert_eq!(collected, vec![(0, Some(4)), (1, Some(4)), (2, Some(4))]);
    }
}
