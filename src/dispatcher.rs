//! Call dispatcher: the public entry point of the bridge.
//!
//! [`Bridge::call`] is what generated stubs invoke. It encodes the arguments,
//! allocates a correlation id and routes the call either to the
//! [`LocalInvoker`] or through the [`ConnectionManager`]. The returned
//! [`Call`] resolves exactly once, with the decoded result or a
//! [`BridgeError`].
//!
//! [`Bridge::stream`] does the same for streaming functions and returns a
//! [`CallStream`] of decoded items. Dropping the stream cancels the call.
//!
//! # Example
//!
//! ```
//! use callbridge::{Bridge, BridgeError};
//!
//! callbridge::function! {
//!     pub local fn add(a: i64, b: i64) -> i64 as Add;
//!     pub remote fn ping() -> () as Ping;
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> callbridge::Result<()> {
//! let bridge = Bridge::builder()
//!     .local::<Add, _, _, std::convert::Infallible>(|(a, b)| async move { Ok(a + b) })
//!     .function::<Ping>()
//!     .build()?;
//!
//! assert_eq!(Add::call(&bridge, 2, 3).await?, 5);
//!
//! // Queuing is off by default, so a remote call needs an open connection.
//! assert!(matches!(Ping::call(&bridge).await, Err(BridgeError::NotConnected)));
//! # Ok(())
//! # }
//! ```

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::codec::{Codec, Schema, Value};
use crate::config::{BridgeConfig, QueueConfig, ReconnectPolicy};
use crate::connection::{ConnectionManager, ConnectionState, OutboundRequest};
use crate::correlation::{CallId, CorrelationTable, ItemReceiver, PendingGuard};
use crate::error::{BridgeError, ErrorDescriptor, Result};
use crate::function::{Function, Locality, StreamFunction, StubTable, WireArgs};
use crate::handler::{BoxFuture, FunctionRegistry, ItemStream};
use crate::local::LocalInvoker;
use crate::record::{Record, RecordRegistry};
use crate::transport::{Connector, Endpoint, SocketConnector};

/// Future returned by every call. Resolves exactly once.
///
/// Dropping it before completion abandons the call and frees its pending
/// entry; a late response is then logged and discarded.
#[must_use = "calls do nothing observable unless awaited"]
pub struct Call<T> {
    id: Option<CallId>,
    inner: BoxFuture<'static, Result<T>>,
}

impl<T: Send + 'static> Call<T> {
    fn new(id: CallId, fut: impl Future<Output = Result<T>> + Send + 'static) -> Self {
        Self {
            id: Some(id),
            inner: Box::pin(fut),
        }
    }

    /// A call that failed before anything was sent.
    fn failed(err: BridgeError) -> Self {
        Self {
            id: None,
            inner: Box::pin(std::future::ready(Err(err))),
        }
    }
}

impl<T> Call<T> {
    /// Correlation id, or `None` if the call failed before one was allocated
    /// or submitted.
    pub fn id(&self) -> Option<CallId> {
        self.id
    }
}

impl<T> Future for Call<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

type ItemDecoder<T> = Box<dyn Fn(&Codec, &[u8]) -> Result<T> + Send + Sync>;

enum Source {
    Remote {
        items: ItemReceiver,
        connection: ConnectionManager,
        id: CallId,
    },
    Local(ItemStream),
    Failed(Option<BridgeError>),
}

/// Items of a streaming call.
///
/// Yields each decoded item; a failed item does not end the stream. The
/// stream ends when the function finishes, and after a terminal error such
/// as `ConnectionLost`. Dropping it early cancels the call on whichever side
/// runs it.
#[must_use = "streams do nothing unless polled"]
pub struct CallStream<T> {
    id: Option<CallId>,
    source: Source,
    codec: Codec,
    decode: ItemDecoder<T>,
}

impl<T: 'static> CallStream<T> {
    /// A stream that yields `err` and ends.
    fn failed(codec: Codec, err: BridgeError) -> Self {
        Self {
            id: None,
            source: Source::Failed(Some(err)),
            codec,
            decode: Box::new(|_, _| Err(BridgeError::Decode("stream was never opened".to_string()))),
        }
    }

    /// Correlation id, or `None` if the call failed before one was allocated.
    pub fn id(&self) -> Option<CallId> {
        self.id
    }
}

impl<T> Stream for CallStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<T>>> {
        let this = self.get_mut();
        let next = match &mut this.source {
            Source::Remote { items, .. } => ready!(items.poll_recv(cx)),
            Source::Local(items) => {
                ready!(items.poll_next_unpin(cx)).map(|item| item.map_err(ErrorDescriptor::into_error))
            }
            Source::Failed(err) => return Poll::Ready(err.take().map(Err)),
        };
        Poll::Ready(next.map(|item| item.and_then(|bytes| (this.decode)(&this.codec, &bytes))))
    }
}

impl<T> Drop for CallStream<T> {
    fn drop(&mut self) {
        if let Source::Remote { connection, id, .. } = &self.source {
            connection.cancel_stream(*id);
        }
    }
}

struct Inner {
    codec: Codec,
    stubs: StubTable,
    local: LocalInvoker,
    connection: ConnectionManager,
    table: Arc<CorrelationTable>,
}

/// Handle to a bridge. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

impl Bridge {
    pub fn builder() -> BridgeBuilder {
        BridgeBuilder::new()
    }

    /// Call `F` with typed arguments.
    pub fn call<F: Function>(&self, args: F::Args) -> Call<F::Output> {
        let codec = &self.inner.codec;
        let payload = match codec.encode_args(&args.into_values(), &<F::Args as WireArgs>::schemas()) {
            Ok(payload) => payload,
            Err(e) => return Call::failed(e),
        };
        self.route(F::NAME, F::LOCALITY, payload, |codec, bytes| {
            codec.decode_typed::<F::Output>(bytes)
        })
    }

    /// Call a function by name with dynamic values.
    ///
    /// The name is resolved through the stub table, which also supplies the
    /// argument and result schemas.
    pub fn invoke(&self, name: &str, args: Vec<Value>) -> Call<Value> {
        let signature = match self.inner.stubs.get(name) {
            Some(signature) => signature,
            None => return Call::failed(BridgeError::UnknownFunction(name.to_string())),
        };
        if signature.streaming {
            return Call::failed(BridgeError::SchemaMismatch(format!(
                "`{}` is a streaming function",
                name
            )));
        }
        let payload = match self.inner.codec.encode_args(&args, &signature.args) {
            Ok(payload) => payload,
            Err(e) => return Call::failed(e),
        };
        let output: Schema = signature.output.clone();
        self.route(signature.name, signature.locality, payload, move |codec, bytes| {
            codec.decode(bytes, &output)
        })
    }

    fn route<T, D>(
        &self,
        name: &'static str,
        locality: Locality,
        payload: bytes::Bytes,
        decode: D,
    ) -> Call<T>
    where
        T: Send + 'static,
        D: FnOnce(&Codec, &[u8]) -> Result<T> + Send + 'static,
    {
        let inner = &self.inner;
        let id = inner.table.allocate();
        let codec = inner.codec.clone();

        match locality {
            Locality::Local => {
                let fut = inner.local.invoke(id, name, payload);
                Call::new(id, async move {
                    let bytes = fut.await.map_err(ErrorDescriptor::into_error)?;
                    decode(&codec, &bytes)
                })
            }
            Locality::Remote => {
                let request = OutboundRequest {
                    id,
                    name,
                    payload,
                    stream: false,
                };
                let rx = match inner.connection.submit(request) {
                    Ok(rx) => rx,
                    Err(e) => {
                        debug!(call_id = id, function = name, error = %e, "call rejected");
                        return Call::failed(e);
                    }
                };
                let guard = PendingGuard::new(inner.table.clone(), id);
                Call::new(id, async move {
                    let _guard = guard;
                    let bytes = rx.await.map_err(|_| {
                        BridgeError::ConnectionLost("bridge was dropped".to_string())
                    })??;
                    decode(&codec, &bytes)
                })
            }
        }
    }

    /// Open a stream from `F` with typed arguments.
    pub fn stream<F: StreamFunction>(&self, args: F::Args) -> CallStream<F::Item> {
        let codec = &self.inner.codec;
        match codec.encode_args(&args.into_values(), &<F::Args as WireArgs>::schemas()) {
            Ok(payload) => self.open_stream(
                F::NAME,
                F::LOCALITY,
                payload,
                Box::new(|codec, bytes| codec.decode_typed::<F::Item>(bytes)),
            ),
            Err(e) => CallStream::failed(codec.clone(), e),
        }
    }

    /// Open a stream by function name with dynamic values.
    pub fn invoke_stream(&self, name: &str, args: Vec<Value>) -> CallStream<Value> {
        let codec = self.inner.codec.clone();
        let signature = match self.inner.stubs.get(name) {
            Some(signature) => signature,
            None => return CallStream::failed(codec, BridgeError::UnknownFunction(name.to_string())),
        };
        if !signature.streaming {
            let err = BridgeError::SchemaMismatch(format!("`{}` is not a streaming function", name));
            return CallStream::failed(codec, err);
        }
        let payload = match codec.encode_args(&args, &signature.args) {
            Ok(payload) => payload,
            Err(e) => return CallStream::failed(codec, e),
        };
        let output = signature.output.clone();
        self.open_stream(
            signature.name,
            signature.locality,
            payload,
            Box::new(move |codec, bytes| codec.decode(bytes, &output)),
        )
    }

    fn open_stream<T: 'static>(
        &self,
        name: &'static str,
        locality: Locality,
        payload: bytes::Bytes,
        decode: ItemDecoder<T>,
    ) -> CallStream<T> {
        let inner = &self.inner;
        let codec = inner.codec.clone();
        let id = inner.table.allocate();

        let source = match locality {
            Locality::Local => match inner.local.open_stream(id, name, payload) {
                Ok(items) => Source::Local(items),
                Err(desc) => Source::Failed(Some(desc.into_error())),
            },
            Locality::Remote => {
                let request = OutboundRequest {
                    id,
                    name,
                    payload,
                    stream: true,
                };
                match inner.connection.submit_stream(request) {
                    Ok(items) => Source::Remote {
                        items,
                        connection: inner.connection.clone(),
                        id,
                    },
                    Err(e) => {
                        debug!(call_id = id, function = name, error = %e, "stream rejected");
                        return CallStream::failed(codec, e);
                    }
                }
            }
        };

        CallStream {
            id: Some(id),
            source,
            codec,
            decode,
        }
    }

    /// Open the connection. See [`ConnectionManager::connect`].
    pub async fn connect(&self) -> Result<()> {
        self.inner.connection.connect().await
    }

    /// Close the connection; in-flight calls fail with `ConnectionLost`.
    pub fn disconnect(&self) {
        self.inner.connection.disconnect()
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.inner.connection.reconnect().await
    }

    /// Point the bridge at another endpoint.
    ///
    /// # Errors
    ///
    /// `InvalidEndpoint` for an unparsable URL, `EndpointLocked` while a
    /// connection is open or opening.
    pub fn set_endpoint(&self, url: &str) -> Result<()> {
        self.inner.connection.set_endpoint(Endpoint::parse(url)?)
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner.connection.endpoint()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Watch connection state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }

    /// Remote calls waiting for a response or a connection.
    pub fn pending_calls(&self) -> usize {
        self.inner.table.len()
    }

    /// Calls waiting in the disconnected queue.
    pub fn queued_calls(&self) -> usize {
        self.inner.connection.queued()
    }

    /// Correlation ids handed out so far, local and remote.
    pub fn calls_issued(&self) -> u64 {
        self.inner.table.allocated()
    }

    pub fn stubs(&self) -> &StubTable {
        &self.inner.stubs
    }

    pub fn codec(&self) -> &Codec {
        &self.inner.codec
    }
}

/// Builder for [`Bridge`].
///
/// Every function the bridge will call must be declared here, either with
/// [`function`](Self::function) or, when it runs in this process, with
/// [`local`](Self::local). Declaring a function also registers the record
/// types it uses.
pub struct BridgeBuilder {
    config: BridgeConfig,
    connector: Option<Arc<dyn Connector>>,
    endpoint_error: Option<BridgeError>,
    records: RecordRegistry,
    stubs: StubTable,
    functions: FunctionRegistry,
}

impl BridgeBuilder {
    pub fn new() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    /// Start from an existing configuration, e.g. [`BridgeConfig::from_env`].
    pub fn with_config(config: BridgeConfig) -> Self {
        Self {
            config,
            connector: None,
            endpoint_error: None,
            records: RecordRegistry::new(),
            stubs: StubTable::new(),
            functions: FunctionRegistry::new(),
        }
    }

    /// Remote endpoint URL: `tcp://host:port`, `host:port` or `unix:///path`.
    ///
    /// An unparsable URL is reported by [`build`](Self::build).
    pub fn endpoint(mut self, url: &str) -> Self {
        match Endpoint::parse(url) {
            Ok(endpoint) => self.config.endpoint = Some(endpoint),
            Err(e) => self.endpoint_error = Some(e),
        }
        self
    }

    /// Queue calls made while disconnected.
    ///
    /// Default: disabled
    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.config.queue = queue;
        self
    }

    /// Reconnect automatically after a lost connection.
    ///
    /// Default: disabled
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    /// Default: 5 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Largest request payload sent and response payload accepted.
    ///
    /// Default: 64 MiB
    pub fn max_payload(mut self, limit: u32) -> Self {
        self.config.max_payload = limit;
        self
    }

    /// Use a custom connector instead of TCP / Unix sockets.
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Register a record type that no declared function mentions.
    pub fn record<R: Record>(mut self) -> Self {
        self.records.register::<R>();
        self
    }

    /// Declare `F`.
    pub fn function<F: Function>(mut self) -> Self {
        F::register_records(&mut self.records);
        self.stubs.insert_function::<F>();
        self
    }

    /// Declare `F` and provide its in-process implementation.
    pub fn local<F, H, Fut, E>(mut self, handler: H) -> Self
    where
        F: Function,
        H: Fn(F::Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<F::Output, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        if F::LOCALITY == Locality::Remote {
            warn!(function = F::NAME, "implementation registered for a remote function");
        }
        self = self.function::<F>();
        self.functions.register::<F, H, Fut, E>(handler);
        self
    }

    /// Declare the streaming function `F`.
    pub fn stream_function<F: StreamFunction>(mut self) -> Self {
        F::register_records(&mut self.records);
        self.stubs.insert_stream_function::<F>();
        self
    }

    /// Declare `F` and provide its in-process implementation.
    pub fn local_stream<F, H, S, E>(mut self, handler: H) -> Self
    where
        F: StreamFunction,
        H: Fn(F::Args) -> S + Send + Sync + 'static,
        S: Stream<Item = std::result::Result<F::Item, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        if F::LOCALITY == Locality::Remote {
            warn!(function = F::NAME, "implementation registered for a remote function");
        }
        self = self.stream_function::<F>();
        self.functions.register_stream::<F, H, S, E>(handler);
        self
    }

    /// Freeze the registries and build the bridge. Does not connect.
    ///
    /// # Errors
    ///
    /// `InvalidEndpoint` for a bad [`endpoint`](Self::endpoint) URL,
    /// `RecordConflict` when two record types share a tag.
    pub fn build(self) -> Result<Bridge> {
        if let Some(e) = self.endpoint_error {
            return Err(e);
        }
        self.records.verify()?;

        for signature in self.stubs.iter() {
            if signature.locality == Locality::Local && !self.functions.contains(signature.name) {
                warn!(function = signature.name, "local function has no implementation");
            }
        }

        let codec = Codec::new(Arc::new(self.records));
        let table = Arc::new(CorrelationTable::new());
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(SocketConnector::new(self.config.connect_timeout)));
        let connection = ConnectionManager::new(&self.config, connector, table.clone());
        let local = LocalInvoker::new(Arc::new(self.functions), codec.clone());

        Ok(Bridge {
            inner: Arc::new(Inner {
                codec,
                stubs: self.stubs,
                local,
                connection,
                table,
            }),
        })
    }
}

impl Default for BridgeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
