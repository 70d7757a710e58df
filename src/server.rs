//! Serving side of the bridge.
//!
//! The [`ServerBuilder`] registers function implementations. The [`Server`]
//! reads request frames from a connection, runs each call in its own task
//! and writes correlated responses through the dedicated writer task:
//! 1. Read frames from the connection
//! 2. Wait for a call slot (`max_concurrent_calls`)
//! 3. Decode arguments and run the handler inside its [`CallContext`]
//! 4. Write a response or an error response carrying an [`ErrorDescriptor`]
//!
//! Streaming calls write one item frame per yielded value and a final empty
//! response. They do not take a call slot, and a cancel frame from the
//! peer stops them without a final frame.
//!
//! Requests over the payload limit and results that would exceed it are
//! answered with a `Decode` error for that call only.
//!
//! # Example
//!
//! ```no_run
//! use callbridge::Server;
//!
//! callbridge::function! {
//!     pub remote fn add(a: i64, b: i64) -> i64 as Add;
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> callbridge::Result<()> {
//! let server = Server::builder()
//!     .function::<Add, _, _, std::convert::Infallible>(|(a, b)| async move { Ok(a + b) })
//!     .build()?;
//!
//! let running = server.bind("127.0.0.1:7000").await?;
//! println!("listening on {}", running.endpoint());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::codec::{Codec, MsgPackCodec};
use crate::correlation::CallId;
use crate::error::{ErrorDescriptor, ErrorKind, Result};
use crate::function::{Function, StreamFunction};
use crate::handler::{CallContext, FunctionRegistry, Origin, Outcome};
use crate::protocol::{check_frame_size, Frame, FrameBuffer, Header, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::record::{Record, RecordRegistry};
use crate::transport::{Endpoint, Listener};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Default maximum concurrent calls per connection.
pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 256;

/// Read buffer size per connection.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Builder for configuring and creating a [`Server`].
pub struct ServerBuilder {
    records: RecordRegistry,
    functions: FunctionRegistry,
    writer_config: WriterConfig,
    max_concurrent_calls: usize,
    max_payload: u32,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            records: RecordRegistry::new(),
            functions: FunctionRegistry::new(),
            writer_config: WriterConfig::default(),
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
            max_payload: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    /// Register the implementation of `F` together with its record types.
    pub fn function<F, H, Fut, E>(mut self, handler: H) -> Self
    where
        F: Function,
        H: Fn(F::Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<F::Output, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        F::register_records(&mut self.records);
        self.functions.register::<F, H, Fut, E>(handler);
        self
    }

    /// Register the implementation of the streaming function `F`.
    pub fn stream_function<F, H, S, E>(mut self, handler: H) -> Self
    where
        F: StreamFunction,
        H: Fn(F::Args) -> S + Send + Sync + 'static,
        S: Stream<Item = std::result::Result<F::Item, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        F::register_records(&mut self.records);
        self.functions.register_stream::<F, H, S, E>(handler);
        self
    }

    /// Register a record type no function mentions.
    pub fn record<R: Record>(mut self) -> Self {
        self.records.register::<R>();
        self
    }

    /// Set the maximum number of unary calls running at once on one
    /// connection.
    ///
    /// Further requests wait for a free slot, in arrival order.
    /// Default: 256
    pub fn max_concurrent_calls(mut self, limit: usize) -> Self {
        self.max_concurrent_calls = limit.max(1);
        self
    }

    /// Set the maximum pending frames for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.writer_config.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.writer_config.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.writer_config.backpressure_timeout = timeout;
        self
    }

    /// Largest accepted request payload, and largest result sent back.
    ///
    /// Default: 64 MiB
    pub fn max_payload(mut self, limit: u32) -> Self {
        self.max_payload = limit;
        self
    }

    /// # Errors
    ///
    /// `RecordConflict` when two record types share a tag.
    pub fn build(self) -> Result<Server> {
        self.records.verify()?;
        Ok(Server {
            inner: Arc::new(ServerInner {
                codec: Codec::new(Arc::new(self.records)),
                functions: self.functions,
                writer_config: self.writer_config,
                max_concurrent_calls: self.max_concurrent_calls,
                max_payload: self.max_payload,
            }),
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ServerInner {
    codec: Codec,
    functions: FunctionRegistry,
    writer_config: WriterConfig,
    max_concurrent_calls: usize,
    max_payload: u32,
}

/// Cancel handles of the streams running on one connection.
type OpenStreams = Arc<Mutex<HashMap<CallId, oneshot::Sender<()>>>>;

/// Per-connection state shared by every call dispatched from it.
struct Session {
    writer: WriterHandle,
    semaphore: Arc<Semaphore>,
    streams: OpenStreams,
    peer: Option<SocketAddr>,
}

/// Executes calls arriving over connections. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.inner.functions
    }

    /// Listen on `url` and serve every accepted connection.
    ///
    /// TCP port 0 picks a free port; [`RunningServer::endpoint`] reports it.
    pub async fn bind(&self, url: &str) -> Result<RunningServer> {
        let listener = Listener::bind(&Endpoint::parse(url)?).await?;
        let endpoint = listener.local_endpoint()?;
        info!(endpoint = %endpoint, functions = self.inner.functions.len(), "server listening");

        let task = tokio::spawn(accept_loop(self.clone(), listener));
        Ok(RunningServer { endpoint, task })
    }

    /// Serve one connection from an unknown peer until it closes.
    pub async fn serve_connection<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.serve_connection_from(reader, writer, None).await
    }

    /// Serve one connection until the peer closes it. `peer` is what
    /// handlers see as [`CallContext::remote_addr`].
    ///
    /// Unary calls still running when the peer stops sending are allowed to
    /// finish and write their responses; open streams are stopped.
    ///
    /// # Errors
    ///
    /// I/O errors from the reader and `Protocol` errors from malformed
    /// frames. Either ends the connection.
    pub async fn serve_connection_from<R, W>(
        &self,
        mut reader: R,
        writer: W,
        peer: Option<SocketAddr>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer, writer_task) = spawn_writer_task(writer, self.inner.writer_config.clone());
        let session = Session {
            writer,
            semaphore: Arc::new(Semaphore::new(self.inner.max_concurrent_calls)),
            streams: Arc::new(Mutex::new(HashMap::new())),
            peer,
        };
        let mut frames = FrameBuffer::with_max_payload(self.inner.max_payload);
        let mut calls = JoinSet::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let result = loop {
            tokio::select! {
                read = reader.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => break Ok(()),
                        Ok(n) => n,
                        Err(e) => break Err(e.into()),
                    };
                    let parsed = match frames.push(&buf[..n]) {
                        Ok(parsed) => parsed,
                        Err(e) => break Err(e),
                    };
                    for header in frames.take_skipped() {
                        self.reject_oversized(header, &session, &mut calls);
                    }
                    for frame in parsed {
                        self.dispatch_frame(frame, &session, &mut calls).await;
                    }
                }
                Some(_) = calls.join_next(), if !calls.is_empty() => {}
            }
        };

        if let Err(e) = &result {
            warn!(error = %e, "connection failed");
        }

        // Dropping the cancel senders stops every open stream.
        session.streams.lock().clear();
        while calls.join_next().await.is_some() {}
        drop(session);
        match writer_task.await {
            Ok(Err(e)) => debug!(error = %e, "writer stopped with error"),
            Err(e) => error!(error = %e, "writer task failed"),
            Ok(Ok(())) => {}
        }

        result
    }

    fn reject_oversized(&self, header: Header, session: &Session, calls: &mut JoinSet<()>) {
        let id = header.call_id;
        if header.is_response() {
            warn!(call_id = id, "dropping oversized response frame sent to the server");
            return;
        }
        warn!(call_id = id, len = header.payload_length, "rejecting oversized request");
        let desc = ErrorDescriptor::new(
            ErrorKind::Decode,
            format!(
                "request payload of {} bytes exceeds the limit of {} bytes",
                header.payload_length, self.inner.max_payload
            ),
        );
        let writer = session.writer.clone();
        let max_payload = self.inner.max_payload;
        calls.spawn(async move { send_outcome(&writer, id, Err(desc), max_payload).await });
    }

    /// Start one call.
    ///
    /// Waits for a call slot first, so with a limit of 1 unary calls run
    /// strictly in arrival order.
    async fn dispatch_frame(&self, frame: Frame, session: &Session, calls: &mut JoinSet<()>) {
        let id = frame.call_id();
        let max_payload = self.inner.max_payload;

        if frame.is_cancel() {
            match session.streams.lock().remove(&id) {
                Some(cancel) => {
                    let _ = cancel.send(());
                }
                None => debug!(call_id = id, "cancel for a stream that is not running"),
            }
            return;
        }

        if frame.is_response() {
            warn!(call_id = id, "dropping response frame sent to the server");
            return;
        }

        let function = match frame.name() {
            Ok(name) => self.inner.functions.resolve(name).ok_or_else(|| {
                ErrorDescriptor::new(ErrorKind::UnknownFunction, name)
            }),
            Err(e) => Err(ErrorDescriptor::new(ErrorKind::Decode, e.to_string())),
        };
        let function = match function {
            Ok(function) => function,
            Err(desc) => {
                let writer = session.writer.clone();
                calls.spawn(async move { send_outcome(&writer, id, Err(desc), max_payload).await });
                return;
            }
        };

        debug!(
            call_id = id,
            function = function,
            len = frame.payload_len(),
            stream = frame.is_stream(),
            "request received"
        );
        let ctx = CallContext::new(id, function, Origin::Remote(session.peer));

        if frame.is_stream() {
            self.open_stream(ctx, frame.payload(), session, calls);
            return;
        }

        let permit = match session.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let server = self.clone();
        let payload = frame.payload_bytes();
        let writer = session.writer.clone();
        calls.spawn(ctx.scope(async move {
            // Slot is held until the response is queued.
            let _permit = permit;
            let inner = &server.inner;
            let outcome = inner.functions.dispatch(&inner.codec, function, &payload).await;
            send_outcome(&writer, id, outcome, inner.max_payload).await;
        }));
    }

    fn open_stream(&self, ctx: CallContext, args: &[u8], session: &Session, calls: &mut JoinSet<()>) {
        let inner = &self.inner;
        let id = ctx.call_id();
        let writer = session.writer.clone();
        let opened = ctx
            .clone()
            .sync_scope(|| inner.functions.open_stream(&inner.codec, ctx.function(), args));

        let items = match opened {
            Ok(items) => ctx.scope_stream(items),
            Err(desc) => {
                let max_payload = inner.max_payload;
                calls.spawn(async move { send_outcome(&writer, id, Err(desc), max_payload).await });
                return;
            }
        };

        let (cancel_tx, cancel_rx) = oneshot::channel();
        if session.streams.lock().insert(id, cancel_tx).is_some() {
            warn!(call_id = id, "stream id reused, cancelling the earlier stream");
        }
        calls.spawn(run_stream(
            writer,
            id,
            items,
            cancel_rx,
            session.streams.clone(),
            inner.max_payload,
        ));
    }
}

/// Forward a stream's items until it ends, fails to send, or is cancelled.
async fn run_stream<S>(
    writer: WriterHandle,
    id: CallId,
    mut items: S,
    mut cancel: oneshot::Receiver<()>,
    streams: OpenStreams,
    max_payload: u32,
) where
    S: Stream<Item = Outcome> + Unpin,
{
    let mut sent = 0u64;
    let end = loop {
        tokio::select! {
            _ = &mut cancel => {
                debug!(call_id = id, sent, "stream stopped");
                return;
            }
            item = items.next() => match item {
                Some(item) => {
                    let Some(frame) = outcome_frame(id, item, max_payload, true) else {
                        continue;
                    };
                    if let Err(e) = writer.send(frame).await {
                        warn!(call_id = id, error = %e, "failed to send stream item");
                        break Err(ErrorDescriptor::remote(format!("stream aborted: {}", e)));
                    }
                    sent += 1;
                }
                None => break Ok(Bytes::new()),
            },
        }
    };

    streams.lock().remove(&id);
    debug!(call_id = id, sent, "stream finished");
    send_outcome(&writer, id, end, max_payload).await;
}

/// Frame carrying `outcome`. Results over `max_payload` become `Decode`
/// errors.
fn outcome_frame(id: CallId, outcome: Outcome, max_payload: u32, item: bool) -> Option<Frame> {
    let outcome = outcome.and_then(|payload| match check_frame_size(0, payload.len(), max_payload) {
        Ok(()) => Ok(payload),
        Err(e) => Err(ErrorDescriptor::new(ErrorKind::Decode, format!("result {}", e))),
    });

    match outcome {
        Ok(payload) if item => Some(Frame::stream_item(id, payload, false)),
        Ok(payload) => Some(Frame::response(id, payload)),
        Err(desc) => {
            debug!(call_id = id, kind = ?desc.kind, message = %desc.message, "call failed");
            match MsgPackCodec::encode(&desc) {
                Ok(payload) if item => Some(Frame::stream_item(id, Bytes::from(payload), true)),
                Ok(payload) => Some(Frame::error_response(id, Bytes::from(payload))),
                Err(e) => {
                    error!(call_id = id, error = %e, "failed to encode error descriptor");
                    None
                }
            }
        }
    }
}

async fn send_outcome(writer: &WriterHandle, id: CallId, outcome: Outcome, max_payload: u32) {
    let Some(frame) = outcome_frame(id, outcome, max_payload, false) else {
        return;
    };
    if let Err(e) = writer.send(frame).await {
        warn!(call_id = id, error = %e, "failed to send response");
    }
}

async fn accept_loop(server: Server, listener: Listener) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((reader, writer, peer)) => {
                    debug!(peer = ?peer, "connection accepted");
                    let server = server.clone();
                    connections.spawn(async move {
                        let _ = server.serve_connection_from(reader, writer, peer).await;
                        debug!(peer = ?peer, "connection finished");
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

/// A server accepting connections in the background.
///
/// Dropping it stops the server like [`shutdown`](Self::shutdown).
pub struct RunningServer {
    endpoint: Endpoint,
    task: JoinHandle<()>,
}

impl RunningServer {
    /// The endpoint actually bound.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// URL clients can pass to `Bridge::set_endpoint`.
    pub fn url(&self) -> String {
        self.endpoint.to_string()
    }

    /// Stop accepting and abort every connection.
    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Schema, Value};
    use crate::error::BridgeError;
    use std::collections::VecDeque;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    crate::function! {
        remote fn add(a: i64, b: i64) -> i64 as Add;
        remote fn fail() -> () as Fail;
        remote fn slow(tag: u64, delay_ms: u64) -> u64 as Slow;
        remote fn pad(len: u64) -> String as Pad;
        remote fn peer() -> Option<String> as Peer;
    }

    crate::stream_function! {
        remote fn count(to: u64) -> u64 as Count;
        remote fn forever() -> u64 as Forever;
    }

    const SMALL_PAYLOAD: u32 = 64;

    fn server(max_concurrent: usize) -> Server {
        builder().max_concurrent_calls(max_concurrent).build().unwrap()
    }

    fn builder() -> ServerBuilder {
        Server::builder()
            .function::<Add, _, _, std::convert::Infallible>(|(a, b)| async move { Ok(a + b) })
            .function::<Fail, _, _, String>(|()| async move { Err("broken".to_string()) })
            .function::<Slow, _, _, std::convert::Infallible>(|(tag, delay_ms)| async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(tag)
            })
            .function::<Pad, _, _, std::convert::Infallible>(|(len,)| async move {
                Ok("x".repeat(len as usize))
            })
            .function::<Peer, _, _, String>(|()| async move {
                let ctx = CallContext::current().ok_or("no context")?;
                if ctx.function() != "peer" || ctx.is_local() {
                    return Err(format!("unexpected context {:?}", ctx));
                }
                Ok(ctx.remote_addr().map(|addr| addr.to_string()))
            })
            .stream_function::<Count, _, _, String>(|(to,)| {
                futures::stream::iter(1..=to).map(|n| {
                    if n == 2 {
                        Err("two is skipped".to_string())
                    } else {
                        Ok(n)
                    }
                })
            })
            .stream_function::<Forever, _, _, std::convert::Infallible>(|()| {
                futures::stream::unfold(0u64, |n| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Some((Ok(n), n + 1))
                })
            })
    }

    struct Client {
        stream: DuplexStream,
        frames: FrameBuffer,
        ready: VecDeque<Frame>,
        codec: Codec,
    }

    impl Client {
        fn start(server: Server) -> Self {
            Self::start_from(server, None)
        }

        fn start_from(server: Server, peer: Option<SocketAddr>) -> Self {
            let (client, server_side) = tokio::io::duplex(64 * 1024);
            tokio::spawn(async move {
                let (reader, writer) = tokio::io::split(server_side);
                let _ = server.serve_connection_from(reader, writer, peer).await;
            });
            Self {
                stream: client,
                frames: FrameBuffer::new(),
                ready: VecDeque::new(),
                codec: Codec::default(),
            }
        }

        async fn request(&mut self, id: CallId, name: &str, args: &[Value], schemas: &[Schema]) {
            let payload = self.codec.encode_args(args, schemas).unwrap();
            self.send(Frame::request(id, name, payload)).await;
        }

        async fn open(&mut self, id: CallId, name: &str, args: &[Value], schemas: &[Schema]) {
            let payload = self.codec.encode_args(args, schemas).unwrap();
            self.send(Frame::stream_request(id, name, payload)).await;
        }

        async fn send(&mut self, frame: Frame) {
            self.stream.write_all(&frame.encode()).await.unwrap();
        }

        async fn next_frame(&mut self) -> Frame {
            loop {
                if let Some(frame) = self.ready.pop_front() {
                    return frame;
                }
                let mut buf = [0u8; 1024];
                let n = self.stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "server closed");
                self.ready.extend(self.frames.push(&buf[..n]).unwrap());
            }
        }
    }

    fn descriptor(frame: &Frame) -> ErrorDescriptor {
        assert!(frame.is_error());
        MsgPackCodec::decode(frame.payload()).unwrap()
    }

    #[tokio::test]
    async fn test_success_response() {
        let mut client = Client::start(server(8));
        client
            .request(1, "add", &[Value::I64(2), Value::I64(40)], &[Schema::I64, Schema::I64])
            .await;

        let frame = client.next_frame().await;
        assert_eq!(frame.call_id(), 1);
        assert!(frame.is_response());
        assert!(!frame.is_error());
        assert_eq!(client.codec.decode_typed::<i64>(frame.payload()).unwrap(), 42);
    }

    #[tokio::test]
    async fn test_error_responses() {
        let mut client = Client::start(server(8));

        client.request(1, "missing", &[], &[]).await;
        let desc = descriptor(&client.next_frame().await);
        assert_eq!(desc.kind, ErrorKind::UnknownFunction);

        client.request(2, "fail", &[], &[]).await;
        let desc = descriptor(&client.next_frame().await);
        assert!(matches!(desc.into_error(), BridgeError::Remote(m) if m == "broken"));

        client
            .request(3, "add", &[Value::Text("x".into())], &[Schema::Text])
            .await;
        let desc = descriptor(&client.next_frame().await);
        assert_eq!(desc.kind, ErrorKind::Decode);
    }

    #[tokio::test]
    async fn test_concurrent_calls_complete_out_of_order() {
        let mut client = Client::start(server(8));
        let schemas = [Schema::U64, Schema::U64];

        client.request(1, "slow", &[Value::U64(1), Value::U64(80)], &schemas).await;
        client.request(2, "slow", &[Value::U64(2), Value::U64(0)], &schemas).await;

        assert_eq!(client.next_frame().await.call_id(), 2);
        assert_eq!(client.next_frame().await.call_id(), 1);
    }

    #[tokio::test]
    async fn test_single_slot_runs_in_order() {
        let mut client = Client::start(server(1));
        let schemas = [Schema::U64, Schema::U64];

        client.request(1, "slow", &[Value::U64(1), Value::U64(50)], &schemas).await;
        client.request(2, "slow", &[Value::U64(2), Value::U64(0)], &schemas).await;

        assert_eq!(client.next_frame().await.call_id(), 1);
        assert_eq!(client.next_frame().await.call_id(), 2);
    }

    #[tokio::test]
    async fn test_response_frames_are_ignored() {
        let mut client = Client::start(server(8));
        client
            .stream
            .write_all(&Frame::response(7, Bytes::from_static(b"\xc0")).encode())
            .await
            .unwrap();
        client
            .request(8, "add", &[Value::I64(1), Value::I64(1)], &[Schema::I64, Schema::I64])
            .await;

        assert_eq!(client.next_frame().await.call_id(), 8);
    }

    #[tokio::test]
    async fn test_oversized_request_gets_error_reply() {
        let mut client = Client::start(builder().max_payload(SMALL_PAYLOAD).build().unwrap());
        client
            .request(1, "pad", &[Value::Text("y".repeat(200))], &[Schema::Text])
            .await;

        let frame = client.next_frame().await;
        assert_eq!(frame.call_id(), 1);
        let desc = descriptor(&frame);
        assert_eq!(desc.kind, ErrorKind::Decode);
        assert!(desc.message.contains("exceeds the limit of 64 bytes"));

        // The connection survives.
        client.request(2, "pad", &[Value::U64(3)], &[Schema::U64]).await;
        let frame = client.next_frame().await;
        assert_eq!(frame.call_id(), 2);
        assert_eq!(client.codec.decode_typed::<String>(frame.payload()).unwrap(), "xxx");
    }

    #[tokio::test]
    async fn test_oversized_result_becomes_error() {
        let mut client = Client::start(builder().max_payload(SMALL_PAYLOAD).build().unwrap());
        client.request(1, "pad", &[Value::U64(500)], &[Schema::U64]).await;

        let desc = descriptor(&client.next_frame().await);
        assert_eq!(desc.kind, ErrorKind::Decode);
        assert!(desc.message.starts_with("result payload of"));
    }

    #[tokio::test]
    async fn test_handler_sees_peer_address() {
        let addr: SocketAddr = "192.0.2.10:5000".parse().unwrap();
        let mut client = Client::start_from(server(8), Some(addr));
        client.request(1, "peer", &[], &[]).await;

        let frame = client.next_frame().await;
        assert!(!frame.is_error());
        let seen = client.codec.decode_typed::<Option<String>>(frame.payload()).unwrap();
        assert_eq!(seen.as_deref(), Some("192.0.2.10:5000"));

        let mut client = Client::start(server(8));
        client.request(2, "peer", &[], &[]).await;
        let frame = client.next_frame().await;
        assert_eq!(client.codec.decode_typed::<Option<String>>(frame.payload()).unwrap(), None);
    }

    #[tokio::test]
    async fn test_stream_items_then_end() {
        let mut client = Client::start(server(8));
        client.open(5, "count", &[Value::U64(3)], &[Schema::U64]).await;

        let first = client.next_frame().await;
        assert!(first.is_stream() && !first.is_error());
        assert_eq!(client.codec.decode_typed::<u64>(first.payload()).unwrap(), 1);

        let failed = client.next_frame().await;
        assert!(failed.is_stream());
        assert_eq!(descriptor(&failed), ErrorDescriptor::remote("two is skipped"));

        let third = client.next_frame().await;
        assert_eq!(client.codec.decode_typed::<u64>(third.payload()).unwrap(), 3);

        let end = client.next_frame().await;
        assert_eq!(end.call_id(), 5);
        assert!(end.is_response() && !end.is_stream() && !end.is_error());
        assert_eq!(end.payload_len(), 0);
    }

    #[tokio::test]
    async fn test_stream_cancel_stops_items() {
        let mut client = Client::start(server(1));
        client.open(9, "forever", &[], &[]).await;

        let item = client.next_frame().await;
        assert_eq!(item.call_id(), 9);
        assert!(item.is_stream());

        client.send(Frame::cancel(9)).await;
        // A unary call still gets its slot while the stream was open.
        client
            .request(10, "add", &[Value::I64(1), Value::I64(2)], &[Schema::I64, Schema::I64])
            .await;

        loop {
            let frame = client.next_frame().await;
            if frame.call_id() == 10 {
                assert!(!frame.is_error());
                break;
            }
            assert!(frame.is_stream(), "no terminal frame after cancel");
        }

        // Items already in flight may trail; after that the stream is silent.
        let mut trailing = 0;
        while let Ok(frame) = tokio::time::timeout(Duration::from_millis(50), client.next_frame()).await {
            assert!(frame.is_stream());
            trailing += 1;
            assert!(trailing < 5, "stream kept running after cancel");
        }
    }

    #[tokio::test]
    async fn test_stream_kind_mismatch() {
        let mut client = Client::start(server(8));
        client.open(1, "add", &[Value::I64(1), Value::I64(2)], &[Schema::I64, Schema::I64]).await;
        let desc = descriptor(&client.next_frame().await);
        assert_eq!(desc.kind, ErrorKind::SchemaMismatch);

        client.request(2, "count", &[Value::U64(1)], &[Schema::U64]).await;
        let desc = descriptor(&client.next_frame().await);
        assert_eq!(desc.kind, ErrorKind::SchemaMismatch);
    }

    #[test]
    fn test_build_rejects_conflicting_records() {
        mod a {
            crate::record! {
                #[derive(Debug, Clone, PartialEq)]
                pub struct Item {
                    pub id: i64,
                }
            }
        }
        mod b {
            crate::record! {
                #[derive(Debug, Clone, PartialEq)]
                pub struct Item {
                    pub label: String,
                }
            }
        }

        let result = Server::builder().record::<a::Item>().record::<b::Item>().build();
        assert!(matches!(result, Err(BridgeError::RecordConflict(tag)) if tag == "Item"));
    }

    #[tokio::test]
    async fn test_bind_and_shutdown() {
        let running = server(8).bind("127.0.0.1:0").await.unwrap();
        let url = running.url();
        assert!(url.starts_with("tcp://127.0.0.1:"));
        assert!(!url.ends_with(":0"));
        running.shutdown();
    }
}
