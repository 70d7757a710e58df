//! The single duplex connection to the remote side.
//!
//! The manager owns the link state machine:
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Open
//!      ^                          |               |
//!      +-------- failure ---------+---- close ----+
//! ```
//!
//! Submitting never waits on the socket: frames land in an unbounded outbox
//! per connection, and a forwarding task feeds them to the dedicated writer
//! task, which applies backpressure. One reader task per connection
//! demultiplexes responses by correlation id into the shared
//! [`CorrelationTable`]. When the transport drops, every in-flight call fails
//! with `ConnectionLost`; calls made while the link is down are queued (when
//! enabled) and written oldest-first as soon as a connection opens.
//!
//! A response whose payload exceeds the configured limit fails only its own
//! call with `Decode`; the connection stays open.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::MsgPackCodec;
use crate::config::{BridgeConfig, QueueConfig, ReconnectPolicy};
use crate::correlation::{CallId, Completion, CorrelationTable, ItemReceiver};
use crate::error::{BridgeError, ErrorDescriptor, Result};
use crate::protocol::{check_frame_size, Frame, FrameBuffer, Header};
use crate::transport::{BoxedReader, BoxedWriter, Connector, Endpoint};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Read buffer size for the connection's inbound half.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Observable state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
        }
    }
}

/// An encoded call ready for the wire.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub id: CallId,
    pub name: &'static str,
    /// Encoded argument array.
    pub payload: Bytes,
    /// Opens a streaming call instead of a unary one.
    pub stream: bool,
}

impl OutboundRequest {
    fn into_frame(self) -> Frame {
        if self.stream {
            Frame::stream_request(self.id, self.name, self.payload)
        } else {
            Frame::request(self.id, self.name, self.payload)
        }
    }
}

struct OpenLink {
    outbox: mpsc::UnboundedSender<Frame>,
    task: JoinHandle<()>,
}

enum Phase {
    Disconnected,
    Connecting,
    Open(OpenLink),
}

impl Phase {
    fn state(&self) -> ConnectionState {
        match self {
            Phase::Disconnected => ConnectionState::Disconnected,
            Phase::Connecting => ConnectionState::Connecting,
            Phase::Open(_) => ConnectionState::Open,
        }
    }
}

struct Link {
    endpoint: Option<Endpoint>,
    phase: Phase,
    queue: VecDeque<OutboundRequest>,
    /// Bumped by every explicit connect/disconnect; stale attempts and
    /// reconnect loops compare against it and stand down.
    generation: u64,
    /// Bumped for every opened connection.
    epoch: u64,
}

struct Shared {
    connector: Arc<dyn Connector>,
    table: Arc<CorrelationTable>,
    queue: QueueConfig,
    reconnect: ReconnectPolicy,
    writer: WriterConfig,
    max_payload: u32,
    link: Mutex<Link>,
    state_tx: watch::Sender<ConnectionState>,
}

/// Owner of the connection and its state machine.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        config: &BridgeConfig,
        connector: Arc<dyn Connector>,
        table: Arc<CorrelationTable>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Shared {
            connector,
            table,
            queue: config.queue.clone(),
            reconnect: config.reconnect.clone(),
            writer: config.writer.clone(),
            max_payload: config.max_payload,
            link: Mutex::new(Link {
                endpoint: config.endpoint.clone(),
                phase: Phase::Disconnected,
                queue: VecDeque::new(),
                generation: 0,
                epoch: 0,
            }),
            state_tx,
        };

        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.shared.link.lock().endpoint.clone()
    }

    /// Change the endpoint used by the next connection attempt.
    ///
    /// # Errors
    ///
    /// `EndpointLocked` unless the link is disconnected.
    pub fn set_endpoint(&self, endpoint: Endpoint) -> Result<()> {
        let mut link = self.shared.link.lock();
        match link.phase {
            Phase::Disconnected => {
                info!(endpoint = %endpoint, "endpoint changed");
                link.endpoint = Some(endpoint);
                Ok(())
            }
            _ => Err(BridgeError::EndpointLocked),
        }
    }

    /// Number of calls waiting for a connection.
    pub fn queued(&self) -> usize {
        self.shared.link.lock().queue.len()
    }

    pub fn table(&self) -> &Arc<CorrelationTable> {
        &self.shared.table
    }

    /// Open the connection.
    ///
    /// Returns immediately when already open and waits for the running
    /// attempt when one is in progress. On failure with automatic
    /// reconnection enabled, retries continue in the background and queued
    /// calls stay queued; otherwise queued calls fail with `ConnectionLost`.
    pub async fn connect(&self) -> Result<()> {
        let attempt = {
            let mut link = self.shared.link.lock();
            match link.phase {
                Phase::Open(_) => return Ok(()),
                Phase::Connecting => None,
                Phase::Disconnected => {
                    link.generation += 1;
                    let endpoint = self.shared.begin_attempt(&mut link)?;
                    Some((link.generation, endpoint))
                }
            }
        };

        let (generation, endpoint) = match attempt {
            Some(attempt) => attempt,
            None => return self.wait_for_attempt().await,
        };

        match self.shared.try_open(generation, &endpoint).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "connection attempt failed");
                let mut link = self.shared.link.lock();
                if link.generation == generation && matches!(link.phase, Phase::Disconnected) {
                    self.shared.after_failure(&mut link, &e.to_string());
                }
                Err(e)
            }
        }
    }

    async fn wait_for_attempt(&self) -> Result<()> {
        let mut rx = self.shared.state_tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Disconnected => {
                    return Err(BridgeError::ConnectionLost(
                        "connection attempt failed".to_string(),
                    ))
                }
                ConnectionState::Connecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(BridgeError::NotConnected);
            }
        }
    }

    /// Close the connection on purpose.
    ///
    /// In-flight and queued calls fail with `ConnectionLost`; no automatic
    /// reconnect follows.
    pub fn disconnect(&self) {
        let shared = &self.shared;
        let mut link = shared.link.lock();
        link.generation += 1;
        let previous = shared.set_phase(&mut link, Phase::Disconnected);
        if let Phase::Open(open) = previous {
            open.task.abort();
        }
        link.queue.clear();
        let failed = shared.table.cancel_all("disconnected");
        info!(failed, "disconnected");
    }

    /// Drop the current connection and open a new one.
    pub async fn reconnect(&self) -> Result<()> {
        self.disconnect();
        self.connect().await
    }

    /// Hand a request to the connection.
    ///
    /// Registers the pending entry and either hands the frame to the
    /// connection's outbox (open) or queues it (not open, queuing enabled).
    /// Never waits for the socket. On error nothing is left behind in the
    /// correlation table.
    ///
    /// # Errors
    ///
    /// - `PayloadTooLarge` when the encoded arguments exceed the frame limit
    /// - `NotConnected` when the link is down and queuing is disabled
    /// - `QueueFull` when the queue is at its configured depth
    /// - `ConnectionLost` when the connection closed underneath
    pub fn submit(&self, request: OutboundRequest) -> Result<oneshot::Receiver<Completion>> {
        self.enqueue(request, CorrelationTable::register)
    }

    /// Like [`submit`](Self::submit), for a streaming call.
    pub fn submit_stream(&self, request: OutboundRequest) -> Result<ItemReceiver> {
        self.enqueue(request, CorrelationTable::register_stream)
    }

    fn enqueue<R>(
        &self,
        request: OutboundRequest,
        register: impl FnOnce(&CorrelationTable, CallId) -> R,
    ) -> Result<R> {
        let shared = &self.shared;
        check_frame_size(request.name.len(), request.payload.len(), shared.max_payload)?;

        let mut link = shared.link.lock();
        let (id, name) = (request.id, request.name);

        if let Phase::Open(open) = &link.phase {
            let rx = register(&shared.table, id);
            if open.outbox.send(request.into_frame()).is_err() {
                shared.table.cancel(id);
                return Err(BridgeError::ConnectionLost("connection closed".to_string()));
            }
            debug!(call_id = id, function = name, "request sent");
            return Ok(rx);
        }

        if !shared.queue.enabled {
            return Err(BridgeError::NotConnected);
        }
        if link.queue.len() >= shared.queue.depth {
            return Err(BridgeError::QueueFull);
        }
        let rx = register(&shared.table, id);
        link.queue.push_back(request);
        debug!(call_id = id, function = name, queued = link.queue.len(), "request queued");
        Ok(rx)
    }

    /// Abandon a streaming call.
    ///
    /// Removes the pending entry and, when the request may already be on
    /// the wire, tells the remote side to stop. A no-op once the stream
    /// has ended.
    pub fn cancel_stream(&self, id: CallId) {
        if !self.shared.table.cancel(id) {
            return;
        }
        let mut link = self.shared.link.lock();
        if let Phase::Open(open) = &link.phase {
            if open.outbox.send(Frame::cancel(id)).is_ok() {
                debug!(call_id = id, "stream cancelled");
            }
            return;
        }
        link.queue.retain(|request| request.id != id);
    }
}

impl Shared {
    /// Publish `phase` and return the previous one.
    fn set_phase(&self, link: &mut Link, phase: Phase) -> Phase {
        let state = phase.state();
        let previous = std::mem::replace(&mut link.phase, phase);
        self.state_tx.send_replace(state);
        previous
    }

    fn begin_attempt(&self, link: &mut Link) -> Result<Endpoint> {
        let endpoint = link
            .endpoint
            .clone()
            .ok_or_else(|| BridgeError::InvalidEndpoint("no endpoint configured".to_string()))?;
        self.set_phase(link, Phase::Connecting);
        debug!(endpoint = %endpoint, "connecting");
        Ok(endpoint)
    }

    /// Connect and install the streams, unless the attempt was superseded.
    async fn try_open(self: &Arc<Self>, generation: u64, endpoint: &Endpoint) -> Result<()> {
        let (reader, writer) = match self.connector.connect(endpoint).await {
            Ok(streams) => streams,
            Err(e) => {
                let mut link = self.link.lock();
                if link.generation == generation && matches!(link.phase, Phase::Connecting) {
                    self.set_phase(&mut link, Phase::Disconnected);
                }
                return Err(e);
            }
        };
        self.install(generation, endpoint, reader, writer)
    }

    fn install(
        self: &Arc<Self>,
        generation: u64,
        endpoint: &Endpoint,
        reader: BoxedReader,
        writer: BoxedWriter,
    ) -> Result<()> {
        let mut link = self.link.lock();
        if link.generation != generation || !matches!(link.phase, Phase::Connecting) {
            debug!(endpoint = %endpoint, "discarding superseded connection");
            return Err(BridgeError::ConnectionLost(
                "connection attempt was superseded".to_string(),
            ));
        }

        let (handle, writer_task) = spawn_writer_task(writer, self.writer.clone());
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        link.epoch += 1;
        let epoch = link.epoch;

        // Queued calls go out before anything submitted after the lock drops.
        let mut flushed = 0usize;
        while let Some(request) = link.queue.pop_front() {
            if !self.table.contains(request.id) {
                continue;
            }
            // The receiver is held below, so this cannot fail.
            let _ = outbox.send(request.into_frame());
            flushed += 1;
        }

        let task = tokio::spawn(run_connection(
            Arc::downgrade(self),
            self.table.clone(),
            Streams {
                reader,
                outbox: outbox_rx,
                writer: handle,
                writer_task,
            },
            epoch,
            self.max_payload,
        ));
        self.set_phase(&mut link, Phase::Open(OpenLink { outbox, task }));
        info!(endpoint = %endpoint, epoch, flushed, "connection open");
        Ok(())
    }

    /// Decide what happens after the link went down unexpectedly.
    fn after_failure(self: &Arc<Self>, link: &mut Link, reason: &str) {
        if self.reconnect.enabled {
            tokio::spawn(reconnect_loop(Arc::downgrade(self), link.generation));
        } else {
            self.fail_queue(link, reason);
        }
    }

    fn fail_queue(&self, link: &mut Link, reason: &str) {
        let mut failed = 0usize;
        for request in link.queue.drain(..) {
            if self
                .table
                .fail(request.id, BridgeError::ConnectionLost(reason.to_string()))
            {
                failed += 1;
            }
        }
        if failed > 0 {
            warn!(failed, reason, "failed queued calls");
        }
    }

    fn on_closed(self: &Arc<Self>, epoch: u64, reason: &str) {
        let mut link = self.link.lock();
        if link.epoch != epoch || !matches!(link.phase, Phase::Open(_)) {
            return;
        }
        self.set_phase(&mut link, Phase::Disconnected);
        let failed = self.table.cancel_all(reason);
        warn!(epoch, failed, reason, "connection closed");
        self.after_failure(&mut link, reason);
    }

    fn give_up(&self, generation: u64, attempts: u32) {
        let mut link = self.link.lock();
        if link.generation != generation || !matches!(link.phase, Phase::Disconnected) {
            return;
        }
        let reason = format!("reconnect gave up after {} attempts", attempts);
        warn!(attempts, "{}", reason);
        self.fail_queue(&mut link, &reason);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Phase::Open(open) = &self.link.get_mut().phase {
            open.task.abort();
        }
    }
}

/// Retry with backoff until a connection opens, the policy runs out, or an
/// explicit connect/disconnect takes over.
async fn reconnect_loop(shared: Weak<Shared>, generation: u64) {
    let mut attempt = 0u32;
    loop {
        let policy = match shared.upgrade() {
            Some(shared) => shared.reconnect.clone(),
            None => return,
        };
        if !policy.allows(attempt) {
            if let Some(shared) = shared.upgrade() {
                shared.give_up(generation, attempt);
            }
            return;
        }

        attempt += 1;
        let delay = policy.backoff_for_attempt(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
        tokio::time::sleep(delay).await;

        let shared = match shared.upgrade() {
            Some(shared) => shared,
            None => return,
        };
        let endpoint = {
            let mut link = shared.link.lock();
            if link.generation != generation || !matches!(link.phase, Phase::Disconnected) {
                return;
            }
            match shared.begin_attempt(&mut link) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    warn!(attempt, error = %e, "cannot reconnect");
                    continue;
                }
            }
        };

        match shared.try_open(generation, &endpoint).await {
            Ok(()) => {
                info!(attempt, "reconnected");
                return;
            }
            Err(e) => warn!(attempt, endpoint = %endpoint, error = %e, "reconnect attempt failed"),
        }
    }
}

/// The halves of one open connection.
struct Streams {
    reader: BoxedReader,
    outbox: mpsc::UnboundedReceiver<Frame>,
    writer: WriterHandle,
    writer_task: JoinHandle<Result<()>>,
}

/// Per-connection task: reads responses and forwards the outbox until the
/// transport or the writer stops, then reports the closure.
async fn run_connection(
    shared: Weak<Shared>,
    table: Arc<CorrelationTable>,
    streams: Streams,
    epoch: u64,
    max_payload: u32,
) {
    let Streams {
        reader,
        outbox,
        writer,
        mut writer_task,
    } = streams;

    let reason = tokio::select! {
        result = read_loop(reader, &table, max_payload) => match result {
            Ok(()) => "peer closed the connection".to_string(),
            Err(e) => e.to_string(),
        },
        result = forward(outbox, writer, &table) => match result {
            Ok(()) => "outbox closed".to_string(),
            Err(e) => e.to_string(),
        },
        result = &mut writer_task => match result {
            Ok(Ok(())) => "writer stopped".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("writer task failed: {}", e),
        },
    };

    match shared.upgrade() {
        Some(shared) => shared.on_closed(epoch, &reason),
        None => {
            table.cancel_all(&reason);
        }
    }
}

/// Move frames from the outbox to the writer task, waiting out backpressure.
///
/// A frame that times out under backpressure fails only its own call.
async fn forward(
    mut outbox: mpsc::UnboundedReceiver<Frame>,
    writer: WriterHandle,
    table: &CorrelationTable,
) -> Result<()> {
    while let Some(frame) = outbox.recv().await {
        let id = frame.call_id();
        match writer.send(frame).await {
            Ok(()) => {}
            Err(BridgeError::Backpressure) => {
                warn!(call_id = id, "writer saturated, failing call");
                table.fail(id, BridgeError::Backpressure);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn read_loop(
    mut reader: BoxedReader,
    table: &CorrelationTable,
    max_payload: u32,
) -> Result<()> {
    let mut frames = FrameBuffer::with_max_payload(max_payload);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let ready = frames.push(&buf[..n])?;
        for header in frames.take_skipped() {
            reject_oversized(table, &header, max_payload);
        }
        for frame in ready {
            handle_frame(table, frame);
        }
    }
}

/// Fail the call whose response was too large to accept.
fn reject_oversized(table: &CorrelationTable, header: &Header, max_payload: u32) {
    let id = header.call_id;
    warn!(
        call_id = id,
        len = header.payload_length,
        limit = max_payload,
        "skipped oversized frame"
    );
    if !header.is_response() {
        return;
    }
    let err = BridgeError::Decode(format!(
        "response payload of {} bytes exceeds the limit of {} bytes",
        header.payload_length, max_payload
    ));
    if header.is_stream() {
        table.push_item(id, Err(err));
    } else {
        table.resolve(id, Err(err));
    }
}

fn handle_frame(table: &CorrelationTable, frame: Frame) {
    let id = frame.call_id();
    if !frame.is_response() {
        warn!(call_id = id, "dropping request frame from the remote side");
        return;
    }

    let outcome = if frame.is_error() {
        match MsgPackCodec::decode::<ErrorDescriptor>(frame.payload()) {
            Ok(desc) => Err(desc.into_error()),
            Err(e) => Err(BridgeError::Decode(format!("unreadable error response: {}", e))),
        }
    } else {
        Ok(frame.payload_bytes())
    };

    debug!(
        call_id = id,
        len = frame.payload_len(),
        error = frame.is_error(),
        item = frame.is_stream(),
        "response received"
    );
    if frame.is_stream() {
        table.push_item(id, outcome);
    } else {
        table.resolve(id, outcome);
    }
}
