//! Correlation table: call id -> pending completion.
//!
//! Every outstanding remote call owns one entry. A unary call holds the
//! sending half of a oneshot channel; a streaming call holds an unbounded
//! item channel that stays in the table until its terminal frame. The entry
//! is removed exactly once: when the final response arrives, when the
//! connection drops, or when the caller abandons the call. Removal and
//! delivery happen under one lock, so a call can never resolve twice.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use callbridge::correlation::CorrelationTable;
//!
//! let table = CorrelationTable::new();
//! let id = table.allocate();
//! let mut rx = table.register(id);
//!
//! assert!(table.resolve(id, Ok(Bytes::from_static(b"\xc3"))));
//! assert!(!table.resolve(id, Ok(Bytes::new())));
//! assert_eq!(rx.try_recv().unwrap().unwrap(), Bytes::from_static(b"\xc3"));
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

/// Correlation id carried in every frame header.
pub type CallId = u64;

/// Outcome delivered to a pending call: the encoded result, or the error.
pub type Completion = Result<Bytes>;

/// Receiving half of a streaming call. The channel closes after the
/// terminal frame.
pub type ItemReceiver = mpsc::UnboundedReceiver<Completion>;

#[derive(Debug)]
enum Pending {
    Unary(oneshot::Sender<Completion>),
    Stream(mpsc::UnboundedSender<Completion>),
}

impl Pending {
    /// Deliver the final outcome. A stream ends on success and forwards
    /// the error otherwise.
    fn finish(self, outcome: Completion) -> bool {
        match self {
            Pending::Unary(tx) => tx.send(outcome).is_ok(),
            Pending::Stream(tx) => match outcome {
                Ok(_) => !tx.is_closed(),
                Err(err) => tx.send(Err(err)).is_ok(),
            },
        }
    }
}

/// Maps in-flight call ids to their completions.
#[derive(Debug)]
pub struct CorrelationTable {
    next_id: AtomicU64,
    pending: Mutex<HashMap<CallId, Pending>>,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh id. Ids start at 1 and are never reused, also
    /// across reconnects.
    pub fn allocate(&self) -> CallId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of ids handed out so far.
    pub fn allocated(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed) - 1
    }

    /// Create the pending entry for `id`.
    pub fn register(&self, id: CallId) -> oneshot::Receiver<Completion> {
        let (tx, rx) = oneshot::channel();
        self.insert(id, Pending::Unary(tx));
        rx
    }

    /// Create the pending entry for a streaming call.
    pub fn register_stream(&self, id: CallId) -> ItemReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.insert(id, Pending::Stream(tx));
        rx
    }

    fn insert(&self, id: CallId, entry: Pending) {
        if self.pending.lock().insert(id, entry).is_some() {
            // Ids are unique per table, so this only happens on misuse.
            warn!(call_id = id, "replaced an existing pending call");
        }
    }

    /// Deliver the outcome for `id`.
    ///
    /// Returns `false` when no call is pending under `id`: it was already
    /// resolved, cancelled, or never existed. That case is logged and
    /// otherwise ignored.
    pub fn resolve(&self, id: CallId, outcome: Completion) -> bool {
        let entry = self.pending.lock().remove(&id);
        match entry {
            Some(entry) => {
                if !entry.finish(outcome) {
                    debug!(call_id = id, "caller dropped before the response arrived");
                }
                true
            }
            None => {
                warn!(error = %BridgeError::UnknownCorrelation(id), "dropping response");
                false
            }
        }
    }

    /// Deliver one item of a streaming call without ending it.
    ///
    /// Returns `false` when `id` is not a pending stream or its receiver
    /// is gone; a gone receiver also removes the entry.
    pub fn push_item(&self, id: CallId, item: Completion) -> bool {
        let mut pending = self.pending.lock();
        let delivered = match pending.get(&id) {
            Some(Pending::Stream(tx)) => tx.send(item).is_ok(),
            Some(Pending::Unary(_)) => {
                warn!(call_id = id, "stream item for a unary call");
                return false;
            }
            None => {
                debug!(call_id = id, "stream item for no pending call");
                return false;
            }
        };
        if !delivered {
            pending.remove(&id);
        }
        delivered
    }

    /// Remove `id` without delivering anything.
    pub fn cancel(&self, id: CallId) -> bool {
        self.pending.lock().remove(&id).is_some()
    }

    /// Fail `id` with `err` if it is still pending.
    ///
    /// Unlike [`resolve`](Self::resolve) a missing entry is expected here
    /// (the caller gave up first) and is not logged.
    pub fn fail(&self, id: CallId, err: BridgeError) -> bool {
        match self.pending.lock().remove(&id) {
            Some(entry) => {
                entry.finish(Err(err));
                true
            }
            None => false,
        }
    }

    /// Fail every pending call with `ConnectionLost(reason)`.
    ///
    /// Returns how many calls were failed.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            entry.finish(Err(BridgeError::ConnectionLost(reason.to_string())));
        }
        if count > 0 {
            debug!(count, reason, "failed pending calls");
        }
        count
    }

    pub fn contains(&self, id: CallId) -> bool {
        self.pending.lock().contains_key(&id)
    }

    /// Number of pending calls.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Removes a pending entry when dropped.
///
/// Held by the caller's future so that abandoning the call frees its slot.
/// Once the call has resolved the removal is a no-op.
#[derive(Debug)]
pub struct PendingGuard {
    table: Arc<CorrelationTable>,
    id: CallId,
}

impl PendingGuard {
    pub fn new(table: Arc<CorrelationTable>, id: CallId) -> Self {
        Self { table, id }
    }

    pub fn id(&self) -> CallId {
        self.id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.table.cancel(self.id) {
            debug!(call_id = self.id, "call abandoned by caller");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let table = CorrelationTable::new();
        assert_eq!(table.allocate(), 1);
        assert_eq!(table.allocate(), 2);
        assert_eq!(table.allocate(), 3);
        assert_eq!(table.allocated(), 3);
    }

    #[tokio::test]
    async fn test_resolve_delivers_once() {
        let table = CorrelationTable::new();
        let id = table.allocate();
        let rx = table.register(id);

        assert!(table.contains(id));
        assert!(table.resolve(id, Ok(Bytes::from_static(b"a"))));
        assert!(!table.resolve(id, Ok(Bytes::from_static(b"b"))));
        assert!(!table.contains(id));

        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"a"));
    }

    #[test]
    fn test_unknown_id_is_not_fatal() {
        let table = CorrelationTable::new();
        let id = table.allocate();
        let _rx = table.register(id);

        assert!(!table.resolve(999, Ok(Bytes::new())));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_all_fails_with_connection_lost() {
        let table = CorrelationTable::new();
        let receivers: Vec<_> = (0..5).map(|_| table.register(table.allocate())).collect();

        assert_eq!(table.cancel_all("peer closed"), 5);
        assert!(table.is_empty());

        for rx in receivers {
            let err = rx.await.unwrap().unwrap_err();
            assert!(matches!(err, BridgeError::ConnectionLost(ref r) if r == "peer closed"));
        }
    }

    #[tokio::test]
    async fn test_resolve_after_receiver_dropped() {
        let table = CorrelationTable::new();
        let id = table.allocate();
        drop(table.register(id));

        // The entry is still consumed.
        assert!(table.resolve(id, Ok(Bytes::new())));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_fail_is_quiet_for_missing_entry() {
        let table = CorrelationTable::new();
        let id = table.allocate();
        let rx = table.register(id);

        assert!(table.fail(id, BridgeError::QueueFull));
        assert!(!table.fail(id, BridgeError::QueueFull));
        assert!(matches!(rx.await.unwrap(), Err(BridgeError::QueueFull)));
    }

    #[test]
    fn test_guard_removes_entry() {
        let table = Arc::new(CorrelationTable::new());
        let id = table.allocate();
        let _rx = table.register(id);

        let guard = PendingGuard::new(table.clone(), id);
        assert_eq!(guard.id(), id);
        drop(guard);

        assert!(!table.contains(id));
    }

    #[tokio::test]
    async fn test_stream_items_then_end() {
        let table = CorrelationTable::new();
        let id = table.allocate();
        let mut rx = table.register_stream(id);

        assert!(table.push_item(id, Ok(Bytes::from_static(b"\x01"))));
        assert!(table.push_item(id, Err(BridgeError::Remote("bad item".into()))));
        assert!(table.push_item(id, Ok(Bytes::from_static(b"\x02"))));
        assert!(table.contains(id));
        assert!(table.resolve(id, Ok(Bytes::new())));
        assert!(!table.push_item(id, Ok(Bytes::new())));

        assert_eq!(rx.recv().await.unwrap().unwrap(), Bytes::from_static(b"\x01"));
        assert!(matches!(rx.recv().await, Some(Err(BridgeError::Remote(_)))));
        assert_eq!(rx.recv().await.unwrap().unwrap(), Bytes::from_static(b"\x02"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_terminal_error_and_connection_loss() {
        let table = CorrelationTable::new();
        let a = table.allocate();
        let b = table.allocate();
        let mut rx_a = table.register_stream(a);
        let mut rx_b = table.register_stream(b);

        assert!(table.resolve(a, Err(BridgeError::Remote("failed".into()))));
        assert_eq!(table.cancel_all("gone"), 1);

        assert!(matches!(rx_a.recv().await, Some(Err(BridgeError::Remote(_)))));
        assert!(rx_a.recv().await.is_none());
        assert!(matches!(rx_b.recv().await, Some(Err(BridgeError::ConnectionLost(_)))));
        assert!(rx_b.recv().await.is_none());
    }

    #[test]
    fn test_push_to_dropped_stream_removes_entry() {
        let table = CorrelationTable::new();
        let id = table.allocate();
        drop(table.register_stream(id));

        assert!(!table.push_item(id, Ok(Bytes::new())));
        assert!(!table.contains(id));
    }

    #[test]
    fn test_push_item_to_unary_call_is_refused() {
        let table = CorrelationTable::new();
        let id = table.allocate();
        let _rx = table.register(id);

        assert!(!table.push_item(id, Ok(Bytes::new())));
        assert!(table.contains(id));
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let table = Arc::new(CorrelationTable::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || (0..250).map(|_| table.allocate()).collect::<Vec<_>>())
            })
            .collect();

        let mut ids: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 1000);
    }
}
