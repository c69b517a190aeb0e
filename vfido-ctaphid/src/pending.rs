//! Pending request correlation
//!
//! Every in-flight request is keyed by its channel and a request ID. A waiter
//! is resolved exactly once: either by [`PendingRequests::deliver`] or by
//! [`PendingRequests::cancel`]. Both remove the entry under the same lock, so
//! whichever runs first wins and the other reports `false`.

use crate::ctaphid::Packet;
use crate::error::{Error, Result};

use spin::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::trace;

/// Correlation key of a pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKey {
    /// Channel the request arrived on
    pub cid: u32,

    /// Request ID, unique per channel manager
    pub request_id: u64,
}

impl RequestKey {
    pub fn new(cid: u32, request_id: u64) -> Self {
        Self { cid, request_id }
    }
}

/// Terminal outcome observed by a waiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Response packets, in transmission order
    Delivered(Vec<Packet>),

    /// Request was cancelled before a response was delivered
    Cancelled,
}

struct Entry {
    token: u64,
    tx: oneshot::Sender<Vec<Packet>>,
}

#[derive(Default)]
struct Inner {
    waiters: Mutex<HashMap<RequestKey, Entry>>,
    next_token: AtomicU64,
}

/// Correlation map of in-flight requests
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Inner>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `key`
    ///
    /// Fails with [`Error::ChannelBusy`] if `key` already has a waiter.
    pub fn register(&self, key: RequestKey) -> Result<ResponseWaiter> {
        let (tx, rx) = oneshot::channel();
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);

        let mut waiters = self.inner.waiters.lock();
        if waiters.contains_key(&key) {
            return Err(Error::ChannelBusy);
        }
        waiters.insert(key, Entry { token, tx });
        drop(waiters);

        Ok(self.waiter(key, token, rx))
    }

    /// Register a waiter for `key`, allowing only one per channel
    ///
    /// Fails with [`Error::ChannelBusy`] if any request on `key.cid` is
    /// still in flight.
    pub fn register_exclusive(&self, key: RequestKey) -> Result<ResponseWaiter> {
        let (tx, rx) = oneshot::channel();
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);

        let mut waiters = self.inner.waiters.lock();
        if waiters.keys().any(|pending| pending.cid == key.cid) {
            return Err(Error::ChannelBusy);
        }
        waiters.insert(key, Entry { token, tx });
        drop(waiters);

        Ok(self.waiter(key, token, rx))
    }

    fn waiter(
        &self,
        key: RequestKey,
        token: u64,
        rx: oneshot::Receiver<Vec<Packet>>,
    ) -> ResponseWaiter {
        trace!(
            cid = format_args!("{:#010x}", key.cid),
            request_id = key.request_id,
            "registered waiter"
        );

        ResponseWaiter {
            key,
            token,
            rx: Some(rx),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Deliver response packets to the waiter for `key`
    ///
    /// Returns `false` if there is no waiter (never registered, already
    /// cancelled, or dropped).
    pub fn deliver(&self, key: RequestKey, packets: Vec<Packet>) -> bool {
        let entry = self.inner.waiters.lock().remove(&key);
        match entry {
            Some(entry) => entry.tx.send(packets).is_ok(),
            None => false,
        }
    }

    /// Cancel the waiter for `key`
    ///
    /// Returns whether a waiter was found and cancelled.
    pub fn cancel(&self, key: RequestKey) -> bool {
        // Dropping the sender resolves the waiter as cancelled
        self.inner.waiters.lock().remove(&key).is_some()
    }

    /// Cancel every waiter on a channel, returning the cancelled keys
    pub fn cancel_channel(&self, cid: u32) -> Vec<RequestKey> {
        let mut cancelled = Vec::new();
        self.inner.waiters.lock().retain(|key, _| {
            if key.cid == cid {
                cancelled.push(*key);
                false
            } else {
                true
            }
        });
        cancelled
    }

    /// Cancel every waiter
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Entry> = self.inner.waiters.lock().drain().map(|(_, e)| e).collect();
        drained.len()
    }

    /// In-flight request on a channel, if any
    pub fn in_flight(&self, cid: u32) -> Option<RequestKey> {
        self.inner
            .waiters
            .lock()
            .keys()
            .find(|key| key.cid == cid)
            .copied()
    }

    /// Whether `key` has a waiter
    pub fn contains(&self, key: RequestKey) -> bool {
        self.inner.waiters.lock().contains_key(&key)
    }

    /// Number of waiters
    pub fn len(&self) -> usize {
        self.inner.waiters.lock().len()
    }

    /// Whether there are no waiters
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caller side of a pending request
///
/// Dropping the waiter without waiting unregisters it.
pub struct ResponseWaiter {
    key: RequestKey,
    token: u64,
    rx: Option<oneshot::Receiver<Vec<Packet>>>,
    inner: Arc<Inner>,
}

impl ResponseWaiter {
    /// Correlation key of this request
    pub fn key(&self) -> RequestKey {
        self.key
    }

    /// Block until the response is delivered or the request is cancelled
    ///
    /// Must not be called from within an async runtime.
    pub fn wait(mut self) -> WaitOutcome {
        let Some(rx) = self.rx.take() else {
            return WaitOutcome::Cancelled;
        };
        match rx.blocking_recv() {
            Ok(packets) => WaitOutcome::Delivered(packets),
            Err(_) => WaitOutcome::Cancelled,
        }
    }
}

impl Drop for ResponseWaiter {
    fn drop(&mut self) {
        let mut waiters = self.inner.waiters.lock();
        if waiters.get(&self.key).is_some_and(|entry| entry.token == self.token) {
            waiters.remove(&self.key);
        }
    }
}

impl std::fmt::Debug for ResponseWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseWaiter").field("key", &self.key).finish()
    }
}
