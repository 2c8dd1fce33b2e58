// Per-connection state: owned channels, the outbound buffer and its send
// lock, and the flow-control gate.
use bytes::{Bytes, BytesMut};
use caserve_wire::{Header, Status, encode_error, encode_frame};
use parking_lot::{Mutex, MutexGuard};
use slab::Slab;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinSet;

use crate::channel::Channel;
use crate::ids::ClientId;

#[derive(Debug, Default)]
pub(crate) struct SendState {
    // Encoded frames waiting for the transport.
    pub(crate) buf: BytesMut,
    // Flow-control gate set by EVENTS_OFF.
    pub(crate) events_off: bool,
    // Deliveries were coalesced because the buffer was over the high-water
    // mark; flush once the transport drains it.
    pub(crate) deferred: bool,
}

/// One connected peer.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    label: String,
    // Channels claimed by this client. Slot indices are recorded in the
    // server resource table next to the channel's sid.
    pub(crate) channels: Mutex<Slab<Box<Channel>>>,
    // Send lock. Held for the whole allocate, fill and commit of a reply.
    send: Mutex<SendState>,
    // Wakes the transport writer when frames are committed.
    ready: Notify,
    // Outbound size above which deliveries are coalesced.
    high_water: usize,
    // Requests parked on asynchronous database completions.
    pending: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl Client {
    pub(crate) fn new(label: impl Into<String>, high_water: usize) -> Self {
        Self {
            id: ClientId::next(),
            label: label.into(),
            channels: Mutex::new(Slab::new()),
            send: Mutex::new(SendState::default()),
            ready: Notify::new(),
            high_water,
            pending: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn events_enabled(&self) -> bool {
        !self.send.lock().events_off
    }

    /// Bytes committed but not yet taken by the transport.
    pub fn outbound_len(&self) -> usize {
        self.send.lock().buf.len()
    }

    /// Wait until frames have been committed since the last wakeup.
    pub async fn ready(&self) {
        self.ready.notified().await;
    }

    /// Wake the writer without committing anything, e.g. on shutdown.
    pub fn wake(&self) {
        self.ready.notify_one();
    }

    pub(crate) fn reply(&self) -> ReplyGuard<'_> {
        ReplyGuard {
            client: self,
            state: self.send.lock(),
        }
    }

    pub(crate) fn over_high_water(&self, state: &SendState) -> bool {
        state.buf.len() >= self.high_water
    }

    /// Mark the client closed. Returns `false` if it already was.
    pub(crate) fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.pending.lock().abort_all();
            self.ready.notify_one();
        }
        first
    }

    /// Park a request on `runtime` until its completion arrives. Aborted
    /// when the client closes.
    pub(crate) fn spawn_pending<F>(&self, runtime: &Handle, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.pending.lock();
        // Drop the results of tasks that already finished.
        while pending.try_join_next().is_some() {}
        pending.spawn_on(task, runtime);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Exclusive access to a client's outbound buffer.
///
/// Frames written through one guard are contiguous on the wire. Dropping the
/// guard wakes the transport if anything is buffered.
pub(crate) struct ReplyGuard<'a> {
    client: &'a Client,
    pub(crate) state: MutexGuard<'a, SendState>,
}

impl ReplyGuard<'_> {
    pub(crate) fn frame(&mut self, header: &Header, payload: &[u8]) {
        encode_frame(&mut self.state.buf, header, payload);
    }

    pub(crate) fn error(&mut self, original: &Header, status: Status, message: &str) {
        tracing::debug!(
            client = %self.client.id,
            command = original.command,
            status = ?status,
            reason = message,
            "request failed"
        );
        encode_error(&mut self.state.buf, original, status, message);
    }

    pub(crate) fn over_high_water(&self) -> bool {
        self.client.over_high_water(&self.state)
    }

    /// Hand the buffered bytes to the transport.
    pub(crate) fn take(&mut self) -> Option<Bytes> {
        if self.state.buf.is_empty() {
            return None;
        }
        Some(self.state.buf.split().freeze())
    }
}

impl Drop for ReplyGuard<'_> {
    fn drop(&mut self) {
        if !self.state.buf.is_empty() {
            self.client.ready.notify_one();
        }
    }
}
