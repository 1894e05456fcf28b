//! Per-client slot state.
//!
//! A slot exists for the server's entire runtime window; only its pipe
//! instance is created, torn down, and recreated. The record is split
//! along the threading boundary: [`ClientSlot`] is owned exclusively by
//! the loop thread, while [`SlotShared`] holds the halves producers touch
//! (the connected flag and the pending command queues).

use crate::command::{CommandSink, DoneCallback, WriteCommand};
use crate::driver::PipeDriver;
use crate::handle::ClientHandle;
use bytes::BytesMut;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Producer-visible half of one slot.
pub(crate) struct SlotShared {
    /// True exactly between the loop observing a connect completion and
    /// the loop observing a disconnect. Written by the loop with release
    /// ordering, read anywhere with acquire.
    pub connected: AtomicBool,
    /// Commands pushed by producers, drained by the loop on `Send` keys
    pub pending_writes: Mutex<VecDeque<WriteCommand>>,
    /// Completion callbacks for user-requested closes
    pub pending_closes: Mutex<VecDeque<Option<DoneCallback>>>,
}

impl SlotShared {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            pending_writes: Mutex::new(VecDeque::new()),
            pending_closes: Mutex::new(VecDeque::new()),
        }
    }
}

/// Loop-owned half of one slot.
///
/// The instance owns the read buffer and write staging buffer, so their
/// lifetime is structurally tied to any operation in flight on them.
pub(crate) struct ClientSlot<D: PipeDriver> {
    pub index: usize,
    pub instance: Option<D::Instance>,
    /// Loop-local mirror of the shared connected flag
    pub connected: bool,
    /// True while a read is armed and its completion not yet dequeued
    pub read_pending: bool,
    /// True while a write is armed and its completion not yet dequeued
    pub writing: bool,
    /// Commands drained from the shared queue and being transmitted
    pub active_writes: VecDeque<WriteCommand>,
    /// Fragments of the current inbound message
    pub reassembly: BytesMut,
    /// Currently published handle, `None` while disconnected
    pub handle: Option<ClientHandle>,
    alive: Option<Arc<AtomicBool>>,
}

impl<D: PipeDriver> ClientSlot<D> {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            instance: None,
            connected: false,
            read_pending: false,
            writing: false,
            active_writes: VecDeque::new(),
            reassembly: BytesMut::new(),
            handle: None,
            alive: None,
        }
    }

    /// Publish a fresh handle for a newly connected interval.
    pub fn publish_handle(&mut self, sink: Weak<dyn CommandSink>) -> ClientHandle {
        let alive = Arc::new(AtomicBool::new(true));
        let handle = ClientHandle::publish(self.index, Arc::clone(&alive), sink);
        self.alive = Some(alive);
        self.handle = Some(handle.clone());
        handle
    }

    /// Invalidate the published handle, if any.
    pub fn invalidate_handle(&mut self) {
        if let Some(alive) = self.alive.take() {
            alive.store(false, Ordering::Release);
        }
        self.handle = None;
    }
}
