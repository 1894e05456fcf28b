//! Per-client handle delivered with connection events.

use crate::command::{finish, CommandSink, DoneCallback};
use crate::error::PipeError;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Thin user-facing reference to one connected client slot.
///
/// A handle is published with `ClientConnected` and stays valid for that
/// connected interval. It forwards `send` and `close` to the server and is
/// invalidated when the slot disconnects; after invalidation every
/// operation completes its callback with [`PipeError::NotConnected`].
///
/// The handle never extends the server's lifetime: it observes the server
/// through a non-owning reference, so operations on a handle that outlived
/// its server complete with [`PipeError::ServerStopped`].
#[derive(Clone)]
pub struct ClientHandle {
    client_id: usize,
    alive: Arc<AtomicBool>,
    sink: Weak<dyn CommandSink>,
}

impl ClientHandle {
    pub(crate) fn publish(
        client_id: usize,
        alive: Arc<AtomicBool>,
        sink: Weak<dyn CommandSink>,
    ) -> Self {
        Self {
            client_id,
            alive,
            sink,
        }
    }

    /// The slot index this handle refers to.
    ///
    /// Slot identity is stable across reconnections of the same slot, so
    /// user code may key bookkeeping on it.
    #[must_use]
    pub fn client_id(&self) -> usize {
        self.client_id
    }

    /// Whether the slot is currently connected and this handle still valid.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        if !self.alive.load(Ordering::Acquire) {
            return false;
        }
        self.sink
            .upgrade()
            .is_some_and(|sink| sink.sink_is_connected(self.client_id))
    }

    /// Queue a message to this client.
    ///
    /// Non-blocking; the result is reported through `on_done`.
    pub fn send(&self, payload: impl Into<Bytes>, on_done: Option<DoneCallback>) {
        if !self.alive.load(Ordering::Acquire) {
            finish(on_done, Err(PipeError::NotConnected));
            return;
        }
        match self.sink.upgrade() {
            Some(sink) => sink.submit_send(self.client_id, payload.into(), on_done),
            None => finish(on_done, Err(PipeError::ServerStopped)),
        }
    }

    /// Request a close of this client's connection.
    pub fn close(&self, on_done: Option<DoneCallback>) {
        if !self.alive.load(Ordering::Acquire) {
            finish(on_done, Err(PipeError::NotConnected));
            return;
        }
        match self.sink.upgrade() {
            Some(sink) => sink.submit_close(self.client_id, on_done),
            None => finish(on_done, Err(PipeError::ServerStopped)),
        }
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("client_id", &self.client_id)
            .field("alive", &self.alive.load(Ordering::Acquire))
            .finish()
    }
}
