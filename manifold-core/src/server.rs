//! The public server facade.
//!
//! `PipeServer` owns the shared state and the loop thread. Every producer
//! operation is non-blocking: validation failures complete the callback
//! synchronously, accepted commands are queued and the loop is woken with
//! a completion-port post. Producers never touch pipe instances or armed
//! I/O state.

use crate::command::{finish, CommandSink, DoneCallback};
use crate::config::ServerConfig;
use crate::dispatch::{EventDispatcher, ServerEventHandler};
use crate::driver::PipeDriver;
use crate::error::PipeError;
use crate::event::ServerEvent;
use crate::event_loop::EventLoop;
use crate::handle::ClientHandle;
use crate::key::{CompletionKey, MAX_CLIENTS};
use crate::lock;
use crate::pipeline;
use crate::slot::SlotShared;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

struct ConfigCell {
    snapshot: ServerConfig,
    updated: bool,
}

/// State shared between the facade, the loop thread, and client handles.
pub(crate) struct Shared<D: PipeDriver> {
    pub driver: D,
    pub slots: Vec<SlotShared>,
    config: Mutex<ConfigCell>,
    config_cv: Condvar,
    stop: AtomicBool,
    running: AtomicBool,
    port: Mutex<Option<D::Port>>,
    dispatcher: Mutex<EventDispatcher>,
}

impl<D: PipeDriver> Shared<D> {
    fn new(driver: D, config: ServerConfig) -> Self {
        Self {
            driver,
            slots: (0..MAX_CLIENTS).map(|_| SlotShared::new()).collect(),
            config: Mutex::new(ConfigCell {
                snapshot: config,
                updated: true,
            }),
            config_cv: Condvar::new(),
            stop: AtomicBool::new(false),
            running: AtomicBool::new(false),
            port: Mutex::new(None),
            dispatcher: Mutex::new(EventDispatcher::default()),
        }
    }

    pub fn emit(&self, event: ServerEvent) {
        lock(&self.dispatcher).emit(&event);
    }

    pub fn publish_port(&self, port: Option<D::Port>) {
        *lock(&self.port) = port;
    }

    fn current_port(&self) -> Option<D::Port> {
        lock(&self.port).clone()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn config_updated(&self) -> bool {
        lock(&self.config).updated
    }

    pub fn config_snapshot(&self) -> ServerConfig {
        lock(&self.config).snapshot.clone()
    }

    /// Block until a configuration is pending or stop is signalled.
    /// Returns false when the loop should exit.
    pub fn await_config(&self) -> bool {
        let mut cell = lock(&self.config);
        loop {
            if self.stop.load(Ordering::Acquire) {
                return false;
            }
            if cell.updated {
                return true;
            }
            cell = self
                .config_cv
                .wait(cell)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Consume the pending configuration.
    pub fn take_config(&self) -> ServerConfig {
        let mut cell = lock(&self.config);
        cell.updated = false;
        cell.snapshot.clone()
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Fail every command still queued on any slot.
    pub fn fail_all_queued(&self, error: &PipeError) {
        for slot in &self.slots {
            pipeline::fail_queued(slot, error);
        }
    }

    fn post_key(&self, key: CompletionKey) -> Result<(), PipeError> {
        match self.current_port() {
            Some(port) => self.driver.post(&port, key.encode()),
            None => Err(PipeError::ServerStopped),
        }
    }

    /// Non-owning reference handles use to reach the command queues.
    pub fn sink_weak(this: &Arc<Self>) -> Weak<dyn CommandSink> {
        let sink: Arc<dyn CommandSink> = this.clone();
        Arc::downgrade(&sink)
    }
}

impl<D: PipeDriver> CommandSink for Shared<D> {
    fn submit_send(&self, client_id: usize, payload: Bytes, on_done: Option<DoneCallback>) {
        if client_id >= MAX_CLIENTS {
            finish(on_done, Err(PipeError::ClientIndexOutOfRange));
            return;
        }
        let limits = lock(&self.config).snapshot.write_limits.clone();
        if payload.len() > limits.max_message_size {
            finish(on_done, Err(PipeError::MessageTooLarge));
            return;
        }
        let Some(port) = self.current_port() else {
            finish(on_done, Err(PipeError::ServerStopped));
            return;
        };

        let rejected = {
            let mut pending = lock(&self.slots[client_id].pending_writes);
            if pending.len() >= limits.max_pending_per_client {
                // Reject without enqueuing; the callback runs outside the
                // lock so it may safely re-enter the server.
                on_done
            } else {
                pending.push_back(crate::command::WriteCommand::new(payload, on_done));
                None
            }
        };
        if let Some(on_done) = rejected {
            on_done(Err(PipeError::QueueFull));
            return;
        }

        // A failed wake means the port raced shut; the queued command is
        // failed at the next init or on drop.
        if let Err(error) = self.driver.post(&port, CompletionKey::Send(client_id).encode()) {
            warn!("[SERVER] send wake for slot {client_id} failed: {error}");
        }
    }

    fn submit_close(&self, client_id: usize, on_done: Option<DoneCallback>) {
        if client_id >= MAX_CLIENTS {
            finish(on_done, Err(PipeError::ClientIndexOutOfRange));
            return;
        }
        let Some(port) = self.current_port() else {
            finish(on_done, Err(PipeError::ServerStopped));
            return;
        };
        lock(&self.slots[client_id].pending_closes).push_back(on_done);
        if let Err(error) = self.driver.post(&port, CompletionKey::Close(client_id).encode()) {
            warn!("[SERVER] close wake for slot {client_id} failed: {error}");
        }
    }

    fn sink_is_connected(&self, client_id: usize) -> bool {
        client_id < MAX_CLIENTS && self.slots[client_id].connected.load(Ordering::Acquire)
    }
}

/// Asynchronous local-IPC pipe server.
///
/// One endpoint, up to [`MAX_CLIENTS`] concurrent clients, one loop thread
/// multiplexing every instance through a single completion port. All
/// methods are safe from any thread; `send_to` and `close` never block and
/// report through their callbacks.
pub struct PipeServer<D: PipeDriver> {
    shared: Arc<Shared<D>>,
    loop_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<D: PipeDriver> PipeServer<D> {
    /// Create a stopped server with the given transport and configuration.
    pub fn new(driver: D, config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(driver, config)),
            loop_thread: Mutex::new(None),
        }
    }

    /// Start serving.
    ///
    /// Idempotent: a prior loop thread is signalled to stop and joined
    /// before the fresh one begins. With `run_async` false the loop runs
    /// on the caller's thread and this call blocks until the server is
    /// stopped from a callback or another thread.
    pub fn start(&self, run_async: bool) {
        let mut guard = lock(&self.loop_thread);
        self.halt(&mut guard);

        self.shared.stop.store(false, Ordering::Release);
        {
            // Re-arm the config so the loop re-enters init even when the
            // previous phase already consumed this snapshot.
            let mut cell = lock(&self.shared.config);
            cell.updated = true;
        }
        self.shared.config_cv.notify_all();

        if run_async {
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name("manifold-loop".to_string())
                .spawn(move || EventLoop::new(shared).run());
            match spawned {
                Ok(handle) => *guard = Some(handle),
                Err(error) => {
                    warn!("[SERVER] failed to spawn loop thread: {error}");
                    self.shared.emit(ServerEvent::ErrorOccurred {
                        error: error.into(),
                    });
                }
            }
        } else {
            drop(guard);
            EventLoop::new(Arc::clone(&self.shared)).run();
        }
    }

    /// Stop serving and join the loop thread if one exists.
    ///
    /// Idempotent; returns after the loop has fully drained.
    pub fn stop(&self) {
        let mut guard = lock(&self.loop_thread);
        self.halt(&mut guard);
    }

    fn halt(&self, guard: &mut Option<JoinHandle<()>>) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.config_cv.notify_all();
        let _ = self.shared.post_key(CompletionKey::Stop);
        if let Some(handle) = guard.take() {
            if handle.thread().id() == thread::current().id() {
                // A callback on the loop thread cannot join itself.
                warn!("[SERVER] stop called from the loop thread; skipping join");
            } else {
                let _ = handle.join();
            }
        }
    }

    /// Replace the configuration.
    ///
    /// Safe at any time. A running server tears down its current serve
    /// phase (failing in-flight callbacks with `ServerStopped`) and
    /// re-enters init with the new snapshot.
    pub fn set_config(&self, config: ServerConfig) {
        debug!("[SERVER] configuration replaced: {:?}", config.endpoint_name);
        {
            let mut cell = lock(&self.shared.config);
            cell.snapshot = config;
            cell.updated = true;
        }
        self.shared.config_cv.notify_all();
        let _ = self.shared.post_key(CompletionKey::Stop);
    }

    /// The current configuration snapshot.
    #[must_use]
    pub fn get_config(&self) -> ServerConfig {
        self.shared.config_snapshot()
    }

    /// Whether a serve phase is currently active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Queue a message to one client.
    ///
    /// Non-blocking. `on_done` fires exactly once: synchronously for
    /// validation failures (`ClientIndexOutOfRange`, `MessageTooLarge`,
    /// `QueueFull`, `ServerStopped`), or from the loop thread once the
    /// message is fully on the wire or has failed.
    pub fn send_to(&self, client_id: usize, payload: impl Into<Bytes>, on_done: Option<DoneCallback>) {
        self.shared.submit_send(client_id, payload.into(), on_done);
    }

    /// Queue a message to every connected client.
    pub fn send_all(&self, payload: impl Into<Bytes>) {
        let payload = payload.into();
        for client_id in 0..MAX_CLIENTS {
            if self.shared.sink_is_connected(client_id) {
                self.shared.submit_send(client_id, payload.clone(), None);
            }
        }
    }

    /// Request a close of one client's connection.
    pub fn close(&self, client_id: usize, on_done: Option<DoneCallback>) {
        self.shared.submit_close(client_id, on_done);
    }

    /// Lock-free check of one slot's connected flag.
    #[must_use]
    pub fn is_connected(&self, client_id: usize) -> bool {
        self.shared.sink_is_connected(client_id)
    }

    /// Number of currently connected clients.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        (0..MAX_CLIENTS)
            .filter(|&client_id| self.shared.sink_is_connected(client_id))
            .count()
    }

    /// Install a handler object; its typed methods run first in the
    /// fan-out order.
    pub fn set_handler(&self, handler: impl ServerEventHandler + 'static) {
        lock(&self.shared.dispatcher).set_handler(Box::new(handler));
    }

    /// Register the universal event sink, invoked last for every event.
    pub fn on_event(&self, callback: impl FnMut(&ServerEvent) + Send + 'static) {
        lock(&self.shared.dispatcher).set_on_event(Box::new(callback));
    }

    /// Register the typed connected callback.
    pub fn on_connected(&self, callback: impl FnMut(usize, &ClientHandle) + Send + 'static) {
        lock(&self.shared.dispatcher).set_on_connected(Box::new(callback));
    }

    /// Register the typed disconnected callback.
    pub fn on_disconnected(
        &self,
        callback: impl FnMut(usize, Option<&PipeError>) + Send + 'static,
    ) {
        lock(&self.shared.dispatcher).set_on_disconnected(Box::new(callback));
    }

    /// Register the typed message callback.
    pub fn on_message(
        &self,
        callback: impl FnMut(usize, &ClientHandle, &Bytes) + Send + 'static,
    ) {
        lock(&self.shared.dispatcher).set_on_message(Box::new(callback));
    }

    /// Register the typed start callback.
    pub fn on_start(&self, callback: impl FnMut(&ServerConfig) + Send + 'static) {
        lock(&self.shared.dispatcher).set_on_start(Box::new(callback));
    }

    /// Register the typed stop callback.
    pub fn on_stop(&self, callback: impl FnMut(&ServerConfig) + Send + 'static) {
        lock(&self.shared.dispatcher).set_on_stop(Box::new(callback));
    }

    /// Register the typed error callback.
    pub fn on_error(&self, callback: impl FnMut(&PipeError) + Send + 'static) {
        lock(&self.shared.dispatcher).set_on_error(Box::new(callback));
    }
}

impl<D: PipeDriver> Drop for PipeServer<D> {
    fn drop(&mut self) {
        self.stop();
        self.shared.fail_all_queued(&PipeError::ServerStopped);
    }
}
