//! The single-threaded event loop.
//!
//! One thread owns every slot's I/O state, all pipe instances, and the
//! completion port. It is the only thread that arms I/O or touches the
//! active queues, the reassembly buffers, or the in-flight flags.
//! Producers reach it exclusively through the shared per-slot queues plus
//! a completion-port post carrying a packed command key.
//!
//! Phases: wait for a configuration, initialize (port + one listening
//! instance per slot), serve completions, drain. Reconfiguration and stop
//! both exit the serve phase through a `Stop` key; the drain fails every
//! still-queued callback so none is silently dropped.

use crate::config::ServerConfig;
use crate::driver::{Completion, CompletionStatus, OpKind, PipeDriver, StartIo, Wait};
use crate::error::PipeError;
use crate::event::ServerEvent;
use crate::key::{CompletionKey, MAX_CLIENTS};
use crate::lock;
use crate::pipeline;
use crate::server::Shared;
use crate::slot::ClientSlot;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Why a serve phase ended.
enum StopReason {
    Stop,
    Reconfigure,
    Fatal(PipeError),
}

pub(crate) struct EventLoop<D: PipeDriver> {
    shared: Arc<Shared<D>>,
    slots: Vec<ClientSlot<D>>,
    port: Option<D::Port>,
    config: ServerConfig,
}

impl<D: PipeDriver> EventLoop<D> {
    pub fn new(shared: Arc<Shared<D>>) -> Self {
        let config = shared.config_snapshot();
        Self {
            shared,
            slots: (0..MAX_CLIENTS).map(ClientSlot::new).collect(),
            port: None,
            config,
        }
    }

    pub fn run(mut self) {
        loop {
            if !self.shared.await_config() {
                debug!("[LOOP] stop signalled; loop thread exiting");
                return;
            }
            self.config = self.shared.take_config();

            // Commands that accumulated while no phase was serving belong
            // to no session; fail them before fresh clients can connect.
            self.shared.fail_all_queued(&PipeError::ServerStopped);

            match self.init() {
                Ok(()) => {
                    self.shared.set_running(true);
                    self.shared.emit(ServerEvent::ServerStarted {
                        config: self.config.clone(),
                    });
                    let reason = self.serve_guarded();
                    self.drain(reason);
                }
                Err(error) => {
                    warn!("[LOOP] init failed: {error}");
                    self.shared.emit(ServerEvent::ErrorOccurred { error });
                    self.drain(StopReason::Stop);
                }
            }
        }
    }

    /// Create the completion port and one listening instance per slot.
    fn init(&mut self) -> Result<(), PipeError> {
        debug!(
            "[LOOP] initializing endpoint {:?} ({} slots)",
            self.config.endpoint_name, MAX_CLIENTS
        );
        let port = self.shared.driver.create_port()?;
        self.shared.publish_port(Some(port.clone()));
        self.port = Some(port);
        for index in 0..MAX_CLIENTS {
            self.slots[index] = ClientSlot::new(index);
            self.create_pipe(index)?;
        }
        Ok(())
    }

    /// Create one instance keyed to its slot and arm its listen.
    fn create_pipe(&mut self, index: usize) -> Result<(), PipeError> {
        let Some(port) = self.port.clone() else {
            return Err(PipeError::InvalidPipeHandle);
        };
        let key = CompletionKey::Io(index).encode();
        let instance = self
            .shared
            .driver
            .create_instance(&port, key, &self.config)?;
        self.slots[index].instance = Some(instance);
        // A failed listen is not fatal; it was already surfaced.
        let _ = self.reconnect_client(index);
        Ok(())
    }

    /// Arm an asynchronous connect on the slot's instance.
    ///
    /// Failures surface as `ErrorOccurred` and leave the slot parked; the
    /// loop itself keeps serving.
    fn reconnect_client(&mut self, index: usize) -> Result<(), PipeError> {
        let Some(port) = self.port.clone() else {
            return Err(PipeError::InvalidPipeHandle);
        };
        let shared = Arc::clone(&self.shared);
        let result = {
            let slot = &mut self.slots[index];
            match slot.instance.as_mut() {
                Some(instance) => shared.driver.connect(&port, instance),
                None => Err(PipeError::InvalidPipeHandle),
            }
        };
        if let Err(error) = &result {
            warn!("[LOOP] listen failed on slot {index}: {error}");
            shared.emit(ServerEvent::ErrorOccurred {
                error: error.clone(),
            });
        }
        result
    }

    /// Serve completions, containing panics from user callbacks.
    fn serve_guarded(&mut self) -> StopReason {
        match panic::catch_unwind(AssertUnwindSafe(|| self.serve())) {
            Ok(reason) => reason,
            Err(_) => {
                warn!("[LOOP] panic escaped the serve phase");
                self.shared.emit(ServerEvent::ErrorOccurred {
                    error: PipeError::UnhandledException,
                });
                StopReason::Fatal(PipeError::UnhandledException)
            }
        }
    }

    fn serve(&mut self) -> StopReason {
        let Some(port) = self.port.clone() else {
            return StopReason::Fatal(PipeError::InvalidPipeHandle);
        };
        let shared = Arc::clone(&self.shared);
        loop {
            match shared.driver.wait(&port) {
                Wait::Closed => return self.classify_stop(),
                Wait::QueueError(error) => {
                    shared.emit(ServerEvent::ErrorOccurred { error });
                }
                Wait::Completion(completion) => {
                    trace!(
                        "[LOOP] completion key={} bytes={} op={:?} status={:?}",
                        completion.key,
                        completion.bytes,
                        completion.op,
                        completion.status
                    );
                    match CompletionKey::decode(completion.key) {
                        None => shared.emit(ServerEvent::ErrorOccurred {
                            error: PipeError::UnknownSystemError,
                        }),
                        Some(CompletionKey::Stop) => return self.classify_stop(),
                        Some(CompletionKey::Send(index)) => self.handle_send(index),
                        Some(CompletionKey::Close(index)) => self.handle_close(index),
                        Some(CompletionKey::Io(index)) => self.handle_io(index, completion),
                    }
                }
            }
        }
    }

    fn classify_stop(&self) -> StopReason {
        if self.shared.stop_requested() {
            StopReason::Stop
        } else if self.shared.config_updated() {
            StopReason::Reconfigure
        } else {
            StopReason::Stop
        }
    }

    /// `Send | i`: drain pending commands and pump if idle.
    fn handle_send(&mut self, index: usize) {
        pipeline::drain_pending(&self.shared.slots[index], &mut self.slots[index]);
        if !self.slots[index].writing {
            pipeline::pump(
                &self.shared.driver,
                self.config.buffer_size,
                &mut self.slots[index],
            );
        }
    }

    /// `Close | i`: user-requested close of one slot.
    fn handle_close(&mut self, index: usize) {
        let on_done = lock(&self.shared.slots[index].pending_closes)
            .pop_front()
            .flatten();

        if self.slots[index].instance.is_none() {
            if let Some(on_done) = on_done {
                on_done(Err(PipeError::InvalidPipeHandle));
            }
            return;
        }

        if self.slots[index].connected {
            let handle = self.slots[index].handle.clone();
            if let Some(handle) = handle {
                self.shared.emit(ServerEvent::ClientDisconnected {
                    client_id: index,
                    handle,
                    error: None,
                });
            }
        }

        let result = self.recycle_slot(index, None);
        if let Some(on_done) = on_done {
            on_done(result);
        }
    }

    /// Route one real I/O completion to the owning slot.
    fn handle_io(&mut self, index: usize, completion: Completion) {
        let shared = Arc::clone(&self.shared);
        match completion.status {
            // Remnant of an operation torn down during a close; the slot
            // has already been recycled.
            CompletionStatus::Cancelled => {
                if completion.op == Some(OpKind::Read) {
                    self.slots[index].read_pending = false;
                }
                return;
            }
            CompletionStatus::BrokenPipe => {
                if completion.op == Some(OpKind::Read) {
                    self.slots[index].read_pending = false;
                }
                self.client_gone(index, PipeError::BrokenPipe);
                return;
            }
            CompletionStatus::Failed(error) => {
                if completion.op == Some(OpKind::Read) {
                    self.slots[index].read_pending = false;
                }
                shared.emit(ServerEvent::ErrorOccurred { error });
            }
            CompletionStatus::MoreData => {
                let ClientSlot {
                    instance,
                    reassembly,
                    read_pending,
                    connected,
                    ..
                } = &mut self.slots[index];
                *read_pending = false;
                // A fragment for a recycled session must not leak into
                // the next client's reassembly.
                if *connected {
                    if let Some(instance) = instance.as_mut() {
                        shared.driver.read_into(instance, completion.bytes, reassembly);
                    }
                }
            }
            CompletionStatus::Ok => match completion.op {
                Some(OpKind::Write) => {
                    pipeline::on_write_complete(
                        &shared.driver,
                        self.config.buffer_size,
                        &mut self.slots[index],
                    );
                }
                Some(OpKind::Read) => {
                    if !self.slots[index].connected {
                        // A zero-byte read completion on an unconnected
                        // slot is the connect finishing; anything else is
                        // a stale packet from a recycled session.
                        if completion.bytes == 0 {
                            self.client_connected(index);
                        }
                    } else {
                        let payload = {
                            let ClientSlot {
                                instance,
                                reassembly,
                                read_pending,
                                ..
                            } = &mut self.slots[index];
                            *read_pending = false;
                            if completion.bytes > 0 {
                                if let Some(instance) = instance.as_mut() {
                                    shared.driver.read_into(
                                        instance,
                                        completion.bytes,
                                        reassembly,
                                    );
                                }
                            }
                            reassembly.split().freeze()
                        };
                        let handle = self.slots[index].handle.clone();
                        if let Some(handle) = handle {
                            shared.emit(ServerEvent::MessageReceived {
                                client_id: index,
                                handle,
                                payload,
                            });
                        }
                    }
                }
                None => {}
            },
        }
        self.arm_read(index);
    }

    /// Mark the slot connected and publish its handle.
    fn client_connected(&mut self, index: usize) {
        let shared = Arc::clone(&self.shared);
        let handle = {
            let slot = &mut self.slots[index];
            slot.connected = true;
            slot.read_pending = false;
            slot.publish_handle(Shared::sink_weak(&shared))
        };
        shared.slots[index].connected.store(true, Ordering::Release);
        debug!("[LOOP] client connected on slot {index}");
        shared.emit(ServerEvent::ClientConnected {
            client_id: index,
            handle,
        });
    }

    /// The far side vanished: emit the disconnect and recycle the slot.
    fn client_gone(&mut self, index: usize, error: PipeError) {
        debug!("[LOOP] client gone on slot {index}: {error}");
        if self.slots[index].connected {
            let handle = self.slots[index].handle.clone();
            if let Some(handle) = handle {
                self.shared.emit(ServerEvent::ClientDisconnected {
                    client_id: index,
                    handle,
                    error: Some(error.clone()),
                });
            }
        }
        let _ = self.recycle_slot(index, Some(error));
    }

    /// Tear down the slot's current session and re-arm its listen.
    ///
    /// In-flight commands fail with `error` (the disconnect cause) or
    /// `NotConnected` for a user close; commands still in the shared queue
    /// fail with `NotConnected` rather than leak onto the slot's next
    /// client. Returns the outcome of re-arming the listen.
    fn recycle_slot(&mut self, index: usize, error: Option<PipeError>) -> Result<(), PipeError> {
        let shared = Arc::clone(&self.shared);
        let failure = error.unwrap_or(PipeError::NotConnected);
        {
            let slot = &mut self.slots[index];
            slot.connected = false;
            slot.invalidate_handle();
            slot.read_pending = false;
            slot.reassembly.clear();
            pipeline::fail_active(slot, &failure);
            if let Some(instance) = slot.instance.as_mut() {
                shared.driver.cancel_io(instance);
                shared.driver.disconnect(instance);
            }
        }
        shared.slots[index].connected.store(false, Ordering::Release);
        pipeline::fail_queued(&shared.slots[index], &PipeError::NotConnected);
        self.reconnect_client(index)
    }

    /// Post a fresh read if the slot is connected and none is pending.
    fn arm_read(&mut self, index: usize) {
        let shared = Arc::clone(&self.shared);
        let start = {
            let slot = &mut self.slots[index];
            if !slot.connected || slot.read_pending {
                return;
            }
            let Some(instance) = slot.instance.as_mut() else {
                return;
            };
            shared.driver.start_read(instance)
        };
        match start {
            StartIo::Pending => self.slots[index].read_pending = true,
            StartIo::Broken | StartIo::NoData => self.client_gone(index, PipeError::BrokenPipe),
            StartIo::Err(error) => shared.emit(ServerEvent::ErrorOccurred { error }),
        }
    }

    /// Cancel everything, fail every queued callback, emit the stop.
    fn drain(&mut self, reason: StopReason) {
        let shared = Arc::clone(&self.shared);
        let termination = match reason {
            StopReason::Stop | StopReason::Reconfigure => PipeError::ServerStopped,
            StopReason::Fatal(error) => error,
        };
        debug!("[LOOP] draining serve phase: {termination}");

        // New submissions from here on observe a stopped server.
        shared.publish_port(None);

        for index in 0..MAX_CLIENTS {
            let (was_connected, handle) = {
                let slot = &mut self.slots[index];
                (slot.connected, slot.handle.clone())
            };
            if was_connected {
                if let Some(handle) = handle {
                    shared.emit(ServerEvent::ClientDisconnected {
                        client_id: index,
                        handle,
                        error: Some(termination.clone()),
                    });
                }
            }
            {
                let slot = &mut self.slots[index];
                slot.connected = false;
                slot.invalidate_handle();
                slot.read_pending = false;
                slot.reassembly.clear();
                pipeline::fail_active(slot, &termination);
                if let Some(instance) = slot.instance.as_mut() {
                    shared.driver.cancel_io(instance);
                    shared.driver.disconnect(instance);
                }
                slot.instance = None;
            }
            shared.slots[index].connected.store(false, Ordering::Release);
            pipeline::fail_queued(&shared.slots[index], &termination);
        }

        self.port = None;
        shared.set_running(false);
        shared.emit(ServerEvent::ServerStopped {
            config: self.config.clone(),
        });
    }
}
