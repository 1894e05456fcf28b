//! Manifold Core
//!
//! Runtime-agnostic building blocks of the manifold local-IPC pipe server:
//! - Closed error taxonomy (`error`)
//! - Configuration snapshots with builder tuning (`config`)
//! - Observable server events (`event`)
//! - Packed completion-key command protocol (`key`)
//! - Per-client slot state split along the threading boundary (`slot`)
//! - Bounded, chunked, single-in-flight write pipeline (`pipeline`)
//! - The single-threaded completion event loop (`event_loop`)
//! - Ordered event fan-out (`dispatch`)
//! - Per-client handles (`handle`)
//! - The transport seam (`driver`) and the in-process transport (`memory`)
//! - The public facade (`server`)
//!
//! # Architecture
//!
//! One dedicated loop thread owns every slot's I/O state, all pipe
//! instances, and the completion port. Producer threads interact with it
//! through two narrow channels: short critical sections on the per-slot
//! command queues, and completion-port posts carrying packed command keys.
//! This keeps the single-writer discipline (reasoning about completions
//! is local to one thread) while `send_to`, `close`, `set_config`,
//! `start`, and `stop` stay safe from anywhere.
//!
//! Callbacks run synchronously on the loop thread and may re-enter the
//! server (`send_to`, `close`, `set_config`). Register callbacks before
//! calling `start`.

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod command;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod event;
pub mod handle;
pub mod key;
pub mod memory;
pub mod server;

pub(crate) mod event_loop;
pub(crate) mod pipeline;
pub(crate) mod slot;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering from poisoning.
///
/// A panicking user callback must not wedge the loop or the facade, so
/// poisoned state is adopted as-is; the serve phase's panic containment
/// reports the failure separately.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Minimal prelude for downstream crates.
pub mod prelude {
    pub use crate::command::DoneCallback;
    pub use crate::config::{ServerConfig, WriteQueueLimits};
    pub use crate::dispatch::ServerEventHandler;
    pub use crate::driver::PipeDriver;
    pub use crate::error::PipeError;
    pub use crate::event::ServerEvent;
    pub use crate::handle::ClientHandle;
    pub use crate::key::MAX_CLIENTS;
    pub use crate::memory::{MemoryClient, MemoryDriver};
    pub use crate::server::PipeServer;
}
