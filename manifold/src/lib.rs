//! # Manifold
//!
//! An asynchronous local-IPC server on the operating system's named-pipe
//! primitive, multiplexing every client instance of one endpoint through a
//! single completion port on a single loop thread.
//!
//! ## Architecture
//!
//! - **`manifold-core`**: slot state, command protocol, write pipeline,
//!   event loop, event fan-out, and an in-process transport
//! - **`manifold`**: the public surface plus the native Windows
//!   completion-port transport (this crate)
//!
//! One loop thread owns all I/O; producer threads queue commands and wake
//! it with a completion-port post. Per-client sends are FIFO, bounded, and
//! chunked; inbound messages are reassembled to full logical messages
//! before dispatch. Unsafe code is confined to the native transport.
//!
//! ## Quick start
//!
//! ```no_run
//! use manifold::{MemoryClient, MemoryDriver, PipeServer, ServerConfig};
//!
//! let driver = MemoryDriver::default();
//! let server = PipeServer::new(driver.clone(), ServerConfig::new("control"));
//!
//! server.on_message(|client_id, handle, payload| {
//!     println!("client({client_id}) sent {} bytes", payload.len());
//!     handle.send(payload.clone(), None);
//! });
//! server.start(true);
//!
//! let client = MemoryClient::connect(&driver, "control").unwrap();
//! client.send("ping").unwrap();
//! println!("{:?}", client.recv());
//! server.stop();
//! ```
//!
//! On Windows the same server speaks to out-of-process clients over
//! `\\.\pipe\{endpoint_name}`:
//!
//! ```ignore
//! use manifold::{IocpDriver, NamedPipeServer, ServerConfig};
//!
//! let server = NamedPipeServer::new(IocpDriver::new(), ServerConfig::new("control"));
//! server.start(true);
//! ```

#![warn(clippy::all)]

pub use manifold_core::command::DoneCallback;
pub use manifold_core::config::{ServerConfig, WriteQueueLimits};
pub use manifold_core::dispatch::ServerEventHandler;
pub use manifold_core::driver::{
    Completion, CompletionStatus, OpKind, PipeDriver, StartIo, Wait,
};
pub use manifold_core::error::{PipeError, Result};
pub use manifold_core::event::ServerEvent;
pub use manifold_core::handle::ClientHandle;
pub use manifold_core::key::{CompletionKey, MAX_CLIENTS};
pub use manifold_core::memory::{MemoryClient, MemoryDriver};
pub use manifold_core::server::PipeServer;

pub mod dev_tracing;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::{IocpDriver, IocpInstance, IocpPort};

/// Server bound to the in-process transport.
pub type MemoryServer = PipeServer<MemoryDriver>;

/// Server bound to the native named-pipe transport.
#[cfg(windows)]
pub type NamedPipeServer = PipeServer<IocpDriver>;
