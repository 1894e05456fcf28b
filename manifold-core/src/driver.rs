//! The transport seam between the event loop and the pipe primitive.
//!
//! The loop's semantics (slot lifecycle, command dispatch, write pipeline,
//! reassembly) are pure logic; everything that actually touches a pipe
//! instance or the completion queue goes through [`PipeDriver`]. The
//! native implementation binds the Windows named-pipe and completion-port
//! calls; [`crate::memory::MemoryDriver`] provides the same contract in
//! process for co-located clients and for the test suites.

use crate::config::ServerConfig;
use crate::error::PipeError;
use bytes::BytesMut;

/// Which per-slot asynchronous state object a completion refers to.
///
/// Each slot keeps one state object per direction; a completion is routed
/// by which of the two it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
}

/// Outcome carried by one dequeued completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Operation finished; for reads this also marks the end of a message
    Ok,
    /// Read finished but the message continues past the buffer
    MoreData,
    /// The far side of the pipe is gone
    BrokenPipe,
    /// The operation was cancelled during teardown; carries no state
    Cancelled,
    /// Operation-level failure
    Failed(PipeError),
}

/// One dequeued completion-port entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Raw completion key; decoded via [`crate::key::CompletionKey`]
    pub key: u64,
    /// Bytes transferred by the operation
    pub bytes: usize,
    /// Operation direction, or `None` for a synthetic command post
    pub op: Option<OpKind>,
    /// Operation outcome
    pub status: CompletionStatus,
}

/// Result of dequeuing from the completion port.
#[derive(Debug)]
pub enum Wait {
    /// A completion (real or synthetic) was dequeued
    Completion(Completion),
    /// The queue itself failed; no operation is attached
    QueueError(PipeError),
    /// The port is gone; treated as a stop request
    Closed,
}

/// Synchronous outcome of arming a read or write.
#[derive(Debug, PartialEq, Eq)]
pub enum StartIo {
    /// The operation is in flight; a completion will arrive at the port
    Pending,
    /// The far side is gone
    Broken,
    /// The far side connected and vanished before any transfer
    NoData,
    /// Any other synchronous failure
    Err(PipeError),
}

/// Driver for one flavor of pipe transport.
///
/// The contract mirrors an overlapped message-mode pipe: at most one read
/// and one write may be in flight per instance, every armed operation
/// eventually surfaces exactly one completion at the port (unless
/// cancelled), and read completions signal [`CompletionStatus::MoreData`]
/// when a message is longer than the instance buffer.
pub trait PipeDriver: Send + Sync + 'static {
    /// Completion queue shared by all of a phase's instances.
    type Port: Clone + Send + Sync + 'static;
    /// One instance of the endpoint, owning its staging buffers.
    type Instance: Send + 'static;

    /// Create the completion port for one serve phase.
    fn create_port(&self) -> Result<Self::Port, PipeError>;

    /// Create one listening instance of the endpoint, associated with
    /// `port` under `key`.
    fn create_instance(
        &self,
        port: &Self::Port,
        key: u64,
        config: &ServerConfig,
    ) -> Result<Self::Instance, PipeError>;

    /// Arm an asynchronous connect.
    ///
    /// On success a zero-byte read-direction completion keyed to the
    /// instance is guaranteed to arrive at the port, whether the transport
    /// reported the connect as pending or as already satisfied.
    fn connect(&self, port: &Self::Port, instance: &mut Self::Instance) -> Result<(), PipeError>;

    /// Arm one read into the instance's read buffer.
    fn start_read(&self, instance: &mut Self::Instance) -> StartIo;

    /// Append the bytes delivered by the most recent read completion.
    fn read_into(&self, instance: &mut Self::Instance, len: usize, dst: &mut BytesMut);

    /// Arm one write of `chunk`. `last` marks the end of the logical
    /// message the chunk belongs to.
    fn start_write(&self, instance: &mut Self::Instance, chunk: &[u8], last: bool) -> StartIo;

    /// Post a synthetic completion carrying `key` and no operation.
    fn post(&self, port: &Self::Port, key: u64) -> Result<(), PipeError>;

    /// Dequeue the next completion, blocking indefinitely.
    fn wait(&self, port: &Self::Port) -> Wait;

    /// Cancel any in-flight operations on the instance.
    fn cancel_io(&self, instance: &mut Self::Instance);

    /// Sever the current peer and return the instance to a listening state.
    fn disconnect(&self, instance: &mut Self::Instance);
}
