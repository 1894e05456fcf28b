//! Error types for pipe-server operations.

use std::io;
use thiserror::Error;

/// Closed error taxonomy for the pipe server.
///
/// Every producer-facing failure and every loop-observed failure is one of
/// these kinds. OS failures that have no dedicated kind pass through as
/// [`PipeError::Os`] with their native code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipeError {
    /// Client index exceeds the slot space
    #[error("client index out of range")]
    ClientIndexOutOfRange,

    /// Operation targeted a slot with no usable pipe instance
    #[error("invalid pipe handle")]
    InvalidPipeHandle,

    /// Completion port could not be created
    #[error("failed to create I/O completion port")]
    IoCompletionPortCreateFailed,

    /// A pipe instance could not be created
    #[error("failed to create named pipe instance")]
    NamedPipeCreateFailed,

    /// Operation attempted on a disconnected client
    #[error("client is not connected")]
    NotConnected,

    /// Operation aborted because the server is stopping or stopped
    #[error("server has been stopped")]
    ServerStopped,

    /// The message exceeds the allowed maximum size
    #[error("message size exceeds the maximum allowed")]
    MessageTooLarge,

    /// The per-client write queue is full
    #[error("per-client write queue is full")]
    QueueFull,

    /// The far side of the pipe is gone
    #[error("pipe connection broken")]
    BrokenPipe,

    /// A panic escaped user code or the loop body during a serve phase
    #[error("unhandled exception in the event loop")]
    UnhandledException,

    /// Fallback for unexpected system errors
    #[error("unknown system error")]
    UnknownSystemError,

    /// Pass-through OS error with its native code
    #[error("os error {0}")]
    Os(i32),
}

/// Result type alias for pipe-server operations
pub type Result<T> = std::result::Result<T, PipeError>;

impl PipeError {
    /// Check if this error reports the peer (or the server itself) going away.
    #[must_use]
    pub const fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::BrokenPipe | Self::NotConnected | Self::ServerStopped
        )
    }

    /// Check if this error is fatal to a serve phase when raised during init.
    #[must_use]
    pub const fn is_init_failure(&self) -> bool {
        matches!(
            self,
            Self::IoCompletionPortCreateFailed | Self::NamedPipeCreateFailed
        )
    }
}

impl From<io::Error> for PipeError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::BrokenPipe {
            return Self::BrokenPipe;
        }
        match err.raw_os_error() {
            Some(code) => Self::Os(code),
            None => Self::UnknownSystemError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            PipeError::QueueFull.to_string(),
            "per-client write queue is full"
        );
        assert_eq!(PipeError::Os(5).to_string(), "os error 5");
    }

    #[test]
    fn from_io_error() {
        let broken = io::Error::new(io::ErrorKind::BrokenPipe, "gone");
        assert_eq!(PipeError::from(broken), PipeError::BrokenPipe);

        let os = io::Error::from_raw_os_error(2);
        assert_eq!(PipeError::from(os), PipeError::Os(2));

        let plain = io::Error::new(io::ErrorKind::Other, "opaque");
        assert_eq!(PipeError::from(plain), PipeError::UnknownSystemError);
    }

    #[test]
    fn disconnect_classification() {
        assert!(PipeError::BrokenPipe.is_disconnect());
        assert!(PipeError::ServerStopped.is_disconnect());
        assert!(!PipeError::QueueFull.is_disconnect());
    }
}
