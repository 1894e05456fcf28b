//! Write commands and the command-submission seam.

use crate::error::PipeError;
use bytes::Bytes;
use std::fmt;

/// Completion callback for a producer-initiated operation.
///
/// Invoked exactly once per accepted operation, on the loop thread for
/// operations that reached the loop, or synchronously on the caller's
/// thread for validation failures.
pub type DoneCallback = Box<dyn FnOnce(Result<(), PipeError>) + Send + 'static>;

/// One queued outbound message.
///
/// `sent` advances across zero or more write completions; a command is
/// popped from the active queue only once the whole payload is on the wire.
pub(crate) struct WriteCommand {
    pub payload: Bytes,
    pub sent: usize,
    on_done: Option<DoneCallback>,
}

impl WriteCommand {
    pub fn new(payload: Bytes, on_done: Option<DoneCallback>) -> Self {
        Self {
            payload,
            sent: 0,
            on_done,
        }
    }

    pub fn remaining(&self) -> usize {
        self.payload.len().saturating_sub(self.sent)
    }

    pub fn is_finished(&self) -> bool {
        self.sent >= self.payload.len()
    }

    /// Consume the command, firing its callback with `result`.
    pub fn complete(mut self, result: Result<(), PipeError>) {
        if let Some(on_done) = self.on_done.take() {
            on_done(result);
        }
    }
}

impl fmt::Debug for WriteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteCommand")
            .field("len", &self.payload.len())
            .field("sent", &self.sent)
            .field("has_on_done", &self.on_done.is_some())
            .finish()
    }
}

/// Invoke an optional completion callback.
pub(crate) fn finish(on_done: Option<DoneCallback>, result: Result<(), PipeError>) {
    if let Some(on_done) = on_done {
        on_done(result);
    }
}

/// Command-submission surface the server exposes to client handles.
///
/// Handles hold a non-owning reference to this seam so they can forward
/// `send` and `close` without extending the server's lifetime.
pub(crate) trait CommandSink: Send + Sync {
    fn submit_send(&self, client_id: usize, payload: Bytes, on_done: Option<DoneCallback>);
    fn submit_close(&self, client_id: usize, on_done: Option<DoneCallback>);
    fn sink_is_connected(&self, client_id: usize) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn complete_fires_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let command = WriteCommand::new(
            Bytes::from_static(b"abc"),
            Some(Box::new(move |result| {
                assert_eq!(result, Err(PipeError::ServerStopped));
                calls2.fetch_add(1, Ordering::SeqCst);
            })),
        );
        command.complete(Err(PipeError::ServerStopped));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn progress_tracking() {
        let mut command = WriteCommand::new(Bytes::from_static(b"abcdef"), None);
        assert_eq!(command.remaining(), 6);
        assert!(!command.is_finished());
        command.sent = 6;
        assert_eq!(command.remaining(), 0);
        assert!(command.is_finished());
    }
}
