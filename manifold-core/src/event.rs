//! Observable server events.

use crate::config::ServerConfig;
use crate::error::PipeError;
use crate::handle::ClientHandle;
use bytes::Bytes;
use std::fmt;

/// One observable occurrence, emitted synchronously from the loop thread.
///
/// `ClientConnected` is emitted at most once per connected interval,
/// `ClientDisconnected` at most once per disconnection and never without a
/// prior `ClientConnected`; `ServerStarted` and `ServerStopped` are
/// balanced per serve phase.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A serve phase began; carries the active configuration
    ServerStarted { config: ServerConfig },

    /// A serve phase ended; carries the last-active configuration
    ServerStopped { config: ServerConfig },

    /// A client connected to the slot
    ClientConnected {
        client_id: usize,
        handle: ClientHandle,
    },

    /// The slot's client is gone; `error` is `None` on a user-initiated
    /// close
    ClientDisconnected {
        client_id: usize,
        handle: ClientHandle,
        error: Option<PipeError>,
    },

    /// A complete inbound message
    MessageReceived {
        client_id: usize,
        handle: ClientHandle,
        payload: Bytes,
    },

    /// A failure that did not end the serve phase
    ErrorOccurred { error: PipeError },
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerStarted { config } => {
                write!(f, "server started on {:?}", config.endpoint_name)
            }
            Self::ServerStopped { config } => {
                write!(f, "server stopped on {:?}", config.endpoint_name)
            }
            Self::ClientConnected { client_id, .. } => {
                write!(f, "client({client_id}) connected")
            }
            Self::ClientDisconnected {
                client_id,
                error: Some(error),
                ..
            } => write!(f, "client({client_id}) disconnected: {error}"),
            Self::ClientDisconnected { client_id, .. } => {
                write!(f, "client({client_id}) disconnected")
            }
            Self::MessageReceived {
                client_id, payload, ..
            } => write!(f, "client({client_id}) message of {} bytes", payload.len()),
            Self::ErrorOccurred { error } => write!(f, "error: {error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let started = ServerEvent::ServerStarted {
            config: ServerConfig::new("t"),
        };
        assert_eq!(started.to_string(), "server started on \"t\"");

        let error = ServerEvent::ErrorOccurred {
            error: PipeError::QueueFull,
        };
        assert_eq!(error.to_string(), "error: per-client write queue is full");
    }
}
