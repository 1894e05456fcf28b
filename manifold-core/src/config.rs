//! Server configuration.
//!
//! A [`ServerConfig`] is an immutable snapshot of tuning parameters. The
//! event loop copies the current snapshot on each (re)initialization, so
//! changing a live server's configuration goes through
//! `PipeServer::set_config`, which tears the serve phase down and re-enters
//! init with the new snapshot.

use std::time::Duration;

/// Limits for the per-client write queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteQueueLimits {
    /// Maximum messages queued per client before sends fail with `QueueFull`
    pub max_pending_per_client: usize,
    /// Maximum size of a single message in bytes
    pub max_message_size: usize,
}

impl Default for WriteQueueLimits {
    fn default() -> Self {
        Self {
            max_pending_per_client: 1000,
            max_message_size: 64 * 1024,
        }
    }
}

/// Pipe server configuration.
///
/// # Examples
///
/// ```
/// use manifold_core::config::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig::new("control")
///     .with_buffer_size(4096)
///     .with_instance_timeout(Duration::from_millis(100));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Short endpoint name; the native transport maps it to
    /// `\\.\pipe\{endpoint_name}`
    pub endpoint_name: String,

    /// Size of the per-slot staging buffers, and the hint for the OS
    /// instance buffers. Also the chunk size for outbound transfers.
    pub buffer_size: usize,

    /// Instance-creation timeout hint passed to the OS
    pub instance_timeout: Duration,

    /// Limits for the write queue
    pub write_limits: WriteQueueLimits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint_name: "server".to_string(),
            buffer_size: 64 * 1024,
            instance_timeout: Duration::from_millis(50),
            write_limits: WriteQueueLimits::default(),
        }
    }
}

impl ServerConfig {
    /// Create a configuration for the given endpoint with default tuning.
    pub fn new(endpoint_name: impl Into<String>) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            ..Self::default()
        }
    }

    /// Set the staging/instance buffer size in bytes.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the OS instance-creation timeout hint.
    pub fn with_instance_timeout(mut self, timeout: Duration) -> Self {
        self.instance_timeout = timeout;
        self
    }

    /// Set the maximum number of queued messages per client.
    pub fn with_max_pending(mut self, max_pending_per_client: usize) -> Self {
        self.write_limits.max_pending_per_client = max_pending_per_client;
        self
    }

    /// Set the maximum size of a single message.
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.write_limits.max_message_size = max_message_size;
        self
    }

    /// Replace the write-queue limits wholesale.
    pub fn with_write_limits(mut self, write_limits: WriteQueueLimits) -> Self {
        self.write_limits = write_limits;
        self
    }
}
