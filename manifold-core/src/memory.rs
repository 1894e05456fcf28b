//! In-process pipe transport.
//!
//! `MemoryDriver` implements the [`PipeDriver`] contract entirely in
//! process: endpoints are named entries in a shared registry, instances
//! pair with [`MemoryClient`]s, and completions flow through a
//! condvar-backed queue standing in for the OS completion port.
//!
//! Message-mode semantics are reproduced faithfully: a client message
//! longer than the instance buffer is delivered to the server in
//! buffer-sized pieces with a more-data signal, and a chunked server send
//! is observed by the client as one message once its final chunk lands.
//!
//! Clone the driver before handing it to a server; clones share the
//! registry, which is how clients find the endpoint:
//!
//! ```
//! use manifold_core::config::ServerConfig;
//! use manifold_core::memory::{MemoryClient, MemoryDriver};
//! use manifold_core::server::PipeServer;
//!
//! let driver = MemoryDriver::default();
//! let server = PipeServer::new(driver.clone(), ServerConfig::new("demo"));
//! server.start(true);
//! let client = MemoryClient::connect(&driver, "demo").unwrap();
//! # drop(client);
//! # server.stop();
//! ```

use crate::config::ServerConfig;
use crate::driver::{Completion, CompletionStatus, OpKind, PipeDriver, StartIo, Wait};
use crate::error::PipeError;
use crate::lock;
use bytes::{Bytes, BytesMut};
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::trace;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// In-process pipe fabric. Cheap to clone; clones share one registry.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    registry: Arc<Registry>,
}

#[derive(Default)]
struct Registry {
    endpoints: Mutex<HashMap<String, Arc<Endpoint>>>,
}

impl Registry {
    fn endpoint(&self, name: &str) -> Arc<Endpoint> {
        let mut endpoints = lock(&self.endpoints);
        Arc::clone(
            endpoints
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Endpoint::default())),
        )
    }
}

#[derive(Default)]
struct Endpoint {
    inner: Mutex<EndpointInner>,
    cv: Condvar,
}

#[derive(Default)]
struct EndpointInner {
    /// Instances whose connect is armed and waiting for a peer
    accepting: Vec<Arc<InstanceState>>,
    /// Clients that arrived before any instance was ready
    waiting_clients: VecDeque<Arc<ClientCore>>,
}

/// Completion queue shared by a phase's instances.
#[derive(Clone, Default)]
pub struct MemoryPort {
    core: Arc<PortCore>,
}

#[derive(Default)]
struct PortCore {
    queue: Mutex<VecDeque<Completion>>,
    cv: Condvar,
}

impl PortCore {
    fn push(&self, completion: Completion) {
        lock(&self.queue).push_back(completion);
        self.cv.notify_one();
    }
}

/// One instance of an in-process endpoint.
pub struct MemoryInstance {
    state: Arc<InstanceState>,
}

struct InstanceState {
    key: u64,
    buffer_size: usize,
    endpoint: Arc<Endpoint>,
    port: MemoryPort,
    io: Mutex<InstanceIo>,
}

#[derive(Default)]
struct InstanceIo {
    phase: Phase,
    client: Option<Arc<ClientCore>>,
    /// Complete messages from the client; the head may be partially read
    inbound: VecDeque<Bytes>,
    cursor: usize,
    read_armed: bool,
    last_read: Vec<u8>,
    /// Chunks of the current outbound message, pending its final chunk
    outgoing: BytesMut,
}

#[derive(Default, PartialEq, Eq, Clone, Copy, Debug)]
enum Phase {
    #[default]
    Idle,
    Accepting,
    Connected,
    /// The client vanished; the server has not recycled the instance yet
    PeerGone,
}

struct ClientCore {
    inbox: Mutex<ClientInbox>,
    cv: Condvar,
    server: Mutex<Weak<InstanceState>>,
}

impl Default for ClientCore {
    fn default() -> Self {
        Self {
            inbox: Mutex::new(ClientInbox::default()),
            cv: Condvar::new(),
            server: Mutex::new(Weak::new()),
        }
    }
}

#[derive(Default)]
struct ClientInbox {
    messages: VecDeque<Bytes>,
    closed: bool,
}

impl ClientCore {
    fn push_message(&self, message: Bytes) {
        lock(&self.inbox).messages.push_back(message);
        self.cv.notify_all();
    }

    fn close(&self) {
        lock(&self.inbox).closed = true;
        self.cv.notify_all();
    }
}

/// Pair an accepting instance with a client and post the connect
/// completion (zero bytes, read direction).
fn attach(state: &Arc<InstanceState>, client: Arc<ClientCore>) {
    {
        let mut io = lock(&state.io);
        io.phase = Phase::Connected;
        io.client = Some(Arc::clone(&client));
        io.inbound.clear();
        io.cursor = 0;
        io.read_armed = false;
        io.outgoing.clear();
    }
    *lock(&client.server) = Arc::downgrade(state);
    trace!("[MEM] paired client with instance key {}", state.key);
    state.port.core.push(Completion {
        key: state.key,
        bytes: 0,
        op: Some(OpKind::Read),
        status: CompletionStatus::Ok,
    });
}

/// Satisfy an armed read from the head of the inbound queue.
///
/// Delivers at most `buffer_size` bytes; a truncated delivery leaves the
/// remainder at the head and signals more data.
fn deliver_read(state: &InstanceState, io: &mut InstanceIo) {
    let Some(message) = io.inbound.front().cloned() else {
        return;
    };
    let take = (message.len() - io.cursor).min(state.buffer_size);
    io.last_read.clear();
    io.last_read.extend_from_slice(&message[io.cursor..io.cursor + take]);
    io.cursor += take;

    let status = if io.cursor >= message.len() {
        io.inbound.pop_front();
        io.cursor = 0;
        CompletionStatus::Ok
    } else {
        CompletionStatus::MoreData
    };
    state.port.core.push(Completion {
        key: state.key,
        bytes: take,
        op: Some(OpKind::Read),
        status,
    });
}

impl PipeDriver for MemoryDriver {
    type Port = MemoryPort;
    type Instance = MemoryInstance;

    fn create_port(&self) -> Result<MemoryPort, PipeError> {
        Ok(MemoryPort::default())
    }

    fn create_instance(
        &self,
        port: &MemoryPort,
        key: u64,
        config: &ServerConfig,
    ) -> Result<MemoryInstance, PipeError> {
        if config.buffer_size == 0 {
            return Err(PipeError::NamedPipeCreateFailed);
        }
        let endpoint = self.registry.endpoint(&config.endpoint_name);
        Ok(MemoryInstance {
            state: Arc::new(InstanceState {
                key,
                buffer_size: config.buffer_size,
                endpoint,
                port: port.clone(),
                io: Mutex::new(InstanceIo::default()),
            }),
        })
    }

    fn connect(&self, _port: &MemoryPort, instance: &mut MemoryInstance) -> Result<(), PipeError> {
        let state = &instance.state;
        let adopted = {
            let mut endpoint = lock(&state.endpoint.inner);
            if let Some(client) = endpoint.waiting_clients.pop_front() {
                Some(client)
            } else {
                lock(&state.io).phase = Phase::Accepting;
                endpoint.accepting.push(Arc::clone(state));
                None
            }
        };
        match adopted {
            // A client beat us here: satisfy the connect immediately, the
            // same way an already-connected instance posts its own
            // completion.
            Some(client) => attach(state, client),
            None => state.endpoint.cv.notify_all(),
        }
        Ok(())
    }

    fn start_read(&self, instance: &mut MemoryInstance) -> StartIo {
        let state = &instance.state;
        let mut io = lock(&state.io);
        match io.phase {
            Phase::Connected => {
                if io.inbound.is_empty() {
                    io.read_armed = true;
                } else {
                    deliver_read(state, &mut io);
                }
                StartIo::Pending
            }
            // Buffered data survives the peer; drain it before reporting
            // the break.
            Phase::PeerGone if !io.inbound.is_empty() => {
                deliver_read(state, &mut io);
                StartIo::Pending
            }
            Phase::PeerGone => StartIo::Broken,
            Phase::Idle | Phase::Accepting => StartIo::NoData,
        }
    }

    fn read_into(&self, instance: &mut MemoryInstance, len: usize, dst: &mut BytesMut) {
        let io = lock(&instance.state.io);
        let take = len.min(io.last_read.len());
        dst.extend_from_slice(&io.last_read[..take]);
    }

    fn start_write(&self, instance: &mut MemoryInstance, chunk: &[u8], last: bool) -> StartIo {
        let state = &instance.state;
        let mut io = lock(&state.io);
        if io.phase != Phase::Connected {
            return StartIo::Broken;
        }
        io.outgoing.extend_from_slice(chunk);
        if last {
            let message = io.outgoing.split().freeze();
            let Some(client) = io.client.clone() else {
                return StartIo::Broken;
            };
            client.push_message(message);
        }
        state.port.core.push(Completion {
            key: state.key,
            bytes: chunk.len(),
            op: Some(OpKind::Write),
            status: CompletionStatus::Ok,
        });
        StartIo::Pending
    }

    fn post(&self, port: &MemoryPort, key: u64) -> Result<(), PipeError> {
        port.core.push(Completion {
            key,
            bytes: 0,
            op: None,
            status: CompletionStatus::Ok,
        });
        Ok(())
    }

    fn wait(&self, port: &MemoryPort) -> Wait {
        let mut queue = lock(&port.core.queue);
        loop {
            if let Some(completion) = queue.pop_front() {
                return Wait::Completion(completion);
            }
            queue = port
                .core
                .cv
                .wait(queue)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn cancel_io(&self, instance: &mut MemoryInstance) {
        let state = &instance.state;
        lock(&state.io).read_armed = false;
        // Purge undelivered completions so a recycled slot never sees a
        // stale packet from the previous session.
        let mut queue = lock(&state.port.core.queue);
        queue.retain(|completion| completion.key != state.key || completion.op.is_none());
    }

    fn disconnect(&self, instance: &mut MemoryInstance) {
        let state = &instance.state;
        let client = {
            let mut io = lock(&state.io);
            io.phase = Phase::Idle;
            io.inbound.clear();
            io.cursor = 0;
            io.read_armed = false;
            io.outgoing.clear();
            io.client.take()
        };
        if let Some(client) = client {
            *lock(&client.server) = Weak::new();
            client.close();
        }
        let mut endpoint = lock(&state.endpoint.inner);
        endpoint
            .accepting
            .retain(|accepting| !Arc::ptr_eq(accepting, state));
    }
}

/// Test-and-demo client side of a [`MemoryDriver`] endpoint.
pub struct MemoryClient {
    core: Arc<ClientCore>,
}

impl MemoryClient {
    /// Connect to a named endpoint, waiting up to five seconds for the
    /// server to offer an instance.
    pub fn connect(driver: &MemoryDriver, endpoint_name: &str) -> Result<Self, PipeError> {
        let endpoint = driver.registry.endpoint(endpoint_name);
        let core = Arc::new(ClientCore::default());
        let deadline = Instant::now() + CONNECT_TIMEOUT;

        let mut inner = lock(&endpoint.inner);
        loop {
            if !inner.accepting.is_empty() {
                let state = inner.accepting.remove(0);
                drop(inner);
                attach(&state, Arc::clone(&core));
                return Ok(Self { core });
            }

            if !inner
                .waiting_clients
                .iter()
                .any(|waiting| Arc::ptr_eq(waiting, &core))
            {
                inner.waiting_clients.push_back(Arc::clone(&core));
            }

            let now = Instant::now();
            if now >= deadline {
                inner
                    .waiting_clients
                    .retain(|waiting| !Arc::ptr_eq(waiting, &core));
                return Err(PipeError::NotConnected);
            }
            let (guard, _timeout) = endpoint
                .cv
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            inner = guard;

            // An instance may have adopted us from the waiting list while
            // we slept.
            if lock(&core.server).upgrade().is_some() {
                inner
                    .waiting_clients
                    .retain(|waiting| !Arc::ptr_eq(waiting, &core));
                return Ok(Self { core });
            }
        }
    }

    /// Send one message to the server.
    pub fn send(&self, payload: impl Into<Bytes>) -> Result<(), PipeError> {
        let payload = payload.into();
        let state = lock(&self.core.server)
            .upgrade()
            .ok_or(PipeError::BrokenPipe)?;
        let mut io = lock(&state.io);
        if io.phase != Phase::Connected {
            return Err(PipeError::BrokenPipe);
        }
        io.inbound.push_back(payload);
        if io.read_armed {
            io.read_armed = false;
            deliver_read(&state, &mut io);
        }
        Ok(())
    }

    /// Receive one message, blocking until data arrives or the connection
    /// closes. Returns `None` on end of stream.
    pub fn recv(&self) -> Option<Bytes> {
        let mut inbox = lock(&self.core.inbox);
        loop {
            if let Some(message) = inbox.messages.pop_front() {
                return Some(message);
            }
            if inbox.closed {
                return None;
            }
            inbox = self
                .core
                .cv
                .wait(inbox)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Receive with a timeout. Returns `None` on end of stream or timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Bytes> {
        let deadline = Instant::now() + timeout;
        let mut inbox = lock(&self.core.inbox);
        loop {
            if let Some(message) = inbox.messages.pop_front() {
                return Some(message);
            }
            if inbox.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _timeout) = self
                .core
                .cv
                .wait_timeout(inbox, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            inbox = guard;
        }
    }

    /// Whether the server side still considers this client attached.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        match lock(&self.core.server).upgrade() {
            Some(state) => lock(&state.io).phase == Phase::Connected,
            None => false,
        }
    }

    /// Drop the connection from the client side.
    ///
    /// The server observes a broken pipe on its next read or write.
    pub fn disconnect(&self) {
        let server = {
            let mut server = lock(&self.core.server);
            std::mem::replace(&mut *server, Weak::new())
        };
        if let Some(state) = server.upgrade() {
            let armed = {
                let mut io = lock(&state.io);
                let ours = io
                    .client
                    .as_ref()
                    .is_some_and(|client| Arc::ptr_eq(client, &self.core));
                if !ours {
                    return;
                }
                io.client = None;
                io.phase = Phase::PeerGone;
                std::mem::replace(&mut io.read_armed, false)
            };
            if armed {
                state.port.core.push(Completion {
                    key: state.key,
                    bytes: 0,
                    op: Some(OpKind::Read),
                    status: CompletionStatus::BrokenPipe,
                });
            }
        }
        self.core.close();
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::CompletionKey;

    fn config(buffer: usize) -> ServerConfig {
        ServerConfig::new("mem-test").with_buffer_size(buffer)
    }

    #[test]
    fn connect_pairs_and_posts_zero_byte_read() {
        let driver = MemoryDriver::default();
        let port = driver.create_port().unwrap();
        let key = CompletionKey::Io(0).encode();
        let mut instance = driver.create_instance(&port, key, &config(64)).unwrap();
        driver.connect(&port, &mut instance).unwrap();

        let driver_for_client = driver.clone();
        let client = std::thread::spawn(move || {
            MemoryClient::connect(&driver_for_client, "mem-test").unwrap()
        });

        let Wait::Completion(completion) = driver.wait(&port) else {
            panic!("expected a completion");
        };
        assert_eq!(completion.key, key);
        assert_eq!(completion.bytes, 0);
        assert_eq!(completion.op, Some(OpKind::Read));
        assert_eq!(completion.status, CompletionStatus::Ok);
        drop(client.join().unwrap());
    }

    #[test]
    fn oversized_message_is_chunked_with_more_data() {
        let driver = MemoryDriver::default();
        let port = driver.create_port().unwrap();
        let key = CompletionKey::Io(1).encode();
        let mut instance = driver.create_instance(&port, key, &config(4)).unwrap();
        driver.connect(&port, &mut instance).unwrap();
        let client = MemoryClient::connect(&driver, "mem-test").unwrap();
        let Wait::Completion(_connect) = driver.wait(&port) else {
            panic!("expected connect completion");
        };

        client.send(Bytes::from_static(b"0123456789")).unwrap();

        let mut assembled = BytesMut::new();
        let mut statuses = Vec::new();
        loop {
            assert_eq!(driver.start_read(&mut instance), StartIo::Pending);
            let Wait::Completion(completion) = driver.wait(&port) else {
                panic!("expected read completion");
            };
            driver.read_into(&mut instance, completion.bytes, &mut assembled);
            statuses.push(completion.status.clone());
            if completion.status == CompletionStatus::Ok {
                break;
            }
        }

        assert_eq!(&assembled[..], b"0123456789");
        assert_eq!(
            statuses,
            vec![
                CompletionStatus::MoreData,
                CompletionStatus::MoreData,
                CompletionStatus::Ok,
            ]
        );
    }

    #[test]
    fn chunked_write_is_one_client_message() {
        let driver = MemoryDriver::default();
        let port = driver.create_port().unwrap();
        let key = CompletionKey::Io(2).encode();
        let mut instance = driver.create_instance(&port, key, &config(4)).unwrap();
        driver.connect(&port, &mut instance).unwrap();
        let client = MemoryClient::connect(&driver, "mem-test").unwrap();
        let Wait::Completion(_connect) = driver.wait(&port) else {
            panic!("expected connect completion");
        };

        assert_eq!(
            driver.start_write(&mut instance, b"abcd", false),
            StartIo::Pending
        );
        assert!(client.recv_timeout(Duration::from_millis(50)).is_none());
        assert_eq!(
            driver.start_write(&mut instance, b"ef", true),
            StartIo::Pending
        );
        assert_eq!(
            client.recv_timeout(Duration::from_secs(1)).as_deref(),
            Some(&b"abcdef"[..])
        );
    }

    #[test]
    fn client_disconnect_breaks_writes() {
        let driver = MemoryDriver::default();
        let port = driver.create_port().unwrap();
        let key = CompletionKey::Io(3).encode();
        let mut instance = driver.create_instance(&port, key, &config(4)).unwrap();
        driver.connect(&port, &mut instance).unwrap();
        let client = MemoryClient::connect(&driver, "mem-test").unwrap();
        let Wait::Completion(_connect) = driver.wait(&port) else {
            panic!("expected connect completion");
        };

        client.disconnect();
        assert_eq!(driver.start_write(&mut instance, b"x", true), StartIo::Broken);
        assert_eq!(driver.start_read(&mut instance), StartIo::Broken);
    }
}
