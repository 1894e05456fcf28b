//! Smoke test of the public surface over the in-process transport.

use manifold::{MemoryClient, MemoryDriver, MemoryServer, ServerConfig, ServerEventHandler};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct CountingHandler {
    connects: Arc<Mutex<usize>>,
}

impl ServerEventHandler for CountingHandler {
    fn on_connected(&mut self, _client_id: usize, _handle: &manifold::ClientHandle) {
        *self.connects.lock().unwrap() += 1;
    }
}

#[test]
fn echo_and_handler_through_reexports() {
    let driver = MemoryDriver::default();
    let server = MemoryServer::new(driver.clone(), ServerConfig::new("facade"));

    let connects = Arc::new(Mutex::new(0));
    server.set_handler(CountingHandler {
        connects: Arc::clone(&connects),
    });
    server.on_message(|_client_id, handle, payload| {
        handle.send(payload.clone(), None);
    });

    server.start(true);

    let client = MemoryClient::connect(&driver, "facade").expect("connect");
    client.send("ping").expect("send");
    let reply = client.recv_timeout(RECV_TIMEOUT).expect("reply");
    assert_eq!(&reply[..], b"ping");

    assert_eq!(server.connection_count(), 1);
    assert_eq!(*connects.lock().unwrap(), 1);

    server.send_all("broadcast");
    let broadcast = client.recv_timeout(RECV_TIMEOUT).expect("broadcast");
    assert_eq!(&broadcast[..], b"broadcast");

    server.stop();
    assert_eq!(server.connection_count(), 0);
}
