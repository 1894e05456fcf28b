//! Echo server with typed callbacks, running against the in-process
//! transport so it works on every platform.

use manifold::{MemoryClient, MemoryDriver, PipeServer, ServerConfig, MAX_CLIENTS};
use std::time::Duration;

fn main() {
    manifold::dev_tracing::init_tracing();

    let driver = MemoryDriver::default();
    let config = ServerConfig::new("example-pipe").with_buffer_size(1024);
    let server = PipeServer::new(driver.clone(), config);

    server.on_connected(|client_id, _handle| {
        println!("client({client_id}) connected");
    });
    server.on_disconnected(|client_id, error| match error {
        Some(error) => println!("client({client_id}) disconnected: {error}"),
        None => println!("client({client_id}) disconnected"),
    });

    let mut message_counters = [0u32; MAX_CLIENTS];
    server.on_message(move |client_id, handle, payload| {
        println!(
            "client({client_id}) sent: {}",
            String::from_utf8_lossy(payload)
        );

        // Echo the message back
        let mut reply = b"Echo: ".to_vec();
        reply.extend_from_slice(payload);
        handle.send(reply, None);

        // Disconnect after 10 messages
        message_counters[client_id] += 1;
        if message_counters[client_id] >= 10 {
            handle.close(None);
        }
    });

    server.on_start(|config| println!("server started on pipe: {}", config.endpoint_name));
    server.on_stop(|_config| println!("server stopped"));
    server.on_error(|error| eprintln!("error: {error}"));

    server.start(true);

    let client = MemoryClient::connect(&driver, "example-pipe").expect("connect");
    for n in 1..=10 {
        client.send(format!("msg-{n}")).expect("send");
        if let Some(reply) = client.recv_timeout(Duration::from_secs(1)) {
            println!("reply: {}", String::from_utf8_lossy(&reply));
        }
    }

    server.stop();
}
