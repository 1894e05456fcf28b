//! Echo server driven entirely through the universal event sink.

use manifold::{MemoryClient, MemoryDriver, PipeServer, ServerConfig, ServerEvent, MAX_CLIENTS};
use std::time::Duration;

fn main() {
    manifold::dev_tracing::init_tracing();

    let driver = MemoryDriver::default();
    let config = ServerConfig::new("example-pipe").with_buffer_size(1024);
    let server = PipeServer::new(driver.clone(), config);

    let mut message_counters = [0u32; MAX_CLIENTS];
    server.on_event(move |event| match event {
        ServerEvent::ServerStarted { config } => {
            println!("server started on pipe: {}", config.endpoint_name);
        }
        ServerEvent::ServerStopped { .. } => println!("server stopped"),
        ServerEvent::ClientConnected { client_id, .. } => {
            println!("client({client_id}) connected");
        }
        ServerEvent::ClientDisconnected {
            client_id, error, ..
        } => match error {
            Some(error) => println!("client({client_id}) disconnected: {error}"),
            None => println!("client({client_id}) disconnected"),
        },
        ServerEvent::MessageReceived {
            client_id,
            handle,
            payload,
        } => {
            println!(
                "client({client_id}) sent: {}",
                String::from_utf8_lossy(payload)
            );
            let mut reply = b"Echo: ".to_vec();
            reply.extend_from_slice(payload);
            handle.send(reply, None);

            message_counters[*client_id] += 1;
            if message_counters[*client_id] >= 10 {
                handle.close(None);
            }
        }
        ServerEvent::ErrorOccurred { error } => eprintln!("error: {error}"),
    });

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
