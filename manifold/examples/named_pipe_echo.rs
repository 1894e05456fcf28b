//! Native named-pipe echo server; connect with any client that opens
//! `\\.\pipe\ExamplePipe` in message mode.

#[cfg(windows)]
fn main() {
    use manifold::{IocpDriver, NamedPipeServer, ServerConfig};

    manifold::dev_tracing::init_tracing();

    let config = ServerConfig::new("ExamplePipe").with_buffer_size(1024);
    let server = NamedPipeServer::new(IocpDriver::new(), config);

    server.on_connected(|client_id, _handle| {
        println!("client({client_id}) connected");
    });
    server.on_disconnected(|client_id, _error| {
        println!("client({client_id}) disconnected");
    });
    server.on_message(|client_id, handle, payload| {
        println!("client({client_id}) sent {} bytes", payload.len());
        let mut reply = b"Echo: ".to_vec();
        reply.extend_from_slice(payload);
        handle.send(reply, None);
    });
    server.on_error(|error| eprintln!("error: {error}"));

    println!("Press Enter to stop the server...");
    server.start(true);

    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);

    server.stop();
}

#[cfg(not(windows))]
fn main() {
    eprintln!("this example needs the native named-pipe transport; try callback_echo instead");
}
