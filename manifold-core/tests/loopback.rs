//! End-to-end exchanges over the in-process transport.

use manifold_core::config::ServerConfig;
use manifold_core::key::MAX_CLIENTS;
use manifold_core::memory::{MemoryClient, MemoryDriver};
use manifold_core::server::PipeServer;
use std::collections::HashMap;
use std::time::Duration;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn echo_ten_then_close() {
    let driver = MemoryDriver::default();
    let server = PipeServer::new(
        driver.clone(),
        ServerConfig::new("t1").with_buffer_size(1024),
    );

    let (closed_tx, closed_rx) = flume::unbounded();
    server.on_disconnected(move |client_id, error| {
        let _ = closed_tx.send((client_id, error.cloned()));
    });

    let mut seen = 0u32;
    server.on_message(move |_client_id, handle, payload| {
        let mut reply = b"Echo: ".to_vec();
        reply.extend_from_slice(payload);
        handle.send(reply, None);
        seen += 1;
        if seen == 10 {
            handle.close(None);
        }
    });

    server.start(true);

    let client = MemoryClient::connect(&driver, "t1").expect("connect");
    for n in 1..=10 {
        client.send(format!("msg-{n}")).expect("send");
    }
    for n in 1..=10 {
        let reply = client.recv_timeout(RECV_TIMEOUT).expect("echo reply");
        assert_eq!(&reply[..], format!("Echo: msg-{n}").as_bytes());
    }

    // user-initiated close: end of stream, disconnect carries no error
    assert!(client.recv_timeout(RECV_TIMEOUT).is_none());
    let (client_id, error) = closed_rx.recv_timeout(RECV_TIMEOUT).expect("disconnect");
    assert!(client_id < MAX_CLIENTS);
    assert_eq!(error, None);

    server.stop();
}

#[test]
fn chunked_large_message_round_trip() {
    let driver = MemoryDriver::default();
    let server = PipeServer::new(
        driver.clone(),
        ServerConfig::new("t2").with_buffer_size(4096),
    );

    let (connected_tx, connected_rx) = flume::unbounded();
    server.on_connected(move |client_id, _handle| {
        let _ = connected_tx.send(client_id);
    });
    let (message_tx, message_rx) = flume::unbounded();
    server.on_message(move |client_id, _handle, payload| {
        let _ = message_tx.send((client_id, payload.clone()));
    });

    server.start(true);

    let client = MemoryClient::connect(&driver, "t2").expect("connect");
    let client_id = connected_rx.recv_timeout(RECV_TIMEOUT).expect("connected");

    // outbound: 10000 bytes cross the 4096-byte staging buffer in three
    // chunks but land as one logical message
    let outbound: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let (done_tx, done_rx) = flume::unbounded();
    server.send_to(
        client_id,
        outbound.clone(),
        Some(Box::new(move |result| {
            let _ = done_tx.send(result);
        })),
    );

    let received = client.recv_timeout(RECV_TIMEOUT).expect("one message");
    assert_eq!(received.len(), 10_000);
    assert_eq!(&received[..], &outbound[..]);
    assert_eq!(done_rx.recv_timeout(RECV_TIMEOUT).expect("done"), Ok(()));

    // inbound: a message past the buffer size is reassembled before
    // dispatch
    let inbound: Vec<u8> = (0..9_000u32).map(|i| (i % 13) as u8).collect();
    client.send(inbound.clone()).expect("send");
    let (from, payload) = message_rx.recv_timeout(RECV_TIMEOUT).expect("message");
    assert_eq!(from, client_id);
    assert_eq!(&payload[..], &inbound[..]);

    server.stop();
}

#[test]
fn empty_message_round_trip() {
    let driver = MemoryDriver::default();
    let server = PipeServer::new(driver.clone(), ServerConfig::new("t4").with_buffer_size(64));

    let (message_tx, message_rx) = flume::unbounded();
    server.on_message(move |client_id, _handle, payload| {
        let _ = message_tx.send((client_id, payload.clone()));
    });
    server.start(true);

    let client = MemoryClient::connect(&driver, "t4").expect("connect");
    client.send(Vec::new()).expect("send");
    let (_, payload) = message_rx.recv_timeout(RECV_TIMEOUT).expect("message");
    assert!(payload.is_empty());

    server.stop();
}

#[test]
fn sixteen_clients_preserve_per_client_order() {
    let driver = MemoryDriver::default();
    let server = PipeServer::new(driver.clone(), ServerConfig::new("t3").with_buffer_size(256));

    let (connected_tx, connected_rx) = flume::unbounded();
    server.on_connected(move |client_id, _handle| {
        let _ = connected_tx.send(client_id);
    });
    let (message_tx, message_rx) = flume::unbounded();
    server.on_message(move |client_id, _handle, payload| {
        let _ = message_tx.send((client_id, payload.clone()));
    });

    server.start(true);

    let mut workers = Vec::new();
    for c in 0..16 {
        let driver = driver.clone();
        workers.push(std::thread::spawn(move || {
            let client = MemoryClient::connect(&driver, "t3").expect("connect");
            for m in 0..100 {
                client.send(format!("c{c}-m{m}")).expect("send");
            }
            client
        }));
    }
    let clients: Vec<MemoryClient> = workers
        .into_iter()
        .map(|worker| worker.join().expect("client thread"))
        .collect();

    for _ in 0..16 {
        connected_rx.recv_timeout(RECV_TIMEOUT).expect("connected");
    }

    let mut per_slot: HashMap<usize, Vec<String>> = HashMap::new();
    for _ in 0..1600 {
        let (slot, payload) = message_rx.recv_timeout(RECV_TIMEOUT).expect("message");
        per_slot
            .entry(slot)
            .or_default()
            .push(String::from_utf8(payload.to_vec()).expect("utf8"));
    }
    assert_eq!(per_slot.len(), 16);

    // cross-client interleaving is unspecified; per-slot order must equal
    // send order
    for messages in per_slot.values() {
        assert_eq!(messages.len(), 100);
        let prefix = messages[0]
            .split('-')
            .next()
            .expect("prefix")
            .to_string();
        let expected: Vec<String> = (0..100).map(|m| format!("{prefix}-m{m}")).collect();
        assert_eq!(messages, &expected);
    }

    drop(clients);
    server.stop();
}

#[test]
fn client_disconnect_recycles_the_slot() {
    let driver = MemoryDriver::default();
    let server = PipeServer::new(driver.clone(), ServerConfig::new("t5").with_buffer_size(64));

    let (connected_tx, connected_rx) = flume::unbounded();
    server.on_connected(move |client_id, _handle| {
        let _ = connected_tx.send(client_id);
    });
    let (closed_tx, closed_rx) = flume::unbounded();
    server.on_disconnected(move |client_id, error| {
        let _ = closed_tx.send((client_id, error.cloned()));
    });
    let (message_tx, message_rx) = flume::unbounded();
    server.on_message(move |client_id, _handle, payload| {
        let _ = message_tx.send((client_id, payload.clone()));
    });

    server.start(true);

    let first = MemoryClient::connect(&driver, "t5").expect("connect");
    let first_slot = connected_rx.recv_timeout(RECV_TIMEOUT).expect("connected");
    first.send("hello").expect("send");
    message_rx.recv_timeout(RECV_TIMEOUT).expect("message");

    first.disconnect();
    let (gone_slot, error) = closed_rx.recv_timeout(RECV_TIMEOUT).expect("disconnect");
    assert_eq!(gone_slot, first_slot);
    assert!(error.is_some());

    // the slot re-listens; a new client can use the endpoint again
    let second = MemoryClient::connect(&driver, "t5").expect("reconnect");
    connected_rx.recv_timeout(RECV_TIMEOUT).expect("reconnected");
    second.send("again").expect("send");
    let (_, payload) = message_rx.recv_timeout(RECV_TIMEOUT).expect("message");
    assert_eq!(&payload[..], b"again");

    server.stop();
}
