//! Bounded-queue and validation behavior of producer-initiated sends.

use manifold_core::config::ServerConfig;
use manifold_core::error::PipeError;
use manifold_core::key::MAX_CLIENTS;
use manifold_core::memory::{MemoryClient, MemoryDriver};
use manifold_core::server::PipeServer;
use std::time::Duration;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

type DoneResult = Result<(), PipeError>;

#[test]
fn queue_full_rejects_overflow() {
    let driver = MemoryDriver::default();
    let server = PipeServer::new(
        driver.clone(),
        ServerConfig::new("bp1").with_buffer_size(64).with_max_pending(2),
    );

    let (result_tx, result_rx) = flume::unbounded();
    server.on_message(move |_client_id, handle, _payload| {
        // The loop is inside this callback, so the pending queue cannot
        // drain between these three submissions.
        for n in 0..3usize {
            let tx = result_tx.clone();
            handle.send(
                vec![b'x'; 16],
                Some(Box::new(move |result: DoneResult| {
                    let _ = tx.send((n, result));
                })),
            );
        }
    });

    server.start(true);

    let client = MemoryClient::connect(&driver, "bp1").expect("connect");
    client.send("go").expect("send");

    let mut results = Vec::new();
    for _ in 0..3 {
        results.push(result_rx.recv_timeout(RECV_TIMEOUT).expect("result"));
    }
    results.sort_by_key(|(n, _)| *n);
    assert_eq!(results[0].1, Ok(()));
    assert_eq!(results[1].1, Ok(()));
    assert_eq!(results[2].1, Err(PipeError::QueueFull));

    // both accepted messages drain once the callback returns
    assert!(client.recv_timeout(RECV_TIMEOUT).is_some());
    assert!(client.recv_timeout(RECV_TIMEOUT).is_some());
    assert!(client.recv_timeout(Duration::from_millis(100)).is_none());

    server.stop();
}

#[test]
fn oversized_message_is_rejected_without_enqueue() {
    let driver = MemoryDriver::default();
    let server = PipeServer::new(
        driver,
        ServerConfig::new("bp2").with_max_message_size(16),
    );

    let (tx, rx) = flume::unbounded();
    server.send_to(
        0,
        vec![0u8; 17],
        Some(Box::new(move |result: DoneResult| {
            let _ = tx.send(result);
        })),
    );
    assert_eq!(
        rx.recv_timeout(RECV_TIMEOUT).expect("result"),
        Err(PipeError::MessageTooLarge)
    );

    // a payload at the limit passes validation (and then fails later for
    // a different reason: the server is not running)
    let (tx, rx) = flume::unbounded();
    server.send_to(
        0,
        vec![0u8; 16],
        Some(Box::new(move |result: DoneResult| {
            let _ = tx.send(result);
        })),
    );
    assert_eq!(
        rx.recv_timeout(RECV_TIMEOUT).expect("result"),
        Err(PipeError::ServerStopped)
    );
}

#[test]
fn out_of_range_client_id_is_rejected() {
    let driver = MemoryDriver::default();
    let server = PipeServer::new(driver, ServerConfig::new("bp3"));

    let (tx, rx) = flume::unbounded();
    server.send_to(
        MAX_CLIENTS,
        "late",
        Some(Box::new(move |result: DoneResult| {
            let _ = tx.send(result);
        })),
    );
    assert_eq!(
        rx.recv_timeout(RECV_TIMEOUT).expect("result"),
        Err(PipeError::ClientIndexOutOfRange)
    );

    let (tx, rx) = flume::unbounded();
    server.close(
        MAX_CLIENTS,
        Some(Box::new(move |result: DoneResult| {
            let _ = tx.send(result);
        })),
    );
    assert_eq!(
        rx.recv_timeout(RECV_TIMEOUT).expect("result"),
        Err(PipeError::ClientIndexOutOfRange)
    );
}

#[test]
fn send_to_listening_slot_reports_not_connected() {
    let driver = MemoryDriver::default();
    let server = PipeServer::new(driver, ServerConfig::new("bp4"));

    let (started_tx, started_rx) = flume::unbounded();
    server.on_start(move |_config| {
        let _ = started_tx.send(());
    });
    server.start(true);
    started_rx.recv_timeout(RECV_TIMEOUT).expect("started");

    let (tx, rx) = flume::unbounded();
    server.send_to(
        0,
        "nobody home",
        Some(Box::new(move |result: DoneResult| {
            let _ = tx.send(result);
        })),
    );
    assert_eq!(
        rx.recv_timeout(RECV_TIMEOUT).expect("result"),
        Err(PipeError::NotConnected)
    );

    server.stop();
}
