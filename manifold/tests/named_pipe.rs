//! Native named-pipe round trip with a raw Win32 client.

#![cfg(windows)]

use manifold::{IocpDriver, NamedPipeServer, ServerConfig};
use std::os::windows::ffi::OsStrExt;
use std::time::Duration;

use windows_sys::Win32::Foundation::{
    CloseHandle, GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadFile, WriteFile, FILE_ATTRIBUTE_NORMAL, OPEN_EXISTING,
};
use windows_sys::Win32::System::Pipes::{
    SetNamedPipeHandleState, PIPE_READMODE_MESSAGE,
};

struct RawClient(HANDLE);

impl RawClient {
    fn connect(name: &str) -> Self {
        let path: Vec<u16> = std::ffi::OsStr::new(&format!(r"\\.\pipe\{name}"))
            .encode_wide()
            .chain([0])
            .collect();
        let handle = unsafe {
            CreateFileW(
                path.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                0,
                std::ptr::null(),
                OPEN_EXISTING,
                FILE_ATTRIBUTE_NORMAL,
                0,
            )
        };
        assert_ne!(handle, INVALID_HANDLE_VALUE, "client connect failed");

        let mut mode = PIPE_READMODE_MESSAGE;
        let ok = unsafe {
            SetNamedPipeHandleState(handle, &mut mode, std::ptr::null(), std::ptr::null())
        };
        assert_ne!(ok, 0, "failed to switch client to message-read mode");
        Self(handle)
    }

    fn send(&self, payload: &[u8]) {
        let mut written = 0u32;
        let ok = unsafe {
            WriteFile(
                self.0,
                payload.as_ptr(),
                payload.len() as u32,
                &mut written,
                std::ptr::null_mut(),
            )
        };
        assert_ne!(ok, 0, "client write failed");
        assert_eq!(written as usize, payload.len());
    }

    fn recv(&self) -> Vec<u8> {
        let mut buffer = vec![0u8; 64 * 1024];
        let mut read = 0u32;
        let ok = unsafe {
            ReadFile(
                self.0,
                buffer.as_mut_ptr(),
                buffer.len() as u32,
                &mut read,
                std::ptr::null_mut(),
            )
        };
        assert_ne!(ok, 0, "client read failed");
        buffer.truncate(read as usize);
        buffer
    }
}

impl Drop for RawClient {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

#[test]
fn native_echo_round_trip() {
    let server = NamedPipeServer::new(
        IocpDriver::new(),
        ServerConfig::new("manifold-test-pipe").with_buffer_size(1024),
    );

    let (started_tx, started_rx) = flume::unbounded();
    server.on_start(move |_config| {
        let _ = started_tx.send(());
    });
    server.on_message(|_client_id, handle, payload| {
        handle.send(payload.clone(), None);
    });

    server.start(true);
    started_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("server started");

    let client = RawClient::connect("manifold-test-pipe");
    client.send(b"ping over npfs");
    assert_eq!(client.recv(), b"ping over npfs");

    drop(client);
    server.stop();
}
