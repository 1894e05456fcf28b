//! Native Windows transport: named pipes driven through an I/O completion
//! port.
//!
//! Each instance is created in duplex, overlapped, message mode with
//! message-read semantics and associated with the phase's completion port
//! under its slot key. The two overlapped state blocks per instance carry
//! a direction tag so a dequeued completion can be routed without
//! consulting the instance.
//!
//! All unsafe in the workspace lives in this module; the state an
//! operation references (buffers and overlapped blocks) is boxed inside
//! the instance, which the event loop keeps alive until cancellation and
//! disconnect are done.

use manifold_core::config::ServerConfig;
use manifold_core::driver::{
    Completion, CompletionStatus, OpKind, PipeDriver, StartIo, Wait,
};
use manifold_core::error::PipeError;

use bytes::BytesMut;
use std::os::windows::ffi::OsStrExt;
use std::sync::Arc;
use tracing::trace;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ABANDONED_WAIT_0, ERROR_BROKEN_PIPE, ERROR_INVALID_HANDLE,
    ERROR_IO_PENDING, ERROR_MORE_DATA, ERROR_NO_DATA, ERROR_OPERATION_ABORTED,
    ERROR_PIPE_CONNECTED, ERROR_PIPE_LISTENING, ERROR_PIPE_NOT_CONNECTED, HANDLE,
    INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    ReadFile, WriteFile, FILE_FLAG_OVERLAPPED, PIPE_ACCESS_DUPLEX,
};
use windows_sys::Win32::System::Pipes::{
    ConnectNamedPipe, CreateNamedPipeW, DisconnectNamedPipe, PIPE_READMODE_MESSAGE,
    PIPE_TYPE_MESSAGE, PIPE_UNLIMITED_INSTANCES, PIPE_WAIT,
};
use windows_sys::Win32::System::IO::{
    CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatus, PostQueuedCompletionStatus,
    OVERLAPPED,
};

/// Completion-port driver for Windows named pipes.
#[derive(Clone, Copy, Default)]
pub struct IocpDriver;

impl IocpDriver {
    pub fn new() -> Self {
        Self
    }
}

struct OwnedPort(usize);

impl Drop for OwnedPort {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0 as HANDLE);
        }
    }
}

/// Shared reference to one completion port.
#[derive(Clone)]
pub struct IocpPort(Arc<OwnedPort>);

impl IocpPort {
    fn raw(&self) -> HANDLE {
        self.0 .0 as HANDLE
    }
}

/// Overlapped block tagged with its direction so completions can be
/// routed straight from the dequeued pointer.
#[repr(C)]
struct TaggedOverlapped {
    raw: OVERLAPPED,
    kind: OpKind,
}

impl TaggedOverlapped {
    fn new(kind: OpKind) -> Box<Self> {
        Box::new(Self {
            raw: unsafe { std::mem::zeroed() },
            kind,
        })
    }

    fn rearm(&mut self) {
        self.raw = unsafe { std::mem::zeroed() };
    }
}

/// One instance of the endpoint.
///
/// Owns the pipe handle, both overlapped blocks, and the staging buffers,
/// so nothing an in-flight operation references can move or drop early.
pub struct IocpInstance {
    handle: usize,
    key: u64,
    read_over: Box<TaggedOverlapped>,
    write_over: Box<TaggedOverlapped>,
    read_buf: Box<[u8]>,
    staging: Box<[u8]>,
}

// Only the loop thread drives an instance; the raw pointers inside the
// overlapped blocks never cross threads while an operation is in flight.
unsafe impl Send for IocpInstance {}

impl Drop for IocpInstance {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.handle as HANDLE);
        }
    }
}

fn pipe_path(endpoint_name: &str) -> Vec<u16> {
    let path = format!(r"\\.\pipe\{endpoint_name}");
    std::ffi::OsStr::new(&path)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

fn last_os_error() -> PipeError {
    PipeError::Os(unsafe { GetLastError() } as i32)
}

fn start_status(code: u32) -> StartIo {
    match code {
        ERROR_IO_PENDING | ERROR_MORE_DATA => StartIo::Pending,
        ERROR_BROKEN_PIPE | ERROR_PIPE_NOT_CONNECTED => StartIo::Broken,
        ERROR_NO_DATA => StartIo::NoData,
        code => StartIo::Err(PipeError::Os(code as i32)),
    }
}

impl PipeDriver for IocpDriver {
    type Port = IocpPort;
    type Instance = IocpInstance;

    fn create_port(&self) -> Result<IocpPort, PipeError> {
        // 0 for the existing-port argument asks for a fresh port.
        let handle = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, 0, 0, 0) };
        if handle == 0 {
            return Err(PipeError::IoCompletionPortCreateFailed);
        }
        Ok(IocpPort(Arc::new(OwnedPort(handle as usize))))
    }

    fn create_instance(
        &self,
        port: &IocpPort,
        key: u64,
        config: &ServerConfig,
    ) -> Result<IocpInstance, PipeError> {
        if config.buffer_size == 0 || config.buffer_size > u32::MAX as usize {
            return Err(PipeError::NamedPipeCreateFailed);
        }
        let path = pipe_path(&config.endpoint_name);
        let buffer = config.buffer_size as u32;
        let timeout = config.instance_timeout.as_millis().min(u32::MAX as u128) as u32;

        let handle = unsafe {
            CreateNamedPipeW(
                path.as_ptr(),
                PIPE_ACCESS_DUPLEX | FILE_FLAG_OVERLAPPED,
                PIPE_TYPE_MESSAGE | PIPE_READMODE_MESSAGE | PIPE_WAIT,
                PIPE_UNLIMITED_INSTANCES,
                buffer,
                buffer,
                timeout,
                std::ptr::null(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(PipeError::NamedPipeCreateFailed);
        }

        let associated = unsafe { CreateIoCompletionPort(handle, port.raw(), key as usize, 0) };
        if associated == 0 {
            unsafe {
                CloseHandle(handle);
            }
            return Err(PipeError::IoCompletionPortCreateFailed);
        }

        Ok(IocpInstance {
            handle: handle as usize,
            key,
            read_over: TaggedOverlapped::new(OpKind::Read),
            write_over: TaggedOverlapped::new(OpKind::Write),
            read_buf: vec![0u8; config.buffer_size].into_boxed_slice(),
            staging: vec![0u8; config.buffer_size].into_boxed_slice(),
        })
    }

    fn connect(&self, port: &IocpPort, instance: &mut IocpInstance) -> Result<(), PipeError> {
        instance.read_over.rearm();
        let connected = unsafe {
            ConnectNamedPipe(instance.handle as HANDLE, &mut instance.read_over.raw)
        };
        if connected != 0 {
            // Synchronous success: surface it through the port like the
            // pending path would.
            return post_connect_ready(port, instance);
        }
        match unsafe { GetLastError() } {
            ERROR_IO_PENDING | ERROR_PIPE_LISTENING => Ok(()),
            ERROR_PIPE_CONNECTED => post_connect_ready(port, instance),
            code => Err(PipeError::Os(code as i32)),
        }
    }

    fn start_read(&self, instance: &mut IocpInstance) -> StartIo {
        instance.read_over.rearm();
        let ok = unsafe {
            ReadFile(
                instance.handle as HANDLE,
                instance.read_buf.as_mut_ptr(),
                instance.read_buf.len() as u32,
                std::ptr::null_mut(),
                &mut instance.read_over.raw,
            )
        };
        if ok != 0 {
            // The completion is still queued to the port.
            return StartIo::Pending;
        }
        start_status(unsafe { GetLastError() })
    }

    fn read_into(&self, instance: &mut IocpInstance, len: usize, dst: &mut BytesMut) {
        let take = len.min(instance.read_buf.len());
        dst.extend_from_slice(&instance.read_buf[..take]);
    }

    fn start_write(&self, instance: &mut IocpInstance, chunk: &[u8], _last: bool) -> StartIo {
        let len = chunk.len().min(instance.staging.len());
        instance.staging[..len].copy_from_slice(&chunk[..len]);
        instance.write_over.rearm();
        let ok = unsafe {
            WriteFile(
                instance.handle as HANDLE,
                instance.staging.as_ptr(),
                len as u32,
                std::ptr::null_mut(),
                &mut instance.write_over.raw,
            )
        };
        if ok != 0 {
            return StartIo::Pending;
        }
        start_status(unsafe { GetLastError() })
    }

    fn post(&self, port: &IocpPort, key: u64) -> Result<(), PipeError> {
        let posted = unsafe {
            PostQueuedCompletionStatus(port.raw(), 0, key as usize, std::ptr::null_mut())
        };
        if posted == 0 {
            return Err(last_os_error());
        }
        Ok(())
    }

    fn wait(&self, port: &IocpPort) -> Wait {
        let mut bytes: u32 = 0;
        let mut key: usize = 0;
        let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();
        let ok = unsafe {
            GetQueuedCompletionStatus(port.raw(), &mut bytes, &mut key, &mut overlapped, u32::MAX)
        };

        if overlapped.is_null() {
            if ok != 0 {
                // A synthetic command post carries no overlapped state.
                return Wait::Completion(Completion {
                    key: key as u64,
                    bytes: bytes as usize,
                    op: None,
                    status: CompletionStatus::Ok,
                });
            }
            return match unsafe { GetLastError() } {
                ERROR_ABANDONED_WAIT_0 | ERROR_INVALID_HANDLE => Wait::Closed,
                code => Wait::QueueError(PipeError::Os(code as i32)),
            };
        }

        let kind = unsafe { (*(overlapped as *mut TaggedOverlapped)).kind };
        let status = if ok != 0 {
            CompletionStatus::Ok
        } else {
            match unsafe { GetLastError() } {
                ERROR_MORE_DATA => CompletionStatus::MoreData,
                ERROR_BROKEN_PIPE | ERROR_PIPE_NOT_CONNECTED | ERROR_NO_DATA => {
                    CompletionStatus::BrokenPipe
                }
                ERROR_OPERATION_ABORTED => CompletionStatus::Cancelled,
                code => CompletionStatus::Failed(PipeError::Os(code as i32)),
            }
        };
        trace!("[IOCP] completion key={key} bytes={bytes} kind={kind:?}");
        Wait::Completion(Completion {
            key: key as u64,
            bytes: bytes as usize,
            op: Some(kind),
            status,
        })
    }

    fn cancel_io(&self, instance: &mut IocpInstance) {
        unsafe {
            CancelIoEx(instance.handle as HANDLE, std::ptr::null_mut());
        }
    }

    fn disconnect(&self, instance: &mut IocpInstance) {
        unsafe {
            DisconnectNamedPipe(instance.handle as HANDLE);
        }
    }
}

/// Queue the zero-byte read-direction completion that stands in for an
/// already-satisfied connect.
fn post_connect_ready(port: &IocpPort, instance: &mut IocpInstance) -> Result<(), PipeError> {
    let posted = unsafe {
        PostQueuedCompletionStatus(
            port.raw(),
            0,
            instance.key as usize,
            &mut instance.read_over.raw,
        )
    };
    if posted == 0 {
        return Err(last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_path_is_nul_terminated_utf16() {
        let path = pipe_path("echo");
        let expected: Vec<u16> = r"\\.\pipe\echo".encode_utf16().chain([0]).collect();
        assert_eq!(path, expected);
    }

    #[test]
    fn start_status_mapping() {
        assert_eq!(start_status(ERROR_IO_PENDING), StartIo::Pending);
        assert_eq!(start_status(ERROR_BROKEN_PIPE), StartIo::Broken);
        assert_eq!(start_status(ERROR_NO_DATA), StartIo::NoData);
        assert_eq!(start_status(5), StartIo::Err(PipeError::Os(5)));
    }
}
