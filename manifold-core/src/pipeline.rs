//! Per-slot outbound write pipeline.
//!
//! Each slot transmits at most one chunk at a time: the head of the active
//! queue is copied into the instance's staging buffer in pieces of at most
//! `buffer_size` bytes, and the next chunk is armed only after the
//! previous completion. `writing` is false exactly when the active queue
//! is drained. A command's callback fires exactly once: with `Ok` when the
//! whole payload is on the wire, or with the first error otherwise.
//!
//! A failed chunk drops the remainder of its message; there is no retry
//! after reconnection.

use crate::command::WriteCommand;
use crate::driver::{PipeDriver, StartIo};
use crate::error::PipeError;
use crate::lock;
use crate::slot::{ClientSlot, SlotShared};
use tracing::trace;

/// Move every pending command into the slot's active queue, preserving
/// enqueue order.
pub(crate) fn drain_pending<D: PipeDriver>(shared: &SlotShared, slot: &mut ClientSlot<D>) {
    let mut pending = lock(&shared.pending_writes);
    slot.active_writes.extend(pending.drain(..));
}

/// Arm the next chunk of the active head, retiring unsendable commands.
pub(crate) fn pump<D: PipeDriver>(driver: &D, buffer_size: usize, slot: &mut ClientSlot<D>) {
    loop {
        if slot.active_writes.is_empty() {
            slot.writing = false;
            return;
        }
        if !slot.connected {
            if let Some(command) = slot.active_writes.pop_front() {
                command.complete(Err(PipeError::NotConnected));
            }
            continue;
        }
        if slot.instance.is_none() {
            if let Some(command) = slot.active_writes.pop_front() {
                command.complete(Err(PipeError::InvalidPipeHandle));
            }
            continue;
        }

        let (chunk, last) = {
            let Some(head) = slot.active_writes.front_mut() else {
                continue;
            };
            let offset = head.sent;
            let take = head.remaining().min(buffer_size);
            let last = offset + take >= head.payload.len();
            let chunk = head.payload.slice(offset..offset + take);
            // Advance optimistically; the completion handler pops the head
            // only once the whole payload has been accepted.
            head.sent += take;
            (chunk, last)
        };

        let Some(instance) = slot.instance.as_mut() else {
            continue;
        };
        match driver.start_write(instance, &chunk, last) {
            StartIo::Pending => {
                trace!(
                    "[PIPE] slot {} armed {} byte chunk (last={last})",
                    slot.index,
                    chunk.len()
                );
                slot.writing = true;
                return;
            }
            StartIo::Broken | StartIo::NoData => {
                if let Some(command) = slot.active_writes.pop_front() {
                    command.complete(Err(PipeError::BrokenPipe));
                }
                slot.writing = false;
                return;
            }
            StartIo::Err(error) => {
                if let Some(command) = slot.active_writes.pop_front() {
                    command.complete(Err(error));
                }
                slot.writing = false;
                return;
            }
        }
    }
}

/// Handle one write completion: retire the head if it is fully sent, then
/// arm the next chunk.
pub(crate) fn on_write_complete<D: PipeDriver>(
    driver: &D,
    buffer_size: usize,
    slot: &mut ClientSlot<D>,
) {
    let finished = slot
        .active_writes
        .front()
        .is_some_and(WriteCommand::is_finished);
    if finished {
        if let Some(command) = slot.active_writes.pop_front() {
            command.complete(Ok(()));
        }
    }
    pump(driver, buffer_size, slot);
}

/// Fail every command in the slot's active queue.
pub(crate) fn fail_active<D: PipeDriver>(slot: &mut ClientSlot<D>, error: &PipeError) {
    while let Some(command) = slot.active_writes.pop_front() {
        command.complete(Err(error.clone()));
    }
    slot.writing = false;
}

/// Fail every command and close callback still queued on the shared half.
pub(crate) fn fail_queued(shared: &SlotShared, error: &PipeError) {
    let drained: Vec<WriteCommand> = {
        let mut pending = lock(&shared.pending_writes);
        pending.drain(..).collect()
    };
    for command in drained {
        command.complete(Err(error.clone()));
    }

    let closes: Vec<Option<crate::command::DoneCallback>> = {
        let mut pending = lock(&shared.pending_closes);
        pending.drain(..).collect()
    };
    for on_done in closes.into_iter().flatten() {
        on_done(Err(error.clone()));
    }
}
