//! Packed completion-key command protocol.
//!
//! Commands cross from producer threads into the event loop as synthetic
//! completions. The completion key is a bitwise composition: the low 8 bits
//! carry the slot index (which is why [`MAX_CLIENTS`] must stay at or below
//! 256), and disjoint high bits mark the command type. A real I/O
//! completion carries a pure slot index, so zero high bits distinguish it
//! from every command key.
//!
//! Extending the slot space past 256 requires redesigning this packing.

/// Hard ceiling on concurrently serviced clients.
///
/// Slots are dense and preallocated; the command-key encoding reserves
/// 8 bits for the index.
pub const MAX_CLIENTS: usize = 64;

const SLOT_MASK: u64 = 0xff;
const CMD_SEND: u64 = 1 << 8;
const CMD_CLOSE: u64 = 1 << 9;
const CMD_STOP: u64 = 1 << 10;

/// Decoded completion key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKey {
    /// Real I/O completion for one slot
    Io(usize),
    /// Drain the slot's pending writes and pump the write pipeline
    Send(usize),
    /// Perform a user-requested close of the slot
    Close(usize),
    /// Exit the serve phase
    Stop,
}

impl CompletionKey {
    /// Pack this key into its wire representation.
    #[must_use]
    pub fn encode(self) -> u64 {
        match self {
            Self::Io(slot) => slot as u64,
            Self::Send(slot) => CMD_SEND | slot as u64,
            Self::Close(slot) => CMD_CLOSE | slot as u64,
            Self::Stop => CMD_STOP,
        }
    }

    /// Decode a raw completion key.
    ///
    /// Returns `None` for unknown command bits or an out-of-range slot;
    /// the loop reports those instead of acting on them.
    #[must_use]
    pub fn decode(raw: u64) -> Option<Self> {
        let slot = (raw & SLOT_MASK) as usize;
        let key = match raw & !SLOT_MASK {
            0 => Self::Io(slot),
            CMD_SEND => Self::Send(slot),
            CMD_CLOSE => Self::Close(slot),
            CMD_STOP => return Some(Self::Stop),
            _ => return None,
        };
        if slot >= MAX_CLIENTS {
            return None;
        }
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_keys_are_pure_slot_indices() {
        for slot in [0, 1, MAX_CLIENTS - 1] {
            let raw = CompletionKey::Io(slot).encode();
            assert_eq!(raw, slot as u64);
            assert_eq!(CompletionKey::decode(raw), Some(CompletionKey::Io(slot)));
        }
    }

    #[test]
    fn command_keys_round_trip() {
        let keys = [
            CompletionKey::Send(3),
            CompletionKey::Close(17),
            CompletionKey::Stop,
        ];
        for key in keys {
            assert_eq!(CompletionKey::decode(key.encode()), Some(key));
        }
    }

    #[test]
    fn command_bits_are_disjoint_from_slot_bits() {
        assert_eq!(CMD_SEND & SLOT_MASK, 0);
        assert_eq!(CMD_CLOSE & SLOT_MASK, 0);
        assert_eq!(CMD_STOP & SLOT_MASK, 0);
        assert!(MAX_CLIENTS <= 256);
    }

    #[test]
    fn rejects_unknown_bits_and_bad_slots() {
        assert_eq!(CompletionKey::decode(1 << 20), None);
        assert_eq!(CompletionKey::decode((CMD_SEND | CMD_CLOSE) | 1), None);
        assert_eq!(CompletionKey::decode(MAX_CLIENTS as u64), None);
        assert_eq!(
            CompletionKey::decode(CMD_SEND | MAX_CLIENTS as u64),
            None
        );
    }

    #[test]
    fn stop_ignores_slot_bits() {
        assert_eq!(
            CompletionKey::decode(CMD_STOP | 42),
            Some(CompletionKey::Stop)
        );
    }
}
