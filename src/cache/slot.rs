//! Buffer slot holding one cached disk block.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::cache::BLOCK_SIZE;

/// One entry in the buffer-slot arena.
///
/// The payload sits behind the slot's blocking content lock; whoever holds
/// that lock owns the bytes. The validity flag says whether the payload holds
/// real disk content or is uninitialized after a recycle. It is cleared under
/// the shard lock when the slot is given a new identity and set under the
/// content lock once the disk fetch completes, so it lives in an atomic
/// rather than under either lock.
#[derive(Debug)]
pub(crate) struct Slot {
    data: Mutex<Box<[u8; BLOCK_SIZE]>>,
    valid: AtomicBool,
}

impl Slot {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(Box::new([0u8; BLOCK_SIZE])),
            valid: AtomicBool::new(false),
        }
    }

    /// Acquires the content lock, blocking until it is available.
    pub fn lock(&self) -> MutexGuard<'_, Box<[u8; BLOCK_SIZE]>> {
        self.data.lock()
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn set_valid(&self) {
        self.valid.store(true, Ordering::Release);
    }

    /// Marks the payload as uninitialized for a new identity.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_slot_invalid() {
        let slot = Slot::new();
        assert!(!slot.is_valid());
        assert!(slot.lock().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_valid_flag_round_trip() {
        let slot = Slot::new();
        slot.set_valid();
        assert!(slot.is_valid());
        slot.invalidate();
        assert!(!slot.is_valid());
    }

    #[test]
    fn test_content_survives_lock_cycles() {
        let slot = Slot::new();
        slot.lock()[7] = 0xAB;
        assert_eq!(slot.lock()[7], 0xAB);
    }
}
