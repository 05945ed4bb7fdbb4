//! Block device collaborator.
//!
//! The cache performs all block transfers through [`BlockDevice`]; the real
//! driver lives outside this crate. [`MemDisk`] is a RAM-backed
//! implementation used for hosting the cache in tests and tools.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::cache::BLOCK_SIZE;
use crate::error::Result;

/// Synchronous block transfer interface.
///
/// A transfer may take unbounded time; the cache only calls in while holding
/// the affected slot's content lock, never a shard lock.
pub trait BlockDevice: Send + Sync {
    /// Fills `buf` with the content of block `blockno` on device `dev`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer fails; the slot stays invalid.
    fn read_block(&self, dev: u32, blockno: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<()>;

    /// Writes `buf` as the content of block `blockno` on device `dev`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer fails.
    fn write_block(&self, dev: u32, blockno: u32, buf: &[u8; BLOCK_SIZE]) -> Result<()>;
}

/// In-memory block device.
///
/// Blocks that were never written read back as zeroes. Transfer counters let
/// callers observe which operations actually reached the device.
#[derive(Debug, Default)]
pub struct MemDisk {
    blocks: Mutex<HashMap<(u32, u32), Box<[u8; BLOCK_SIZE]>>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemDisk {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of read transfers performed so far.
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of write transfers performed so far.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of blocks that have been written at least once.
    #[must_use]
    pub fn blocks_written(&self) -> usize {
        self.blocks.lock().len()
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, dev: u32, blockno: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        match self.blocks.lock().get(&(dev, blockno)) {
            Some(data) => buf.copy_from_slice(&data[..]),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&self, dev: u32, blockno: u32, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.blocks.lock().insert((dev, blockno), Box::new(*buf));
        Ok(())
    }
}
