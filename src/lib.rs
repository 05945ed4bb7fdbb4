//! memcore - the memory-resource core of a small multiprocessor kernel.
//!
//! Two independent resource managers:
//! - [`cache::BufCache`]: a sharded cache of disk-block-backed buffer slots
//!   with exact per-shard LRU reuse and cross-shard stealing.
//! - [`frame::FrameAllocator`]: a reference-counted physical page-frame
//!   allocator supporting copy-on-write sharing.
//!
//! Both manage fixed pools constructed once and living for the process
//! lifetime. Short metadata edits (shard lists, the freelist, refcounts) run
//! under busy-wait locks; slot content is serialized by a blocking lock so a
//! waiter yields its thread across unbounded disk transfers.

pub mod cache;
pub mod error;
pub mod frame;

pub use cache::{
    BlockDevice, BlockGuard, BufCache, CacheConfig, CacheStats, MemDisk, PinnedBlock, BLOCK_SIZE,
};
pub use error::{MemError, Result};
pub use frame::{AllocStats, FrameAllocator, PhysAddr, FRAME_SIZE, FRAME_SIZE_LOG2};

use std::sync::Arc;

/// Both resource managers, constructed once at boot and owned together for
/// the life of the process.
///
/// Nothing is shared with other threads until `new` returns, so pool
/// construction is single-threaded by construction.
#[derive(Debug)]
pub struct MemCore {
    cache: BufCache,
    frames: FrameAllocator,
}

impl MemCore {
    /// Builds the buffer cache over `device` and the frame allocator over
    /// the physical range `[memory_start, memory_end)`.
    ///
    /// # Errors
    ///
    /// Returns [`MemError::InvalidConfig`] if the cache configuration or the
    /// managed memory range is unusable.
    pub fn new(
        config: CacheConfig,
        device: Arc<dyn BlockDevice>,
        memory_start: PhysAddr,
        memory_end: PhysAddr,
    ) -> Result<Self> {
        Ok(Self {
            cache: BufCache::new(config, device)?,
            frames: FrameAllocator::new(memory_start, memory_end)?,
        })
    }

    /// The buffer cache.
    #[must_use]
    pub fn cache(&self) -> &BufCache {
        &self.cache
    }

    /// The page-frame allocator.
    #[must_use]
    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }
}
