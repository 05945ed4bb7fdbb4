//! Sharded buffer cache for disk blocks.
//!
//! A fixed pool of block-sized slots caches copies of disk block contents
//! and gives concurrent callers a synchronization point per block. The pool
//! is partitioned into independently locked shards, each keeping an exact
//! recency list of the slots it owns; the home shard of a block is
//! `blockno % shards`.
//!
//! # Interface
//!
//! - [`BufCache::read`] returns a locked, valid [`BlockGuard`] for a block.
//! - [`BufCache::write`] pushes a guard's content to the device.
//! - Dropping the guard releases the block; at refcount zero the slot moves
//!   to the most-recently-used end of its shard.
//! - [`BufCache::pin`] / [`BufCache::unpin`] keep a slot resident across an
//!   operation sequence without holding its content lock.
//!
//! Only one caller at a time can use a block's content; do not hold guards
//! longer than necessary.

mod device;
mod lru;
mod slot;

pub use device::{BlockDevice, MemDisk};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::MutexGuard;
use spin::Mutex as SpinMutex;

use crate::error::{MemError, Result};
use lru::{Entry, RecencyList};
use slot::Slot;

/// Size of one cached disk block in bytes.
pub const BLOCK_SIZE: usize = 1024;

/// Default number of independently locked shards.
pub const DEFAULT_SHARDS: usize = 13;

/// Default number of buffer slots in the pool.
pub const DEFAULT_SLOTS: usize = 30;

/// Construction parameters for [`BufCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of shards (metadata lock domains).
    pub shards: usize,
    /// Total number of buffer slots, distributed round-robin across shards.
    pub slots: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shards: DEFAULT_SHARDS,
            slots: DEFAULT_SLOTS,
        }
    }
}

/// Sharded cache of disk-block-backed buffer slots.
pub struct BufCache {
    shards: Vec<SpinMutex<RecencyList>>,
    slots: Vec<Slot>,
    device: Arc<dyn BlockDevice>,
    hits: AtomicU64,
    recycles: AtomicU64,
    steals: AtomicU64,
}

impl BufCache {
    /// Builds the pool: every slot is created and linked into a shard's
    /// recency list before any operation can run.
    ///
    /// # Errors
    ///
    /// Returns [`MemError::InvalidConfig`] if the shard count or slot count
    /// is zero.
    pub fn new(config: CacheConfig, device: Arc<dyn BlockDevice>) -> Result<Self> {
        if config.shards == 0 {
            return Err(MemError::InvalidConfig(
                "shard count must be greater than 0".into(),
            ));
        }
        if config.slots == 0 {
            return Err(MemError::InvalidConfig(
                "slot count must be greater than 0".into(),
            ));
        }

        let mut shards: Vec<SpinMutex<RecencyList>> = (0..config.shards)
            .map(|_| SpinMutex::new(RecencyList::new()))
            .collect();

        let slots: Vec<Slot> = (0..config.slots).map(|_| Slot::new()).collect();
        for (i, shard) in (0..config.slots).zip((0..config.shards).cycle()) {
            shards[shard].get_mut().push_front(Entry {
                slot: i,
                dev: 0,
                blockno: 0,
                refcnt: 0,
            });
        }

        info!(
            "buffer cache: {} slots of {} bytes across {} shards",
            config.slots,
            BLOCK_SIZE,
            config.shards
        );

        Ok(Self {
            shards,
            slots,
            device,
            hits: AtomicU64::new(0),
            recycles: AtomicU64::new(0),
            steals: AtomicU64::new(0),
        })
    }

    fn home_shard(&self, blockno: u32) -> usize {
        blockno as usize % self.shards.len()
    }

    /// Looks up the slot caching `(dev, blockno)`, claiming one if absent,
    /// and returns it with the content lock held. Content is not guaranteed
    /// valid; use [`BufCache::read`] for that.
    ///
    /// # Panics
    ///
    /// Panics if every slot in the pool is held (`refcnt > 0`): the pool is
    /// undersized for the concurrent demand and the kernel cannot continue.
    #[must_use]
    pub fn get(&self, dev: u32, blockno: u32) -> BlockGuard<'_> {
        let home = self.home_shard(blockno);
        let shard_count = self.shards.len();
        loop {
            let mut list = self.shards[home].lock();

            // Already cached?
            if let Some(node) = list.find(|e| e.dev == dev && e.blockno == blockno) {
                let entry = list.entry_mut(node);
                entry.refcnt += 1;
                let slot = entry.slot;
                drop(list);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return self.lock_slot(slot, dev, blockno);
            }

            // Not cached. Recycle the least recently used unheld slot of the
            // home shard.
            if let Some(node) = list.rfind(|e| e.refcnt == 0) {
                let entry = list.entry_mut(node);
                entry.dev = dev;
                entry.blockno = blockno;
                entry.refcnt = 1;
                let slot = entry.slot;
                self.slots[slot].invalidate();
                drop(list);
                self.recycles.fetch_add(1, Ordering::Relaxed);
                return self.lock_slot(slot, dev, blockno);
            }

            // Steal from another shard, visiting candidates in ascending
            // order from home+1. Candidate locks are only try-locked, so no
            // shard ever blocks on another while holding its own lock.
            let mut inspected_all = true;
            for step in 1..shard_count {
                let k = (home + step) % shard_count;
                let Some(mut victim) = self.shards[k].try_lock() else {
                    inspected_all = false;
                    continue;
                };
                if let Some(node) = victim.rfind(|e| e.refcnt == 0) {
                    let mut entry = victim.remove(node);
                    drop(victim);
                    entry.dev = dev;
                    entry.blockno = blockno;
                    entry.refcnt = 1;
                    let slot = entry.slot;
                    self.slots[slot].invalidate();
                    // The stolen slot enters the home shard at the MRU end
                    // regardless of its true age.
                    list.push_front(entry);
                    drop(list);
                    self.steals.fetch_add(1, Ordering::Relaxed);
                    debug!("stole slot {slot} from shard {k} into shard {home} for ({dev},{blockno})");
                    return self.lock_slot(slot, dev, blockno);
                }
                drop(victim);
            }
            if inspected_all {
                panic!("buffer cache exhausted: no reusable slot for dev {dev} block {blockno}");
            }

            // A contended candidate was skipped. Drop the home lock before
            // retrying: a competing sweep may be waiting to try-lock this
            // shard, and a release that would free a slot needs it too. The
            // retry rescans the home shard, so a block cached or released in
            // the meantime is picked up.
            drop(list);
            std::hint::spin_loop();
        }
    }

    /// As [`BufCache::get`], but fetches the block from the device first if
    /// the cached content is not yet valid. The only suspension point tied
    /// to external I/O.
    ///
    /// # Errors
    ///
    /// Returns a device error if the fetch fails; the slot stays invalid and
    /// is released.
    ///
    /// # Panics
    ///
    /// Panics on pool exhaustion, as [`BufCache::get`].
    pub fn read(&self, dev: u32, blockno: u32) -> Result<BlockGuard<'_>> {
        let mut guard = self.get(dev, blockno);
        if !self.slots[guard.slot].is_valid() {
            self.device.read_block(dev, blockno, guard.data_mut())?;
            self.slots[guard.slot].set_valid();
        }
        Ok(guard)
    }

    /// Writes the guard's content to the device synchronously. Holding the
    /// guard proves the caller owns the content lock.
    ///
    /// # Errors
    ///
    /// Returns a device error if the transfer fails.
    pub fn write(&self, guard: &BlockGuard<'_>) -> Result<()> {
        self.device
            .write_block(guard.dev, guard.blockno, guard.data())
    }

    /// Takes an extra reference on the guarded slot so it stays resident
    /// after the guard is dropped. The pin holds no lock; release it with
    /// [`BufCache::unpin`].
    #[must_use]
    pub fn pin(&self, guard: &BlockGuard<'_>) -> PinnedBlock {
        let home = self.home_shard(guard.blockno);
        let mut list = self.shards[home].lock();
        let node = list
            .find(|e| e.slot == guard.slot)
            .unwrap_or_else(|| panic!("pin: slot {} missing from shard {home}", guard.slot));
        list.entry_mut(node).refcnt += 1;
        PinnedBlock {
            slot: guard.slot,
            dev: guard.dev,
            blockno: guard.blockno,
        }
    }

    /// Drops the reference taken by [`BufCache::pin`]. The slot's position
    /// in its shard list is unchanged.
    ///
    /// # Panics
    ///
    /// Panics if the pinned slot is no longer tracked by its home shard,
    /// which indicates refcount corruption.
    pub fn unpin(&self, pin: PinnedBlock) {
        let home = self.home_shard(pin.blockno);
        let mut list = self.shards[home].lock();
        let node = list
            .find(|e| e.slot == pin.slot)
            .unwrap_or_else(|| panic!("unpin: slot {} missing from shard {home}", pin.slot));
        let entry = list.entry_mut(node);
        assert!(entry.refcnt > 0, "unpin: slot {} not held", pin.slot);
        entry.refcnt -= 1;
    }

    /// Current reference count of the cached block, or `None` if the block
    /// is not cached in its home shard.
    #[must_use]
    pub fn block_refcount(&self, dev: u32, blockno: u32) -> Option<u32> {
        let list = self.shards[self.home_shard(blockno)].lock();
        list.find(|e| e.dev == dev && e.blockno == blockno)
            .map(|node| list.entry(node).refcnt)
    }

    /// Number of slots currently owned by each shard.
    #[must_use]
    pub fn shard_occupancy(&self) -> Vec<usize> {
        self.shards.iter().map(|s| s.lock().len()).collect()
    }

    /// Returns cache statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            shards: self.shards.len(),
            slots: self.slots.len(),
            hits: self.hits.load(Ordering::Relaxed),
            recycles: self.recycles.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
        }
    }

    /// Resets the statistics counters.
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.recycles.store(0, Ordering::Relaxed);
        self.steals.store(0, Ordering::Relaxed);
    }

    fn lock_slot(&self, slot: usize, dev: u32, blockno: u32) -> BlockGuard<'_> {
        // The shard lock is released by now; this acquisition may block.
        let data = self.slots[slot].lock();
        BlockGuard {
            cache: self,
            slot,
            dev,
            blockno,
            data,
        }
    }

    /// Guard-drop path: decrement the refcount and, at zero, move the slot
    /// to the most-recently-used end of its shard.
    fn release(&self, slot: usize, blockno: u32) {
        let home = self.home_shard(blockno);
        let mut list = self.shards[home].lock();
        let node = list
            .find(|e| e.slot == slot)
            .unwrap_or_else(|| panic!("release: slot {slot} missing from shard {home}"));
        let entry = list.entry_mut(node);
        assert!(entry.refcnt > 0, "release: slot {slot} not held");
        entry.refcnt -= 1;
        if entry.refcnt == 0 {
            list.move_to_front(node);
        }
    }
}

impl std::fmt::Debug for BufCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufCache")
            .field("shards", &self.shards.len())
            .field("slots", &self.slots.len())
            .finish_non_exhaustive()
    }
}

/// RAII guard for an exclusively locked buffer slot.
///
/// Holds the slot's content lock and one reference. Dropping the guard
/// releases both; do not use the block's content after that.
#[must_use]
pub struct BlockGuard<'a> {
    cache: &'a BufCache,
    slot: usize,
    dev: u32,
    blockno: u32,
    data: MutexGuard<'a, Box<[u8; BLOCK_SIZE]>>,
}

impl BlockGuard<'_> {
    /// Device id of the guarded block.
    #[must_use]
    pub fn dev(&self) -> u32 {
        self.dev
    }

    /// Block number of the guarded block.
    #[must_use]
    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    /// Arena index of the slot backing this guard.
    #[must_use]
    pub fn slot_id(&self) -> usize {
        self.slot
    }

    /// Whether the content currently holds real disk data.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.cache.slots[self.slot].is_valid()
    }

    /// Read access to the block content.
    #[must_use]
    pub fn data(&self) -> &[u8; BLOCK_SIZE] {
        &self.data
    }

    /// Write access to the block content.
    pub fn data_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.data
    }
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        // The content lock itself drops right after this; a thief that
        // claims the slot once refcnt hits zero blocks only until then.
        self.cache.release(self.slot, self.blockno);
    }
}

impl std::fmt::Debug for BlockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockGuard")
            .field("dev", &self.dev)
            .field("blockno", &self.blockno)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

/// Token for a slot reference taken with [`BufCache::pin`].
///
/// Must be returned through [`BufCache::unpin`]; the token holds no lock.
#[derive(Debug)]
#[must_use]
pub struct PinnedBlock {
    slot: usize,
    dev: u32,
    blockno: u32,
}

impl PinnedBlock {
    /// Device id of the pinned block.
    #[must_use]
    pub fn dev(&self) -> u32 {
        self.dev
    }

    /// Block number of the pinned block.
    #[must_use]
    pub fn blockno(&self) -> u32 {
        self.blockno
    }
}

/// Statistics about cache behavior since construction or the last reset.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of shards.
    pub shards: usize,
    /// Total number of buffer slots.
    pub slots: usize,
    /// Lookups satisfied by an already-cached slot.
    pub hits: u64,
    /// Lookups that recycled a slot from the home shard.
    pub recycles: u64,
    /// Lookups that relocated a slot from another shard.
    pub steals: u64,
}

impl CacheStats {
    /// Lookups that did not find the block cached.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.recycles + self.steals
    }

    /// Fraction of lookups satisfied from cache, or `None` before the first
    /// lookup.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.hits + self.misses();
        if total == 0 {
            None
        } else {
            Some(self.hits as f64 / total as f64)
        }
    }
}
