//! Reference-counted physical page-frame allocator.
//!
//! Manages a fixed range of physical memory as whole frames. Free frames are
//! threaded into an intrusive freelist (a free frame's first bytes hold the
//! index of the next free frame); a parallel table tracks how many live
//! mappings share each allocated frame, so a frame returns to the freelist
//! only when its last reference is dropped (copy-on-write sharing).
//!
//! All four operations (`allocate`, `free`, `share`, `refcount`) run under
//! the same metadata lock; their critical sections are bounded and never
//! perform I/O.

use std::sync::atomic::{AtomicU64, Ordering};

use log::{info, warn};
use spin::Mutex as SpinMutex;

use crate::error::{MemError, Result};

/// Size of one physical page frame in bytes (4KB).
pub const FRAME_SIZE: usize = 4096;

/// Frame size as a power of 2 (2^12 = 4096).
pub const FRAME_SIZE_LOG2: u32 = 12;

/// Fill byte for freshly allocated frames, to surface reads of
/// uninitialized memory.
const ALLOC_JUNK: u8 = 0x05;

/// Fill byte for retired frames, to surface dangling references.
const FREE_JUNK: u8 = 0x01;

/// Freelist terminator stored in a free frame's link bytes.
const LINK_NONE: u64 = u64::MAX;

/// Address of a physical page frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    /// Creates a physical address.
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Whether the address sits on a frame boundary.
    #[must_use]
    pub const fn is_frame_aligned(self) -> bool {
        self.0 & (FRAME_SIZE as u64 - 1) == 0
    }

    /// The address rounded up to the next frame boundary.
    #[must_use]
    pub const fn frame_round_up(self) -> Self {
        Self((self.0 + (FRAME_SIZE as u64 - 1)) & !(FRAME_SIZE as u64 - 1))
    }
}

impl std::fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Lock-protected allocator state: the backing memory for the managed
/// range, the per-frame refcount table, and the freelist head.
struct AllocState {
    memory: Vec<u8>,
    refcnt: Vec<u64>,
    /// Frame index of the first free frame, or [`LINK_NONE`].
    free_head: u64,
    free_frames: usize,
}

impl AllocState {
    fn frame_mut(&mut self, idx: usize) -> &mut [u8] {
        &mut self.memory[idx * FRAME_SIZE..(idx + 1) * FRAME_SIZE]
    }

    fn frame(&self, idx: usize) -> &[u8] {
        &self.memory[idx * FRAME_SIZE..(idx + 1) * FRAME_SIZE]
    }

    /// Reads the freelist link stored in a free frame's first bytes.
    fn link(&self, idx: usize) -> u64 {
        let raw = &self.frame(idx)[..8];
        u64::from_le_bytes(raw.try_into().expect("8-byte link slice"))
    }

    /// Fills a frame with junk and pushes it onto the freelist.
    fn retire(&mut self, idx: usize) {
        let next = self.free_head;
        let frame = self.frame_mut(idx);
        frame.fill(FREE_JUNK);
        frame[..8].copy_from_slice(&next.to_le_bytes());
        self.free_head = idx as u64;
        self.free_frames += 1;
    }
}

/// Fixed-pool physical page-frame allocator with per-frame sharing counts.
pub struct FrameAllocator {
    base: u64,
    limit: u64,
    frames: usize,
    state: SpinMutex<AllocState>,
    allocations: AtomicU64,
    releases: AtomicU64,
    shares: AtomicU64,
}

impl FrameAllocator {
    /// Builds the allocator over the physical range `[start, end)`.
    ///
    /// The managed base is `start` rounded up to a frame boundary; only
    /// complete frames inside the range are managed. Every frame enters the
    /// freelist before any operation can run.
    ///
    /// # Errors
    ///
    /// Returns [`MemError::InvalidConfig`] if the range holds no complete
    /// frame.
    pub fn new(start: PhysAddr, end: PhysAddr) -> Result<Self> {
        let base = start.frame_round_up().0;
        let frames = (end.0.saturating_sub(base) as usize) / FRAME_SIZE;
        if frames == 0 {
            return Err(MemError::InvalidConfig(format!(
                "range [{start}, {end}) holds no complete frame"
            )));
        }
        let limit = base + (frames * FRAME_SIZE) as u64;

        let mut state = AllocState {
            memory: vec![0u8; frames * FRAME_SIZE],
            refcnt: vec![0u64; frames],
            free_head: LINK_NONE,
            free_frames: 0,
        };
        for idx in 0..frames {
            state.retire(idx);
        }

        info!("frame allocator: {frames} frames over [{base:#x}, {limit:#x})");

        Ok(Self {
            base,
            limit,
            frames,
            state: SpinMutex::new(state),
            allocations: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            shares: AtomicU64::new(0),
        })
    }

    /// First managed frame address.
    #[must_use]
    pub fn base(&self) -> PhysAddr {
        PhysAddr(self.base)
    }

    /// End of the managed range (exclusive).
    #[must_use]
    pub fn limit(&self) -> PhysAddr {
        PhysAddr(self.limit)
    }

    /// Total number of managed frames.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames
    }

    /// Checked address-to-index conversion shared by every operation that
    /// touches the refcount table.
    fn frame_index(&self, pa: PhysAddr) -> Result<usize> {
        if pa.0 < self.base || pa.0 >= self.limit {
            warn!("frame address {pa} outside managed range");
            return Err(MemError::FrameOutOfRange {
                addr: pa.0,
                base: self.base,
                limit: self.limit,
            });
        }
        Ok(((pa.0 - self.base) >> FRAME_SIZE_LOG2) as usize)
    }

    fn addr_of(&self, idx: usize) -> PhysAddr {
        PhysAddr(self.base + ((idx * FRAME_SIZE) as u64))
    }

    /// Allocates one frame, filled with junk, with its refcount set to 1.
    ///
    /// Returns `None` when no frame is free; the caller must handle memory
    /// pressure, this is not a fault.
    #[must_use]
    pub fn allocate(&self) -> Option<PhysAddr> {
        let mut st = self.state.lock();
        if st.free_head == LINK_NONE {
            return None;
        }
        let idx = st.free_head as usize;
        st.free_head = st.link(idx);
        st.refcnt[idx] = 1;
        st.free_frames -= 1;
        st.frame_mut(idx).fill(ALLOC_JUNK);
        drop(st);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Some(self.addr_of(idx))
    }

    /// Drops one reference to the frame. While other references remain the
    /// frame stays allocated; when the last one is dropped the frame is
    /// junk-filled and returned to the freelist.
    ///
    /// Freeing a frame whose refcount is already zero is a no-op: the count
    /// never underflows and the freelist is not corrupted by a double free.
    ///
    /// # Errors
    ///
    /// Returns [`MemError::FrameOutOfRange`] for addresses outside the
    /// managed range, leaving all state untouched.
    ///
    /// # Panics
    ///
    /// Panics if the last reference to a misaligned address is dropped; an
    /// address inside a frame can only come from a corrupted caller mapping.
    pub fn free(&self, pa: PhysAddr) -> Result<()> {
        let idx = self.frame_index(pa)?;
        let mut st = self.state.lock();
        if st.refcnt[idx] == 0 {
            warn!("free of unreferenced frame {pa}");
            return Ok(());
        }
        st.refcnt[idx] -= 1;
        if st.refcnt[idx] > 0 {
            return Ok(());
        }
        assert!(pa.is_frame_aligned(), "free: misaligned frame {pa}");
        st.retire(idx);
        drop(st);
        self.releases.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Adds one reference to the frame, for a mapping duplicated across
    /// address spaces instead of copied.
    ///
    /// # Errors
    ///
    /// Returns [`MemError::FrameOutOfRange`] for addresses outside the
    /// managed range and [`MemError::FrameNotAllocated`] for a free frame;
    /// reviving a frame that is on the freelist would let a later
    /// allocation alias it.
    pub fn share(&self, pa: PhysAddr) -> Result<()> {
        let idx = self.frame_index(pa)?;
        let mut st = self.state.lock();
        if st.refcnt[idx] == 0 {
            warn!("share of unreferenced frame {pa}");
            return Err(MemError::FrameNotAllocated(pa));
        }
        st.refcnt[idx] += 1;
        drop(st);
        self.shares.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Current number of references to the frame.
    ///
    /// # Errors
    ///
    /// Returns [`MemError::FrameOutOfRange`] for addresses outside the
    /// managed range.
    pub fn refcount(&self, pa: PhysAddr) -> Result<u64> {
        let idx = self.frame_index(pa)?;
        Ok(self.state.lock().refcnt[idx])
    }

    /// Runs `f` over the content of an allocated frame.
    ///
    /// The allocator never interprets frame content itself; this is the
    /// access path for callers that would otherwise write through a mapping.
    /// `f` runs under the allocator lock, so keep it short and non-blocking.
    ///
    /// # Errors
    ///
    /// Returns [`MemError::FrameOutOfRange`] for addresses outside the
    /// managed range and [`MemError::FrameNotAllocated`] for a free frame.
    pub fn with_frame<R>(&self, pa: PhysAddr, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let idx = self.frame_index(pa)?;
        let mut st = self.state.lock();
        if st.refcnt[idx] == 0 {
            return Err(MemError::FrameNotAllocated(pa));
        }
        Ok(f(st.frame_mut(idx)))
    }

    /// Returns allocator statistics.
    #[must_use]
    pub fn stats(&self) -> AllocStats {
        let st = self.state.lock();
        AllocStats {
            frames: self.frames,
            free_frames: st.free_frames,
            allocations: self.allocations.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            shares: self.shares.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for FrameAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameAllocator")
            .field("base", &self.base())
            .field("limit", &self.limit())
            .field("frames", &self.frames)
            .finish_non_exhaustive()
    }
}

/// Statistics about allocator state and activity.
#[derive(Debug, Clone)]
pub struct AllocStats {
    /// Total number of managed frames.
    pub frames: usize,
    /// Frames currently on the freelist.
    pub free_frames: usize,
    /// Frames handed out since construction.
    pub allocations: u64,
    /// Frames retired back to the freelist since construction.
    pub releases: u64,
    /// References added by `share` since construction.
    pub shares: u64,
}

impl AllocStats {
    /// Frames currently holding at least one reference.
    #[must_use]
    pub fn allocated_frames(&self) -> usize {
        self.frames - self.free_frames
    }
}
