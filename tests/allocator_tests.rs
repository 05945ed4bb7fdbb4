//! Integration tests for the page-frame allocator.

use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;

use proptest::prelude::*;

use memcore::{FrameAllocator, MemError, PhysAddr, FRAME_SIZE};

fn allocator(frames: usize) -> FrameAllocator {
    let base = 0x8000_0000u64;
    FrameAllocator::new(
        PhysAddr(base),
        PhysAddr(base + (frames * FRAME_SIZE) as u64),
    )
    .unwrap()
}

// =============================================================================
// Capacity
// =============================================================================

#[test]
fn test_pool_hands_out_exactly_its_capacity() {
    let fa = allocator(8);

    let mut held = Vec::new();
    for _ in 0..8 {
        let pa = fa.allocate().unwrap();
        assert!(pa.is_frame_aligned());
        assert!(pa >= fa.base() && pa < fa.limit());
        held.push(pa);
    }
    let distinct: HashSet<_> = held.iter().copied().collect();
    assert_eq!(distinct.len(), 8);

    // Exhausted: allocation reports pressure, it does not fail loudly.
    assert!(fa.allocate().is_none());
    assert_eq!(fa.stats().allocated_frames(), 8);

    // Returning one frame makes allocation possible again.
    fa.free(held.pop().unwrap()).unwrap();
    assert!(fa.allocate().is_some());
}

#[test]
fn test_frames_hold_independent_content() {
    let fa = allocator(4);
    let held: Vec<_> = (0..4).map(|_| fa.allocate().unwrap()).collect();

    for (i, &pa) in held.iter().enumerate() {
        fa.with_frame(pa, |frame| frame.fill(i as u8)).unwrap();
    }
    for (i, &pa) in held.iter().enumerate() {
        fa.with_frame(pa, |frame| {
            assert!(frame.iter().all(|&b| b == i as u8));
        })
        .unwrap();
    }
}

#[test]
fn test_fresh_allocation_is_junk_filled() {
    let fa = allocator(1);

    // Leave recognizable content behind, free, and reallocate.
    let pa = fa.allocate().unwrap();
    fa.with_frame(pa, |frame| frame.fill(0xEE)).unwrap();
    fa.free(pa).unwrap();

    let pa = fa.allocate().unwrap();
    fa.with_frame(pa, |frame| {
        let fill = frame[0];
        assert_ne!(fill, 0xEE, "stale content leaked through reallocation");
        assert_ne!(fill, 0, "junk fill must be distinguishable from zeroes");
        assert!(frame.iter().all(|&b| b == fill));
    })
    .unwrap();
}

// =============================================================================
// Sharing
// =============================================================================

#[test]
fn test_shared_frame_survives_first_free() {
    let fa = allocator(2);

    let pa = fa.allocate().unwrap();
    fa.with_frame(pa, |frame| frame.fill(0x42)).unwrap();
    fa.share(pa).unwrap();
    assert_eq!(fa.refcount(pa).unwrap(), 2);

    // First owner drops its mapping: the frame and its content stay live.
    fa.free(pa).unwrap();
    assert_eq!(fa.refcount(pa).unwrap(), 1);
    fa.with_frame(pa, |frame| {
        assert!(frame.iter().all(|&b| b == 0x42));
    })
    .unwrap();

    // Last reference gone: the frame goes back on the freelist, and LIFO
    // reuse hands the same frame to the next allocation.
    fa.free(pa).unwrap();
    assert_eq!(fa.refcount(pa).unwrap(), 0);
    assert!(matches!(
        fa.with_frame(pa, |_| ()),
        Err(MemError::FrameNotAllocated(_))
    ));
    assert_eq!(fa.allocate(), Some(pa));
}

#[test]
fn test_free_of_unreferenced_frame_is_a_no_op() {
    let fa = allocator(3);
    let pa = fa.allocate().unwrap();
    fa.free(pa).unwrap();

    // Reported, tolerated, and without effect on the pool.
    fa.free(pa).unwrap();
    fa.free(pa).unwrap();
    assert_eq!(fa.stats().free_frames, 3);

    let distinct: HashSet<_> = (0..3).map(|_| fa.allocate().unwrap()).collect();
    assert_eq!(distinct.len(), 3);
    assert!(fa.allocate().is_none());
}

#[test]
fn test_out_of_range_addresses_are_soft_errors() {
    let fa = allocator(2);
    let below = PhysAddr(fa.base().0 - FRAME_SIZE as u64);
    let above = fa.limit();

    for pa in [below, above, PhysAddr(0)] {
        assert!(matches!(
            fa.free(pa),
            Err(MemError::FrameOutOfRange { .. })
        ));
        assert!(matches!(
            fa.share(pa),
            Err(MemError::FrameOutOfRange { .. })
        ));
        assert!(matches!(
            fa.refcount(pa),
            Err(MemError::FrameOutOfRange { .. })
        ));
    }

    // The allocator keeps working at full capacity afterwards.
    assert_eq!(fa.stats().free_frames, 2);
    assert!(fa.allocate().is_some());
    assert!(fa.allocate().is_some());
    assert!(fa.allocate().is_none());
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_concurrent_allocations_never_alias() {
    let fa = Arc::new(allocator(64));
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let (tx, rx) = mpsc::channel();

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let fa = Arc::clone(&fa);
            let barrier = Arc::clone(&barrier);
            let tx = tx.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..8 {
                    tx.send(fa.allocate().unwrap()).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    drop(tx);

    let held: Vec<PhysAddr> = rx.iter().collect();
    let distinct: HashSet<_> = held.iter().copied().collect();
    assert_eq!(distinct.len(), 64, "a frame was handed out twice");
    assert!(fa.allocate().is_none());

    for pa in held {
        fa.free(pa).unwrap();
    }
    assert_eq!(fa.stats().free_frames, 64);
}

#[test]
fn test_concurrent_churn_conserves_frames() {
    let fa = Arc::new(allocator(16));
    let threads = 4;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let fa = Arc::clone(&fa);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..200 {
                    let Some(pa) = fa.allocate() else { continue };
                    fa.share(pa).unwrap();
                    fa.with_frame(pa, |frame| frame[0] = t as u8).unwrap();
                    fa.free(pa).unwrap();
                    fa.free(pa).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let stats = fa.stats();
    assert_eq!(stats.free_frames, 16);
    assert_eq!(stats.allocations, stats.releases);
}

// =============================================================================
// Property tests
// =============================================================================

proptest! {
    /// Random interleavings of allocate/share/free against a reference
    /// model: per-frame refcounts and the free count always agree.
    #[test]
    fn prop_refcounts_track_reference_model(
        ops in proptest::collection::vec((0u8..3, 0usize..64), 1..200),
    ) {
        let fa = allocator(8);
        let mut model: Vec<(PhysAddr, u64)> = Vec::new();

        for (op, pick) in ops {
            match op {
                0 => match fa.allocate() {
                    Some(pa) => {
                        prop_assert!(
                            !model.iter().any(|&(p, _)| p == pa),
                            "allocated a frame that is still referenced"
                        );
                        model.push((pa, 1));
                    }
                    None => prop_assert_eq!(model.len(), 8),
                },
                1 if !model.is_empty() => {
                    let i = pick % model.len();
                    fa.share(model[i].0).unwrap();
                    model[i].1 += 1;
                }
                2 if !model.is_empty() => {
                    let i = pick % model.len();
                    fa.free(model[i].0).unwrap();
                    model[i].1 -= 1;
                    if model[i].1 == 0 {
                        model.swap_remove(i);
                    }
                }
                _ => {}
            }

            prop_assert_eq!(fa.stats().allocated_frames(), model.len());
            for &(pa, rc) in &model {
                prop_assert_eq!(fa.refcount(pa).unwrap(), rc);
            }
        }
    }
}
