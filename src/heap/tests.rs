use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;
use crate::config::{
    CACHE_LINE, CHUNK_ALIGN, CHUNK_SIZE, MAX_CENTRAL_CACHE, MAX_THREAD_CACHE, MIN_ALLOC,
};

/// Cache-line-rounded slab header; the first block starts here.
fn slab_header_size() -> usize {
    round_up(size_of::<Slab>(), CACHE_LINE)
}

#[test]
fn class_table_shape() {
    // strictly increasing, anchored at both ends
    assert_eq!(class_to_size(0), MIN_ALLOC);
    assert_eq!(class_to_size(CLASS_COUNT - 1), MAX_SMALL_ALLOC);
    for i in 1..CLASS_COUNT {
        assert!(class_to_size(i) > class_to_size(i - 1));
    }
    // worst-case internal waste for the non-tiny classes stays under 1/8
    for i in 1..CLASS_COUNT {
        let prev = class_to_size(i - 1);
        let size = class_to_size(i);
        if prev >= 64 {
            assert!(
                (size - prev) * 8 <= prev,
                "class {} ({} -> {}) wastes more than 12.5%",
                i,
                prev,
                size
            );
        }
    }
}

#[test]
fn size_to_class_agrees_with_table_scan() {
    // reference: first class whose size covers the request
    let reference = |nbytes: usize| {
        (0..CLASS_COUNT)
            .find(|&i| class_to_size(i) >= nbytes)
            .unwrap()
    };
    for nbytes in 1..=MAX_SMALL_ALLOC {
        assert_eq!(size_to_class(nbytes), reference(nbytes), "nbytes={}", nbytes);
    }
    // round-trip on exact class sizes
    for i in 0..CLASS_COUNT {
        assert_eq!(size_to_class(class_to_size(i)), i);
    }
}

#[test]
fn normalize_matches_reservation() {
    assert_eq!(normalize(0), MIN_ALLOC);
    assert_eq!(normalize(1), MIN_ALLOC);
    assert_eq!(normalize(100), 104);
    assert_eq!(normalize(4096), 4096);
    assert_eq!(normalize(MAX_SMALL_ALLOC), MAX_SMALL_ALLOC);
    // just past the boundary: one chunk minus the span header
    assert_eq!(normalize(MAX_SMALL_ALLOC + 1), CHUNK_SIZE - SPAN_HEADER);
    assert_eq!(normalize(3 * CHUNK_SIZE), 4 * CHUNK_SIZE - SPAN_HEADER);
}

#[cfg(not(loom))]
#[test]
fn slab_carve_and_free() {
    let central = CentralChunkCache::global();
    let chunk = central.fetch_chunk();
    assert!(!chunk.is_null());

    let slab = unsafe { Slab::create_at(chunk, 0x1234, 64) };
    let s = unsafe { &*slab };
    assert_eq!(s.kind(), ChunkKind::Small);
    assert_eq!(s.block_size(), 64);
    assert_eq!(
        s.max_block_count() as usize,
        (CHUNK_SIZE - slab_header_size()) / 64
    );
    assert!(s.is_empty());

    // drain the bump frontier completely
    let mut blocks = Vec::new();
    loop {
        let b = s.allocate();
        if b.is_null() {
            break;
        }
        assert_eq!(b as usize % 64, 0);
        blocks.push(b);
    }
    assert_eq!(blocks.len(), s.max_block_count() as usize);
    assert!(s.is_full());

    // free one locally; LIFO hands the same block straight back
    let freed = blocks.pop().unwrap();
    assert!(!unsafe { s.free_local(freed) });
    assert_eq!(s.allocated_count() + 1, s.max_block_count());
    assert_eq!(s.allocate(), freed);

    for b in blocks.drain(..) {
        unsafe { s.free_local(b) };
    }
    assert!(unsafe { s.free_local(freed) });
    assert!(s.is_empty());

    unsafe { Slab::destroy_for_reuse(slab) };
    central.return_chunk(chunk);
}

#[cfg(not(loom))]
#[test]
fn slab_remote_free_steal() {
    let central = CentralChunkCache::global();
    let chunk = central.fetch_chunk();
    let slab = unsafe { Slab::create_at(chunk, 0x1234, 128) };
    let s = unsafe { &*slab };

    let a = s.allocate();
    let b = s.allocate();
    let c = s.allocate();
    assert_eq!(s.allocated_count(), 3);

    // remote frees do not move the owner's count until stolen
    unsafe {
        Slab::free_remote(slab, a);
        Slab::free_remote(slab, b);
    }
    assert_eq!(s.allocated_count(), 3);
    assert_eq!(s.reclaim_remote_memory(), 2);
    assert_eq!(s.allocated_count(), 1);

    // stolen blocks are allocatable again
    let a2 = s.allocate();
    let b2 = s.allocate();
    assert!(a2 == a || a2 == b);
    assert!(b2 == a || b2 == b);
    assert_ne!(a2, b2);

    unsafe {
        s.free_local(a2);
        s.free_local(b2);
        s.free_local(c);
        Slab::destroy_for_reuse(slab);
    }
    central.return_chunk(chunk);
}

#[cfg(not(loom))]
#[test]
fn atomic_free_list_mpsc_stress() {
    const PUSHERS: usize = 4;
    const PER_PUSHER: usize = 200;

    let list = AtomicFreeList::new();
    let pushed = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for _ in 0..PUSHERS {
            scope.spawn(|| {
                for _ in 0..PER_PUSHER {
                    let block = Box::into_raw(Box::new([0u8; 32])) as *mut u8;
                    unsafe { list.push(block) };
                    pushed.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });

    assert_eq!(pushed.load(Ordering::Relaxed), PUSHERS * PER_PUSHER);

    // every push must surface in exactly one steal
    let mut seen = 0;
    let mut head = list.steal_all();
    while !head.is_null() {
        let next = unsafe { *(head as *const usize) } as *mut u8;
        drop(unsafe { Box::from_raw(head as *mut [u8; 32]) });
        seen += 1;
        head = next;
    }
    assert_eq!(seen, PUSHERS * PER_PUSHER);
    assert!(list.steal_all().is_null());
}

/// A slab parked on the full list whose blocks were freed by another
/// thread must be rescued rather than replaced by a new chunk.
#[cfg(not(loom))]
#[test]
fn pool_rescues_remote_freed_slab() {
    // geometry: exactly 4 blocks fill one chunk
    let block_size = ((CHUNK_SIZE - slab_header_size()) / 4) as u32;
    let cache = ThreadChunkCache::new();
    let pool = SizeClassPool::new(block_size);

    // fill the first slab
    let first: Vec<*mut u8> = (0..4).map(|_| pool.allocate(&cache)).collect();
    assert!(first.iter().all(|b| !b.is_null()));
    let slab1 = first[0] as usize & CHUNK_MASK;
    assert!(first.iter().all(|&b| b as usize & CHUNK_MASK == slab1));

    // the fifth allocation demotes the full slab and opens a second chunk
    let spill = pool.allocate(&cache);
    let slab2 = spill as usize & CHUNK_MASK;
    assert_ne!(slab1, slab2);

    // another thread frees into the demoted slab
    let victim = first[0] as usize;
    std::thread::scope(|scope| {
        scope.spawn(move || unsafe {
            Slab::free_remote(slab1 as *const Slab, victim as *mut u8);
        });
    });

    // exhaust the second slab too, so the next allocation has to probe
    // the full list
    let more: Vec<*mut u8> = (0..3).map(|_| pool.allocate(&cache)).collect();
    assert!(more.iter().all(|&b| b as usize & CHUNK_MASK == slab2));

    // the rescue scan must recover the first slab, not map a third chunk
    let misses_before = pool.rescue_misses();
    let rescued = pool.allocate(&cache);
    assert_eq!(rescued as usize, victim);
    assert_eq!(pool.rescue_misses(), misses_before);

    // tear everything down through the owner path
    let mut live: Vec<*mut u8> = Vec::new();
    live.push(rescued);
    live.extend(&first[1..]);
    live.push(spill);
    live.extend(&more);
    for b in live {
        let slab = (b as usize & CHUNK_MASK) as *mut Slab;
        unsafe { pool.deallocate(&cache, slab, b) };
    }
    assert_eq!(pool.live_block_count(), 0);
}

#[cfg(not(loom))]
#[test]
fn central_cache_respects_watermark() {
    let central = CentralChunkCache::global();
    let chunks: Vec<*mut u8> = (0..MAX_CENTRAL_CACHE + 8)
        .map(|_| central.fetch_chunk())
        .collect();
    assert!(chunks.iter().all(|c| !c.is_null()));
    assert!(chunks
        .iter()
        .all(|&c| c as usize & (CHUNK_ALIGN - 1) == 0));

    for c in chunks {
        central.return_chunk(c);
    }
    // other tests push and pop concurrently; the invariant is the cap
    assert!(central.free_chunk_count() <= MAX_CENTRAL_CACHE);
}

#[cfg(not(loom))]
#[test]
fn thread_cache_overflows_to_central() {
    let cache = ThreadChunkCache::new();
    let chunks: Vec<*mut u8> = (0..MAX_THREAD_CACHE + 2)
        .map(|_| cache.fetch_chunk())
        .collect();
    for c in chunks {
        cache.return_chunk(c);
    }
    assert_eq!(cache.cached_count(), MAX_THREAD_CACHE);

    // local pops never hit the central lock
    let again = cache.fetch_chunk();
    assert!(!again.is_null());
    assert_eq!(cache.cached_count(), MAX_THREAD_CACHE - 1);
    cache.return_chunk(again);
}

#[cfg(not(loom))]
#[test]
fn facade_small_alloc_roundtrip() {
    let p = ThreadHeap::allocate(100);
    assert!(!p.is_null());
    assert_eq!(p as usize % MIN_ALLOC, 0);
    unsafe {
        p.write_bytes(0xab, 100);
        assert_eq!(*p.add(99), 0xab);
    }
    ThreadHeap::deallocate(p);
    ThreadHeap::deallocate(std::ptr::null_mut()); // null is a no-op
}

#[cfg(not(loom))]
#[test]
fn facade_layout_alignment() {
    for &align in &[8usize, 16, 32, 64] {
        for &size in &[1usize, 24, 40, 100, 500, 5000, 100_000] {
            let layout = Layout::from_size_align(size, align).unwrap();
            let p = ThreadHeap::allocate_layout(layout);
            assert!(!p.is_null());
            assert_eq!(
                p as usize % align,
                0,
                "size={} align={} ptr={:p}",
                size,
                align,
                p
            );
            ThreadHeap::deallocate(p);
        }
    }
}

#[cfg(not(loom))]
#[test]
fn facade_large_span_roundtrip() {
    let n = MAX_SMALL_ALLOC + 100_000;
    let p = ThreadHeap::allocate(n);
    assert!(!p.is_null());

    let header = (p as usize & CHUNK_MASK) as *const ChunkHeader;
    assert_eq!(unsafe { (*header).kind }, ChunkKind::Large);
    let span = unsafe { &*(header as *const Span) };
    assert_eq!(span.kind(), ChunkKind::Large);
    assert!(span.size() > n);

    unsafe {
        p.write_bytes(0xcd, n);
        assert_eq!(*p.add(n - 1), 0xcd);
    }
    ThreadHeap::deallocate(p);
}

/// allocate/deallocate from one thread leaves every per-class counter
/// balanced.
#[cfg(not(loom))]
#[test]
fn facade_counter_balance() {
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    // 4096 is a class the STM machinery never touches, so concurrent test
    // threads cannot skew this thread's counters
    let class_idx = size_to_class(4096);
    assert_eq!(class_to_size(class_idx), 4096);

    let before = ThreadHeap::with_local(|h| h.pools()[class_idx].live_block_count()).unwrap();

    let mut rng = SmallRng::seed_from_u64(12345);
    let mut live = Vec::new();
    for _ in 0..300 {
        let p = ThreadHeap::allocate(4096);
        assert!(!p.is_null());
        live.push(p);
        if rng.gen_bool(0.3) {
            let idx = rng.gen_range(0..live.len());
            ThreadHeap::deallocate(live.swap_remove(idx));
        }
    }
    let held = live.len() as u64;
    let during = ThreadHeap::with_local(|h| h.pools()[class_idx].live_block_count()).unwrap();
    assert_eq!(during, before + held);

    for p in live {
        ThreadHeap::deallocate(p);
    }
    let after = ThreadHeap::with_local(|h| h.pools()[class_idx].live_block_count()).unwrap();
    assert_eq!(after, before);
}

/// Blocks allocated here and freed on other threads come home through the
/// remote lists and are reusable.
#[cfg(not(loom))]
#[test]
fn facade_cross_thread_free() {
    const ROUNDS: usize = 50;
    const PER_ROUND: usize = 64;

    for _ in 0..ROUNDS {
        let blocks: Vec<usize> = (0..PER_ROUND)
            .map(|_| {
                let p = ThreadHeap::allocate(256);
                assert!(!p.is_null());
                p as usize
            })
            .collect();
        std::thread::scope(|scope| {
            scope.spawn(move || {
                for b in blocks {
                    ThreadHeap::deallocate(b as *mut u8);
                }
            });
        });
    }
    // the remote frees must eventually be stolen back instead of growing
    // the heap without bound: allocating again reuses rescued space
    let p = ThreadHeap::allocate(256);
    assert!(!p.is_null());
    ThreadHeap::deallocate(p);
}

/// Randomized churn across size classes and threads: every block carries
/// a fill pattern that must survive until its free, whichever thread
/// performs it.
#[cfg(not(loom))]
#[test]
fn facade_multithread_stress() {
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use std::sync::mpsc;

    const THREADS: usize = 4;
    const OPS: usize = 2000;

    // ring of channels: every thread frees blocks its neighbor allocated
    let (senders, receivers): (Vec<_>, Vec<_>) =
        (0..THREADS).map(|_| mpsc::channel::<usize>()).unzip();

    std::thread::scope(|scope| {
        for (t, rx) in receivers.into_iter().enumerate() {
            let tx = senders[(t + 1) % THREADS].clone();
            scope.spawn(move || {
                let mut rng = SmallRng::seed_from_u64(0xc0ffee + t as u64);
                let mut local: Vec<(usize, usize, u8)> = Vec::new();
                for i in 0..OPS {
                    let size = rng.gen_range(1..=8192);
                    let p = ThreadHeap::allocate(size);
                    assert!(!p.is_null());
                    let fill = (i & 0xff) as u8;
                    unsafe { p.write_bytes(fill, size) };
                    match i % 3 {
                        0 => local.push((p as usize, size, fill)),
                        1 => tx.send(p as usize).unwrap(),
                        _ => {
                            unsafe {
                                assert_eq!(*p, fill);
                                assert_eq!(*p.add(size - 1), fill);
                            }
                            ThreadHeap::deallocate(p);
                        }
                    }
                    while let Ok(addr) = rx.try_recv() {
                        ThreadHeap::deallocate(addr as *mut u8);
                    }
                }

                // blocks kept across the whole run must be untouched
                for (addr, size, fill) in local {
                    let p = addr as *mut u8;
                    unsafe {
                        assert_eq!(*p, fill);
                        assert_eq!(*p.add(size - 1), fill);
                    }
                    ThreadHeap::deallocate(p);
                }

                drop(tx);
                while let Ok(addr) = rx.recv() {
                    ThreadHeap::deallocate(addr as *mut u8);
                }
            });
        }
        // the spawned clones are the only senders that should keep the
        // ring alive
        drop(senders);
    });
}

#[cfg(loom)]
mod loom_tests {
    use super::*;

    /// Two producers and one stealing consumer over the remote free list;
    /// loom checks every interleaving of the CAS publish against the
    /// steal.
    #[test]
    fn atomic_free_list_push_steal() {
        loom::model(|| {
            let list = loom::sync::Arc::new(AtomicFreeList::new());
            let blocks: Vec<*mut u8> = (0..2)
                .map(|_| Box::into_raw(Box::new([0usize; 4])) as *mut u8)
                .collect();

            let handles: Vec<_> = blocks
                .iter()
                .map(|&block| {
                    let list = list.clone();
                    let addr = block as usize;
                    loom::thread::spawn(move || unsafe { list.push(addr as *mut u8) })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }

            let mut seen = 0;
            let mut head = list.steal_all();
            while !head.is_null() {
                let next = unsafe { *(head as *const usize) } as *mut u8;
                drop(unsafe { Box::from_raw(head as *mut [usize; 4]) });
                seen += 1;
                head = next;
            }
            assert_eq!(seen, 2);
        });
    }
}
