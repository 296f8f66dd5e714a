//! Tiered thread-caching allocator.
//!
//! ```text
//! OS (mmap, chunk-aligned)
//!   -> central chunk cache      (process-wide LIFO, spinlock, cap 64)
//!   -> per-thread chunk cache   (LIFO, cap 8)
//!   -> slab                     (one chunk, fixed-size blocks)
//!   -> size-class pool          (current/partial/full slabs, rescue)
//!   -> ThreadHeap facade        (size-class table + large-span path)
//! ```
//!
//! Small allocations (≤ 256 KiB) are rounded to one of 104 size classes
//! and served from per-thread slabs with zero global synchronization on
//! the fast path. Anything larger gets its own chunk-aligned span.
//! Cross-thread frees are routed by reading the chunk header found at
//! `ptr & CHUNK_MASK` and land on the owning slab's remote free list.

mod central;
mod pool;
mod slab;

use std::alloc::Layout;
use std::mem::size_of;
use std::ptr;

use tracing::Level;

pub use central::{CentralChunkCache, ThreadChunkCache};
pub use pool::SizeClassPool;
pub use slab::{AtomicFreeList, ChunkHeader, ChunkKind, Slab};

use crate::config::{CACHE_LINE, CHUNK_MASK, CHUNK_SIZE, CLASS_COUNT, MAX_SMALL_ALLOC, MIN_ALLOC};
use crate::util::{round_up, UsizePtr};

/// Block size of each class, ascending. Piecewise-linear ranges trade
/// class count against internal waste (≤ 12.5 % per class).
const CLASS_TO_SIZE: [u32; CLASS_COUNT] = build_class_table();

const fn build_class_table() -> [u32; CLASS_COUNT] {
    let ranges: [(usize, usize, usize); 12] = [
        (8, 128, 8),
        (144, 256, 16),
        (288, 512, 32),
        (576, 1024, 64),
        (1152, 2048, 128),
        (2304, 4096, 256),
        (4608, 8192, 512),
        (9216, 16384, 1024),
        (18432, 32768, 2048),
        (36864, 65536, 4096),
        (73728, 131072, 8192),
        (147456, 262144, 16384),
    ];

    let mut table = [0u32; CLASS_COUNT];
    let mut idx = 0;
    let mut r = 0;
    while r < ranges.len() {
        let mut s = ranges[r].0;
        while s <= ranges[r].1 {
            table[idx] = s as u32;
            idx += 1;
            s += ranges[r].2;
        }
        r += 1;
    }
    assert!(idx == CLASS_COUNT);
    assert!(table[0] as usize == MIN_ALLOC);
    assert!(table[CLASS_COUNT - 1] as usize == MAX_SMALL_ALLOC);
    table
}

/// Map a request size to its class index. `nbytes` must be
/// ≤ [`MAX_SMALL_ALLOC`].
pub fn size_to_class(nbytes: usize) -> usize {
    debug_assert!(nbytes <= MAX_SMALL_ALLOC);
    if nbytes <= MIN_ALLOC {
        return 0;
    }
    // the first 16 classes are linear in steps of 8; pure shift
    if nbytes <= 128 {
        return (nbytes - 1) >> 3;
    }
    // lower-bound binary search over the remainder
    let mut left = 16;
    let mut right = CLASS_COUNT - 1;
    while left < right {
        let mid = (left + right) / 2;
        if (CLASS_TO_SIZE[mid] as usize) < nbytes {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    left
}

pub fn class_to_size(class_idx: usize) -> usize {
    debug_assert!(class_idx < CLASS_COUNT);
    CLASS_TO_SIZE[class_idx] as usize
}

/// Round a request up to the number of bytes actually reserved for it:
/// the class block size below the small/large boundary, the span's payload
/// capacity above it.
pub fn normalize(nbytes: usize) -> usize {
    if nbytes > MAX_SMALL_ALLOC {
        round_up(nbytes + SPAN_HEADER, CHUNK_SIZE) - SPAN_HEADER
    } else {
        class_to_size(size_to_class(nbytes))
    }
}

/// Header of a chunk sequence devoted to a single large allocation.
/// Shares the tag-first layout with [`Slab`]; the payload begins at the
/// next cache line.
#[repr(C, align(64))]
pub struct Span {
    /// Must stay first; see [`ChunkHeader`]
    kind: ChunkKind,
    /// Total mapped size including this header
    size: usize,
}

const SPAN_HEADER: usize = round_up(size_of::<Span>(), CACHE_LINE);

impl Span {
    /// Safety: `base` must be a live chunk-aligned mapping of at least
    /// `total` bytes with no other references.
    unsafe fn create_at(base: *mut u8, total: usize) -> *mut Span {
        let span = base as *mut Span;
        span.write(Span {
            kind: ChunkKind::Large,
            size: total,
        });
        span
    }

    unsafe fn payload(self_: *mut Span) -> *mut u8 {
        (self_ as *mut u8).add(SPAN_HEADER)
    }

    pub fn kind(&self) -> ChunkKind {
        self.kind
    }

    /// Total mapped bytes, header included.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Per-thread allocation façade: one pool per size class plus the thread's
/// chunk cache. Reached through a `thread_local!`; the public surface is
/// the pair of associated functions [`ThreadHeap::allocate`] /
/// [`ThreadHeap::deallocate`].
pub struct ThreadHeap {
    chunk_cache: ThreadChunkCache,
    pools: [SizeClassPool; CLASS_COUNT],
}

thread_local! {
    static THREAD_HEAP: ThreadHeap = ThreadHeap::new();
}

impl ThreadHeap {
    fn new() -> Self {
        Self {
            chunk_cache: ThreadChunkCache::new(),
            pools: std::array::from_fn(|i| SizeClassPool::new(CLASS_TO_SIZE[i])),
        }
    }

    /// Allocate `nbytes`. Small requests come from this thread's slabs
    /// (pointer-aligned or better); large ones get a fresh span. Returns
    /// null on OS exhaustion, or for small requests during thread
    /// teardown once the heap TLS has been destroyed.
    pub fn allocate(nbytes: usize) -> *mut u8 {
        if nbytes > MAX_SMALL_ALLOC {
            return Self::allocate_span(nbytes);
        }
        THREAD_HEAP
            .try_with(|heap| {
                let class_idx = size_to_class(nbytes);
                heap.pools[class_idx].allocate(&heap.chunk_cache)
            })
            .unwrap_or(ptr::null_mut())
    }

    /// Allocate for a layout. The size is rounded up to a multiple of the
    /// alignment, which for alignments up to a cache line guarantees the
    /// chosen size class (and therefore every block offset) honors it.
    pub fn allocate_layout(layout: Layout) -> *mut u8 {
        debug_assert!(layout.align() <= CACHE_LINE);
        let size = round_up(layout.size().max(1), layout.align());
        Self::allocate(size)
    }

    fn allocate_span(nbytes: usize) -> *mut u8 {
        let total = nbytes + SPAN_HEADER;
        let base = CentralChunkCache::global().allocate_large(total);
        if base.is_null() {
            return ptr::null_mut();
        }
        tracing::event!(
            Level::TRACE,
            base = ?UsizePtr::from(base),
            nbytes,
            "heap::allocate_span"
        );
        // safety: fresh exclusive mapping of at least `total` bytes
        unsafe {
            let span = Span::create_at(base, total);
            Span::payload(span)
        }
    }

    /// Free a pointer previously returned by [`ThreadHeap::allocate`] (any
    /// thread). Null is ignored. Frees of another thread's blocks take the
    /// remote path on the owning slab, as do all small frees after this
    /// thread's heap TLS is gone.
    pub fn deallocate(ptr_in: *mut u8) {
        if ptr_in.is_null() {
            return;
        }
        let header = (ptr_in as usize & CHUNK_MASK) as *mut ChunkHeader;
        // safety: a live allocation always sits inside a chunk whose
        // header is reachable through the mask
        match unsafe { (*header).kind } {
            ChunkKind::Small => {
                let slab = header as *mut Slab;
                let handled = THREAD_HEAP
                    .try_with(|heap| {
                        // safety: slab headers of live blocks are readable
                        let class_idx =
                            size_to_class(unsafe { Slab::block_size_of(slab) } as usize);
                        let pool = &heap.pools[class_idx];
                        if unsafe { Slab::owner_of(slab) } == pool.identity() {
                            // safety: identity match means we are the
                            // owning thread
                            unsafe { pool.deallocate(&heap.chunk_cache, slab, ptr_in) };
                            true
                        } else {
                            false
                        }
                    })
                    .unwrap_or(false);
                if !handled {
                    // safety: live block of a live slab; remote push only
                    unsafe { Slab::free_remote(slab, ptr_in) };
                }
            }
            ChunkKind::Large => {
                let span = header as *mut Span;
                // safety: span header written at allocation, immutable
                let total = unsafe { (*span).size() };
                CentralChunkCache::global().free_large(span as *mut u8, total);
            }
        }
    }

    /// Run `f` against the calling thread's heap (test observability).
    #[cfg(test)]
    pub(crate) fn with_local<R>(f: impl FnOnce(&ThreadHeap) -> R) -> Option<R> {
        THREAD_HEAP.try_with(f).ok()
    }

    #[cfg(test)]
    pub(crate) fn pools(&self) -> &[SizeClassPool; CLASS_COUNT] {
        &self.pools
    }
}

#[cfg(test)]
mod tests;
