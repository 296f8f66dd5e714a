//! Chunk caches: the process-wide central cache over the OS, and the tiny
//! per-thread cache that amortizes the central spinlock.
//!
//! Both caches store free chunks as an intrusive LIFO; the first machine
//! word of a cached chunk points at the next one. LIFO reuse keeps the
//! hottest pages cycling; the water-marks bound idle residency.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::Level;

use crate::config::{CHUNK_ALIGN, CHUNK_SIZE, MAX_CENTRAL_CACHE, MAX_THREAD_CACHE};
use crate::sys;
use crate::util::round_up;

/// Process-wide chunk cache. The LIFO is guarded by a test-and-set
/// spinlock; the critical sections are a handful of word operations, so
/// parking would cost more than it saves.
pub struct CentralChunkCache {
    lock: AtomicBool,
    // both fields only touched with the lock held
    head: Cell<usize>,
    count: Cell<usize>,
}

// safety: head/count are only accessed under `lock`
unsafe impl Sync for CentralChunkCache {}

static CENTRAL: CentralChunkCache = CentralChunkCache {
    lock: AtomicBool::new(false),
    head: Cell::new(0),
    count: Cell::new(0),
};

/// RAII for the central spinlock.
struct SpinGuard<'a>(&'a CentralChunkCache);

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        // order: push out the list manipulation before the next holder
        self.0.lock.store(false, Ordering::Release);
    }
}

impl CentralChunkCache {
    pub fn global() -> &'static CentralChunkCache {
        &CENTRAL
    }

    fn acquire(&self) -> SpinGuard<'_> {
        loop {
            if !self.lock.load(Ordering::Relaxed) {
                // order: acquire pairs with the unlocking release so we see
                // the previous holder's list writes
                if !self.lock.swap(true, Ordering::Acquire) {
                    return SpinGuard(self);
                }
            }
            std::hint::spin_loop();
        }
    }

    /// Pop a cached chunk, or map a fresh one. Null only under OS
    /// exhaustion.
    pub fn fetch_chunk(&self) -> *mut u8 {
        {
            let _g = self.acquire();
            let head = self.head.get();
            if head != 0 {
                // safety: cached chunks are mapped and exclusively ours
                self.head.set(unsafe { *(head as *const usize) });
                self.count.set(self.count.get() - 1);
                return head as *mut u8;
            }
        }
        sys::map_aligned(CHUNK_SIZE, CHUNK_ALIGN)
    }

    /// Cache `ptr`, or release it to the OS above the water-mark.
    /// `ptr` must be a chunk-aligned chunk no longer referenced by anyone.
    pub fn return_chunk(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        debug_assert_eq!(ptr as usize & (CHUNK_ALIGN - 1), 0);

        {
            let _g = self.acquire();
            if self.count.get() < MAX_CENTRAL_CACHE {
                // safety: we own the chunk; its first word becomes the link
                unsafe { (ptr as *mut usize).write(self.head.get()) };
                self.head.set(ptr as usize);
                self.count.set(self.count.get() + 1);
                return;
            }
        }
        tracing::event!(Level::TRACE, "central::release_to_os");
        sys::unmap(ptr, CHUNK_SIZE);
    }

    /// Map a fresh aligned region for one large span. Sizes vary, so spans
    /// never go through the single-chunk LIFO.
    pub fn allocate_large(&self, total: usize) -> *mut u8 {
        sys::map_aligned(round_up(total, CHUNK_SIZE), CHUNK_ALIGN)
    }

    /// Release a large span's backing region.
    /// `ptr`/`total` must match a prior `allocate_large`.
    pub fn free_large(&self, ptr: *mut u8, total: usize) {
        sys::unmap(ptr, round_up(total, CHUNK_SIZE));
    }

    /// Snapshot of the cached-chunk count (test observability; racy by
    /// nature).
    pub fn free_chunk_count(&self) -> usize {
        let _g = self.acquire();
        self.count.get()
    }
}

/// Per-thread chunk cache: a bounded LIFO in front of the central cache so
/// slab churn inside one thread never takes the central lock.
pub struct ThreadChunkCache {
    head: Cell<usize>,
    count: Cell<usize>,
}

impl ThreadChunkCache {
    pub fn new() -> Self {
        Self {
            head: Cell::new(0),
            count: Cell::new(0),
        }
    }

    pub fn fetch_chunk(&self) -> *mut u8 {
        let head = self.head.get();
        if head != 0 {
            // safety: locally cached chunks are mapped and ours alone
            self.head.set(unsafe { *(head as *const usize) });
            self.count.set(self.count.get() - 1);
            return head as *mut u8;
        }
        CentralChunkCache::global().fetch_chunk()
    }

    pub fn return_chunk(&self, chunk: *mut u8) {
        debug_assert!(!chunk.is_null());
        if self.count.get() >= MAX_THREAD_CACHE {
            CentralChunkCache::global().return_chunk(chunk);
            return;
        }
        // safety: we own the chunk; its first word becomes the link
        unsafe { (chunk as *mut usize).write(self.head.get()) };
        self.head.set(chunk as usize);
        self.count.set(self.count.get() + 1);
    }

    pub fn cached_count(&self) -> usize {
        self.count.get()
    }
}

impl Drop for ThreadChunkCache {
    fn drop(&mut self) {
        let central = CentralChunkCache::global();
        let mut head = self.head.get();
        while head != 0 {
            // safety: walking our own intrusive list
            let next = unsafe { *(head as *const usize) };
            central.return_chunk(head as *mut u8);
            head = next;
        }
        self.head.set(0);
        self.count.set(0);
    }
}
