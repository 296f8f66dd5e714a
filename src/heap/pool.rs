//! Per-thread, per-size-class slab pools.
//!
//! Each pool keeps one *current* slab that the fast path tries first, a
//! *partial* list of slabs known to have local free space, and a *full*
//! list of slabs that looked exhausted the last time the owner touched
//! them. A slab on the full list can become usable again when other
//! threads remote-free into it; the bounded *rescue* scan recovers those
//! without walking the whole list.
//!
//! Invariant: at any moment a slab is current, on exactly one of the two
//! lists, or sitting in a chunk cache, never more than one of these.

use std::cell::Cell;
use std::ptr;

use tracing::Level;

use crate::config::MAX_POOL_RESCUE_CHECKS;
use crate::heap::central::{CentralChunkCache, ThreadChunkCache};
use crate::heap::slab::Slab;
use crate::util::UsizePtr;

/// Intrusive doubly-linked list threaded through [`Slab::prev`] /
/// [`Slab::next`]. Owner-thread only; the element type guarantees a slab
/// is on at most one list, which is what makes the unchecked unlinking in
/// `remove` sound.
pub(super) struct SlabList {
    head: Cell<*mut Slab>,
    tail: Cell<*mut Slab>,
}

impl SlabList {
    pub fn new() -> Self {
        Self {
            head: Cell::new(ptr::null_mut()),
            tail: Cell::new(ptr::null_mut()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.get().is_null()
    }

    pub fn front(&self) -> *mut Slab {
        self.head.get()
    }

    /// Safety (all mutators): `slab` must be a live slab owned by this
    /// pool's thread, and for insertions it must not currently be on any
    /// list.
    pub unsafe fn push_front(&self, slab: *mut Slab) {
        let old_head = self.head.get();
        (*slab).prev.set(ptr::null_mut());
        (*slab).next.set(old_head);
        if old_head.is_null() {
            self.tail.set(slab);
        } else {
            (*old_head).prev.set(slab);
        }
        self.head.set(slab);
    }

    pub unsafe fn push_back(&self, slab: *mut Slab) {
        let old_tail = self.tail.get();
        (*slab).next.set(ptr::null_mut());
        (*slab).prev.set(old_tail);
        if old_tail.is_null() {
            self.head.set(slab);
        } else {
            (*old_tail).next.set(slab);
        }
        self.tail.set(slab);
    }

    /// Unlink `slab`, which must be on this list.
    pub unsafe fn remove(&self, slab: *mut Slab) {
        let prev = (*slab).prev.get();
        let next = (*slab).next.get();
        if prev.is_null() {
            debug_assert_eq!(self.head.get(), slab);
            self.head.set(next);
        } else {
            (*prev).next.set(next);
        }
        if next.is_null() {
            debug_assert_eq!(self.tail.get(), slab);
            self.tail.set(prev);
        } else {
            (*next).prev.set(prev);
        }
        (*slab).prev.set(ptr::null_mut());
        (*slab).next.set(ptr::null_mut());
    }

    pub unsafe fn pop_front(&self) -> *mut Slab {
        let head = self.head.get();
        if !head.is_null() {
            self.remove(head);
        }
        head
    }

    /// Rotate the head to the tail; gives the rescue scan fairness across
    /// probes.
    pub unsafe fn move_head_to_tail(&self) {
        let first = self.head.get();
        if first.is_null() || first == self.tail.get() {
            return;
        }
        let new_head = (*first).next.get();
        (*new_head).prev.set(ptr::null_mut());
        self.head.set(new_head);

        let last = self.tail.get();
        (*last).next.set(first);
        (*first).prev.set(last);
        (*first).next.set(ptr::null_mut());
        self.tail.set(first);
    }

    #[cfg(test)]
    fn sum_allocated(&self) -> u64 {
        let mut sum = 0u64;
        let mut slab = self.head.get();
        while !slab.is_null() {
            // safety: slabs on our lists are live and ours
            unsafe {
                sum += (*slab).allocated_count() as u64;
                slab = (*slab).next.get();
            }
        }
        sum
    }
}

/// One thread's allocation state for one block size.
pub struct SizeClassPool {
    block_size: u32,
    current: Cell<*mut Slab>,
    partial: SlabList,
    full: SlabList,
    /// Rescue probes that recovered nothing; observable signal for whether
    /// `MAX_POOL_RESCUE_CHECKS` is big enough for the workload
    rescue_misses: Cell<u64>,
}

impl SizeClassPool {
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            current: Cell::new(ptr::null_mut()),
            partial: SlabList::new(),
            full: SlabList::new(),
            rescue_misses: Cell::new(0),
        }
    }

    /// The pool's identity as stamped into its slabs' owner field.
    pub fn identity(&self) -> usize {
        self as *const SizeClassPool as usize
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn rescue_misses(&self) -> u64 {
        self.rescue_misses.get()
    }

    /// Live blocks from the owner's view across every slab this pool
    /// holds (test observability).
    #[cfg(test)]
    pub(crate) fn live_block_count(&self) -> u64 {
        let mut sum = self.partial.sum_allocated() + self.full.sum_allocated();
        let current = self.current.get();
        if !current.is_null() {
            // safety: current is live and ours
            sum += unsafe { (*current).allocated_count() } as u64;
        }
        sum
    }

    /// Take one block, refilling from partial slabs, rescued full slabs,
    /// or a fresh chunk as needed. Null only when the chunk caches and the
    /// OS are exhausted.
    pub fn allocate(&self, cache: &ThreadChunkCache) -> *mut u8 {
        let current = self.current.get();
        if !current.is_null() {
            // safety: current is a live slab owned by this thread
            let ptr = unsafe { (*current).allocate() };
            if !ptr.is_null() {
                return ptr;
            }
            // exhausted from our view; set it aside until a remote free
            // resurrects it
            unsafe { self.full.push_back(current) };
            self.current.set(ptr::null_mut());
        }

        if !self.partial.is_empty() {
            return self.alloc_from_partial();
        }

        if !self.full.is_empty() {
            let ptr = self.alloc_from_rescue();
            if !ptr.is_null() {
                return ptr;
            }
        }

        self.alloc_from_new(cache)
    }

    fn alloc_from_partial(&self) -> *mut u8 {
        // safety: list is non-empty; slabs on it are ours
        let slab = unsafe { self.partial.pop_front() };
        self.current.set(slab);
        unsafe { (*slab).allocate() }
    }

    /// Probe up to `MAX_POOL_RESCUE_CHECKS` heads of the full list for
    /// accumulated remote frees. A successful probe becomes the current
    /// slab; unsuccessful ones rotate to the tail.
    fn alloc_from_rescue(&self) -> *mut u8 {
        let mut checks = 0;
        while !self.full.is_empty() && checks < MAX_POOL_RESCUE_CHECKS {
            let victim = self.full.front();
            // safety: victim is on our full list, hence live and ours
            unsafe {
                if (*victim).reclaim_remote_memory() > 0 {
                    self.full.remove(victim);
                    self.current.set(victim);
                    tracing::event!(
                        Level::TRACE,
                        slab = ?UsizePtr::from(victim),
                        block_size = self.block_size,
                        "pool::rescue"
                    );
                    return (*victim).allocate();
                }
                self.full.move_head_to_tail();
            }
            checks += 1;
        }
        self.rescue_misses.set(self.rescue_misses.get() + 1);
        tracing::event!(
            Level::TRACE,
            block_size = self.block_size,
            misses = self.rescue_misses.get(),
            "pool::rescue_miss"
        );
        ptr::null_mut()
    }

    fn alloc_from_new(&self, cache: &ThreadChunkCache) -> *mut u8 {
        let chunk = cache.fetch_chunk();
        if chunk.is_null() {
            return ptr::null_mut();
        }
        tracing::event!(
            Level::TRACE,
            chunk = ?UsizePtr::from(chunk),
            block_size = self.block_size,
            "pool::new_slab"
        );
        // safety: the chunk is fresh, aligned, and exclusively ours
        let slab = unsafe { Slab::create_at(chunk, self.identity(), self.block_size) };
        self.current.set(slab);
        unsafe { (*slab).allocate() }
    }

    /// Owner-thread deallocation of `ptr` into `slab`.
    ///
    /// Safety: `slab` must belong to this pool (identity already checked by
    /// the caller), `ptr` must be a live block of it, and the caller must
    /// be the owning thread.
    pub unsafe fn deallocate(&self, cache: &ThreadChunkCache, slab: *mut Slab, ptr: *mut u8) {
        let s = &*slab;
        let was_full = s.is_full();
        // a freshly filled current slab can have was_full set while it is
        // not on the full list yet; list surgery below must skip it
        let is_current = self.current.get() == slab;
        let now_empty = s.free_local(ptr);

        if now_empty {
            if s.reclaim_remote_memory() > 0 {
                // not actually idle: remote frees were pending
                if was_full && !is_current {
                    self.full.remove(slab);
                    self.partial.push_front(slab);
                }
            } else {
                // truly idle: hand the chunk back
                if is_current {
                    self.current.set(ptr::null_mut());
                } else if was_full {
                    self.full.remove(slab);
                } else {
                    self.partial.remove(slab);
                }
                Slab::destroy_for_reuse(slab);
                cache.return_chunk(slab as *mut u8);
            }
        } else if was_full && !is_current {
            // LIFO on the partial list keeps recently touched slabs warm
            self.full.remove(slab);
            self.partial.push_front(slab);
        }
    }
}

impl Drop for SizeClassPool {
    /// Thread teardown. Idle slabs give their chunks straight back to the
    /// central cache; slabs that still hold live blocks are orphaned so
    /// that late frees (EBR deleters, cross-thread drops) keep taking the
    /// remote path instead of dereferencing a dead pool.
    fn drop(&mut self) {
        let central = CentralChunkCache::global();
        let mut release = |slab: *mut Slab| {
            // safety: we are the owning thread and the slab is off all
            // lists by the time this runs
            unsafe {
                let s = &*slab;
                s.reclaim_remote_memory();
                if s.is_empty() {
                    Slab::destroy_for_reuse(slab);
                    central.return_chunk(slab as *mut u8);
                } else {
                    tracing::event!(
                        Level::TRACE,
                        slab = ?UsizePtr::from(slab),
                        live = s.allocated_count(),
                        "pool::orphan"
                    );
                    s.orphan();
                }
            }
        };

        let current = self.current.get();
        if !current.is_null() {
            self.current.set(ptr::null_mut());
            release(current);
        }
        loop {
            let slab = unsafe { self.partial.pop_front() };
            if slab.is_null() {
                break;
            }
            release(slab);
        }
        loop {
            let slab = unsafe { self.full.pop_front() };
            if slab.is_null() {
                break;
            }
            release(slab);
        }
    }
}
