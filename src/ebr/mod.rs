//! Epoch-based reclamation with three rotating retire buckets.
//!
//! Readers bracket their traversals with [`EbrManager::enter`] /
//! [`EbrManager::leave`]; writers hand retired pointers to
//! [`EbrManager::retire`] together with a deleter. The global epoch only
//! advances when every in-critical thread has caught up with it, and an
//! advance to epoch `g` reclaims the bucket filled two epochs earlier, so
//! a pointer retired in epoch `e` survives at least until `g >= e + 2`.
//! This gives every critical section that could still see it time to
//! finish.
//!
//! Deleters run on whichever thread performs the advance. They typically
//! free memory into the thread heap, which may be a *different* thread's
//! heap than the one that allocated: exactly the cross-free case the
//! slab remote-free path exists for.
//!
//! Thread slots are handed out through a thread-local proxy and recycled
//! through a lock-free reuse stack when the thread exits, so the slot
//! array only ever grows with the peak thread count, not the total.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::Level;

use crate::config::{EBR_EPOCH_BUCKETS, EBR_RETIRE_PRESSURE};
use crate::util::CacheAligned;

/// First segment size; each growth doubles the capacity.
const INITIAL_SLOT_CAPACITY: usize = 32;

/// Reuse-stack heads pack a 16-bit generation above a 48-bit slot address
/// to defeat ABA on pop (slots are recycled, so a bare pointer CAS is not
/// enough).
const SLOT_PTR_MASK: u64 = (1 << 48) - 1;

/// One thread's visibility into the epoch scheme. Cache-line isolated:
/// the owner writes it on every enter/leave while advancers scan it.
#[repr(align(64))]
pub struct ThreadSlot {
    local_epoch: AtomicU64,
    in_critical: AtomicBool,
    /// Link for the reuse stack; only meaningful while the slot is free
    reuse_next: AtomicUsize,
}

impl ThreadSlot {
    fn new() -> Self {
        Self {
            local_epoch: AtomicU64::new(0),
            in_critical: AtomicBool::new(false),
            reuse_next: AtomicUsize::new(0),
        }
    }
}

/// Slot storage: segments are allocated on demand under a mutex and never
/// freed (the manager is a process-lifetime static), which is what makes
/// handing out `&'static ThreadSlot` sound. The free stack is lock-free
/// so thread exit never takes the segment mutex.
struct SlotRegistry {
    free: AtomicU64,
    segments: Mutex<Vec<Box<[ThreadSlot]>>>,
    capacity: AtomicUsize,
}

impl SlotRegistry {
    const fn new() -> Self {
        Self {
            free: AtomicU64::new(0),
            segments: Mutex::new(Vec::new()),
            capacity: AtomicUsize::new(0),
        }
    }

    fn acquire(&self) -> &'static ThreadSlot {
        if let Some(slot) = self.pop_free() {
            return slot;
        }
        self.expand_and_acquire()
    }

    fn expand_and_acquire(&self) -> &'static ThreadSlot {
        let mut segments = self.segments.lock().unwrap();
        // double-check: someone else may have expanded while we waited
        if let Some(slot) = self.pop_free() {
            return slot;
        }

        let current = self.capacity.load(Ordering::Relaxed);
        let grow = if current == 0 {
            INITIAL_SLOT_CAPACITY
        } else {
            current
        };
        let segment: Box<[ThreadSlot]> = (0..grow).map(|_| ThreadSlot::new()).collect();
        tracing::event!(Level::DEBUG, new_capacity = current + grow, "ebr::grow_slots");

        // safety: the segment is about to be owned by a static that is
        // never dropped, so its slots live for the process lifetime
        for i in 0..grow - 1 {
            let slot = unsafe { &*segment.as_ptr().add(i) };
            self.push_free(slot);
        }
        let last = unsafe { &*segment.as_ptr().add(grow - 1) };

        segments.push(segment);
        self.capacity.store(current + grow, Ordering::Relaxed);
        last
    }

    fn pop_free(&self) -> Option<&'static ThreadSlot> {
        let mut head = self.free.load(Ordering::Acquire);
        loop {
            let slot_ptr = (head & SLOT_PTR_MASK) as usize as *const ThreadSlot;
            if slot_ptr.is_null() {
                return None;
            }
            // safety: slots are never freed; a stale pointer still points
            // at a live slot, and the generation tag rejects stale heads
            let next = unsafe { (*slot_ptr).reuse_next.load(Ordering::Relaxed) } as u64;
            let tagged = (head.wrapping_add(1 << 48) & !SLOT_PTR_MASK) | (next & SLOT_PTR_MASK);
            match self.free.compare_exchange_weak(
                head,
                tagged,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(unsafe { &*slot_ptr }),
                Err(x) => head = x,
            }
        }
    }

    fn push_free(&self, slot: &'static ThreadSlot) {
        debug_assert!(!slot.in_critical.load(Ordering::Relaxed));
        let slot_addr = slot as *const ThreadSlot as u64;
        debug_assert_eq!(slot_addr & !SLOT_PTR_MASK, 0);
        let mut head = self.free.load(Ordering::Relaxed);
        loop {
            slot.reuse_next
                .store((head & SLOT_PTR_MASK) as usize, Ordering::Relaxed);
            let tagged = (head.wrapping_add(1 << 48) & !SLOT_PTR_MASK) | slot_addr;
            // order: release so the reuse_next link is visible to poppers
            match self.free.compare_exchange_weak(
                head,
                tagged,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(x) => head = x,
            }
        }
    }

    fn for_each(&self, mut f: impl FnMut(&ThreadSlot)) {
        let segments = self.segments.lock().unwrap();
        for segment in segments.iter() {
            for slot in segment.iter() {
                f(slot);
            }
        }
    }
}

struct RetireNode {
    ptr: *mut u8,
    deleter: unsafe fn(*mut u8),
    next: *mut RetireNode,
}

/// MPSC stack of retired pointers for one epoch residue class. Many
/// threads push; the single successful advancer for an epoch detaches the
/// whole stack in one exchange and runs the deleters.
struct RetireBucket {
    head: AtomicPtr<RetireNode>,
    /// Approximate occupancy, read for advance back-pressure
    len: AtomicUsize,
}

impl RetireBucket {
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    fn push(&self, ptr: *mut u8, deleter: unsafe fn(*mut u8)) {
        let node = Box::into_raw(Box::new(RetireNode {
            ptr,
            deleter,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // safety: the node is ours until the CAS publishes it
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(x) => head = x,
            }
        }
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Detach everything currently in the bucket and run the deleters.
    /// Pushes racing with the detach land on the fresh head and wait for
    /// the bucket's next turn.
    fn drain(&self) -> usize {
        let mut node = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        let mut reclaimed = 0usize;
        while !node.is_null() {
            // safety: detached nodes are exclusively ours
            let owned = unsafe { Box::from_raw(node) };
            node = owned.next;
            unsafe { (owned.deleter)(owned.ptr) };
            reclaimed += 1;
        }
        if reclaimed > 0 {
            self.len.fetch_sub(reclaimed, Ordering::Relaxed);
        }
        reclaimed
    }

    fn approx_len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }
}

struct SlotProxy {
    slot: Cell<Option<&'static ThreadSlot>>,
}

impl Drop for SlotProxy {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.get() {
            EbrManager::global().registry.push_free(slot);
        }
    }
}

thread_local! {
    static SLOT_PROXY: SlotProxy = const {
        SlotProxy {
            slot: Cell::new(None),
        }
    };
}

/// The process-wide epoch manager.
pub struct EbrManager {
    global_epoch: CacheAligned<AtomicU64>,
    buckets: [RetireBucket; EBR_EPOCH_BUCKETS],
    registry: SlotRegistry,
}

static GLOBAL_EBR: EbrManager = EbrManager::new();

impl EbrManager {
    const fn new() -> Self {
        Self {
            global_epoch: CacheAligned(AtomicU64::new(0)),
            buckets: [RetireBucket::new(), RetireBucket::new(), RetireBucket::new()],
            registry: SlotRegistry::new(),
        }
    }

    pub fn global() -> &'static EbrManager {
        &GLOBAL_EBR
    }

    fn local_slot(&self) -> &'static ThreadSlot {
        SLOT_PROXY.with(|proxy| match proxy.slot.get() {
            Some(slot) => slot,
            None => {
                let slot = self.registry.acquire();
                proxy.slot.set(Some(slot));
                slot
            }
        })
    }

    /// Open a critical section: pointers observed from here on will not be
    /// reclaimed until after [`EbrManager::leave`]. Not reentrant.
    pub fn enter(&self) {
        let slot = self.local_slot();
        debug_assert!(!slot.in_critical.load(Ordering::Relaxed));
        // Publish the flag first, then settle on the current epoch. The
        // re-read closes the race where an advancer scanned this slot
        // before the flag store became visible: if the epoch moved under
        // us we settle again, so once local_epoch == global_epoch holds,
        // every subsequent scan observes the flag (SeqCst total order puts
        // our store before any scan that reads the epoch we settled on).
        slot.in_critical.store(true, Ordering::SeqCst);
        let mut epoch = self.global_epoch.0.load(Ordering::SeqCst);
        loop {
            slot.local_epoch.store(epoch, Ordering::SeqCst);
            let now = self.global_epoch.0.load(Ordering::SeqCst);
            if now == epoch {
                break;
            }
            epoch = now;
        }
    }

    /// Close the critical section and opportunistically try to turn the
    /// epoch over.
    pub fn leave(&self) {
        let slot = self.local_slot();
        debug_assert!(slot.in_critical.load(Ordering::Relaxed));
        // order: release so the section's accesses complete before the
        // slot scans as inactive
        slot.in_critical.store(false, Ordering::Release);
        self.try_advance();
    }

    /// Hand over a pointer for deferred reclamation. Must be called from
    /// inside an enter/leave section (the current epoch may otherwise turn
    /// over far enough to reclaim the bucket while we are pushing into
    /// it).
    pub fn retire(&self, ptr: *mut u8, deleter: unsafe fn(*mut u8)) {
        if ptr.is_null() {
            return;
        }
        let epoch = self.global_epoch.0.load(Ordering::Acquire);
        let bucket = &self.buckets[(epoch % EBR_EPOCH_BUCKETS as u64) as usize];
        bucket.push(ptr, deleter);
        if bucket.approx_len() >= EBR_RETIRE_PRESSURE {
            self.try_advance();
        }
    }

    /// Attempt one epoch turn. Fails if any in-critical thread has not
    /// caught up with the current epoch, or if another thread advanced
    /// first. On success, reclaims the bucket retired two epochs ago on
    /// the calling thread.
    pub fn try_advance(&self) -> bool {
        let epoch = self.global_epoch.0.load(Ordering::SeqCst);
        let mut blocked = false;
        self.registry.for_each(|slot| {
            if slot.in_critical.load(Ordering::SeqCst)
                && slot.local_epoch.load(Ordering::SeqCst) != epoch
            {
                blocked = true;
            }
        });
        if blocked {
            return false;
        }
        if self
            .global_epoch
            .0
            .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        // new epoch is `epoch + 1`; the bucket retired two epochs before it
        // is (epoch - 1) mod 3 == (epoch + 2) mod 3
        let bucket = &self.buckets[((epoch + 2) % EBR_EPOCH_BUCKETS as u64) as usize];
        let reclaimed = bucket.drain();
        if reclaimed > 0 {
            tracing::event!(
                Level::DEBUG,
                epoch = epoch + 1,
                reclaimed,
                "ebr::advance"
            );
        }
        true
    }

    pub fn current_epoch(&self) -> u64 {
        self.global_epoch.0.load(Ordering::Acquire)
    }

    /// Approximate number of retired-but-unreclaimed pointers.
    pub fn pending_retired(&self) -> usize {
        self.buckets.iter().map(|b| b.approx_len()).sum()
    }

    #[cfg(test)]
    pub(crate) fn slot_capacity(&self) -> usize {
        self.registry.capacity.load(Ordering::Relaxed)
    }
}
