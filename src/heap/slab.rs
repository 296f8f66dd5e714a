//! Slabs: one chunk carved into fixed-size blocks of a single size class.
//!
//! A slab services allocations from three sources, in order: an intrusive
//! LIFO of blocks freed by the owning thread, blocks freed by *other*
//! threads (stolen in one atomic exchange), and finally the bump frontier
//! of never-touched chunk space. All owner-side state is plain
//! (`Cell`-based) and must only be touched by the owning thread; the only
//! cross-thread entry points are [`Slab::free_remote`] and the read-only
//! identity accessors.

use std::cell::Cell;
use std::mem::size_of;
use std::ptr::{self, addr_of};
use std::sync::atomic::Ordering;

use crate::config::{CACHE_LINE, CHUNK_ALIGN, CHUNK_SIZE};
use crate::loom_testing::*;
use crate::util::{round_up, CacheAligned};

/// Tag stored in the first machine word of every chunk header, used to
/// route deallocations: `ptr & CHUNK_MASK` finds the header, the tag says
/// whether the chunk is a slab or a large span.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u64)]
pub enum ChunkKind {
    Small = 0x51ab_0001,
    Large = 0x51ab_0002,
}

/// Common prefix of [`Slab`] and [`crate::heap::Span`]; both are
/// `#[repr(C)]` with the tag first, so a chunk base pointer can be read as
/// this before the real type is known.
#[repr(C)]
pub struct ChunkHeader {
    pub kind: ChunkKind,
}

/// Lock-free multi-producer single-consumer stack of freed blocks.
///
/// Producers are arbitrary threads freeing blocks they do not own; the one
/// consumer is the owning thread, which takes the entire stack in a single
/// exchange. The link pointer lives in the first word of each freed block.
/// Single-word CAS is ABA-safe here: a block cannot be freed twice, and a
/// pushed block is not handed out again until after a steal, so a head
/// value never reappears with a different tail behind it.
pub struct AtomicFreeList {
    head: AtomicUsize,
}

impl AtomicFreeList {
    pub fn new() -> Self {
        Self {
            head: AtomicUsize::new(0),
        }
    }

    /// Push a block. `ptr` must point at a dead block of at least one
    /// machine word that no other thread can concurrently access.
    pub unsafe fn push(&self, ptr: *mut u8) {
        debug_assert!(!ptr.is_null());
        let mut old = self.head.load(Ordering::Relaxed);
        loop {
            (ptr as *mut usize).write(old);
            // order: release on success so that the link write above (and
            // anything the freeing thread wrote into the block before
            // freeing it) happens-before the owner's steal
            match self.head.compare_exchange_weak(
                old,
                ptr as usize,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => old = x,
            }
        }
    }

    /// Detach the whole stack and return its head (null if empty).
    ///
    /// order: acquire to observe every pushed link; the intermediate pushes
    /// are RmW operations and so form a release sequence that this
    /// synchronizes with in full.
    pub fn steal_all(&self) -> *mut u8 {
        self.head.swap(0, Ordering::AcqRel) as *mut u8
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed) == 0
    }
}

/// Header of a chunk used as an array of same-sized blocks.
///
/// Lives at the base of its chunk (placement-constructed by
/// [`Slab::create_at`]); the first block starts at the next cache line
/// after the header.
#[repr(C, align(64))]
pub struct Slab {
    /// Must stay first; see [`ChunkHeader`]
    kind: ChunkKind,
    block_size: u32,
    max_block_count: u32,
    /// Live allocations from the owner's view; remote frees are not
    /// subtracted until the owner steals the remote list
    allocated_count: Cell<u32>,
    /// Identity of the owning size-class pool (its address), used only for
    /// pointer comparison on the deallocation fast path. Cleared when the
    /// slab is destroyed or orphaned.
    owner: AtomicUsize,
    /// Frontier of never-allocated space
    bump_ptr: Cell<usize>,
    end_ptr: usize,
    /// Intrusive LIFO of blocks freed by the owning thread (0 = empty)
    local_free: Cell<usize>,
    /// Links for whichever one of the pool's lists this slab is on
    pub(super) prev: Cell<*mut Slab>,
    pub(super) next: Cell<*mut Slab>,
    /// Kept on its own cache line: this is the one field remote threads
    /// hammer on
    remote_free: CacheAligned<AtomicFreeList>,
}

impl Slab {
    /// Construct a slab header in place at the base of `chunk` and set up
    /// the block geometry.
    ///
    /// Safety: `chunk` must be a live, chunk-aligned, chunk-sized mapping
    /// that nothing else references.
    pub unsafe fn create_at(chunk: *mut u8, owner: usize, block_size: u32) -> *mut Slab {
        debug_assert!(!chunk.is_null());
        debug_assert_eq!(chunk as usize & (CHUNK_ALIGN - 1), 0);
        debug_assert!(block_size as usize >= size_of::<usize>());

        let head_size = round_up(size_of::<Slab>(), CACHE_LINE);
        let avail = CHUNK_SIZE - head_size;
        let slab = chunk as *mut Slab;
        slab.write(Slab {
            kind: ChunkKind::Small,
            block_size,
            max_block_count: (avail / block_size as usize) as u32,
            allocated_count: Cell::new(0),
            owner: AtomicUsize::new(owner),
            bump_ptr: Cell::new(chunk as usize + head_size),
            end_ptr: chunk as usize + CHUNK_SIZE,
            local_free: Cell::new(0),
            prev: Cell::new(ptr::null_mut()),
            next: Cell::new(ptr::null_mut()),
            remote_free: CacheAligned(AtomicFreeList::new()),
        });
        slab
    }

    /// Take one block out of this slab, or null if the slab is exhausted
    /// from this thread's point of view (local list empty, nothing to
    /// steal, bump frontier spent).
    pub fn allocate(&self) -> *mut u8 {
        if self.local_free.get() != 0 {
            return self.alloc_from_list();
        }

        if !self.remote_free.0.is_empty() && self.reclaim_remote_memory() > 0 {
            return self.alloc_from_list();
        }

        let bump = self.bump_ptr.get();
        if bump + self.block_size as usize <= self.end_ptr {
            self.bump_ptr.set(bump + self.block_size as usize);
            self.allocated_count.set(self.allocated_count.get() + 1);
            return bump as *mut u8;
        }

        ptr::null_mut()
    }

    fn alloc_from_list(&self) -> *mut u8 {
        let head = self.local_free.get();
        debug_assert!(head != 0);
        // safety: blocks on the local list are dead and owned by us
        self.local_free.set(unsafe { *(head as *const usize) });
        self.allocated_count.set(self.allocated_count.get() + 1);
        head as *mut u8
    }

    /// Owner-thread free. Returns true iff the slab now has no live blocks
    /// from the owner's view.
    ///
    /// Safety: `ptr` must be a live block of this slab, freed exactly once,
    /// and the caller must be the owning thread.
    pub unsafe fn free_local(&self, ptr: *mut u8) -> bool {
        (ptr as *mut usize).write(self.local_free.get());
        self.local_free.set(ptr as usize);
        let count = self.allocated_count.get() - 1;
        self.allocated_count.set(count);
        count == 0
    }

    /// Cross-thread free: push the block on the remote MPSC stack. Never
    /// touches owner-side state, so it is callable through a raw header
    /// pointer from any thread.
    ///
    /// Safety: `ptr` must be a live block of the slab at `self_`, freed
    /// exactly once; the chunk must still be mapped (guaranteed because a
    /// slab with live blocks is never returned to the chunk caches).
    pub unsafe fn free_remote(self_: *const Slab, ptr: *mut u8) {
        let remote = &*addr_of!((*self_).remote_free);
        remote.0.push(ptr);
    }

    /// Steal everything on the remote free list and splice it onto the
    /// local list. Returns the number of blocks recovered. Owner thread
    /// only; this is also the pool's rescue entry point.
    pub fn reclaim_remote_memory(&self) -> u32 {
        let head = self.remote_free.0.steal_all();
        if head.is_null() {
            return 0;
        }

        let mut count = 1u32;
        let mut tail = head as usize;
        // safety: stolen blocks are dead and, post-steal, exclusively ours;
        // the acquire in steal_all made their link words visible
        unsafe {
            loop {
                let next = *(tail as *const usize);
                if next == 0 {
                    break;
                }
                tail = next;
                count += 1;
            }
            (tail as *mut usize).write(self.local_free.get());
        }
        self.local_free.set(head as usize);
        self.allocated_count
            .set(self.allocated_count.get() - count);
        count
    }

    pub fn kind(&self) -> ChunkKind {
        self.kind
    }

    /// Full from the owner's view: every block handed out and not locally
    /// reclaimed. Remote frees that have not been stolen yet do not count,
    /// which is exactly why the pool's rescue scan exists.
    pub fn is_full(&self) -> bool {
        self.allocated_count.get() == self.max_block_count
    }

    pub fn is_empty(&self) -> bool {
        self.allocated_count.get() == 0
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn max_block_count(&self) -> u32 {
        self.max_block_count
    }

    pub fn allocated_count(&self) -> u32 {
        self.allocated_count.get()
    }

    /// Read the block size through a raw header pointer (deallocation
    /// routing on non-owner threads).
    ///
    /// Safety: `self_` must point at a live slab header.
    pub unsafe fn block_size_of(self_: *const Slab) -> u32 {
        *addr_of!((*self_).block_size)
    }

    /// Read the owning pool's identity through a raw header pointer.
    ///
    /// Safety: `self_` must point at a live slab header.
    pub unsafe fn owner_of(self_: *const Slab) -> usize {
        (*addr_of!((*self_).owner)).load(Ordering::Relaxed)
    }

    /// Detach the slab from its pool identity without tearing the header
    /// down; frees from any thread will now take the remote path. Used when
    /// the owning thread exits while blocks are still live.
    pub fn orphan(&self) {
        self.owner.store(0, Ordering::Relaxed);
    }

    /// Wipe the header before the chunk is recycled, so a stale slab
    /// pointer can never pass the owner identity check again. Debug builds
    /// poison the whole header region.
    ///
    /// Safety: the slab must be empty with its remote list drained, off
    /// every pool list, and about to be returned to a chunk cache; no
    /// reference to it may be used afterwards.
    pub unsafe fn destroy_for_reuse(self_: *mut Slab) {
        if cfg!(debug_assertions) {
            let head_size = round_up(size_of::<Slab>(), CACHE_LINE);
            ptr::write_bytes(self_ as *mut u8, 0xde, head_size);
        } else {
            (*addr_of!((*self_).owner)).store(0, Ordering::Relaxed);
        }
    }
}
