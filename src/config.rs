//! Global compile-time configuration.
//!
//! Everything here is a build-time constant; there is no runtime tuning
//! surface. All sizes are in bytes unless stated otherwise.

/// Unit of OS allocation. Every slab occupies exactly one chunk, and large
/// spans occupy a whole number of chunks.
pub const CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Chunks are aligned to their own size so that any interior pointer can be
/// masked down to the chunk header.
pub const CHUNK_ALIGN: usize = CHUNK_SIZE;

/// `ptr & CHUNK_MASK` yields the base of the containing chunk.
pub const CHUNK_MASK: usize = !(CHUNK_SIZE - 1);

const _: () = assert!(CHUNK_SIZE.is_power_of_two());

/// Water-mark for the central chunk cache LIFO; chunks returned beyond this
/// go back to the OS.
pub const MAX_CENTRAL_CACHE: usize = 64;

/// Water-mark for each per-thread chunk cache LIFO; overflow spills to the
/// central cache.
pub const MAX_THREAD_CACHE: usize = 8;

/// How many heads of a pool's full list the rescue path probes per
/// allocation before giving up and fetching a fresh chunk.
pub const MAX_POOL_RESCUE_CHECKS: usize = 4;

/// Smallest serviced allocation; requests below round up to this.
pub const MIN_ALLOC: usize = 8;

/// Small/large boundary. Requests above this take the span path.
pub const MAX_SMALL_ALLOC: usize = 256 * 1024;

/// Number of size classes covering `[MIN_ALLOC, MAX_SMALL_ALLOC]`.
pub const CLASS_COUNT: usize = 104;

/// Number of stripes in the commit-lock table.
pub const LOCK_TABLE_SIZE: usize = 1 << 20;

const _: () = assert!(LOCK_TABLE_SIZE.is_power_of_two());

/// Upper bound on the length of a transactional variable's version chain
/// after a committer finishes pruning.
pub const MAX_HISTORY: usize = 8;

/// Number of rotating retire buckets in the epoch manager.
pub const EBR_EPOCH_BUCKETS: usize = 3;

/// Retire-bucket length at which `retire` starts attempting epoch advances
/// itself rather than waiting for the next `leave`.
pub const EBR_RETIRE_PRESSURE: usize = 128;

/// Padding granularity for contended metadata (slab headers, lock stripes,
/// epoch slots, the global clock).
pub const CACHE_LINE: usize = 64;
