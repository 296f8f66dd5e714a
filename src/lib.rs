//! A concurrency substrate built from two tightly coupled cores sharing one
//! per-thread memory foundation:
//!
//! * a tiered thread-caching allocator ([`heap::ThreadHeap`]): per-thread
//!   slab heaps backed by a central chunk cache, so small/large allocations
//!   avoid per-allocation global contention;
//! * a multi-version software transactional memory engine ([`stm`]) layered
//!   on that allocator, providing serializable atomic multi-object
//!   transactions with snapshot reads, TL2-style commit-time locking, and
//!   epoch-based reclamation ([`ebr`]) of retired versions.
//!
//! The intended entry points are [`stm::TMVar`] and [`stm::atomically`]:
//!
//! ```
//! use galena::stm::{atomically, TMVar};
//!
//! let account = TMVar::new(100i64);
//! atomically(|tx| {
//!     let v = tx.load(&account)?;
//!     tx.store(&account, v + 50)
//! })
//! .unwrap();
//! let balance = atomically(|tx| tx.load(&account)).unwrap();
//! assert_eq!(balance, 150);
//! ```
//!
//! The allocator is also usable on its own through
//! [`heap::ThreadHeap::allocate`] / [`heap::ThreadHeap::deallocate`].

pub mod config;
pub mod ebr;
pub mod heap;
mod loom_testing;
pub mod stm;
mod sys;
mod util;
