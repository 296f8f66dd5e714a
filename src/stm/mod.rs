//! Multi-version software transactional memory.
//!
//! TL2-style commit protocol upgraded to MVCC: transactions read a
//! snapshot chosen by the global clock, buffer writes as preconstructed
//! version nodes, and at commit time acquire striped per-variable locks
//! in a total order, take a fresh commit timestamp, re-validate the read
//! set, and append the new versions to each variable's chain. Readers
//! never block writers and never take locks; a read that observes a
//! concurrent committer simply retries.
//!
//! The user-facing surface is [`atomically`] plus [`Transaction::load`] /
//! [`Transaction::store`]:
//!
//! ```
//! use galena::stm::{atomically, TMVar};
//!
//! let x = TMVar::new(1i32);
//! let y = TMVar::new(2i32);
//! let sum = atomically(|tx| {
//!     let a = tx.load(&x)?;
//!     let b = tx.load(&y)?;
//!     tx.store(&x, b)?;
//!     tx.store(&y, a)?;
//!     Ok(a + b)
//! })
//! .unwrap();
//! assert_eq!(sum, 3);
//! ```
//!
//! [`TxError::Retry`] is pure control flow: user code propagates it with
//! `?` and [`atomically`] consumes it by re-running the closure against a
//! fresh snapshot. It never escapes to the caller.

mod lock_table;
mod tmvar;

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use thiserror::Error;
use tracing::Level;

pub use lock_table::StripedLockTable;
pub use tmvar::TMVar;

use crate::ebr::EbrManager;
use crate::loom_testing::yield_now;
use crate::util::CacheAligned;
use tmvar::VersionNode;

/// Why a transaction could not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TxError {
    /// The snapshot is no longer readable (concurrent committer observed,
    /// version too new, or history pruned). Consumed by [`atomically`];
    /// user closures just propagate it.
    #[error("transaction conflict, must retry")]
    Retry,
    /// The thread heap could not allocate a version node. Surfaces to the
    /// caller of [`atomically`]; an out-of-memory condition is not
    /// retryable.
    #[error("thread heap exhausted")]
    HeapExhausted,
}

pub type TxResult<T> = Result<T, TxError>;

/// Monotonic commit clock shared by every transaction in the process.
struct GlobalClock;

static CLOCK: CacheAligned<AtomicU64> = CacheAligned(AtomicU64::new(0));

impl GlobalClock {
    /// Current time; start-of-transaction snapshots read this.
    fn now() -> u64 {
        CLOCK.0.load(Ordering::Acquire)
    }

    /// Claim the next commit timestamp. fetch-add keeps it strictly
    /// monotonic across all committers.
    fn tick() -> u64 {
        CLOCK.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

struct ReadLogEntry {
    var_addr: *const (),
    validate: unsafe fn(*const (), u64) -> bool,
}

struct WriteLogEntry {
    var_addr: *const (),
    /// Preconstructed version node; nulled once published so the abort
    /// path cannot double-free it
    new_node: *mut (),
    commit: unsafe fn(*const (), *mut (), u64),
    delete: unsafe fn(*mut ()),
}

/// Per-thread, reusable transaction state. Reset keeps the Vec
/// capacities, so a steady-state transaction allocates nothing but its
/// version nodes.
pub struct TransactionDescriptor {
    read_version: u64,
    read_set: Vec<ReadLogEntry>,
    write_set: Vec<WriteLogEntry>,
    /// Stripe indices held during commit, ascending
    lock_set: Vec<usize>,
}

impl TransactionDescriptor {
    fn new() -> Self {
        Self {
            read_version: 0,
            read_set: Vec::with_capacity(64),
            write_set: Vec::with_capacity(16),
            lock_set: Vec::with_capacity(16),
        }
    }

    fn reset(&mut self) {
        self.read_version = 0;
        self.read_set.clear();
        self.lock_set.clear();
        self.clear_write_set();
    }

    fn clear_write_set(&mut self) {
        for entry in self.write_set.drain(..) {
            if !entry.new_node.is_null() {
                // safety: a non-null node was never published, so we hold
                // the only pointer to it
                unsafe { (entry.delete)(entry.new_node) };
            }
        }
    }
}

impl Drop for TransactionDescriptor {
    fn drop(&mut self) {
        self.clear_write_set();
    }
}

thread_local! {
    static TX_DESC: RefCell<TransactionDescriptor> =
        RefCell::new(TransactionDescriptor::new());
}

/// Handle passed to the [`atomically`] closure; all transactional reads
/// and writes go through it.
pub struct Transaction<'desc> {
    desc: &'desc mut TransactionDescriptor,
}

impl Transaction<'_> {
    fn begin(&mut self) {
        self.desc.reset();
        self.desc.read_version = GlobalClock::now();
    }

    #[cfg(test)]
    pub(crate) fn read_version(&self) -> u64 {
        self.desc.read_version
    }

    #[cfg(test)]
    pub(crate) fn force_read_version(&mut self, rv: u64) {
        self.desc.read_version = rv;
    }

    /// Read `var` within this transaction's snapshot.
    pub fn load<T: Clone>(&mut self, var: &TMVar<T>) -> TxResult<T> {
        let addr = var.addr();

        // read-your-own-writes: the newest buffered store wins
        for entry in self.desc.write_set.iter().rev() {
            if entry.var_addr == addr {
                let node = entry.new_node as *mut VersionNode<T>;
                // safety: buffered nodes are live and exclusively ours
                return Ok(unsafe { (*node).payload.clone() });
            }
        }

        let table = StripedLockTable::global();
        let head = var.load_head();

        // pre-check: we hold no commit locks during the execution phase,
        // so a locked stripe means some other transaction is publishing
        // into it right now
        if table.is_locked(addr) {
            return Err(TxError::Retry);
        }

        self.desc.read_set.push(ReadLogEntry {
            var_addr: addr,
            validate: TMVar::<T>::validate_erased,
        });

        // walk to the newest version inside the snapshot
        let rv = self.desc.read_version;
        let mut node = head;
        loop {
            if node.is_null() {
                // history pruned past this snapshot
                return Err(TxError::Retry);
            }
            // safety: reachable nodes stay live while we are inside the
            // transaction's EBR critical section
            if unsafe { (*node).write_ts } <= rv {
                break;
            }
            node = unsafe { (*node).prev.load(Ordering::Acquire) };
        }

        // post-check with a full fence: the version reads above must not
        // reorder past this lock observation, otherwise a committer could
        // slip a new head in between undetected
        fence(Ordering::SeqCst);
        if table.is_locked(addr) {
            return Err(TxError::Retry);
        }

        // safety: published payloads are immutable
        Ok(unsafe { (*node).payload.clone() })
    }

    /// Buffer a write of `val` to `var`. Nothing is visible to other
    /// transactions until commit.
    pub fn store<T>(&mut self, var: &TMVar<T>, val: T) -> TxResult<()> {
        let addr = var.addr();
        let node = tmvar::alloc_node(val, 0, ptr::null_mut());
        if node.is_null() {
            return Err(TxError::HeapExhausted);
        }

        // a second store to the same variable supersedes the first;
        // publishing both under one commit timestamp would break the
        // chain's strictly decreasing order
        for entry in self.desc.write_set.iter_mut().rev() {
            if entry.var_addr == addr {
                let old = entry.new_node;
                entry.new_node = node as *mut ();
                // safety: the superseded node was never published
                unsafe { (entry.delete)(old) };
                return Ok(());
            }
        }

        self.desc.write_set.push(WriteLogEntry {
            var_addr: addr,
            new_node: node as *mut (),
            commit: TMVar::<T>::commit_erased,
            delete: TMVar::<T>::delete_erased,
        });
        Ok(())
    }

    /// TL2 commit: lock the write set's stripes in ascending index order,
    /// take a commit timestamp, re-validate the read set, publish, unlock.
    /// False means validation lost; the driver restarts the transaction.
    fn commit(&mut self) -> bool {
        if self.desc.write_set.is_empty() {
            // read-only: the snapshot was consistent by construction
            self.desc.reset();
            return true;
        }

        let table = StripedLockTable::global();

        self.desc.lock_set.clear();
        for entry in &self.desc.write_set {
            self.desc.lock_set.push(table.stripe_of(entry.var_addr));
        }
        self.desc.lock_set.sort_unstable();
        self.desc.lock_set.dedup();
        for &idx in &self.desc.lock_set {
            table.lock_index(idx);
        }

        let wv = GlobalClock::tick();

        if !self.validate_read_set() {
            for &idx in &self.desc.lock_set {
                table.unlock_index(idx);
            }
            tracing::event!(Level::TRACE, wv, "stm::commit_validation_failed");
            return false;
        }

        for entry in &mut self.desc.write_set {
            // safety: we hold the stripe covering var_addr, and new_node
            // is our unpublished node
            unsafe { (entry.commit)(entry.var_addr, entry.new_node, wv) };
            // published: the abort/reset path must skip it from now on
            entry.new_node = ptr::null_mut();
        }

        for &idx in &self.desc.lock_set {
            table.unlock_index(idx);
        }
        tracing::event!(Level::TRACE, wv, "stm::commit");
        self.desc.reset();
        true
    }

    /// Read-set validation under the held commit locks: each entry must be
    /// unlocked (or locked by us) both before and after the version check,
    /// with a full fence keeping the three observations ordered.
    fn validate_read_set(&self) -> bool {
        let table = StripedLockTable::global();
        let rv = self.desc.read_version;
        for entry in &self.desc.read_set {
            let stripe = table.stripe_of(entry.var_addr);
            let locked_by_me = self.desc.lock_set.binary_search(&stripe).is_ok();

            if table.is_locked_index(stripe) && !locked_by_me {
                return false;
            }
            // safety: read-set variables outlive the transaction (borrowed
            // by the closure) and their address is the identity we stored
            if !unsafe { (entry.validate)(entry.var_addr, rv) } {
                return false;
            }
            fence(Ordering::SeqCst);
            if table.is_locked_index(stripe) && !locked_by_me {
                return false;
            }
        }
        true
    }
}

/// Leaves the EBR critical section on every exit path, including unwinds
/// out of the user closure.
struct CriticalSection;

impl CriticalSection {
    fn enter() -> Self {
        EbrManager::global().enter();
        CriticalSection
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        EbrManager::global().leave();
    }
}

/// Run `f` as one atomic transaction, retrying until it commits.
///
/// `f` may be executed many times; it must be side-effect free apart from
/// its transactional loads and stores. `Err(`[`TxError::Retry`]`)` from
/// `f` restarts it against a fresh snapshot and is never returned to the
/// caller; `Err(`[`TxError::HeapExhausted`]`)` aborts the transaction
/// (buffered writes are reclaimed, nothing published) and is returned.
/// A panic in `f` likewise aborts cleanly and then unwinds out.
///
/// Transactions do not nest: calling `atomically` from inside `f` panics.
pub fn atomically<R>(mut f: impl FnMut(&mut Transaction<'_>) -> TxResult<R>) -> TxResult<R> {
    TX_DESC.with(|cell| {
        let mut desc = cell
            .try_borrow_mut()
            .expect("atomically() does not nest: transaction already active on this thread");

        let _critical = CriticalSection::enter();
        let mut retries = 0u64;
        loop {
            let mut tx = Transaction { desc: &mut *desc };
            tx.begin();

            match panic::catch_unwind(AssertUnwindSafe(|| f(&mut tx))) {
                Ok(Ok(value)) => {
                    if tx.commit() {
                        return Ok(value);
                    }
                }
                Ok(Err(TxError::Retry)) => {
                    tx.desc.reset();
                }
                Ok(Err(err)) => {
                    tx.desc.reset();
                    return Err(err);
                }
                Err(payload) => {
                    // user "exception": abort (reclaims buffered nodes),
                    // then let it unwind past the EBR guard
                    tx.desc.reset();
                    drop(tx);
                    panic::resume_unwind(payload);
                }
            }

            retries += 1;
            if retries % 1000 == 0 {
                tracing::event!(Level::TRACE, retries, "stm::retrying");
            }
            yield_now();
        }
    })
}
