//! Striped commit-lock table.
//!
//! A fixed array of cache-line-isolated test-and-set locks; a
//! transactional variable maps to a stripe by hashing its address.
//! Committers collect the *indices* of their write set's stripes, sort
//! and dedupe them, and acquire in ascending order: two variables that
//! collide on a stripe are then locked once, and committers can never
//! deadlock against each other.

use std::hash::Hasher;
use std::sync::atomic::Ordering;
use std::sync::OnceLock;

use rustc_hash::FxHasher;

use crate::config::LOCK_TABLE_SIZE;
use crate::loom_testing::*;

/// One test-and-set lock on its own cache line.
#[repr(align(64))]
pub struct StripeLock {
    locked: AtomicBool,
}

impl StripeLock {
    fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }
}

pub struct StripedLockTable {
    stripes: Box<[StripeLock]>,
}

static GLOBAL_TABLE: OnceLock<StripedLockTable> = OnceLock::new();

impl StripedLockTable {
    /// The process-wide table ([`LOCK_TABLE_SIZE`] stripes), allocated on
    /// first use.
    pub fn global() -> &'static StripedLockTable {
        GLOBAL_TABLE.get_or_init(|| StripedLockTable::with_stripes(LOCK_TABLE_SIZE))
    }

    /// `stripe_count` must be a power of two.
    pub fn with_stripes(stripe_count: usize) -> Self {
        assert!(stripe_count.is_power_of_two());
        Self {
            stripes: (0..stripe_count).map(|_| StripeLock::new()).collect(),
        }
    }

    /// Stripe index for a variable address.
    pub fn stripe_of(&self, addr: *const ()) -> usize {
        let mut hasher = FxHasher::default();
        hasher.write_usize(addr as usize);
        (hasher.finish() as usize) & (self.stripes.len() - 1)
    }

    /// Spin until the stripe is held. Test-first so waiters spin on a
    /// local cacheline read; a lost test-and-set race yields instead of
    /// burning the bus.
    pub fn lock_index(&self, idx: usize) {
        let stripe = &self.stripes[idx];
        loop {
            if !stripe.locked.load(Ordering::Relaxed) {
                // order: acquire pairs with the unlocking release so the
                // stripe's protected publishes are visible
                if !stripe.locked.swap(true, Ordering::Acquire) {
                    return;
                }
                yield_now();
            } else {
                spin_hint();
            }
        }
    }

    pub fn try_lock_index(&self, idx: usize) -> bool {
        !self.stripes[idx].locked.swap(true, Ordering::Acquire)
    }

    pub fn unlock_index(&self, idx: usize) {
        debug_assert!(self.stripes[idx].locked.load(Ordering::Relaxed));
        self.stripes[idx].locked.store(false, Ordering::Release);
    }

    pub fn is_locked_index(&self, idx: usize) -> bool {
        self.stripes[idx].locked.load(Ordering::Acquire)
    }

    pub fn lock(&self, addr: *const ()) {
        self.lock_index(self.stripe_of(addr));
    }

    pub fn try_lock(&self, addr: *const ()) -> bool {
        self.try_lock_index(self.stripe_of(addr))
    }

    pub fn unlock(&self, addr: *const ()) {
        self.unlock_index(self.stripe_of(addr));
    }

    pub fn is_locked(&self, addr: *const ()) -> bool {
        self.is_locked_index(self.stripe_of(addr))
    }
}
