//! Admission control over the receiver's tuner slots.
//!
//! The upstream device can only serve a fixed number of concurrent live
//! streams. `TunerPool` owns that counter; request handlers never touch it
//! directly. Denial is a normal outcome (the client gets a busy response),
//! not an error.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, warn};

/// Bounded counter of in-use tuner slots.
///
/// Invariant: `0 <= in_use <= capacity`. The counter only moves through
/// [`TunerPool::try_acquire`] and lease release.
#[derive(Debug)]
pub struct TunerPool {
    capacity: u32,
    in_use: AtomicU32,
}

impl TunerPool {
    /// Create a pool for a device with `capacity` tuners.
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            in_use: AtomicU32::new(0),
        }
    }

    /// Try to claim one tuner slot.
    ///
    /// Returns `None` when all slots are busy. Safe under concurrent
    /// callers: the check-and-increment is a single compare-exchange, so
    /// simultaneous requests can never push `in_use` past `capacity`.
    pub fn try_acquire(self: &Arc<Self>) -> Option<TunerLease> {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                debug!(
                    "Tuner pool busy ({}/{} in use)",
                    current, self.capacity
                );
                return None;
            }
            match self.in_use.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!("Tuner acquired ({}/{} in use)", current + 1, self.capacity);
                    return Some(TunerLease {
                        pool: Arc::clone(self),
                        released: AtomicBool::new(false),
                    });
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn in_use(&self) -> u32 {
        self.in_use.load(Ordering::Acquire)
    }

    fn release_slot(&self) {
        let previous = self.in_use.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            // Only reachable through a bug: every release goes through a
            // lease's single-fire flag.
            warn!("Tuner release with no slots in use; counter restored");
            self.in_use.store(0, Ordering::Release);
        } else {
            debug!("Tuner released ({}/{} in use)", previous - 1, self.capacity);
        }
    }
}

/// One claimed tuner slot.
///
/// A session's client-disconnect and process-exit signals can race; the
/// `released` flag makes sure the slot goes back exactly once no matter
/// how many teardown paths fire. Dropping the lease releases too.
#[derive(Debug)]
pub struct TunerLease {
    pool: Arc<TunerPool>,
    released: AtomicBool,
}

impl TunerLease {
    /// Return the slot to the pool. Idempotent.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.pool.release_slot();
        }
    }
}

impl Drop for TunerLease {
    fn drop(&mut self) {
        self.release();
    }
}
