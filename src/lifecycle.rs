//! Teardown coordination between hook callbacks and object destruction.
//!
//! Every engine and server owns a [`LifecycleLock`]. Hook-invoking paths
//! acquire it before calling into embedder code; teardown flips the lock
//! into the destroying state and waits for all holders to drain. Once
//! `begin_destroy_and_wait` returns, no embedder callback is running and
//! none will start.
//!
//! Acquisition is reentrant per thread: a hook that synchronously calls
//! back into the engine does not deadlock against its own guard.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Reentrancy depth per lock, keyed by lock id.
    static HOLD_DEPTH: RefCell<HashMap<u64, usize>> = RefCell::new(HashMap::new());
}

/// Holder-counted lock that lets teardown wait out in-flight callbacks.
pub struct LifecycleLock {
    id: u64,
    holders: AtomicUsize,
    destroying: AtomicBool,
}

impl LifecycleLock {
    pub fn new() -> Self {
        Self {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            holders: AtomicUsize::new(0),
            destroying: AtomicBool::new(false),
        }
    }

    /// Try to become a holder. Fails only once destruction has begun and
    /// this thread is not already a holder.
    pub fn try_acquire(&self) -> bool {
        let depth = HOLD_DEPTH.with(|m| m.borrow().get(&self.id).copied().unwrap_or(0));
        if depth > 0 {
            // Reentrant: this thread already holds the lock, so destruction
            // cannot complete underneath it.
            HOLD_DEPTH.with(|m| *m.borrow_mut().entry(self.id).or_insert(0) += 1);
            return true;
        }
        if self.destroying.load(Ordering::Acquire) {
            return false;
        }
        self.holders.fetch_add(1, Ordering::AcqRel);
        // Destruction may have started between the check and the increment.
        if self.destroying.load(Ordering::Acquire) {
            self.holders.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        HOLD_DEPTH.with(|m| *m.borrow_mut().entry(self.id).or_insert(0) += 1);
        true
    }

    /// Acquire as an RAII guard, or `None` once destruction has begun.
    pub fn acquire(&self) -> Option<LifecycleGuard<'_>> {
        if self.try_acquire() {
            Some(LifecycleGuard { lock: self })
        } else {
            None
        }
    }

    fn release(&self) {
        let depth = HOLD_DEPTH.with(|m| {
            let mut map = m.borrow_mut();
            match map.get_mut(&self.id) {
                Some(d) => {
                    *d -= 1;
                    let left = *d;
                    if left == 0 {
                        map.remove(&self.id);
                    }
                    left
                }
                None => 0,
            }
        });
        if depth == 0 {
            self.holders.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Enter the destroying state and wait until every holder has released.
    ///
    /// Reentrancy held by the calling thread counts as drained, so a thread
    /// may tear down from inside its own guard scope without deadlocking.
    pub fn begin_destroy_and_wait(&self) {
        self.destroying.store(true, Ordering::Release);
        let own = HOLD_DEPTH.with(|m| m.borrow().get(&self.id).copied().unwrap_or(0));
        let expected = if own > 0 { 1 } else { 0 };
        while self.holders.load(Ordering::Acquire) > expected {
            std::thread::yield_now();
        }
    }

    /// Whether destruction has begun.
    pub fn is_destroying(&self) -> bool {
        self.destroying.load(Ordering::Acquire)
    }
}

impl Default for LifecycleLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII holder handle; releases on drop.
pub struct LifecycleGuard<'a> {
    lock: &'a LifecycleLock,
}

impl Drop for LifecycleGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
