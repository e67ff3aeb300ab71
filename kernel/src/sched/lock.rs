//! Sleep lock: mutual exclusion that suspends instead of spinning.
//!
//! A holder tid plus a condition. Contenders wait on the condition; release
//! broadcasts it. Not recursive. Use this (never a spin lock) around
//! critical sections that can suspend — block-buffer copies, pipe state.

use crate::sched::condition::Condition;
use crate::sched::thread::{self, Tid};
use crate::sync::IrqSafe;

/// A non-recursive sleeping mutual-exclusion lock.
pub struct SleepLock {
    holder: IrqSafe<Option<Tid>>,
    available: Condition,
}

impl SleepLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            holder: IrqSafe::new(None),
            available: Condition::new(name),
        }
    }

    /// Acquire the lock, suspending while another thread holds it.
    pub fn acquire(&self) -> SleepLockGuard<'_> {
        loop {
            let taken = self.holder.with(|h| {
                if h.is_none() {
                    *h = Some(thread::current_tid());
                    true
                } else {
                    false
                }
            });
            if taken {
                return SleepLockGuard { lock: self };
            }
            self.available.wait();
        }
    }

    fn release(&self) {
        let cur = thread::current_tid();
        self.holder.with(|h| {
            assert_eq!(*h, Some(cur), "sleep lock released by non-holder");
            *h = None;
        });
        self.available.broadcast();
    }
}

/// RAII guard; releases on all paths.
pub struct SleepLockGuard<'a> {
    lock: &'a SleepLock,
}

impl Drop for SleepLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
