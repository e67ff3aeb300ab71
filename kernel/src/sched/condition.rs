//! Condition variables: named FIFO wait lists over threads.
//!
//! The wait list itself is interrupt-safe (ISRs broadcast conditions), but
//! the *predicate* a condition guards is the caller's to serialize,
//! typically with a sleep lock. Waiters enter at the tail and broadcast
//! drains from the head, so wakeup order is FIFO.

use core::ptr;

use crate::arch::{interrupts_enable, interrupts_enabled};
use crate::sched::thread::{self, ThreadList, ThreadState};
use crate::sync::IrqSafe;

/// A named wait list of threads.
pub struct Condition {
    name: &'static str,
    waiters: IrqSafe<ThreadList>,
}

impl Condition {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            waiters: IrqSafe::new(ThreadList::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Block the calling thread until the condition is broadcast.
    ///
    /// The caller may enter with interrupts disabled to close the window
    /// against an ISR broadcast (the block driver does); the wait enables
    /// interrupts around the suspension so the wakeup can ever arrive,
    /// and restores the caller's interrupt state before returning.
    pub fn wait(&self) {
        let cur = thread::current_ptr();
        self.waiters.with(|list| {
            // SAFETY: `cur` is the live running thread and joins exactly
            // this one list; state edits happen inside the list section.
            unsafe {
                debug_assert_eq!((*cur).state, ThreadState::Running);
                (*cur).state = ThreadState::Waiting;
                (*cur).wait_cond = self as *const Condition;
                list.insert(cur);
            }
        });
        let was_enabled = interrupts_enabled();
        interrupts_enable();
        thread::suspend_current();
        if !was_enabled {
            crate::arch::interrupts_disable();
        }
    }

    /// Make every waiter ready, in FIFO order.
    pub fn broadcast(&self) {
        self.waiters.with(|list| {
            // SAFETY: list members are live waiting threads; they move to
            // the ready list inside the same interrupt-disabled section.
            unsafe {
                while let Some(t) = list.remove_head() {
                    debug_assert_eq!((*t).state, ThreadState::Waiting);
                    (*t).state = ThreadState::Ready;
                    (*t).wait_cond = ptr::null();
                    thread::ready_insert(t);
                }
            }
        });
    }
}
