//! Kernel synchronization support.
//!
//! Two kinds of mutual exclusion exist in this kernel and they must not be
//! mixed up:
//!
//! * [`IrqSafe`] — an interrupts-disabled cell for the structures the ISRs
//!   share with thread context (ready list, condition wait lists, free-page
//!   list). Sections are short and never sleep.
//! * `spin::Mutex` — for thread-only state with short critical sections
//!   (console, open-file table bookkeeping).
//!
//! Sleeping exclusion (the sleep lock over a condition variable) lives in
//! `sched::lock`, since it is built on the scheduler.

mod irq_safe;
mod once_lock;

pub use irq_safe::IrqSafe;
pub use once_lock::OnceLock;
