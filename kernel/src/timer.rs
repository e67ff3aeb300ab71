//! Timer ticks and timed sleep.
//!
//! The CLINT comparator is programmed for a periodic tick; the ISR only
//! counts, broadcasts the tick conditions, and rearms — it never yields on
//! behalf of the interrupted thread. `sleep_us` is the kernel's one timed
//! wait: it sleeps on the tick condition until its deadline passes.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::{MTIMECMP_ADDR, MTIME_ADDR, MTIME_FREQ, TICK_HZ};
use crate::sched::Condition;

/// Broadcast every tick (TICK_HZ per second).
pub static TICK: Condition = Condition::new("timer.tick");
/// Broadcast once a second.
pub static TICK_1HZ: Condition = Condition::new("timer.tick_1hz");

static TICK_COUNT: AtomicU64 = AtomicU64::new(0);

fn mtime() -> u64 {
    // SAFETY: the CLINT mtime register is identity-mapped MMIO; reads
    // have no side effects.
    unsafe { core::ptr::read_volatile(MTIME_ADDR as *const u64) }
}

fn set_mtimecmp(value: u64) {
    // SAFETY: the comparator is identity-mapped MMIO owned by this
    // module; writing it (re)schedules the timer interrupt.
    unsafe { core::ptr::write_volatile(MTIMECMP_ADDR as *mut u64, value) }
}

/// Park the comparator and unmask the timer-interrupt class.
pub fn init() {
    set_mtimecmp(u64::MAX);
    // SAFETY: unmasking timer interrupts; the comparator is parked.
    unsafe {
        riscv::register::sie::set_stimer();
    }
}

/// Start the periodic tick.
pub fn start() {
    set_mtimecmp(mtime() + MTIME_FREQ / TICK_HZ);
}

/// Ticks since `start`.
pub fn ticks() -> u64 {
    TICK_COUNT.load(Ordering::Relaxed)
}

/// Timer ISR: count, broadcast, rearm.
pub fn handle_interrupt() {
    let count = TICK_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
    TICK.broadcast();
    if count % TICK_HZ == 0 {
        TICK_1HZ.broadcast();
    }
    set_mtimecmp(mtime() + MTIME_FREQ / TICK_HZ);
}

/// Suspend the calling thread for at least `us` microseconds. Resolution
/// is the tick period; the wakeup is an alarm, not a busy wait.
pub fn sleep_us(us: u64) {
    let deadline = mtime() + us.saturating_mul(MTIME_FREQ / 1_000_000);
    while mtime() < deadline {
        TICK.wait();
    }
}
