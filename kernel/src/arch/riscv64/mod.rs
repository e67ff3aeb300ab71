//! RISC-V 64 support: CSR access, interrupt masking, halt.

pub mod context;
pub mod trap;
pub mod usermode;

use core::arch::asm;

const SSTATUS_SIE: usize = 1 << 1;
const SSTATUS_SUM: usize = 1 << 18;

/// Disable supervisor interrupts; returns whether they were enabled.
pub fn interrupts_disable() -> bool {
    let sstatus: usize;
    // SAFETY: reading sstatus and clearing SIE have no memory effects
    // beyond masking interrupt delivery on this hart.
    unsafe {
        asm!("csrrci {}, sstatus, 2", out(reg) sstatus);
    }
    sstatus & SSTATUS_SIE != 0
}

/// Restore the interrupt-enable state saved by [`interrupts_disable`].
pub fn interrupts_restore(was_enabled: bool) {
    if was_enabled {
        interrupts_enable();
    }
}

/// Enable supervisor interrupts.
pub fn interrupts_enable() {
    // SAFETY: setting SIE only unmasks interrupt delivery.
    unsafe {
        asm!("csrsi sstatus, 2");
    }
}

/// Whether supervisor interrupts are currently enabled.
pub fn interrupts_enabled() -> bool {
    riscv::register::sstatus::read().sie()
}

/// Permit supervisor loads/stores through user (U=1) mappings.
///
/// Set once at memory-manager init; the kernel reads and writes user
/// buffers in place after pointer validation.
pub fn allow_user_memory_access() {
    let mask = SSTATUS_SUM;
    // SAFETY: setting SUM only widens what supervisor code may touch.
    unsafe {
        asm!("csrs sstatus, {}", in(reg) mask);
    }
}

/// Halt the hart until the next interrupt. Only the idle thread calls
/// this. Wakes on a pending interrupt even while delivery is masked.
pub fn idle_wait() {
    // SAFETY: wfi only stalls the hart; it has no memory effects.
    unsafe {
        asm!("wfi");
    }
}

// QEMU virt "sifive_test" finisher device.
const TEST_FINISHER: usize = 0x10_0000;
const FINISHER_PASS: u32 = 0x5555;
const FINISHER_FAIL: u32 = 0x3333;

/// Terminate the machine reporting success.
pub fn halt_success() -> ! {
    // SAFETY: the finisher device is identity-mapped at a fixed address on
    // the virt board; writing the pass code powers the machine off.
    unsafe {
        core::ptr::write_volatile(TEST_FINISHER as *mut u32, FINISHER_PASS);
    }
    loop {
        idle_wait();
    }
}

/// Terminate the machine reporting failure.
pub fn halt_failure() -> ! {
    // SAFETY: as in `halt_success`.
    unsafe {
        core::ptr::write_volatile(TEST_FINISHER as *mut u32, FINISHER_FAIL);
    }
    loop {
        idle_wait();
    }
}
