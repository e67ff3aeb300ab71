//! S-mode to U-mode transition.

use core::arch::asm;

/// Enter user mode at `entry` with the given user stack pointer.
///
/// Sets sscratch to the current thread's kernel stack top so the next trap
/// lands on it, clears sstatus.SPP, sets SPIE so user code runs with
/// interrupts enabled, and issues `sret`. Does not return.
///
/// # Safety
/// - `entry` must be a mapped, executable user address in the active space
/// - `user_sp` must lie in the user region (the stack is demand-paged)
/// - `kstack_top` must be the current thread's kernel stack top
/// - the trap vector must already be installed
pub unsafe fn enter_user(entry: usize, user_sp: usize, kstack_top: usize) -> ! {
    // SAFETY: forwarded contract; after sret the hart executes user code
    // and re-enters the kernel only through the trap vector.
    unsafe {
        asm!(
            "csrw sscratch, {ksp}",
            "csrw sepc, {entry}",
            "csrc sstatus, {spp}",
            "csrs sstatus, {spie}",
            "mv sp, {usp}",
            "sret",
            ksp = in(reg) kstack_top,
            entry = in(reg) entry,
            spp = in(reg) super::trap::SSTATUS_SPP,
            spie = in(reg) super::trap::SSTATUS_SPIE,
            usp = in(reg) user_sp,
            options(noreturn)
        );
    }
}
