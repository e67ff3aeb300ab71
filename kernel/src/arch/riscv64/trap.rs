//! Trap entry, trap frame, and exception dispatch.
//!
//! `stvec` points at `_trap_entry` in direct mode. The entry stub selects a
//! stack using the sscratch convention — sscratch holds the current
//! thread's kernel stack top while the hart runs in U-mode and zero while
//! it runs in S-mode — saves a full register frame, and calls
//! [`trap_dispatch`]. The restore path is shared with the fork/exec return
//! paths through `_trap_frame_restore`.
//!
//! The kernel keeps its thread pointer in `tp` across user execution; user
//! code must not clobber `tp` (standard ABI: `tp` is reserved).

use core::arch::{asm, global_asm};

/// Saved register state at trap entry. `x[n]` is register xn; `x[0]` is
/// never written and `x[2]` holds the interrupted stack pointer.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct TrapFrame {
    pub x: [usize; 32],
    pub sepc: usize,
    pub sstatus: usize,
}

/// Size of the in-memory trap frame; fixed by the assembly below.
pub const TRAP_FRAME_SIZE: usize = core::mem::size_of::<TrapFrame>();

impl TrapFrame {
    pub const fn zeroed() -> Self {
        Self {
            x: [0; 32],
            sepc: 0,
            sstatus: 0,
        }
    }

    /// Whether this frame was captured from U-mode (sstatus.SPP clear).
    pub fn from_user(&self) -> bool {
        self.sstatus & SSTATUS_SPP == 0
    }
}

pub const SSTATUS_SPP: usize = 1 << 8;
pub const SSTATUS_SPIE: usize = 1 << 5;

// Register frame layout: x1..x31 at byte offset 8*n, sepc at 256,
// sstatus at 264. Total 272 bytes, 16-byte aligned.
global_asm!(
    r#"
    .section .text
    .align 4
    .globl _trap_entry
_trap_entry:
    # sscratch: kernel stack top if trapping from U-mode, zero from S-mode.
    csrrw   sp, sscratch, sp
    bnez    sp, 1f
    csrrw   sp, sscratch, sp
1:
    addi    sp, sp, -272
    sd      x1, 8(sp)
    sd      x3, 24(sp)
    sd      x4, 32(sp)
    sd      x5, 40(sp)
    sd      x6, 48(sp)
    sd      x7, 56(sp)
    sd      x8, 64(sp)
    sd      x9, 72(sp)
    sd      x10, 80(sp)
    sd      x11, 88(sp)
    sd      x12, 96(sp)
    sd      x13, 104(sp)
    sd      x14, 112(sp)
    sd      x15, 120(sp)
    sd      x16, 128(sp)
    sd      x17, 136(sp)
    sd      x18, 144(sp)
    sd      x19, 152(sp)
    sd      x20, 160(sp)
    sd      x21, 168(sp)
    sd      x22, 176(sp)
    sd      x23, 184(sp)
    sd      x24, 192(sp)
    sd      x25, 200(sp)
    sd      x26, 208(sp)
    sd      x27, 216(sp)
    sd      x28, 224(sp)
    sd      x29, 232(sp)
    sd      x30, 240(sp)
    sd      x31, 248(sp)
    # Interrupted sp: from U-mode it sits in sscratch, from S-mode it is
    # sp+272. Zero sscratch while in the kernel so a nested trap stays on
    # the current stack.
    csrr    t0, sscratch
    beqz    t0, 2f
    sd      t0, 16(sp)
    csrw    sscratch, zero
    j       3f
2:
    addi    t0, sp, 272
    sd      t0, 16(sp)
3:
    csrr    t0, sepc
    sd      t0, 256(sp)
    csrr    t1, sstatus
    sd      t1, 264(sp)
    mv      a0, sp
    call    trap_dispatch
    mv      a0, sp

    .globl _trap_frame_restore
_trap_frame_restore:
    mv      sp, a0
    ld      t0, 256(sp)
    csrw    sepc, t0
    ld      t1, 264(sp)
    csrw    sstatus, t1
    # Returning to U-mode: re-arm sscratch with this stack's top.
    andi    t1, t1, 0x100
    bnez    t1, 4f
    addi    t0, sp, 272
    csrw    sscratch, t0
4:
    ld      x1, 8(sp)
    ld      x3, 24(sp)
    ld      x4, 32(sp)
    ld      x5, 40(sp)
    ld      x6, 48(sp)
    ld      x7, 56(sp)
    ld      x8, 64(sp)
    ld      x9, 72(sp)
    ld      x10, 80(sp)
    ld      x11, 88(sp)
    ld      x12, 96(sp)
    ld      x13, 104(sp)
    ld      x14, 112(sp)
    ld      x15, 120(sp)
    ld      x16, 128(sp)
    ld      x17, 136(sp)
    ld      x18, 144(sp)
    ld      x19, 152(sp)
    ld      x20, 160(sp)
    ld      x21, 168(sp)
    ld      x22, 176(sp)
    ld      x23, 184(sp)
    ld      x24, 192(sp)
    ld      x25, 200(sp)
    ld      x26, 208(sp)
    ld      x27, 216(sp)
    ld      x28, 224(sp)
    ld      x29, 232(sp)
    ld      x30, 240(sp)
    ld      x31, 248(sp)
    ld      x2, 16(sp)
    sret
"#
);

extern "C" {
    fn _trap_entry();
    fn _trap_frame_restore(frame: *mut TrapFrame) -> !;
}

/// Point stvec at the trap entry stub (direct mode) and zero sscratch.
pub fn init() {
    let entry = _trap_entry as usize;
    debug_assert_eq!(entry & 0x3, 0);
    // SAFETY: `_trap_entry` is 4-aligned code; installing it in stvec and
    // clearing sscratch establishes the documented trap convention before
    // interrupts are enabled.
    unsafe {
        asm!("csrw stvec, {}", in(reg) entry);
        asm!("csrw sscratch, zero");
    }
}

/// Resume execution from a trap frame placed at `frame`. Never returns.
///
/// # Safety
/// `frame` must point at a fully initialized [`TrapFrame`] located exactly
/// `TRAP_FRAME_SIZE` bytes below the current thread's kernel stack top, so
/// the restore path re-arms sscratch correctly for a U-mode return.
pub unsafe fn frame_restore(frame: *mut TrapFrame) -> ! {
    // SAFETY: forwarded contract; the assembly consumes the frame and
    // executes sret.
    unsafe { _trap_frame_restore(frame) }
}

// scause exception codes.
const EXCP_ECALL_UMODE: usize = 8;
const EXCP_INSTR_PAGE_FAULT: usize = 12;
const EXCP_LOAD_PAGE_FAULT: usize = 13;
const EXCP_STORE_PAGE_FAULT: usize = 15;

// scause interrupt codes.
const INTR_S_TIMER: usize = 5;
const INTR_S_EXTERNAL: usize = 9;

const EXCP_NAMES: [&str; 16] = [
    "Misaligned instruction address",
    "Instruction access fault",
    "Illegal instruction",
    "Breakpoint",
    "Misaligned load address",
    "Load access fault",
    "Misaligned store address",
    "Store access fault",
    "Environment call from U mode",
    "Environment call from S mode",
    "Reserved (10)",
    "Reserved (11)",
    "Instruction page fault",
    "Load page fault",
    "Reserved (14)",
    "Store page fault",
];

fn excp_name(code: usize) -> &'static str {
    EXCP_NAMES.get(code).copied().unwrap_or("Unknown exception")
}

/// Central trap router, called from the entry stub with the saved frame.
#[no_mangle]
extern "C" fn trap_dispatch(frame: &mut TrapFrame) {
    let cause = riscv::register::scause::read().bits();
    let is_interrupt = cause >> 63 != 0;
    let code = cause & !(1 << 63);

    if is_interrupt {
        match code {
            INTR_S_TIMER => crate::timer::handle_interrupt(),
            INTR_S_EXTERNAL => crate::irq::handle_external(),
            _ => panic!("unexpected interrupt cause {}", code),
        }
        return;
    }

    if frame.from_user() {
        match code {
            EXCP_ECALL_UMODE => crate::syscall::dispatch(frame),
            EXCP_STORE_PAGE_FAULT => {
                let vptr = riscv::register::stval::read();
                crate::mm::space::handle_store_page_fault(vptr);
            }
            EXCP_INSTR_PAGE_FAULT | EXCP_LOAD_PAGE_FAULT => {
                // Only store faults are demand-paged; anything else from
                // user mode is fatal to the process.
                crate::println!(
                    "{} at {:#x} (stval={:#x}): terminating process",
                    excp_name(code),
                    frame.sepc,
                    riscv::register::stval::read()
                );
                crate::process::exit_current();
            }
            _ => {
                crate::println!(
                    "{} at {:#x}: terminating process",
                    excp_name(code),
                    frame.sepc
                );
                crate::process::exit_current();
            }
        }
    } else {
        panic!("{} at sepc={:#x}", excp_name(code), frame.sepc);
    }
}
