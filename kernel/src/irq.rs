//! External interrupt routing: PLIC programming and the ISR registry.
//!
//! Drivers register a handler for their interrupt line; the external-
//! interrupt trap claims lines from the PLIC and dispatches until no claim
//! remains. Register programming targets the S-mode context of hart 0 on
//! the virt board.

use crate::config::{PLIC_BASE, PLIC_IRQ_MAX};
use crate::sync::IrqSafe;

/// An interrupt service routine with its registered auxiliary word.
pub type IsrFn = fn(aux: usize);

#[derive(Clone, Copy)]
struct IsrEntry {
    handler: IsrFn,
    aux: usize,
}

static ISR_TABLE: IrqSafe<[Option<IsrEntry>; PLIC_IRQ_MAX as usize + 1]> =
    IrqSafe::new([None; PLIC_IRQ_MAX as usize + 1]);

// PLIC register blocks for hart 0, S-mode context (context 1 on virt).
const PRIORITY_BASE: usize = PLIC_BASE;
const ENABLE_BASE: usize = PLIC_BASE + 0x2080;
const THRESHOLD: usize = PLIC_BASE + 0x20_1000;
const CLAIM_COMPLETE: usize = PLIC_BASE + 0x20_1004;

fn write_reg(addr: usize, value: u32) {
    // SAFETY: PLIC registers are identity-mapped MMIO owned by this
    // module.
    unsafe { core::ptr::write_volatile(addr as *mut u32, value) }
}

fn read_reg(addr: usize) -> u32 {
    // SAFETY: as above.
    unsafe { core::ptr::read_volatile(addr as *const u32) }
}

/// Accept every priority and unmask external interrupts at the hart.
pub fn init() {
    write_reg(THRESHOLD, 0);
    // SAFETY: enabling the external-interrupt class; delivery is further
    // gated per line by `enable_irq`.
    unsafe {
        riscv::register::sie::set_sext();
    }
}

/// Register `handler` for `irqno` with the given PLIC priority. The line
/// stays masked until [`enable_irq`].
pub fn register_isr(irqno: u32, priority: u32, handler: IsrFn, aux: usize) {
    assert!(irqno > 0 && irqno <= PLIC_IRQ_MAX, "irq {} out of range", irqno);
    ISR_TABLE.with(|table| {
        assert!(
            table[irqno as usize].is_none(),
            "irq {} already registered",
            irqno
        );
        table[irqno as usize] = Some(IsrEntry { handler, aux });
    });
    write_reg(PRIORITY_BASE + 4 * irqno as usize, priority);
}

/// Unmask `irqno` at the PLIC.
pub fn enable_irq(irqno: u32) {
    let reg = ENABLE_BASE + 4 * (irqno / 32) as usize;
    write_reg(reg, read_reg(reg) | (1 << (irqno % 32)));
}

/// Mask `irqno` at the PLIC.
pub fn disable_irq(irqno: u32) {
    let reg = ENABLE_BASE + 4 * (irqno / 32) as usize;
    write_reg(reg, read_reg(reg) & !(1 << (irqno % 32)));
}

/// Claim-dispatch-complete loop, called from the trap router on an
/// external interrupt.
pub fn handle_external() {
    loop {
        let irqno = read_reg(CLAIM_COMPLETE);
        if irqno == 0 {
            break;
        }
        let entry = ISR_TABLE.with(|table| table.get(irqno as usize).copied().flatten());
        match entry {
            Some(isr) => (isr.handler)(isr.aux),
            None => log::warn!("unhandled external interrupt {}", irqno),
        }
        write_reg(CLAIM_COMPLETE, irqno);
    }
}
