//! Architecture support.
//!
//! The kernel targets 64-bit RISC-V; host builds (unit tests) get inert
//! stubs for the interrupt plumbing so architecture-independent code links.

#[cfg(target_arch = "riscv64")]
pub mod riscv64;

#[cfg(target_arch = "riscv64")]
pub use riscv64::{
    halt_failure, halt_success, idle_wait, interrupts_disable, interrupts_enable,
    interrupts_enabled, interrupts_restore,
};

// Host stubs: single-threaded test processes have no interrupts to mask.
#[cfg(not(target_arch = "riscv64"))]
mod host {
    pub fn interrupts_disable() -> bool {
        false
    }
    pub fn interrupts_restore(_was_enabled: bool) {}
    pub fn interrupts_enable() {}
    pub fn interrupts_enabled() -> bool {
        false
    }
}

#[cfg(not(target_arch = "riscv64"))]
pub use host::{interrupts_disable, interrupts_enable, interrupts_enabled, interrupts_restore};
