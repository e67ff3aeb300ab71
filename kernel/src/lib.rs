//! FerriteOS kernel library.
//!
//! A supervisor-mode kernel for 64-bit RISC-V (Sv39, single hart, QEMU
//! virt): demand-paged user processes, a polymorphic I/O layer, a
//! virtio-blk driver, a flat filesystem, pipes, and an ecall syscall
//! surface. The library form exists so the architecture-independent parts
//! (filesystem, ELF parsing, page-table arithmetic, pipes, I/O plumbing)
//! compile and test on a host target; the bin target boots on bare metal.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Bare metal uses the list allocator over the boot heap window; the host
// target (unit tests) delegates to the system allocator so test code can
// allocate normally.
#[cfg(target_arch = "riscv64")]
use linked_list_allocator::LockedHeap;

#[cfg(target_arch = "riscv64")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Hand the boot heap window to the global allocator. Called once from
/// `mm::space::init`.
#[cfg(target_arch = "riscv64")]
pub fn heap_init(start: usize, size: usize) {
    // SAFETY: the window [start, start+size) is identity-mapped RAM
    // reserved for the heap by the memory-space setup and unused by
    // anything else.
    unsafe {
        ALLOCATOR.lock().init(start as *mut u8, size);
    }
}

#[macro_use]
pub mod print;

pub mod arch;
pub mod config;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod fs;
pub mod io;
pub mod mm;
pub mod sync;

#[cfg(target_arch = "riscv64")]
pub mod irq;
#[cfg(target_arch = "riscv64")]
pub mod process;
#[cfg(target_arch = "riscv64")]
pub mod sched;
#[cfg(target_arch = "riscv64")]
pub mod serial;
#[cfg(target_arch = "riscv64")]
pub mod syscall;
#[cfg(target_arch = "riscv64")]
pub mod timer;

/// Heap allocation failure is unrecoverable in a no_std kernel.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted: {:?}", layout);
}
