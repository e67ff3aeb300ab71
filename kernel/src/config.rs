//! Compile-time kernel parameters for the QEMU `virt` platform.
//!
//! Everything here is a plain constant so the values show up in one place.
//! Address-layout constants describe the single supported board; the table
//! sizes bound the fixed kernel data structures.

/// Log2 of the page size.
pub const PAGE_ORDER: usize = 12;
/// Size of a physical page and of a filesystem block (4 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_ORDER;
/// Size of a level-1 megapage mapping (2 MiB).
pub const MEGA_SIZE: usize = PAGE_SIZE << 9;
/// Size of a level-2 gigapage mapping (1 GiB).
pub const GIGA_SIZE: usize = MEGA_SIZE << 9;

/// Start of physical RAM on the virt board; also where the kernel is loaded.
pub const RAM_START: usize = 0x8000_0000;
/// RAM size. 8 MiB is the QEMU configuration this kernel is run with.
pub const RAM_SIZE: usize = 8 * 1024 * 1024;
/// One past the last byte of RAM.
pub const RAM_END: usize = RAM_START + RAM_SIZE;

/// Minimum size of the boot heap window handed to the allocator.
pub const HEAP_INIT_MIN: usize = 256 * 1024;

/// Lowest virtual address a user mapping may occupy.
pub const USER_START: usize = 0x8010_0000;
/// One past the highest user virtual address.
pub const USER_END: usize = 0x8100_0000;
/// Initial user stack pointer; the stack grows down from the top of the
/// user region and is committed by demand paging.
pub const USER_STACK_VMA: usize = USER_END;

/// Maximum number of threads, including the main and idle threads.
pub const NTHR: usize = 16;
/// Maximum number of processes. Slot 0 is the main kernel process.
pub const NPROC: usize = 16;
/// Per-process I/O table size, and capacity of the filesystem open table.
pub const FD_MAX: usize = 32;

/// Kernel stack size for spawned threads.
pub const THREAD_STACK_SIZE: usize = 16 * 1024;
/// Bytes reserved at the top of every thread stack for a user trap frame.
pub const THREAD_TRAP_RESERVE: usize = 288;

/// Pipe buffer capacity in bytes.
pub const PIPE_CAPACITY: usize = 512;

// MMIO layout of the virt board. Only the devices this kernel programs are
// listed; everything below lives inside the identity-mapped MMIO gigapages.

/// NS16550A UART.
pub const UART0_BASE: usize = 0x1000_0000;
/// First virtio-mmio transport window.
pub const VIRTIO_MMIO_BASE: usize = 0x1000_1000;
/// Stride between virtio-mmio windows.
pub const VIRTIO_MMIO_STRIDE: usize = 0x1000;
/// Number of virtio-mmio slots probed at boot.
pub const VIRTIO_MMIO_COUNT: usize = 8;
/// PLIC interrupt number of the first virtio slot; slot n uses IRQ 1+n.
pub const VIRTIO_IRQ_BASE: u32 = 1;

/// PLIC register window.
pub const PLIC_BASE: usize = 0x0c00_0000;
/// Highest external interrupt number the kernel will route.
pub const PLIC_IRQ_MAX: u32 = 32;

/// CLINT mtime register.
pub const MTIME_ADDR: usize = 0x0200_bff8;
/// CLINT mtimecmp register for hart 0.
pub const MTIMECMP_ADDR: usize = 0x0200_4000;
/// mtime tick rate on QEMU virt.
pub const MTIME_FREQ: u64 = 10_000_000;
/// Periodic tick rate driven by the timer interrupt.
pub const TICK_HZ: u64 = 10;
