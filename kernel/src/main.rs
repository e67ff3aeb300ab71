//! Kernel entry point and boot sequence.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

// Host builds of the bin target are an empty shell; the kernel proper
// lives in the library and the bare-metal boot path below.
#[cfg(not(target_os = "none"))]
fn main() {}

#[cfg(all(target_os = "none", target_arch = "riscv64"))]
mod boot {
    use core::arch::global_asm;

    use ferrite_kernel::{arch, drivers, fs, mm, println, process, sched, serial, timer};

    // Machine entry: a stack, then Rust. QEMU zeroes fresh RAM, so BSS
    // needs no explicit clearing.
    global_asm!(
        r#"
        .section .text.boot
        .globl _start
    _start:
        la      sp, _boot_stack_top
        call    kmain
    1:
        wfi
        j       1b

        .section .bss
        .align 16
        .globl _boot_stack
    _boot_stack:
        .space 65536
        .globl _boot_stack_top
    _boot_stack_top:
    "#
    );

    extern "C" {
        static _boot_stack_top: u8;
    }

    #[no_mangle]
    extern "C" fn kmain() -> ! {
        serial::init();
        println!();
        println!("FerriteOS {} (riscv64, Sv39)", env!("CARGO_PKG_VERSION"));
        ferrite_kernel::print::init_logging(log::LevelFilter::Info);

        arch::riscv64::trap::init();
        mm::space::init();

        // SAFETY: the symbol marks the top of the boot stack laid out in
        // the assembly above; taking its address is the only use.
        let boot_stack_top = unsafe { &_boot_stack_top as *const u8 as usize };
        sched::thread::init(boot_stack_top);
        process::init();

        ferrite_kernel::irq::init();
        timer::init();
        drivers::init();
        timer::start();
        arch::interrupts_enable();

        // Mount the filesystem on the block device and run init.
        let blk = drivers::open("blk", 0).unwrap_or_else(|e| panic!("no block device: {}", e));
        fs::mount_global(blk).unwrap_or_else(|e| panic!("fs mount failed: {}", e));

        let init_io = fs::open_file(b"init").unwrap_or_else(|e| panic!("no init image: {}", e));
        match process::exec(init_io) {
            Ok(never) => match never {},
            Err(e) => panic!("exec init failed: {}", e),
        }
    }

    /// Kernel-fatal tier: print the reason and halt the machine.
    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        println!();
        println!("KERNEL PANIC: {}", info);
        arch::halt_failure()
    }
}
