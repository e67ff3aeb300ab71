//! NS16550A UART driver for kernel console output.
//!
//! Console byte I/O is a boot-time surface, not a scheduled device: writes
//! spin on the transmit-holding bit and never block on a condition. The
//! UART lives in the identity-mapped MMIO region.

use crate::config::UART0_BASE;

// Register offsets (byte-wide registers at stride 1 on virt).
const RBR_THR: usize = 0; // receive buffer / transmit holding
const IER: usize = 1; // interrupt enable
const FCR: usize = 2; // FIFO control
const LCR: usize = 3; // line control
const LSR: usize = 5; // line status

const LSR_THRE: u8 = 1 << 5; // transmit holding register empty
const LSR_DR: u8 = 1 << 0; // data ready

/// A memory-mapped 16550-compatible UART.
pub struct Uart {
    base: usize,
}

impl Uart {
    /// Create a handle for the UART at `base`.
    ///
    /// # Safety
    /// `base` must be the MMIO base of a 16550-compatible UART that is
    /// identity-mapped and not driven by any other owner.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    fn reg(&self, offset: usize) -> *mut u8 {
        (self.base + offset) as *mut u8
    }

    /// Program 8N1, enable FIFOs, mask interrupts.
    pub fn init(&mut self) {
        // SAFETY: the constructor contract guarantees `base` addresses a
        // live UART register block; byte writes to its registers are the
        // documented programming interface.
        unsafe {
            core::ptr::write_volatile(self.reg(IER), 0x00);
            core::ptr::write_volatile(self.reg(LCR), 0x03); // 8 data bits
            core::ptr::write_volatile(self.reg(FCR), 0x01); // enable FIFO
        }
    }

    /// Blocking write of one byte.
    pub fn putc(&mut self, byte: u8) {
        // SAFETY: see `init`; LSR reads and THR writes are side-effect-free
        // polling per the 16550 datasheet.
        unsafe {
            while core::ptr::read_volatile(self.reg(LSR)) & LSR_THRE == 0 {
                core::hint::spin_loop();
            }
            core::ptr::write_volatile(self.reg(RBR_THR), byte);
        }
    }

    /// Non-blocking read of one byte, if available.
    pub fn try_getc(&mut self) -> Option<u8> {
        // SAFETY: see `init`.
        unsafe {
            if core::ptr::read_volatile(self.reg(LSR)) & LSR_DR != 0 {
                Some(core::ptr::read_volatile(self.reg(RBR_THR)))
            } else {
                None
            }
        }
    }
}

impl core::fmt::Write for Uart {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.putc(b'\r');
            }
            self.putc(byte);
        }
        Ok(())
    }
}

/// The board UART, shared behind a spin lock. Console writes are short and
/// never sleep, so a spin lock is the right weight here.
pub static CONSOLE: spin::Mutex<Uart> = spin::Mutex::new(
    // SAFETY: UART0_BASE is the virt board's 16550 window, identity-mapped
    // by the main memory space and owned solely by this static.
    unsafe { Uart::new(UART0_BASE) },
);

/// Initialize the console UART. Called once, early in boot.
pub fn init() {
    CONSOLE.lock().init();
}
