//! In-memory byte-stream pipe endpoint.
//!
//! A single fixed-capacity buffer, a sleep lock, and two conditions.
//! The writer waits until the reader has drained the previous batch, then
//! deposits up to a buffer's worth and broadcasts `not_empty`; the reader
//! waits for data, takes what it can, and broadcasts `empty` once the
//! batch is fully drained. Waits release the lock around suspension and
//! re-acquire on resume. A pipe created before `fork` is shared by both
//! sides through the endpoint's reference count.

use crate::config::PIPE_CAPACITY;

/// The batch buffer: one writer batch at a time, drained by the reader.
/// Pure state; the blocking protocol lives in [`Pipe`].
pub struct PipeBuffer {
    data: [u8; PIPE_CAPACITY],
    len: usize,
    consumed: usize,
}

impl PipeBuffer {
    pub const fn new() -> Self {
        Self {
            data: [0; PIPE_CAPACITY],
            len: 0,
            consumed: 0,
        }
    }

    /// Whether the reader has taken everything the writer deposited.
    pub fn is_drained(&self) -> bool {
        self.consumed == self.len
    }

    /// Bytes available to the reader.
    pub fn available(&self) -> usize {
        self.len - self.consumed
    }

    /// Deposit a new batch. Only legal when drained; copies up to the
    /// capacity and returns the number of bytes taken from `src`.
    pub fn deposit(&mut self, src: &[u8]) -> usize {
        debug_assert!(self.is_drained());
        let n = src.len().min(PIPE_CAPACITY);
        self.data[..n].copy_from_slice(&src[..n]);
        self.len = n;
        self.consumed = 0;
        n
    }

    /// Take buffered bytes into `dst`; returns the count.
    pub fn take(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.available());
        dst[..n].copy_from_slice(&self.data[self.consumed..self.consumed + n]);
        self.consumed += n;
        n
    }
}

impl Default for PipeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "riscv64")]
mod endpoint {
    use alloc::sync::Arc;
    use core::cell::UnsafeCell;

    use super::PipeBuffer;
    use crate::error::{KernelError, KernelResult};
    use crate::io::{ioctl, IoEndpoint, IoRef};
    use crate::sched::{Condition, SleepLock};

    /// A pipe endpoint. Reader and writer are threads sharing this one
    /// object; all state sits behind the sleep lock.
    pub struct Pipe {
        lock: SleepLock,
        not_empty: Condition,
        empty: Condition,
        buf: UnsafeCell<PipeBuffer>,
    }

    // SAFETY: the buffer is only touched while holding `lock`.
    unsafe impl Sync for Pipe {}
    // SAFETY: as above.
    unsafe impl Send for Pipe {}

    /// Create a pipe endpoint.
    pub fn open() -> KernelResult<IoRef> {
        Ok(Arc::new(Pipe {
            lock: SleepLock::new("pipe.lock"),
            not_empty: Condition::new("pipe.not_empty"),
            empty: Condition::new("pipe.empty"),
            buf: UnsafeCell::new(PipeBuffer::new()),
        }))
    }

    impl Pipe {
        /// Buffer access; callers hold the sleep lock.
        #[allow(clippy::mut_from_ref)]
        fn buffer(&self) -> &mut PipeBuffer {
            // SAFETY: every use sites inside a held SleepLock guard, which
            // serializes reader and writer.
            unsafe { &mut *self.buf.get() }
        }
    }

    impl IoEndpoint for Pipe {
        fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
            let mut guard = self.lock.acquire();
            while self.buffer().is_drained() {
                drop(guard);
                self.not_empty.wait();
                guard = self.lock.acquire();
            }
            let n = self.buffer().take(buf);
            if self.buffer().is_drained() {
                self.empty.broadcast();
            }
            drop(guard);
            Ok(n)
        }

        fn write(&self, buf: &[u8]) -> KernelResult<usize> {
            if buf.is_empty() {
                return Ok(0);
            }
            let mut guard = self.lock.acquire();
            while !self.buffer().is_drained() {
                drop(guard);
                self.empty.wait();
                guard = self.lock.acquire();
            }
            let n = self.buffer().deposit(buf);
            self.not_empty.broadcast();
            drop(guard);
            Ok(n)
        }

        fn ctl(&self, cmd: u32, _arg: u64) -> KernelResult<u64> {
            match cmd {
                ioctl::WAIT_EMPTY => {
                    let mut guard = self.lock.acquire();
                    while !self.buffer().is_drained() {
                        drop(guard);
                        self.empty.wait();
                        guard = self.lock.acquire();
                    }
                    drop(guard);
                    Ok(0)
                }
                _ => Err(KernelError::NotSupported { what: "pipe ioctl" }),
            }
        }
    }
}

#[cfg(target_arch = "riscv64")]
pub use endpoint::open;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deposit_then_take_preserves_order() {
        let mut buf = PipeBuffer::new();
        assert!(buf.is_drained());
        assert_eq!(buf.deposit(b"ABC"), 3);
        assert!(!buf.is_drained());
        let mut out = [0u8; 8];
        assert_eq!(buf.take(&mut out), 3);
        assert_eq!(&out[..3], b"ABC");
        assert!(buf.is_drained());
    }

    #[test]
    fn deposit_clamps_to_capacity() {
        let mut buf = PipeBuffer::new();
        let big = alloc::vec![7u8; PIPE_CAPACITY + 100];
        assert_eq!(buf.deposit(&big), PIPE_CAPACITY);
        assert_eq!(buf.available(), PIPE_CAPACITY);
    }

    #[test]
    fn partial_takes_drain_incrementally() {
        let mut buf = PipeBuffer::new();
        buf.deposit(b"abcdef");
        let mut out = [0u8; 4];
        assert_eq!(buf.take(&mut out), 4);
        assert_eq!(&out, b"abcd");
        assert!(!buf.is_drained());
        assert_eq!(buf.take(&mut out), 2);
        assert_eq!(&out[..2], b"ef");
        assert!(buf.is_drained());
    }
}
