//! Memory-literal I/O endpoint.
//!
//! Wraps a byte buffer with a position, making in-memory data (an embedded
//! executable, a test disk image) usable anywhere an endpoint is. Also the
//! substrate the filesystem and ELF unit tests run on.

use spin::Mutex;

use alloc::vec::Vec;

use super::{ioctl, IoEndpoint};
use crate::error::{KernelError, KernelResult};

struct Inner {
    data: Vec<u8>,
    pos: usize,
}

/// An endpoint over owned memory.
pub struct MemIo {
    inner: Mutex<Inner>,
}

impl MemIo {
    /// An endpoint over the given bytes, position at zero.
    pub fn with_contents(data: Vec<u8>) -> Self {
        Self {
            inner: Mutex::new(Inner { data, pos: 0 }),
        }
    }

    /// A zero-filled endpoint of fixed size.
    pub fn zeroed(len: usize) -> Self {
        Self::with_contents(alloc::vec![0; len])
    }

    /// Copy out the current contents (test support).
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().data.clone()
    }
}

impl IoEndpoint for MemIo {
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        let mut inner = self.inner.lock();
        let remaining = inner.data.len().saturating_sub(inner.pos);
        let n = buf.len().min(remaining);
        let pos = inner.pos;
        buf[..n].copy_from_slice(&inner.data[pos..pos + n]);
        inner.pos += n;
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        let mut inner = self.inner.lock();
        let remaining = inner.data.len().saturating_sub(inner.pos);
        let n = buf.len().min(remaining);
        let pos = inner.pos;
        inner.data[pos..pos + n].copy_from_slice(&buf[..n]);
        inner.pos += n;
        Ok(n)
    }

    fn ctl(&self, cmd: u32, arg: u64) -> KernelResult<u64> {
        let mut inner = self.inner.lock();
        match cmd {
            ioctl::GETLEN => Ok(inner.data.len() as u64),
            ioctl::GETPOS => Ok(inner.pos as u64),
            ioctl::SETPOS => {
                if arg > inner.data.len() as u64 {
                    return Err(KernelError::InvalidArgument {
                        what: "seek past end of memory endpoint",
                    });
                }
                inner.pos = arg as usize;
                Ok(arg)
            }
            _ => Err(KernelError::NotSupported {
                what: "memio ioctl",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_clamps_at_end() {
        let io = MemIo::with_contents(b"xyz".to_vec());
        let mut buf = [0u8; 8];
        assert_eq!(io.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"xyz");
        assert_eq!(io.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn write_patches_in_place() {
        let io = MemIo::with_contents(b"hello world".to_vec());
        io.seek(6).unwrap();
        assert_eq!(io.write(b"there").unwrap(), 5);
        assert_eq!(io.snapshot(), b"hello there");
    }

    #[test]
    fn seek_past_end_rejected() {
        let io = MemIo::zeroed(16);
        assert!(io.seek(17).is_err());
        assert!(io.seek(16).is_ok());
    }
}
