//! The polymorphic I/O endpoint.
//!
//! Every byte source or sink in the kernel — the block device, an open
//! file, a pipe, a memory buffer — is an [`IoEndpoint`] behind an
//! [`IoRef`]. Reference counting is the `Arc` strong count: opening yields
//! a count of one, `fork` duplicates the per-process table with
//! `Arc::clone`, and the final drop runs the concrete type's teardown.
//!
//! `read` and `write` move at most one convenient unit (one block, one
//! buffered batch) and advance an implementation-defined position; the
//! provided [`IoEndpoint::read_exact`] / [`IoEndpoint::write_all`]
//! helpers compose them across boundaries.
//!
//! Endpoints are not uniformly thread-safe: outside the block driver and
//! the pipe, callers rely on single-owner use (one thread per process).

pub mod memio;

use alloc::sync::Arc;

use crate::error::{KernelError, KernelResult};

/// Control commands understood by [`IoEndpoint::ctl`].
pub mod ioctl {
    /// Get the endpoint length in bytes (returned).
    pub const GETLEN: u32 = 1;
    /// Set the endpoint length. No endpoint in this kernel supports it.
    pub const SETLEN: u32 = 2;
    /// Get the current position (returned).
    pub const GETPOS: u32 = 3;
    /// Set the current position (argument).
    pub const SETPOS: u32 = 4;
    /// Flush buffered state. No endpoint in this kernel supports it.
    pub const FLUSH: u32 = 5;
    /// Get the underlying block size (returned).
    pub const GETBLKSZ: u32 = 6;
    /// Pipe only: wait until the reader has drained the buffer.
    pub const WAIT_EMPTY: u32 = 8;
}

/// A polymorphic I/O endpoint. See the module docs for the contract.
pub trait IoEndpoint: Send + Sync {
    /// Read up to `buf.len()` bytes at the current position. Returns the
    /// number of bytes read; zero means end of data.
    fn read(&self, _buf: &mut [u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported { what: "read" })
    }

    /// Write up to `buf.len()` bytes at the current position. Returns the
    /// number of bytes written; zero means no further progress is
    /// possible.
    fn write(&self, _buf: &[u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported { what: "write" })
    }

    /// Control operation. `arg` is the input for commands that take one;
    /// the returned value is the output for commands that produce one.
    fn ctl(&self, _cmd: u32, _arg: u64) -> KernelResult<u64> {
        Err(KernelError::NotSupported { what: "ioctl" })
    }

    /// Read exactly `buf.len()` bytes, composing partial reads. Fails with
    /// `EINVAL` if the data runs out first.
    fn read_exact(&self, buf: &mut [u8]) -> KernelResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read(&mut buf[done..])?;
            if n == 0 {
                return Err(KernelError::InvalidArgument {
                    what: "short read",
                });
            }
            done += n;
        }
        Ok(())
    }

    /// Write all of `buf`, composing partial writes. Fails with `EINVAL`
    /// if the endpoint stops accepting bytes.
    fn write_all(&self, buf: &[u8]) -> KernelResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.write(&buf[done..])?;
            if n == 0 {
                return Err(KernelError::InvalidArgument {
                    what: "short write",
                });
            }
            done += n;
        }
        Ok(())
    }

    /// Move the position, via `ctl(SETPOS)`.
    fn seek(&self, pos: u64) -> KernelResult<()> {
        self.ctl(ioctl::SETPOS, pos).map(|_| ())
    }

    /// Current position, via `ctl(GETPOS)`.
    fn position(&self) -> KernelResult<u64> {
        self.ctl(ioctl::GETPOS, 0)
    }

    /// Total length in bytes, via `ctl(GETLEN)`.
    fn byte_len(&self) -> KernelResult<u64> {
        self.ctl(ioctl::GETLEN, 0)
    }
}

/// A counted reference to an endpoint. Dropping the last reference closes
/// the endpoint (the concrete type's `Drop` runs).
pub type IoRef = Arc<dyn IoEndpoint>;

#[cfg(test)]
mod tests {
    use super::*;
    use memio::MemIo;

    #[test]
    fn helpers_compose_partial_transfers() {
        let io = MemIo::with_contents(b"abcdefgh".to_vec());
        let mut buf = [0u8; 8];
        io.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abcdefgh");
        // Past the end: read reports zero, read_exact maps it to an error.
        assert!(io.read_exact(&mut buf).is_err());
    }

    #[test]
    fn seek_and_position_roundtrip() {
        let io = MemIo::with_contents(b"0123456789".to_vec());
        io.seek(4).unwrap();
        assert_eq!(io.position().unwrap(), 4);
        let mut b = [0u8; 2];
        io.read_exact(&mut b).unwrap();
        assert_eq!(&b, b"45");
        assert_eq!(io.byte_len().unwrap(), 10);
    }

    #[test]
    fn refcount_tracks_clones() {
        let io: IoRef = Arc::new(MemIo::with_contents(alloc::vec![1, 2, 3]));
        assert_eq!(Arc::strong_count(&io), 1);
        let dup = io.clone();
        assert_eq!(Arc::strong_count(&io), 2);
        drop(dup);
        assert_eq!(Arc::strong_count(&io), 1);
    }
}
