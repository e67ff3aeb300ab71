//! Kernel error types.
//!
//! Every recoverable failure in the kernel is a [`KernelError`]; there is no
//! unwinding. Errors propagate with `?` up to the syscall boundary, where
//! [`KernelError::to_retval`] flattens them into the negative integers of
//! the syscall ABI. Panics are reserved for the kernel-fatal tier: out of
//! physical pages, scheduler invariant violations, supervisor-mode
//! exceptions.

use core::fmt;

/// Syscall-visible error codes, returned to user space negated in `a0`.
pub mod code {
    /// Argument validation, bad seek or range.
    pub const EINVAL: i64 = 1;
    /// Device or slot already in use.
    pub const EBUSY: i64 = 2;
    /// Unknown ioctl or unsupported operation.
    pub const ENOTSUP: i64 = 3;
    /// ELF or disk-format violation.
    pub const EBADFMT: i64 = 4;
    /// No such device.
    pub const ENODEV: i64 = 5;
    /// Block device reported an error.
    pub const EIO: i64 = 6;
    /// File descriptor out of range or not open.
    pub const EBADFD: i64 = 7;
    /// No such file or process.
    pub const ENOENT: i64 = 8;
    /// Page-already-mapped collision.
    pub const EACCESS: i64 = 9;
}

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// An argument failed validation: bad pointer, bad range, bad seek.
    InvalidArgument { what: &'static str },
    /// A named entity (file, device, process) does not exist.
    NotFound { what: &'static str },
    /// File descriptor out of range or with no open endpoint.
    BadFileDescriptor { fd: isize },
    /// Input violated a binary format (ELF header, boot block).
    BadFormat { what: &'static str },
    /// The operation is not supported by this endpoint.
    NotSupported { what: &'static str },
    /// The resource is exclusively held.
    Busy { what: &'static str },
    /// No such device registered.
    NoDevice { name: &'static str },
    /// A mapping request collided with an existing page-table entry.
    AlreadyMapped { vma: usize },
    /// The block device reported a non-recoverable error.
    Io { device: &'static str },
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    /// The ABI error code for this error, as a positive magnitude.
    pub const fn code(&self) -> i64 {
        match self {
            Self::InvalidArgument { .. } => code::EINVAL,
            Self::NotFound { .. } => code::ENOENT,
            Self::BadFileDescriptor { .. } => code::EBADFD,
            Self::BadFormat { .. } => code::EBADFMT,
            Self::NotSupported { .. } => code::ENOTSUP,
            Self::Busy { .. } => code::EBUSY,
            Self::NoDevice { .. } => code::ENODEV,
            Self::AlreadyMapped { .. } => code::EACCESS,
            Self::Io { .. } => code::EIO,
        }
    }

    /// The negative `a0` value handed back to user space.
    pub const fn to_retval(&self) -> i64 {
        -self.code()
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument { what } => write!(f, "invalid argument: {}", what),
            Self::NotFound { what } => write!(f, "not found: {}", what),
            Self::BadFileDescriptor { fd } => write!(f, "bad file descriptor {}", fd),
            Self::BadFormat { what } => write!(f, "bad format: {}", what),
            Self::NotSupported { what } => write!(f, "not supported: {}", what),
            Self::Busy { what } => write!(f, "busy: {}", what),
            Self::NoDevice { name } => write!(f, "no device: {}", name),
            Self::AlreadyMapped { vma } => write!(f, "already mapped at {:#x}", vma),
            Self::Io { device } => write!(f, "I/O error on {}", device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retval_is_negative_code() {
        let e = KernelError::BadFileDescriptor { fd: 99 };
        assert_eq!(e.code(), code::EBADFD);
        assert_eq!(e.to_retval(), -code::EBADFD);
    }

    #[test]
    fn codes_are_distinct() {
        let codes = [
            code::EINVAL,
            code::EBUSY,
            code::ENOTSUP,
            code::EBADFMT,
            code::ENODEV,
            code::EIO,
            code::EBADFD,
            code::ENOENT,
            code::EACCESS,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
