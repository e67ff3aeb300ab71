//! Virtqueue data structures (VirtIO 1.x split ring).
//!
//! This kernel drives one queue of depth one per device, with a single
//! statically shaped descriptor chain reached through an indirect
//! descriptor. The layouts below are fixed by the VirtIO specification.

use bitflags::bitflags;

/// Queue depth used for every virtqueue in this kernel.
pub const QUEUE_SIZE: usize = 1;

bitflags! {
    /// Descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        /// Buffer continues in the descriptor indexed by `next`.
        const NEXT = 1 << 0;
        /// Buffer is device-writable (device reads it otherwise).
        const WRITE = 1 << 1;
        /// Buffer holds a table of descriptors.
        const INDIRECT = 1 << 2;
    }
}

/// One descriptor: a physical buffer address, length, flags, and chain
/// link.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl VirtqDesc {
    pub const fn zeroed() -> Self {
        Self {
            addr: 0,
            len: 0,
            flags: 0,
            next: 0,
        }
    }
}

/// Driver-written available ring, sized for depth 1.
#[repr(C, align(2))]
#[derive(Debug)]
pub struct VirtqAvail {
    pub flags: u16,
    pub idx: u16,
    pub ring: [u16; QUEUE_SIZE],
}

impl VirtqAvail {
    pub const fn zeroed() -> Self {
        Self {
            flags: 0,
            idx: 0,
            ring: [0; QUEUE_SIZE],
        }
    }
}

/// One used-ring element: the head descriptor id of a completed chain and
/// the number of bytes the device wrote.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VirtqUsedElem {
    pub id: u32,
    pub len: u32,
}

/// Device-written used ring, sized for depth 1.
#[repr(C, align(4))]
#[derive(Debug)]
pub struct VirtqUsed {
    pub flags: u16,
    pub idx: u16,
    pub ring: [VirtqUsedElem; QUEUE_SIZE],
}

impl VirtqUsed {
    pub const fn zeroed() -> Self {
        Self {
            flags: 0,
            idx: 0,
            ring: [VirtqUsedElem { id: 0, len: 0 }; QUEUE_SIZE],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn ring_layouts_are_abi_exact() {
        assert_eq!(size_of::<VirtqDesc>(), 16);
        assert_eq!(size_of::<VirtqUsedElem>(), 8);
        // Depth-1 rings: flags + idx + one element.
        assert_eq!(size_of::<VirtqAvail>(), 6);
        assert_eq!(size_of::<VirtqUsed>(), 12);
    }

    #[test]
    fn desc_flags_values() {
        assert_eq!(DescFlags::NEXT.bits(), 1);
        assert_eq!(DescFlags::WRITE.bits(), 2);
        assert_eq!(DescFlags::INDIRECT.bits(), 4);
    }
}
