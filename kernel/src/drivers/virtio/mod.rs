//! VirtIO MMIO transport and device probe.
//!
//! The virt board exposes up to eight virtio-mmio windows; [`probe`] scans
//! them and attaches the block driver to any block device found. Register
//! offsets and the initialization handshake follow the VirtIO 1.x
//! specification (MMIO transport, section 4.2).

#[cfg(target_arch = "riscv64")]
pub mod blk;
pub mod queue;

use crate::error::{KernelError, KernelResult};

/// "virt" in little-endian.
const MMIO_MAGIC: u32 = 0x7472_6976;
const MMIO_VERSION_MODERN: u32 = 2;

/// Device ids.
pub const DEVICE_ID_BLOCK: u32 = 2;

/// Device-independent feature bits (number, not mask).
pub mod feature {
    pub const VIRTIO_F_INDIRECT_DESC: u32 = 28;
    pub const VIRTIO_F_VERSION_1: u32 = 32;
    pub const VIRTIO_F_RING_RESET: u32 = 40;
}

/// Device status bits.
mod status {
    pub const ACKNOWLEDGE: u32 = 1;
    pub const DRIVER: u32 = 2;
    pub const DRIVER_OK: u32 = 4;
    pub const FEATURES_OK: u32 = 8;
    pub const FAILED: u32 = 128;
}

// Register offsets (MMIO transport).
mod reg {
    pub const MAGIC: usize = 0x000;
    pub const VERSION: usize = 0x004;
    pub const DEVICE_ID: usize = 0x008;
    pub const DEVICE_FEATURES: usize = 0x010;
    pub const DEVICE_FEATURES_SEL: usize = 0x014;
    pub const DRIVER_FEATURES: usize = 0x020;
    pub const DRIVER_FEATURES_SEL: usize = 0x024;
    pub const QUEUE_SEL: usize = 0x030;
    pub const QUEUE_NUM_MAX: usize = 0x034;
    pub const QUEUE_NUM: usize = 0x038;
    pub const QUEUE_READY: usize = 0x044;
    pub const QUEUE_NOTIFY: usize = 0x050;
    pub const INTERRUPT_STATUS: usize = 0x060;
    pub const INTERRUPT_ACK: usize = 0x064;
    pub const STATUS: usize = 0x070;
    pub const QUEUE_DESC_LOW: usize = 0x080;
    pub const QUEUE_DESC_HIGH: usize = 0x084;
    pub const QUEUE_DRIVER_LOW: usize = 0x090;
    pub const QUEUE_DRIVER_HIGH: usize = 0x094;
    pub const QUEUE_DEVICE_LOW: usize = 0x0a0;
    pub const QUEUE_DEVICE_HIGH: usize = 0x0a4;
    pub const CONFIG: usize = 0x100;
}

/// A virtio-mmio register window.
#[derive(Clone, Copy)]
pub struct MmioTransport {
    base: usize,
}

impl MmioTransport {
    /// Wrap the window at `base`.
    ///
    /// # Safety
    /// `base` must be an identity-mapped virtio-mmio window not driven by
    /// another owner.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: constructor contract; MMIO reads within the window.
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write32(&self, offset: usize, value: u32) {
        // SAFETY: constructor contract; MMIO writes within the window.
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }

    pub fn is_present(&self) -> bool {
        self.read32(reg::MAGIC) == MMIO_MAGIC && self.read32(reg::VERSION) == MMIO_VERSION_MODERN
    }

    pub fn device_id(&self) -> u32 {
        self.read32(reg::DEVICE_ID)
    }

    /// Reset, then advertise that a driver has found the device.
    pub fn begin_init(&self) {
        self.write32(reg::STATUS, 0);
        self.write32(reg::STATUS, status::ACKNOWLEDGE);
        self.write32(reg::STATUS, status::ACKNOWLEDGE | status::DRIVER);
    }

    fn device_features(&self) -> u64 {
        self.write32(reg::DEVICE_FEATURES_SEL, 0);
        let low = self.read32(reg::DEVICE_FEATURES) as u64;
        self.write32(reg::DEVICE_FEATURES_SEL, 1);
        let high = self.read32(reg::DEVICE_FEATURES) as u64;
        (high << 32) | low
    }

    fn write_driver_features(&self, features: u64) {
        self.write32(reg::DRIVER_FEATURES_SEL, 0);
        self.write32(reg::DRIVER_FEATURES, features as u32);
        self.write32(reg::DRIVER_FEATURES_SEL, 1);
        self.write32(reg::DRIVER_FEATURES, (features >> 32) as u32);
    }

    /// Negotiate features: every `needed` bit must be offered, `wanted`
    /// bits are taken when offered. Returns the accepted set.
    pub fn negotiate_features(&self, needed: u64, wanted: u64) -> KernelResult<u64> {
        let offered = self.device_features();
        if offered & needed != needed {
            self.write32(reg::STATUS, status::FAILED);
            return Err(KernelError::NotSupported {
                what: "required virtio features",
            });
        }
        let accepted = needed | (wanted & offered);
        self.write_driver_features(accepted);
        let st = self.read32(reg::STATUS);
        self.write32(reg::STATUS, st | status::FEATURES_OK);
        if self.read32(reg::STATUS) & status::FEATURES_OK == 0 {
            self.write32(reg::STATUS, status::FAILED);
            return Err(KernelError::NotSupported {
                what: "virtio FEATURES_OK",
            });
        }
        Ok(accepted)
    }

    /// Install a queue's descriptor table, available ring, and used ring.
    /// The queue is not made ready; see [`MmioTransport::set_queue_ready`].
    pub fn attach_virtq(&self, qid: u32, size: u32, desc: u64, avail: u64, used: u64) {
        self.write32(reg::QUEUE_SEL, qid);
        let max = self.read32(reg::QUEUE_NUM_MAX);
        assert!(max >= size, "virtqueue {} shorter than {}", qid, size);
        self.write32(reg::QUEUE_NUM, size);
        self.write32(reg::QUEUE_DESC_LOW, desc as u32);
        self.write32(reg::QUEUE_DESC_HIGH, (desc >> 32) as u32);
        self.write32(reg::QUEUE_DRIVER_LOW, avail as u32);
        self.write32(reg::QUEUE_DRIVER_HIGH, (avail >> 32) as u32);
        self.write32(reg::QUEUE_DEVICE_LOW, used as u32);
        self.write32(reg::QUEUE_DEVICE_HIGH, (used >> 32) as u32);
    }

    pub fn set_queue_ready(&self, qid: u32, ready: bool) {
        self.write32(reg::QUEUE_SEL, qid);
        self.write32(reg::QUEUE_READY, ready as u32);
    }

    pub fn driver_ok(&self) {
        let st = self.read32(reg::STATUS);
        self.write32(reg::STATUS, st | status::DRIVER_OK);
    }

    pub fn notify_queue(&self, qid: u32) {
        self.write32(reg::QUEUE_NOTIFY, qid);
    }

    pub fn interrupt_status(&self) -> u32 {
        self.read32(reg::INTERRUPT_STATUS)
    }

    pub fn interrupt_ack(&self, bits: u32) {
        self.write32(reg::INTERRUPT_ACK, bits);
    }

    pub fn config_read32(&self, offset: usize) -> u32 {
        self.read32(reg::CONFIG + offset)
    }

    pub fn config_read64(&self, offset: usize) -> u64 {
        let low = self.config_read32(offset) as u64;
        let high = self.config_read32(offset + 4) as u64;
        (high << 32) | low
    }
}

/// Scan the board's virtio-mmio slots and attach known devices.
#[cfg(target_arch = "riscv64")]
pub fn probe() {
    use crate::config::{
        VIRTIO_IRQ_BASE, VIRTIO_MMIO_BASE, VIRTIO_MMIO_COUNT, VIRTIO_MMIO_STRIDE,
    };

    for slot in 0..VIRTIO_MMIO_COUNT {
        let base = VIRTIO_MMIO_BASE + slot * VIRTIO_MMIO_STRIDE;
        // SAFETY: the slot addresses are the board's virtio windows,
        // identity-mapped and probed exactly once here.
        let transport = unsafe { MmioTransport::new(base) };
        if !transport.is_present() {
            continue;
        }
        let irqno = VIRTIO_IRQ_BASE + slot as u32;
        match transport.device_id() {
            DEVICE_ID_BLOCK => match blk::attach(transport, irqno) {
                Ok(()) => log::info!("virtio-blk at {:#x}, irq {}", base, irqno),
                Err(e) => log::warn!("virtio-blk at {:#x} failed: {}", base, e),
            },
            0 => {}
            other => log::debug!("virtio device {} at {:#x} ignored", other, base),
        }
    }
}
