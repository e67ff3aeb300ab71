//! Virtio block device driver.
//!
//! One device, one virtqueue of depth one, one request in flight. The
//! descriptor chain is statically shaped: descriptor 0 is INDIRECT and
//! points at a three-entry table (request header, data, status byte) that
//! lives in the driver state. Completion is interrupt-driven: the ISR
//! acknowledges the used-buffer bit and broadcasts `used_updated`; the
//! waiting driver thread then checks the status byte.
//!
//! Reads and writes go through a single block buffer sized to the
//! negotiated block size. `bufblkno` remembers which disk block occupies
//! the buffer, so re-reading a buffered block issues no virtqueue request
//! and sub-block writes become read-modify-write. The buffer lock is held
//! only across the memcpy between caller and block buffer, never across
//! the virtqueue wait.
//!
//! Endpoints from [`open`] assume single-owner use, like the rest of the
//! I/O layer; the ISR itself never touches the driver state.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{fence, Ordering};

use super::queue::{DescFlags, VirtqAvail, VirtqDesc, VirtqUsed, QUEUE_SIZE};
use super::{feature, MmioTransport};
use crate::arch::{interrupts_disable, interrupts_restore};
use crate::error::{KernelError, KernelResult};
use crate::io::{ioctl, IoEndpoint, IoRef};
use crate::sched::{Condition, SleepLock};
use crate::sync::IrqSafe;

/// Device sector size fixed by the VirtIO protocol.
pub const SECTOR_SIZE: usize = 512;

/// Recoverable-status retries before a request is abandoned.
const ATTEMPT_MAX: u32 = 10;

/// Block-device feature bits (number, not mask).
mod blk_feature {
    pub const BLK_SIZE: u32 = 6;
    pub const TOPOLOGY: u32 = 10;
}

mod req_type {
    pub const IN: u32 = 0;
    pub const OUT: u32 = 1;
}

mod req_status {
    pub const OK: u8 = 0;
    pub const IOERR: u8 = 1;
    pub const UNSUPP: u8 = 2;
}

// Indices into the indirect descriptor table.
const DESC_HEADER: usize = 0;
const DESC_DATA: usize = 1;
const DESC_STATUS: usize = 2;

/// Device-readable request header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RequestHeader {
    type_: u32,
    reserved: u32,
    sector: u64,
}

/// The virtqueue memory shared with the device. `desc[0]` is the indirect
/// descriptor published in the available ring; `desc[1..4]` is the
/// three-entry table it points to.
#[repr(C)]
struct VirtqState {
    avail: VirtqAvail,
    used: VirtqUsed,
    desc: [VirtqDesc; 4],
    header: RequestHeader,
    status: u8,
}

/// Driver-private mutable state: position, block buffer, virtqueue.
struct DriverState {
    pos: u64,
    /// Disk block currently in `blkbuf`, or `u64::MAX` for none.
    bufblkno: u64,
    blkbuf: Box<[u8]>,
    vq: Box<VirtqState>,
}

/// A virtio block device instance.
pub struct VioBlk {
    transport: MmioTransport,
    irqno: u32,
    /// Negotiated optimal block size, a multiple of the sector size.
    blksz: usize,
    /// Device size in bytes.
    size: u64,
    opened: IrqSafe<bool>,
    /// Signaled from the ISR when the used ring advances.
    used_updated: Condition,
    /// Held only across copies between caller buffers and the block
    /// buffer.
    buf_lock: SleepLock,
    state: UnsafeCell<DriverState>,
}

// SAFETY: the mutable state is only touched by the single endpoint owner
// (module contract); the ISR limits itself to the condition broadcast and
// the transport registers.
unsafe impl Sync for VioBlk {}
// SAFETY: as above; the raw state moves with the owning allocation.
unsafe impl Send for VioBlk {}

/// Probe result of [`attach`]: the device registers itself as `"blk"`.
pub fn attach(transport: MmioTransport, irqno: u32) -> KernelResult<()> {
    transport.begin_init();

    let needed = (1u64 << feature::VIRTIO_F_RING_RESET)
        | (1u64 << feature::VIRTIO_F_INDIRECT_DESC)
        | (1u64 << feature::VIRTIO_F_VERSION_1);
    let wanted = (1u64 << blk_feature::BLK_SIZE) | (1u64 << blk_feature::TOPOLOGY);
    let accepted = transport.negotiate_features(needed, wanted)?;

    // Config space: capacity in sectors at 0, blk_size at 20.
    let capacity_sectors = transport.config_read64(0);
    let blksz = if accepted & (1 << blk_feature::BLK_SIZE) != 0 {
        transport.config_read32(20) as usize
    } else {
        SECTOR_SIZE
    };
    assert!(
        blksz % SECTOR_SIZE == 0 && blksz > 0,
        "virtio-blk block size {} not a sector multiple",
        blksz
    );

    let size = capacity_sectors * SECTOR_SIZE as u64;

    let mut vq = Box::new(VirtqState {
        avail: VirtqAvail::zeroed(),
        used: VirtqUsed::zeroed(),
        desc: [VirtqDesc::zeroed(); 4],
        header: RequestHeader {
            type_: 0,
            reserved: 0,
            sector: 0,
        },
        status: 0,
    });

    let blkbuf = vec![0u8; blksz].into_boxed_slice();

    // Static descriptor chain: indirect -> [header, data, status].
    let table_addr = &vq.desc[1] as *const VirtqDesc as u64;
    vq.desc[0] = VirtqDesc {
        addr: table_addr,
        len: (3 * core::mem::size_of::<VirtqDesc>()) as u32,
        flags: DescFlags::INDIRECT.bits(),
        next: 0,
    };
    vq.desc[1 + DESC_HEADER] = VirtqDesc {
        addr: &vq.header as *const RequestHeader as u64,
        len: core::mem::size_of::<RequestHeader>() as u32,
        flags: DescFlags::NEXT.bits(),
        next: DESC_DATA as u16,
    };
    vq.desc[1 + DESC_DATA] = VirtqDesc {
        addr: blkbuf.as_ptr() as u64,
        len: blksz as u32,
        flags: DescFlags::NEXT.bits(),
        next: DESC_STATUS as u16,
    };
    vq.desc[1 + DESC_STATUS] = VirtqDesc {
        addr: &vq.status as *const u8 as u64,
        len: 1,
        flags: DescFlags::WRITE.bits(),
        next: 0,
    };

    transport.attach_virtq(
        0,
        QUEUE_SIZE as u32,
        &vq.desc[0] as *const VirtqDesc as u64,
        &vq.avail as *const VirtqAvail as u64,
        &vq.used as *const VirtqUsed as u64,
    );
    transport.driver_ok();

    // The device lives for the kernel's lifetime; the registry and the
    // ISR table both hold its address.
    let dev = Box::into_raw(Box::new(VioBlk {
        transport,
        irqno,
        blksz,
        size,
        opened: IrqSafe::new(false),
        used_updated: Condition::new("vioblk.used_updated"),
        buf_lock: SleepLock::new("vioblk.blkbuf"),
        state: UnsafeCell::new(DriverState {
            pos: 0,
            bufblkno: u64::MAX,
            blkbuf,
            vq,
        }),
    }));

    crate::irq::register_isr(irqno, 1, isr, dev as usize);
    crate::drivers::register("blk", open, dev as usize);

    log::info!(
        "vioblk: {} KB, block size {}",
        size / 1024,
        blksz
    );
    Ok(())
}

/// Open the device, yielding its endpoint. A second open without a close
/// fails with `EBUSY`.
fn open(aux: usize) -> KernelResult<IoRef> {
    // SAFETY: `aux` is the leaked VioBlk pointer registered in `attach`.
    let dev: &'static VioBlk = unsafe { &*(aux as *const VioBlk) };
    let first = dev.opened.with(|o| {
        if *o {
            false
        } else {
            *o = true;
            true
        }
    });
    if !first {
        return Err(KernelError::Busy { what: "vioblk" });
    }
    // SAFETY: open is exclusive (checked above), so the state is ours.
    let state = unsafe { &mut *dev.state.get() };
    state.vq.avail.flags = 0;
    state.vq.avail.idx = 0;
    state.vq.avail.ring[0] = 0;
    dev.transport.set_queue_ready(0, true);
    crate::irq::enable_irq(dev.irqno);
    Ok(Arc::new(VioBlkHandle { dev }))
}

/// The open handle; the final drop closes the device.
struct VioBlkHandle {
    dev: &'static VioBlk,
}

impl Drop for VioBlkHandle {
    fn drop(&mut self) {
        self.dev.transport.set_queue_ready(0, false);
        crate::irq::disable_irq(self.dev.irqno);
        self.dev.opened.with(|o| *o = false);
    }
}

impl IoEndpoint for VioBlkHandle {
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        self.dev.read(buf)
    }

    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        self.dev.write(buf)
    }

    fn ctl(&self, cmd: u32, arg: u64) -> KernelResult<u64> {
        self.dev.ctl(cmd, arg)
    }
}

impl VioBlk {
    /// Exclusive access to the driver state. Callers hold the single open
    /// handle, which is not shared across threads (single-owner I/O).
    #[allow(clippy::mut_from_ref)]
    fn state(&self) -> &mut DriverState {
        // SAFETY: single-owner contract of the endpoint layer; the ISR
        // never calls this.
        unsafe { &mut *self.state.get() }
    }

    /// Read up to one block's worth of bytes at the current position.
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        let state = self.state();
        if buf.is_empty() || state.pos >= self.size {
            return Ok(0);
        }
        let n = buf.len().min((self.size - state.pos) as usize);

        let blksz = self.blksz as u64;
        let blkno = state.pos / blksz;
        let start = (state.pos % blksz) as usize;
        let end = self.blksz.min(start + n);

        if state.bufblkno != blkno {
            self.request(state, blkno, req_type::IN)?;
            state.bufblkno = blkno;
        }

        {
            let _guard = self.buf_lock.acquire();
            buf[..end - start].copy_from_slice(&state.blkbuf[start..end]);
        }
        state.pos += (end - start) as u64;
        Ok(end - start)
    }

    /// Write up to one block's worth of bytes at the current position.
    /// Sub-block writes read the block first (read-modify-write).
    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        let state = self.state();
        if buf.is_empty() || state.pos >= self.size {
            return Ok(0);
        }
        let n = buf.len().min((self.size - state.pos) as usize);

        let blksz = self.blksz as u64;
        let blkno = state.pos / blksz;
        let start = (state.pos % blksz) as usize;
        let end = self.blksz.min(start + n);

        let partial = start != 0 || end != self.blksz;
        if partial && state.bufblkno != blkno {
            self.request(state, blkno, req_type::IN)?;
        }
        state.bufblkno = blkno;

        {
            let _guard = self.buf_lock.acquire();
            state.blkbuf[start..end].copy_from_slice(&buf[..end - start]);
        }
        self.request(state, blkno, req_type::OUT)?;
        state.pos += (end - start) as u64;
        Ok(end - start)
    }

    fn ctl(&self, cmd: u32, arg: u64) -> KernelResult<u64> {
        let state = self.state();
        match cmd {
            ioctl::GETLEN => Ok(self.size),
            ioctl::GETPOS => Ok(state.pos),
            ioctl::SETPOS => {
                if arg >= self.size {
                    return Err(KernelError::InvalidArgument {
                        what: "position beyond device",
                    });
                }
                state.pos = arg;
                Ok(arg)
            }
            ioctl::GETBLKSZ => Ok(self.blksz as u64),
            _ => Err(KernelError::NotSupported {
                what: "vioblk ioctl",
            }),
        }
    }

    /// Submit one request for `blkno` and wait for completion.
    ///
    /// Interrupts are disabled from publishing the buffer until the wait
    /// is entered, so the completion broadcast cannot be lost; the wait
    /// itself re-enables interrupts around the suspension.
    fn request(&self, state: &mut DriverState, blkno: u64, op: u32) -> KernelResult<()> {
        let sector = blkno * (self.blksz / SECTOR_SIZE) as u64;
        assert!(sector * SECTOR_SIZE as u64 <= self.size, "request beyond device");

        let vq = &mut *state.vq;
        vq.header.type_ = op;
        vq.header.reserved = 0;
        vq.header.sector = sector;

        // The data descriptor is device-writable for reads only.
        let data_flags = if op == req_type::IN {
            DescFlags::NEXT | DescFlags::WRITE
        } else {
            DescFlags::NEXT
        };
        vq.desc[1 + DESC_DATA].flags = data_flags.bits();

        for _attempt in 0..ATTEMPT_MAX {
            let was_enabled = interrupts_disable();

            let used_idx_ptr = &vq.used.idx as *const u16;
            // SAFETY: `used.idx` is device-written shared memory; volatile
            // reads observe the device's progress.
            let prev_used = unsafe { core::ptr::read_volatile(used_idx_ptr) };

            let avail_idx_ptr = &mut vq.avail.idx as *mut u16;
            // SAFETY: the available ring is shared with the device; the
            // release fence below orders the descriptor writes before the
            // index bump that publishes them.
            unsafe {
                let idx = core::ptr::read_volatile(avail_idx_ptr);
                fence(Ordering::Release);
                core::ptr::write_volatile(avail_idx_ptr, idx.wrapping_add(1));
            }
            self.transport.notify_queue(0);

            // Suspend until the ISR sees the used-buffer interrupt.
            self.used_updated.wait();
            interrupts_restore(was_enabled);

            fence(Ordering::Acquire);
            // SAFETY: as above.
            let now_used = unsafe { core::ptr::read_volatile(used_idx_ptr) };
            assert_ne!(prev_used, now_used, "woken without used-ring progress");

            // Depth-1 queue: the completed chain is always descriptor 0.
            // SAFETY: device-written used element, read after the acquire
            // fence above.
            let used_id = unsafe { core::ptr::read_volatile(&vq.used.ring[0].id as *const u32) };
            if used_id != 0 {
                log::warn!("vioblk: used ring returned id {}", used_id);
            }

            // SAFETY: the status byte is device-written shared memory.
            let status = unsafe { core::ptr::read_volatile(&vq.status as *const u8) };
            match status {
                req_status::OK => return Ok(()),
                req_status::IOERR => {
                    log::warn!("vioblk: I/O error on block {}, retrying", blkno);
                }
                req_status::UNSUPP => {
                    return Err(KernelError::NotSupported {
                        what: "vioblk request type",
                    })
                }
                other => {
                    log::warn!("vioblk: unknown status {} on block {}", other, blkno);
                }
            }
        }
        Err(KernelError::Io { device: "vioblk" })
    }
}

/// Used-buffer interrupt: acknowledge and wake the waiting request.
fn isr(aux: usize) {
    const USED_BUFFER: u32 = 1 << 0;
    // SAFETY: `aux` is the leaked VioBlk pointer registered in `attach`.
    let dev: &'static VioBlk = unsafe { &*(aux as *const VioBlk) };
    if dev.transport.interrupt_status() & USED_BUFFER != 0 {
        dev.used_updated.broadcast();
        dev.transport.interrupt_ack(USED_BUFFER);
        fence(Ordering::SeqCst);
    }
}
