//! Device drivers and the name + instance device registry.
//!
//! Drivers attach at boot and register an open function under a short
//! name; the `devopen` syscall resolves `(name, instance)` pairs through
//! [`open`] into I/O endpoints.

pub mod virtio;

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::io::IoRef;

/// Opens a registered device; `aux` is whatever the driver registered.
pub type OpenFn = fn(aux: usize) -> KernelResult<IoRef>;

struct Device {
    name: &'static str,
    instno: usize,
    open: OpenFn,
    aux: usize,
}

static DEVICES: spin::Mutex<Vec<Device>> = spin::Mutex::new(Vec::new());

/// Register a device instance. Returns the instance number assigned under
/// `name` (instances count up from zero per name).
pub fn register(name: &'static str, open: OpenFn, aux: usize) -> usize {
    let mut devices = DEVICES.lock();
    let instno = devices.iter().filter(|d| d.name == name).count();
    devices.push(Device {
        name,
        instno,
        open,
        aux,
    });
    log::info!("device registered: {}{}", name, instno);
    instno
}

/// Open device `name` instance `instno`.
pub fn open(name: &str, instno: usize) -> KernelResult<IoRef> {
    let (open, aux) = {
        let devices = DEVICES.lock();
        let dev = devices
            .iter()
            .find(|d| d.name == name && d.instno == instno)
            .ok_or(KernelError::NoDevice { name: "device" })?;
        (dev.open, dev.aux)
    };
    open(aux)
}

/// Probe the platform's device slots and attach what is found. Pipes
/// register as an openable pseudo-device: each open of `"pipe"` creates a
/// fresh pipe endpoint, shared with a child across fork.
#[cfg(target_arch = "riscv64")]
pub fn init() {
    virtio::probe();
    register("pipe", open_pipe, 0);
}

#[cfg(target_arch = "riscv64")]
fn open_pipe(_aux: usize) -> KernelResult<IoRef> {
    crate::fs::pipe::open()
}
