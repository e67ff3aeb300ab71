//! Environment-call dispatch.
//!
//! The trap router lands here for every ecall from U-mode. The dispatcher
//! advances `sepc` past the 4-byte ecall, reads the syscall number from
//! `a7` and arguments from `a0..a5`, and writes the result back to `a0`
//! as a non-negative value or a negated error code.
//!
//! Every user-supplied pointer crosses [`crate::mm::space`]'s validators
//! before the kernel touches it; that boundary turns would-be page faults
//! into `EINVAL` returns.

use alloc::string::String;

use crate::arch::riscv64::trap::TrapFrame;
use crate::error::KernelResult;
use crate::io::{ioctl, IoEndpoint};
use crate::mm::page_table::PteFlags;
use crate::mm::space;
use crate::process;
use crate::sched::thread;

// Syscall numbers (a7).
const SYS_EXIT: usize = 0;
const SYS_MSGOUT: usize = 1;
const SYS_DEVOPEN: usize = 10;
const SYS_FSOPEN: usize = 11;
const SYS_CLOSE: usize = 20;
const SYS_READ: usize = 21;
const SYS_WRITE: usize = 22;
const SYS_IOCTL: usize = 23;
const SYS_EXEC: usize = 30;
const SYS_FORK: usize = 31;
const SYS_WAIT: usize = 32;
const SYS_USLEEP: usize = 33;

fn retval(result: KernelResult<i64>) -> i64 {
    match result {
        Ok(v) => v,
        Err(e) => e.to_retval(),
    }
}

/// Decode and run one syscall against `frame`.
pub fn dispatch(frame: &mut TrapFrame) {
    // The ecall instruction is 4 bytes; resume after it.
    frame.sepc += 4;

    let [a0, a1, a2] = [frame.x[10], frame.x[11], frame.x[12]];
    let nr = frame.x[17];

    let result = match nr {
        SYS_EXIT => process::exit_current(),
        SYS_MSGOUT => retval(sys_msgout(a0)),
        SYS_DEVOPEN => retval(sys_devopen(a0 as isize, a1, a2)),
        SYS_FSOPEN => retval(sys_fsopen(a0 as isize, a1)),
        SYS_CLOSE => retval(sys_close(a0 as isize)),
        SYS_READ => retval(sys_read(a0 as isize, a1, a2)),
        SYS_WRITE => retval(sys_write(a0 as isize, a1, a2)),
        SYS_IOCTL => retval(sys_ioctl(a0 as isize, a1 as u32, a2)),
        SYS_EXEC => retval(sys_exec(a0 as isize)),
        SYS_FORK => retval(process::fork(frame).map(|tid| tid as i64)),
        SYS_WAIT => retval(sys_wait(a0)),
        SYS_USLEEP => retval(sys_usleep(a0)),
        _ => {
            log::debug!("unknown syscall {}", nr);
            crate::error::KernelError::NotSupported { what: "syscall" }.to_retval()
        }
    };

    frame.x[10] = result as usize;
}

/// Copy a validated, NUL-terminated user string into the kernel.
fn copy_user_str(uptr: usize) -> KernelResult<String> {
    let len = space::validate_vstr(uptr, PteFlags::USER | PteFlags::READ)?;
    // SAFETY: every byte of [uptr, uptr+len] was just validated as a
    // mapped, user-readable page; SUM permits the supervisor load.
    let bytes = unsafe { core::slice::from_raw_parts(uptr as *const u8, len) };
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn sys_msgout(msg_ptr: usize) -> KernelResult<i64> {
    let msg = copy_user_str(msg_ptr)?;
    crate::print!("{}", msg);
    Ok(0)
}

fn sys_devopen(fd: isize, name_ptr: usize, instno: usize) -> KernelResult<i64> {
    let name = copy_user_str(name_ptr)?;
    let io = crate::drivers::open(&name, instno)?;
    let fd = process::fd_install(fd, io)?;
    Ok(fd as i64)
}

fn sys_fsopen(fd: isize, name_ptr: usize) -> KernelResult<i64> {
    let name = copy_user_str(name_ptr)?;
    let io = crate::fs::open_file(name.as_bytes())?;
    let fd = process::fd_install(fd, io)?;
    Ok(fd as i64)
}

fn sys_close(fd: isize) -> KernelResult<i64> {
    process::fd_remove(fd)?;
    Ok(0)
}

fn sys_read(fd: isize, buf_ptr: usize, len: usize) -> KernelResult<i64> {
    let io = process::fd_get(fd)?;
    space::validate_vptr_len(buf_ptr, len, PteFlags::USER | PteFlags::WRITE)?;
    // SAFETY: the destination range was just validated as mapped and
    // user-writable; SUM permits the supervisor store. The calling thread
    // keeps its space active across any suspension inside `read`.
    let buf = unsafe { core::slice::from_raw_parts_mut(buf_ptr as *mut u8, len) };
    let n = io.read(buf)?;
    Ok(n as i64)
}

fn sys_write(fd: isize, buf_ptr: usize, len: usize) -> KernelResult<i64> {
    let io = process::fd_get(fd)?;
    space::validate_vptr_len(buf_ptr, len, PteFlags::USER | PteFlags::READ)?;
    // SAFETY: the source range was just validated as mapped and
    // user-readable; SUM permits the supervisor load.
    let buf = unsafe { core::slice::from_raw_parts(buf_ptr as *const u8, len) };
    let n = io.write(buf)?;
    Ok(n as i64)
}

fn sys_ioctl(fd: isize, cmd: u32, arg_ptr: usize) -> KernelResult<i64> {
    let io = process::fd_get(fd)?;
    match cmd {
        // Out-parameters: a u64 the kernel writes.
        ioctl::GETLEN | ioctl::GETPOS => {
            let value = io.ctl(cmd, 0)?;
            space::validate_vptr_len(arg_ptr, 8, PteFlags::USER | PteFlags::WRITE)?;
            // SAFETY: validated mapped user-writable range of 8 bytes.
            unsafe { (arg_ptr as *mut u64).write_unaligned(value) };
            Ok(0)
        }
        // In-parameter: a u64 the kernel reads.
        ioctl::SETPOS => {
            space::validate_vptr_len(arg_ptr, 8, PteFlags::USER | PteFlags::READ)?;
            // SAFETY: validated mapped user-readable range of 8 bytes.
            let pos = unsafe { (arg_ptr as *const u64).read_unaligned() };
            io.ctl(cmd, pos)?;
            Ok(0)
        }
        ioctl::GETBLKSZ => {
            let value = io.ctl(cmd, 0)?;
            space::validate_vptr_len(arg_ptr, 4, PteFlags::USER | PteFlags::WRITE)?;
            // SAFETY: validated mapped user-writable range of 4 bytes.
            unsafe { (arg_ptr as *mut u32).write_unaligned(value as u32) };
            Ok(0)
        }
        // Anything else is for the endpoint to interpret or reject.
        _ => {
            io.ctl(cmd, arg_ptr as u64)?;
            Ok(0)
        }
    }
}

fn sys_exec(fd: isize) -> KernelResult<i64> {
    let io = process::fd_get(fd)?;
    // Never returns on success.
    match process::exec(io) {
        Ok(never) => match never {},
        Err(e) => Err(e),
    }
}

fn sys_wait(tid: usize) -> KernelResult<i64> {
    let joined = if tid == 0 {
        thread::join_any()?
    } else {
        thread::join(tid)?
    };
    Ok(joined as i64)
}

fn sys_usleep(us: usize) -> KernelResult<i64> {
    crate::timer::sleep_us(us as u64);
    Ok(0)
}
