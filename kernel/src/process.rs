//! User processes: a bounded table of (pid, thread, memory space, I/O
//! table) tuples.
//!
//! Slot 0 is the main kernel process, adopted by the boot thread; it
//! becomes the first user process when boot execs the init image. `fork`
//! clones the address space page for page, duplicates the I/O table by
//! reference, and starts a fresh kernel thread that rides the common
//! trap-return path back into user mode with `a0 = 0`.

use alloc::boxed::Box;
use core::convert::Infallible;

use crate::arch::riscv64::trap::{frame_restore, TrapFrame, TRAP_FRAME_SIZE};
use crate::arch::riscv64::usermode;
use crate::config::{FD_MAX, NPROC, USER_STACK_VMA};
use crate::error::{KernelError, KernelResult};
use crate::io::IoRef;
use crate::mm::space;
use crate::sched::thread;

/// Process identifier: an index into the process table.
pub type Pid = usize;

const MAIN_PID: Pid = 0;

/// One process.
pub struct Process {
    pub pid: Pid,
    /// Thread carrying this process.
    pub tid: thread::Tid,
    /// satp tag of the process's memory space.
    pub mtag: usize,
    /// File-descriptor-indexed I/O endpoints.
    pub iotab: [Option<IoRef>; FD_MAX],
}

const NO_IO: Option<IoRef> = None;

fn empty_iotab() -> [Option<IoRef>; FD_MAX] {
    [NO_IO; FD_MAX]
}

const NO_PROC: Option<Box<Process>> = None;

static PROCTAB: spin::Mutex<[Option<Box<Process>>; NPROC]> = spin::Mutex::new([NO_PROC; NPROC]);

/// Install the main kernel process in slot 0, attached to the boot
/// thread and the main memory space.
pub fn init() {
    let mut table = PROCTAB.lock();
    assert!(table[MAIN_PID].is_none(), "process manager reinitialized");
    let main_tid = thread::current_tid();
    table[MAIN_PID] = Some(Box::new(Process {
        pid: MAIN_PID,
        tid: main_tid,
        mtag: space::main_space().bits(),
        iotab: empty_iotab(),
    }));
    drop(table);
    thread::set_process(main_tid, MAIN_PID);
    thread::set_space(main_tid, space::main_space().bits());
}

/// Pid of the calling thread's process.
pub fn current_pid() -> Pid {
    thread::current_pid().expect("caller carries no process")
}

/// Clone the endpoint at `fd` of the current process.
pub fn fd_get(fd: isize) -> KernelResult<IoRef> {
    let pid = current_pid();
    if !(0..FD_MAX as isize).contains(&fd) {
        return Err(KernelError::BadFileDescriptor { fd });
    }
    let table = PROCTAB.lock();
    let proc = table[pid].as_ref().expect("current process missing");
    proc.iotab[fd as usize]
        .clone()
        .ok_or(KernelError::BadFileDescriptor { fd })
}

/// Install `io` at `fd`, or at the first free slot if `fd` is negative.
/// Returns the descriptor used.
pub fn fd_install(fd: isize, io: IoRef) -> KernelResult<usize> {
    let pid = current_pid();
    let mut table = PROCTAB.lock();
    let proc = table[pid].as_mut().expect("current process missing");
    let slot = if fd < 0 {
        proc.iotab
            .iter()
            .position(|s| s.is_none())
            .ok_or(KernelError::Busy {
                what: "file-descriptor table",
            })?
    } else {
        let fd = fd as usize;
        if fd >= FD_MAX {
            return Err(KernelError::BadFileDescriptor { fd: fd as isize });
        }
        if proc.iotab[fd].is_some() {
            return Err(KernelError::Busy {
                what: "file descriptor",
            });
        }
        fd
    };
    proc.iotab[slot] = Some(io);
    Ok(slot)
}

/// Drop the endpoint at `fd`; the final reference closes it.
pub fn fd_remove(fd: isize) -> KernelResult<()> {
    let pid = current_pid();
    if !(0..FD_MAX as isize).contains(&fd) {
        return Err(KernelError::BadFileDescriptor { fd });
    }
    let io = {
        let mut table = PROCTAB.lock();
        let proc = table[pid].as_mut().expect("current process missing");
        proc.iotab[fd as usize]
            .take()
            .ok_or(KernelError::BadFileDescriptor { fd })?
    };
    drop(io);
    Ok(())
}

/// Replace the current process image with the executable behind `io` and
/// enter user mode at its entry point. Does not return on success; the
/// caller keeps the (partially touched) address space on failure and is
/// expected to exit.
pub fn exec(io: IoRef) -> KernelResult<Infallible> {
    let pid = current_pid();

    // The main process execs out of the boot space; give it a user space
    // of its own first so user leaves never land in the shared main
    // tables.
    if space::active_space() == space::main_space() {
        let tag = space::new_user_space();
        space::switch(tag);
        thread::set_space(thread::current_tid(), tag.bits());
        PROCTAB.lock()[pid].as_mut().expect("current process missing").mtag = tag.bits();
    } else {
        space::unmap_and_free_user();
    }

    let entry = elf_entry(&io)?;
    drop(io);

    let kstack_top = thread::current_kstack_top();
    // SAFETY: `entry` was validated and mapped by the loader into the
    // active space; the stack pointer is demand-paged on first store; the
    // kernel stack top belongs to the calling thread.
    unsafe { usermode::enter_user(entry, USER_STACK_VMA, kstack_top) }
}

fn elf_entry(io: &IoRef) -> KernelResult<usize> {
    let entry = crate::elf::load(io)?;
    log::debug!("exec: entry {:#x}", entry);
    Ok(entry)
}

struct ForkPayload {
    frame: TrapFrame,
    mtag: usize,
}

/// Clone the current process. The parent receives the child's thread id;
/// the child resumes in user mode from a copy of `parent_frame` with
/// `a0 = 0`.
pub fn fork(parent_frame: &TrapFrame) -> KernelResult<usize> {
    let parent_pid = current_pid();

    let child_pid = {
        let table = PROCTAB.lock();
        (0..NPROC)
            .find(|&i| table[i].is_none())
            .ok_or(KernelError::Busy {
                what: "process table",
            })?
    };

    let child_tag = space::clone_user_space()?;

    // Duplicate the I/O table; each clone bumps the endpoint refcount.
    let iotab = {
        let table = PROCTAB.lock();
        let parent = table[parent_pid].as_ref().expect("current process missing");
        parent.iotab.clone()
    };

    let mut frame = parent_frame.clone();
    frame.x[10] = 0; // a0: the child observes a zero return
    let payload = Box::new(ForkPayload {
        frame,
        mtag: child_tag.bits(),
    });

    let tid = thread::spawn(
        "user-child",
        fork_child_entry,
        Box::into_raw(payload) as usize,
    );
    thread::set_process(tid, child_pid);
    thread::set_space(tid, child_tag.bits());

    PROCTAB.lock()[child_pid] = Some(Box::new(Process {
        pid: child_pid,
        tid,
        mtag: child_tag.bits(),
        iotab,
    }));

    Ok(tid)
}

/// First activation of a forked child: switch to the cloned space, park
/// the copied trap frame at the reserved stack top, and ride the common
/// restore path into user mode.
extern "C" fn fork_child_entry(arg: usize) {
    // SAFETY: `arg` is the Box leaked by `fork` for exactly this thread.
    let payload = unsafe { Box::from_raw(arg as *mut ForkPayload) };
    space::switch(space::SpaceTag::from_bits(payload.mtag));

    let kstack_top = thread::current_kstack_top();
    let frame_slot = (kstack_top - TRAP_FRAME_SIZE) as *mut TrapFrame;
    // SAFETY: the top TRAP_FRAME_SIZE bytes of every thread stack are
    // reserved for exactly this frame and are unused by the running code
    // (execution starts below the reserve).
    unsafe {
        core::ptr::write(frame_slot, payload.frame.clone());
    }
    drop(payload);
    // SAFETY: the frame sits at kstack_top - TRAP_FRAME_SIZE as
    // `frame_restore` requires, and was captured from user mode, so the
    // restore ends in sret to the user.
    unsafe { frame_restore(frame_slot) }
}

/// Terminate the current process: reclaim its memory space (main keeps
/// its), close every endpoint in the I/O table, and exit the thread.
pub fn exit_current() -> ! {
    let pid = current_pid();

    if pid != MAIN_PID {
        thread::set_space(thread::current_tid(), 0);
        space::reclaim();
    }

    let proc = PROCTAB.lock()[pid].take();
    // Dropping the process drops every table entry; final references
    // close their endpoints.
    drop(proc);

    thread::exit()
}
