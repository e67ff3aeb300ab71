//! Thread table, ready list, and the suspend/switch core.
//!
//! Every thread is a heap-allocated [`Thread`] whose raw pointer lives in
//! `THRTAB`; the running thread's pointer is additionally kept in the `tp`
//! register (see `arch::riscv64::context`). Threads link into at most one
//! list at a time — the ready list or one condition's wait list — through
//! their intrusive `list_next` field.
//!
//! `suspend_current` is the sole scheduling primitive: everything else
//! (yield, condition wait, exit, join) reduces to it.

use alloc::boxed::Box;
use core::ptr;

use crate::arch::riscv64::context::{
    current_thread, set_current_thread, Context, _thread_switch,
};
use crate::arch::{interrupts_disable, interrupts_enabled, interrupts_restore};
use crate::config::{NTHR, THREAD_STACK_SIZE, THREAD_TRAP_RESERVE};
use crate::error::{KernelError, KernelResult};
use crate::sched::condition::Condition;
use crate::sync::IrqSafe;

/// Thread identifier: an index into the thread table.
pub type Tid = usize;

/// Slot of the boot thread.
pub const MAIN_TID: Tid = 0;
/// Reserved slot of the idle thread.
pub const IDLE_TID: Tid = NTHR - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Uninitialized,
    Stopped,
    Waiting,
    Running,
    Ready,
    Exited,
}

/// 16-byte aligned kernel stack.
#[repr(C, align(16))]
struct Stack([u8; THREAD_STACK_SIZE]);

/// A kernel thread. `context` must stay the first field: the switch stub
/// saves and restores through offset 0 of this struct.
#[repr(C)]
pub struct Thread {
    pub(crate) context: Context,
    pub(crate) id: Tid,
    pub(crate) name: &'static str,
    pub(crate) state: ThreadState,
    pub(crate) parent: Tid,
    stack: Option<Box<Stack>>,
    /// Top of the kernel stack; sscratch target for user-mode returns.
    pub(crate) kstack_top: usize,
    pub(crate) list_next: *mut Thread,
    pub(crate) wait_cond: *const Condition,
    pub(crate) child_exit: Condition,
    /// Owning process slot, if this thread carries a process.
    pub(crate) pid: Option<usize>,
    /// satp tag of the thread's address space, or 0 for
    /// any-space kernel threads. Re-installed when the thread resumes,
    /// since the hardware does not switch satp with the context.
    pub(crate) space_tag: usize,
}

/// An intrusive FIFO of threads, used for the ready list and for
/// condition wait lists. Holds no storage; links thread structs.
pub struct ThreadList {
    head: *mut Thread,
    tail: *mut Thread,
}

// SAFETY: the raw pointers are only dereferenced inside interrupt-disabled
// sections on a single hart.
unsafe impl Send for ThreadList {}

impl ThreadList {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Append `thread` at the tail.
    ///
    /// # Safety
    /// `thread` must be live and on no other list.
    pub unsafe fn insert(&mut self, thread: *mut Thread) {
        // SAFETY: caller guarantees `thread` is live and unlinked.
        unsafe {
            (*thread).list_next = ptr::null_mut();
            if self.tail.is_null() {
                debug_assert!(self.head.is_null());
                self.head = thread;
            } else {
                (*self.tail).list_next = thread;
            }
        }
        self.tail = thread;
    }

    /// Remove and return the head, if any.
    ///
    /// # Safety
    /// The list must only contain live threads inserted via `insert`.
    pub unsafe fn remove_head(&mut self) -> Option<*mut Thread> {
        if self.head.is_null() {
            return None;
        }
        let thread = self.head;
        // SAFETY: `thread` is live per the list invariant.
        unsafe {
            self.head = (*thread).list_next;
            (*thread).list_next = ptr::null_mut();
        }
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        Some(thread)
    }
}

struct ThreadTable {
    slots: [*mut Thread; NTHR],
}

// SAFETY: slot pointers are only dereferenced inside interrupt-disabled
// sections on a single hart.
unsafe impl Send for ThreadTable {}

static THRTAB: IrqSafe<ThreadTable> = IrqSafe::new(ThreadTable {
    slots: [ptr::null_mut(); NTHR],
});

static READY: IrqSafe<ThreadList> = IrqSafe::new(ThreadList::new());

pub(crate) fn current_ptr() -> *mut Thread {
    let ptr = current_thread() as *mut Thread;
    debug_assert!(!ptr.is_null(), "scheduler not initialized");
    ptr
}

/// Tid of the running thread.
pub fn current_tid() -> Tid {
    // SAFETY: tp always points at the live current thread once `init` ran.
    unsafe { (*current_ptr()).id }
}

/// Process slot attached to the running thread, if any.
pub fn current_pid() -> Option<usize> {
    // SAFETY: as in `current_tid`.
    unsafe { (*current_ptr()).pid }
}

/// Attach process slot `pid` to thread `tid`.
pub fn set_process(tid: Tid, pid: usize) {
    THRTAB.with(|tab| {
        let t = tab.slots[tid];
        assert!(!t.is_null(), "set_process on empty slot");
        // SAFETY: slot pointers are live; we are inside the table section.
        unsafe {
            (*t).pid = Some(pid);
        }
    });
}

/// Record the address-space tag thread `tid` must run under (0 clears).
pub fn set_space(tid: Tid, space_tag: usize) {
    THRTAB.with(|tab| {
        let t = tab.slots[tid];
        assert!(!t.is_null(), "set_space on empty slot");
        // SAFETY: slot pointers are live; we are inside the table section.
        unsafe {
            (*t).space_tag = space_tag;
        }
    });
}

/// Kernel stack top of the running thread.
pub fn current_kstack_top() -> usize {
    // SAFETY: as in `current_tid`.
    unsafe { (*current_ptr()).kstack_top }
}

fn new_thread(id: Tid, name: &'static str, parent: Tid) -> Box<Thread> {
    Box::new(Thread {
        context: Context::zeroed(),
        id,
        name,
        state: ThreadState::Uninitialized,
        parent,
        stack: None,
        kstack_top: 0,
        list_next: ptr::null_mut(),
        wait_cond: ptr::null(),
        child_exit: Condition::new("child_exit"),
        pid: None,
        space_tag: 0,
    })
}

/// Adopt the boot thread as thread 0 and start the idle thread.
/// `boot_stack_top` is the top of the stack the boot code set up; it
/// becomes the main thread's kernel stack for user-mode returns.
pub fn init(boot_stack_top: usize) {
    let mut main = new_thread(MAIN_TID, "main", MAIN_TID);
    main.state = ThreadState::Running;
    main.kstack_top = boot_stack_top;
    let main_ptr = Box::into_raw(main);
    THRTAB.with(|tab| tab.slots[MAIN_TID] = main_ptr);
    // SAFETY: `main_ptr` is a live leaked thread with context at offset 0.
    unsafe {
        set_current_thread(main_ptr as *mut core::ffi::c_void);
    }
    spawn_at(IDLE_TID, "idle", idle_entry, 0);
}

/// Spawn a thread in the first free slot. Panics if the table is full —
/// at this kernel's scale that is a programming error, not a condition to
/// recover from.
pub fn spawn(name: &'static str, entry: extern "C" fn(usize), arg: usize) -> Tid {
    let tid = THRTAB.with(|tab| {
        (1..NTHR)
            .find(|&i| i != IDLE_TID && tab.slots[i].is_null())
            .unwrap_or_else(|| panic!("too many threads"))
    });
    spawn_at(tid, name, entry, arg)
}

/// Heap-allocate a zeroed stack without a stack-resident temporary (the
/// array would not fit on the spawning thread's own stack).
fn alloc_stack() -> Box<Stack> {
    let layout = core::alloc::Layout::new::<Stack>();
    // SAFETY: `Stack` has non-zero size; a zeroed byte pattern is a valid
    // Stack, so the box takes ownership of a fully initialized value.
    unsafe {
        let ptr = alloc::alloc::alloc_zeroed(layout) as *mut Stack;
        assert!(!ptr.is_null(), "thread stack allocation failed");
        Box::from_raw(ptr)
    }
}

fn spawn_at(tid: Tid, name: &'static str, entry: extern "C" fn(usize), arg: usize) -> Tid {
    let mut thread = new_thread(tid, name, current_tid());
    let stack = alloc_stack();
    let kstack_top = stack.as_ref() as *const Stack as usize + THREAD_STACK_SIZE;
    // The top of every stack is reserved for a restored user trap frame;
    // normal execution starts below it.
    thread
        .context
        .prepare(kstack_top - THREAD_TRAP_RESERVE, entry, arg);
    thread.stack = Some(stack);
    thread.kstack_top = kstack_top;
    thread.state = ThreadState::Ready;

    let ptr = Box::into_raw(thread);
    THRTAB.with(|tab| {
        assert!(tab.slots[tid].is_null(), "thread slot {} in use", tid);
        tab.slots[tid] = ptr;
    });
    READY.with(|list| {
        // SAFETY: `ptr` is live and on no list yet.
        unsafe {
            list.insert(ptr);
        }
    });
    tid
}

/// Move the caller to the back of the ready list and run the next thread.
pub fn yield_now() {
    debug_assert!(interrupts_enabled());
    // SAFETY: tp points at the live current thread.
    debug_assert_eq!(unsafe { (*current_ptr()).state }, ThreadState::Running);
    suspend_current();
}

/// Terminate the calling thread. The main thread halts the machine
/// instead, as there is nothing left to schedule back into.
pub fn exit() -> ! {
    let cur = current_ptr();
    // SAFETY: tp points at the live current thread; parent slots stay
    // valid because recycling reparents children first.
    unsafe {
        if (*cur).id == MAIN_TID {
            crate::arch::halt_success();
        }
        (*cur).state = ThreadState::Exited;
        let parent = (*cur).parent;
        let parent_ptr = THRTAB.with(|tab| tab.slots[parent]);
        assert!(!parent_ptr.is_null(), "exiting thread has no parent");
        (*parent_ptr).child_exit.broadcast();
    }
    suspend_current();
    panic!("exited thread was rescheduled");
}

/// Landing point of the startup shim when a thread's entry returns.
#[no_mangle]
extern "C" fn thread_finish() -> ! {
    exit()
}

/// Wait for child `tid` to exit, then recycle its slot.
pub fn join(tid: Tid) -> KernelResult<Tid> {
    if tid == 0 || tid >= NTHR {
        return Err(KernelError::InvalidArgument {
            what: "thread id out of range",
        });
    }
    let cur = current_ptr();
    loop {
        let state = THRTAB.with(|tab| {
            let child = tab.slots[tid];
            if child.is_null() {
                return Err(KernelError::NotFound { what: "thread" });
            }
            // SAFETY: slot pointers are live inside the table section.
            unsafe {
                if (*child).parent != (*cur).id {
                    return Err(KernelError::InvalidArgument {
                        what: "not a child of the caller",
                    });
                }
                Ok((*child).state)
            }
        })?;
        if state == ThreadState::Exited {
            recycle(tid);
            return Ok(tid);
        }
        // SAFETY: tp points at the live current thread.
        unsafe {
            (*cur).child_exit.wait();
        }
    }
}

/// Wait for any child to exit; returns its tid. Calling this with no
/// children is a scheduler-invariant violation.
pub fn join_any() -> KernelResult<Tid> {
    let cur_tid = current_tid();
    loop {
        let mut child_count = 0;
        let mut exited = None;
        THRTAB.with(|tab| {
            for tid in 1..NTHR {
                let t = tab.slots[tid];
                if t.is_null() {
                    continue;
                }
                // SAFETY: slot pointers are live inside the table section.
                unsafe {
                    if (*t).parent == cur_tid && tid != cur_tid {
                        child_count += 1;
                        if (*t).state == ThreadState::Exited {
                            exited.get_or_insert(tid);
                        }
                    }
                }
            }
        });
        if let Some(tid) = exited {
            recycle(tid);
            return Ok(tid);
        }
        assert!(child_count > 0, "join_any called by childless thread");
        // SAFETY: tp points at the live current thread.
        unsafe {
            (*current_ptr()).child_exit.wait();
        }
    }
}

/// Free an exited thread's slot, reparenting its children to the caller's
/// own slot (the joiner is the parent).
fn recycle(tid: Tid) {
    let thread = THRTAB.with(|tab| {
        let t = tab.slots[tid];
        assert!(!t.is_null());
        // SAFETY: slot pointers are live inside the table section.
        unsafe {
            assert_eq!((*t).state, ThreadState::Exited, "recycling a live thread");
            for other in 1..NTHR {
                let o = tab.slots[other];
                if !o.is_null() && (*o).parent == tid {
                    (*o).parent = (*t).parent;
                }
            }
        }
        tab.slots[tid] = ptr::null_mut();
        t
    });
    // SAFETY: the slot was cleared, the thread is Exited and on no list,
    // so this Box is the last owner.
    drop(unsafe { Box::from_raw(thread) });
}

/// Enqueue a thread on the ready list (interrupt-safe).
pub(crate) fn ready_insert(thread: *mut Thread) {
    READY.with(|list| {
        // SAFETY: caller hands a live, unlinked thread.
        unsafe {
            list.insert(thread);
        }
    });
}

pub(crate) fn ready_is_empty() -> bool {
    READY.with(|list| list.is_empty())
}

/// Suspend the caller and switch to the next ready thread. If the caller
/// is still Running it is re-queued as Ready; a Waiting or Exited caller
/// is not. Returns when the caller is next scheduled.
pub(crate) fn suspend_current() {
    let was_enabled = interrupts_disable();
    let cur = current_ptr();
    // SAFETY: tp points at the live current thread; list edits happen
    // with interrupts disabled.
    unsafe {
        if (*cur).state == ThreadState::Running {
            (*cur).state = ThreadState::Ready;
            // SAFETY: `cur` is live and, having just left Running, is on
            // no list.
            READY.with(|list| unsafe { list.insert(cur) });
        }
        // SAFETY: the ready list holds only live threads.
        let next = READY
            .with(|list| unsafe { list.remove_head() })
            .unwrap_or_else(|| panic!("ready list empty: idle thread missing"));
        (*next).state = ThreadState::Running;
        interrupts_restore(was_enabled);
        // SAFETY: `next` is a live thread with context at offset 0; the
        // stub moves tp and returns on the caller's next activation.
        _thread_switch(next as *mut core::ffi::c_void);

        // Resumed. Another process may have run meanwhile with its own
        // translation; put this thread's space back before it touches
        // user memory.
        let me = current_ptr();
        let tag = (*me).space_tag;
        if tag != 0 && crate::mm::space::active_space().bits() != tag {
            crate::mm::space::switch(crate::mm::space::SpaceTag::from_bits(tag));
        }
    }
}

/// The idle loop: yield while work exists, halt the hart otherwise. The
/// interrupt-disabled recheck closes the race where an ISR readies a
/// thread between the emptiness check and the wfi.
extern "C" fn idle_entry(_arg: usize) {
    loop {
        while !ready_is_empty() {
            yield_now();
        }
        let was_enabled = interrupts_disable();
        if ready_is_empty() {
            crate::arch::idle_wait();
        }
        interrupts_restore(was_enabled);
    }
}
