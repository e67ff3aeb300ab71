//! Memory spaces: the boot-built main space and per-process user spaces.
//!
//! The main space identity-maps MMIO as RW gigapages, the kernel image as
//! 4 KiB pages (text RX, rodata R, data RW), and the rest of RAM as RW
//! megapages, all global. A user space starts as a fresh root that shares
//! the global MMIO leaves and carries private copies of the RAM-gigarange
//! tables behind non-global branches; user (U) leaves are added inside
//! [USER_START, USER_END). Reclaim walks a departed space and frees every
//! non-global leaf page and every non-global table page, leaving the
//! global content untouched.

use core::arch::asm;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::config::{
    GIGA_SIZE, HEAP_INIT_MIN, MEGA_SIZE, PAGE_SIZE, RAM_END, RAM_START, USER_END, USER_START,
};
use crate::error::{KernelError, KernelResult};
use crate::mm::page_alloc;
use crate::mm::page_table::{vpn, walk, PageTable, Pte, PteFlags, PTE_COUNT};
use crate::mm::{page_down, page_up, round_up};

// Linker-provided kernel image boundaries (kernel.ld).
extern "C" {
    static _kimg_start: u8;
    static _kimg_text_start: u8;
    static _kimg_text_end: u8;
    static _kimg_rodata_start: u8;
    static _kimg_rodata_end: u8;
    static _kimg_data_start: u8;
    static _kimg_end: u8;
}

fn kimg_addr(sym: &u8) -> usize {
    sym as *const u8 as usize
}

/// A compact memory-space tag: the satp value (mode 8 = Sv39 in the top
/// nibble, root PPN in the low 44 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceTag(usize);

const SATP_MODE_SV39: usize = 8 << 60;
const SATP_PPN_MASK: usize = (1 << 44) - 1;

impl SpaceTag {
    fn from_root(root: *const PageTable) -> Self {
        Self(SATP_MODE_SV39 | ((root as usize) >> 12))
    }

    /// Rebuild a tag from its raw satp bits (as stored on a thread).
    pub fn from_bits(bits: usize) -> Self {
        Self(bits)
    }

    /// The root table, reachable through the identity map.
    pub fn root(&self) -> *mut PageTable {
        ((self.0 & SATP_PPN_MASK) << 12) as *mut PageTable
    }

    pub const fn bits(&self) -> usize {
        self.0
    }
}

// Statically allocated tables of the main space. Written during
// single-threaded boot, read-only afterwards.
#[repr(transparent)]
struct BootTable(UnsafeCell<PageTable>);

// SAFETY: mutated only before the scheduler and interrupts exist; all
// later access is read-only through the MMU and the reclaim walkers.
unsafe impl Sync for BootTable {}

static MAIN_PT2: BootTable = BootTable(UnsafeCell::new(PageTable::empty()));
static MAIN_PT1: BootTable = BootTable(UnsafeCell::new(PageTable::empty()));
static MAIN_PT0: BootTable = BootTable(UnsafeCell::new(PageTable::empty()));

static MAIN_TAG: AtomicUsize = AtomicUsize::new(0);

/// The tag of the boot-built main space.
pub fn main_space() -> SpaceTag {
    let bits = MAIN_TAG.load(Ordering::Relaxed);
    debug_assert_ne!(bits, 0, "memory manager not initialized");
    SpaceTag(bits)
}

/// The tag currently loaded in satp.
pub fn active_space() -> SpaceTag {
    let satp: usize;
    // SAFETY: reading satp has no side effects.
    unsafe {
        asm!("csrr {}, satp", out(reg) satp);
    }
    SpaceTag(satp)
}

fn active_root() -> *mut PageTable {
    active_space().root()
}

/// Switch the active space, fence, and return the previous tag.
pub fn switch(tag: SpaceTag) -> SpaceTag {
    let old: usize;
    // SAFETY: `tag` was built from a live root table; the fence orders the
    // table edit against subsequent translations.
    unsafe {
        asm!("csrrw {}, satp, {}", out(reg) old, in(reg) tag.bits());
    }
    sfence_vma();
    SpaceTag(old)
}

fn sfence_vma() {
    // SAFETY: a bare TLB fence.
    unsafe {
        asm!("sfence.vma");
    }
}

/// Build the main space, enable paging, hand the heap window to the global
/// allocator, and populate the page pool with the remaining RAM.
pub fn init() {
    let pt2 = MAIN_PT2.0.get();
    let pt1 = MAIN_PT1.0.get();
    let pt0 = MAIN_PT0.0.get();

    // SAFETY: single-threaded boot; the tables are exclusively ours and
    // the MMU is still off (or running on the loader's mapping).
    unsafe {
        let text_start = kimg_addr(&_kimg_text_start);
        let text_end = kimg_addr(&_kimg_text_end);
        let rodata_start = kimg_addr(&_kimg_rodata_start);
        let rodata_end = kimg_addr(&_kimg_rodata_end);
        let data_start = kimg_addr(&_kimg_data_start);
        let kimg_end = kimg_addr(&_kimg_end);

        assert_eq!(kimg_addr(&_kimg_start), RAM_START);
        assert!(
            kimg_end - RAM_START <= MEGA_SIZE,
            "kernel image exceeds one megapage"
        );

        crate::println!(
            "           RAM: [{:#x},{:#x}): {} MB",
            RAM_START,
            RAM_END,
            (RAM_END - RAM_START) / 1024 / 1024
        );
        crate::println!("  kernel image: [{:#x},{:#x})", RAM_START, kimg_end);

        // MMIO below RAM: identity RW gigapages.
        let mut pma = 0;
        while pma < RAM_START {
            (*pt2)[vpn(2, pma)] =
                Pte::leaf(pma, PteFlags::READ | PteFlags::WRITE | PteFlags::GLOBAL);
            pma += GIGA_SIZE;
        }

        // RAM gigarange: table chain down to 4 KiB pages for the first
        // megarange (the kernel image), megapages above it.
        (*pt2)[vpn(2, RAM_START)] = Pte::branch(pt1 as usize, true);
        (*pt1)[vpn(1, RAM_START)] = Pte::branch(pt0 as usize, true);

        let mut page = text_start;
        while page < text_end {
            (*pt0)[vpn(0, page)] =
                Pte::leaf(page, PteFlags::READ | PteFlags::EXEC | PteFlags::GLOBAL);
            page += PAGE_SIZE;
        }
        let mut page = rodata_start;
        while page < rodata_end {
            (*pt0)[vpn(0, page)] = Pte::leaf(page, PteFlags::READ | PteFlags::GLOBAL);
            page += PAGE_SIZE;
        }
        let mut page = data_start;
        while page < RAM_START + MEGA_SIZE {
            (*pt0)[vpn(0, page)] =
                Pte::leaf(page, PteFlags::READ | PteFlags::WRITE | PteFlags::GLOBAL);
            page += PAGE_SIZE;
        }

        let mut pma = RAM_START + MEGA_SIZE;
        while pma < RAM_END {
            (*pt1)[vpn(1, pma)] =
                Pte::leaf(pma, PteFlags::READ | PteFlags::WRITE | PteFlags::GLOBAL);
            pma += MEGA_SIZE;
        }

        let tag = SpaceTag::from_root(pt2);
        MAIN_TAG.store(tag.bits(), Ordering::Relaxed);
        asm!("csrw satp, {}", in(reg) tag.bits());
        sfence_vma();

        // Heap window: image end up to at least HEAP_INIT_MIN, page-aligned.
        let heap_start = kimg_end;
        let mut heap_end = page_up(heap_start);
        if heap_end - heap_start < HEAP_INIT_MIN {
            heap_end += round_up(HEAP_INIT_MIN - (heap_end - heap_start), PAGE_SIZE);
        }
        assert!(heap_end <= RAM_END, "not enough memory for boot heap");
        // Kernel image and heap must stay below the user window: user
        // leaves shadow the identity map per-space, and nothing the
        // kernel owns may sit where a user mapping can land.
        assert!(
            heap_end <= USER_START,
            "kernel image + heap reach into the user window"
        );

        crate::heap_init(heap_start, heap_end - heap_start);
        crate::println!(
            "boot heap:      [{:#x},{:#x}): {} KB",
            heap_start,
            heap_end,
            (heap_end - heap_start) / 1024
        );

        page_alloc::init(heap_end, RAM_END);
    }

    // The kernel reads/writes user buffers in place after validation.
    crate::arch::riscv64::allow_user_memory_access();
}

/// Map a fresh physical page at `vma` in the active space with the given
/// R/W/X/U/G permissions (D|A|V are always added). Fails with `EACCESS`
/// if a mapping is already present.
///
/// Inside the user window a slot may still hold the global identity leaf
/// inherited from the main space (the user region overlaps identity-
/// mapped RAM). Such a leaf counts as *unmapped* here: the user page
/// shadows the identity mapping for this space, and unmapping restores
/// it. Only user leaves and non-global content count as collisions.
pub fn alloc_and_map_page(vma: usize, rwxug: PteFlags) -> KernelResult<usize> {
    let vma = page_down(vma);
    // SAFETY: the active root is live; single-threaded table edits per the
    // shared-resource policy (one thread per process, ISRs do not map).
    let pte = unsafe { walk(active_root(), vma, true) }.expect("create walk cannot fail");
    // SAFETY: `pte` points into a live table.
    unsafe {
        if (*pte).is_valid() {
            let flags = (*pte).flags();
            let shadowable =
                flags.contains(PteFlags::GLOBAL) && !flags.contains(PteFlags::USER);
            if !shadowable {
                return Err(KernelError::AlreadyMapped { vma });
            }
        }
        let page = page_alloc::alloc_page_zeroed();
        *pte = Pte::leaf(page as usize, rwxug);
    }
    sfence_vma();
    Ok(vma)
}

/// Map every page covering `[vma, vma+size)`. Returns the original `vma`.
pub fn alloc_and_map_range(vma: usize, size: usize, rwxug: PteFlags) -> KernelResult<usize> {
    let start = page_down(vma);
    let end = page_up(vma + size);
    let mut page = start;
    while page < end {
        alloc_and_map_page(page, rwxug)?;
        page += PAGE_SIZE;
    }
    Ok(vma)
}

/// Rewrite the permission bits of the leaf mapping `vma`, preserving the
/// PPN and the mandatory D|A|V set.
pub fn set_page_flags(vma: usize, rwxug: PteFlags) {
    // SAFETY: lookup walk on the live active root.
    if let Some(pte) = unsafe { walk(active_root(), page_down(vma), false) } {
        // SAFETY: `pte` points into a live table.
        unsafe {
            if (*pte).is_leaf() {
                (*pte).set_permissions(rwxug);
            }
        }
        sfence_vma();
    }
}

/// Range form of [`set_page_flags`]; silent on unmapped pages.
pub fn set_range_flags(vma: usize, size: usize, rwxug: PteFlags) {
    let start = page_down(vma);
    let end = page_up(vma + size);
    let mut page = start;
    while page < end {
        set_page_flags(page, rwxug);
        page += PAGE_SIZE;
    }
}

/// Build an empty user space: global MMIO leaves shared from the main
/// root, private copies of the RAM-gigarange tables behind non-global
/// branches (so reclaim can free them), no user mappings yet.
pub fn new_user_space() -> SpaceTag {
    let root = page_alloc::alloc_page_zeroed() as *mut PageTable;
    let l1 = page_alloc::alloc_page_zeroed() as *mut PageTable;
    let l0 = page_alloc::alloc_page_zeroed() as *mut PageTable;
    let main_root = main_space().root();

    // SAFETY: the fresh tables are exclusively ours; the main tables are
    // read-only after boot. All pointers are identity-mapped.
    unsafe {
        for i in 0..PTE_COUNT {
            (*root)[i] = (*main_root)[i];
        }
        for i in 0..PTE_COUNT {
            (*l1)[i] = (*MAIN_PT1.0.get())[i];
        }
        for i in 0..PTE_COUNT {
            (*l0)[i] = (*MAIN_PT0.0.get())[i];
        }
        (*root)[vpn(2, RAM_START)] = Pte::branch(l1 as usize, false);
        (*l1)[vpn(1, RAM_START)] = Pte::branch(l0 as usize, false);
    }
    SpaceTag::from_root(root)
}

/// Clone the active space's user mappings into a fresh user space: every U
/// leaf is duplicated into a newly allocated page with identical contents
/// and permissions. Returns the child's tag. Runs with the parent active,
/// reading through the user virtual addresses.
pub fn clone_user_space() -> KernelResult<SpaceTag> {
    let child = new_user_space();
    let parent_root = active_root();

    for_each_user_leaf(parent_root, |va, pte| {
        let perms = pte.flags() & PteFlags::RWXUG;
        let page = page_alloc::alloc_page();
        // SAFETY: `va` is a mapped user page in the active space (we just
        // found its leaf) and `page` is a fresh identity-mapped page;
        // both are PAGE_SIZE long and cannot overlap.
        unsafe {
            core::ptr::copy_nonoverlapping(va as *const u8, page, PAGE_SIZE);
        }
        // SAFETY: the child hierarchy is private to this call.
        let slot = unsafe { walk(child.root(), va, true) }.expect("create walk cannot fail");
        // SAFETY: `slot` points into the child's live tables.
        unsafe {
            *slot = Pte::leaf(page as usize, perms);
        }
    });

    Ok(child)
}

/// Visit every user (U) 4 KiB leaf below `root`.
fn for_each_user_leaf(root: *mut PageTable, mut f: impl FnMut(usize, &mut Pte)) {
    // SAFETY throughout: branches only point at identity-mapped table
    // pages; the hierarchy is not concurrently edited (single owner).
    for i2 in 0..PTE_COUNT {
        let e2 = unsafe { &mut (*root)[i2] };
        if !e2.is_branch() || e2.flags().contains(PteFlags::GLOBAL) {
            continue;
        }
        let t1 = e2.pa() as *mut PageTable;
        for i1 in 0..PTE_COUNT {
            let e1 = unsafe { &mut (*t1)[i1] };
            if !e1.is_branch() || e1.flags().contains(PteFlags::GLOBAL) {
                continue;
            }
            let t0 = e1.pa() as *mut PageTable;
            for i0 in 0..PTE_COUNT {
                let e0 = unsafe { &mut (*t0)[i0] };
                if e0.is_leaf() && e0.flags().contains(PteFlags::USER) {
                    let va = (i2 << 30) | (i1 << 21) | (i0 << 12);
                    f(va, e0);
                }
            }
        }
    }
}

/// Switch to the main space and reclaim the space that was active: every
/// non-global leaf's backing page and every non-global table page is
/// returned to the pool. Panics if the main space itself is active.
pub fn reclaim() {
    let old = switch(main_space());
    assert_ne!(old, main_space(), "attempt to reclaim the main space");
    free_table(old.root(), 2);
    sfence_vma();
}

/// Free all non-global content of `table` (level 2, 1, or 0), then the
/// table page itself.
fn free_table(table: *mut PageTable, level: usize) {
    for i in 0..PTE_COUNT {
        // SAFETY: `table` is a live identity-mapped table being torn down
        // with exclusive access (its space is no longer active).
        let entry = unsafe { &mut (*table)[i] };
        if !entry.is_valid() || entry.flags().contains(PteFlags::GLOBAL) {
            continue;
        }
        if entry.is_leaf() {
            page_alloc::free_page(entry.pa() as *mut u8);
        } else if level > 0 {
            free_table(entry.pa() as *mut PageTable, level - 1);
        }
        entry.clear();
    }
    page_alloc::free_page(table as *mut u8);
}

/// Unmap and free every user (U) page of the active space. The space
/// stays live: table pages that still carry kernel content are kept, and
/// only tables left completely empty are freed. Where a user leaf was
/// shadowing identity-mapped RAM, the identity leaf is reinstated so the
/// kernel keeps its view of physical memory through this space.
pub fn unmap_and_free_user() {
    let root = active_root();
    // SAFETY throughout: same single-owner discipline as the other
    // walkers; the active root stays installed, so global/kernel entries
    // must survive untouched.
    for i2 in 0..PTE_COUNT {
        let e2 = unsafe { &mut (*root)[i2] };
        if !e2.is_branch() || e2.flags().contains(PteFlags::GLOBAL) {
            continue;
        }
        let t1 = e2.pa() as *mut PageTable;
        for i1 in 0..PTE_COUNT {
            let e1 = unsafe { &mut (*t1)[i1] };
            if !e1.is_branch() || e1.flags().contains(PteFlags::GLOBAL) {
                continue;
            }
            let t0 = e1.pa() as *mut PageTable;
            let mut live = 0;
            for i0 in 0..PTE_COUNT {
                let e0 = unsafe { &mut (*t0)[i0] };
                if e0.is_leaf() && e0.flags().contains(PteFlags::USER) {
                    page_alloc::free_page(e0.pa() as *mut u8);
                    let va = (i2 << 30) | (i1 << 21) | (i0 << 12);
                    if (RAM_START..RAM_END).contains(&va) {
                        *e0 = Pte::leaf(va, PteFlags::READ | PteFlags::WRITE | PteFlags::GLOBAL);
                        live += 1;
                    } else {
                        e0.clear();
                    }
                } else if e0.is_valid() {
                    live += 1;
                }
            }
            if live == 0 {
                page_alloc::free_page(t0 as *mut u8);
                e1.clear();
            }
        }
    }
    sfence_vma();
}

/// Check that every page of `[vp, vp+len)` is mapped with at least the
/// required permission bits.
pub fn validate_vptr_len(vp: usize, len: usize, required: PteFlags) -> KernelResult<()> {
    if len == 0 {
        return Ok(());
    }
    let end = vp.checked_add(len).ok_or(KernelError::InvalidArgument {
        what: "pointer range overflows",
    })?;
    let root = active_root();
    let mut page = page_down(vp);
    while page < end {
        // SAFETY: lookup walk on the live active root.
        let pte = unsafe { walk(root, page, false) }.ok_or(KernelError::InvalidArgument {
            what: "unmapped user pointer",
        })?;
        // SAFETY: `pte` points into a live table.
        let pte = unsafe { *pte };
        if !pte.is_leaf() || !pte.flags().contains(required) {
            return Err(KernelError::InvalidArgument {
                what: "user pointer lacks required access",
            });
        }
        page += PAGE_SIZE;
    }
    Ok(())
}

/// Walk a NUL-terminated user string, page by page, requiring the given
/// permissions on every byte. Returns the string length (excluding NUL).
pub fn validate_vstr(vs: usize, required: PteFlags) -> KernelResult<usize> {
    let root = active_root();
    let mut addr = vs;
    loop {
        // SAFETY: lookup walk on the live active root.
        let pte = unsafe { walk(root, page_down(addr), false) }.ok_or(
            KernelError::InvalidArgument {
                what: "unmapped user string",
            },
        )?;
        // SAFETY: `pte` points into a live table.
        let pte = unsafe { *pte };
        if !pte.is_leaf() || !pte.flags().contains(required) {
            return Err(KernelError::InvalidArgument {
                what: "user string lacks required access",
            });
        }
        let page_end = page_down(addr) + PAGE_SIZE;
        while addr < page_end {
            // SAFETY: the page containing `addr` was just validated as
            // mapped with the required permissions; SUM is set.
            let byte = unsafe { (addr as *const u8).read() };
            if byte == 0 {
                return Ok(addr - vs);
            }
            addr += 1;
        }
    }
}

/// Demand paging for user store faults. A fault inside the user region
/// gets a fresh R|W|U page; a fault on an already-mapped page (permission
/// violation) or outside the user region terminates the process.
pub fn handle_store_page_fault(vptr: usize) {
    if !(USER_START..USER_END).contains(&vptr) {
        crate::println!(
            "store fault outside user region at {:#x}: terminating process",
            vptr
        );
        crate::process::exit_current();
    }
    match alloc_and_map_page(
        page_down(vptr),
        PteFlags::READ | PteFlags::WRITE | PteFlags::USER,
    ) {
        Ok(_) => sfence_vma(),
        Err(_) => {
            crate::println!(
                "store to protected page at {:#x}: terminating process",
                vptr
            );
            crate::process::exit_current();
        }
    }
}
