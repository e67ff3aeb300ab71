//! ELF64 loader for statically linked user executables.
//!
//! Validation is strict and cheap: magic, 64-bit class, little-endian
//! data, current version. Only PT_LOAD segments are honored, and each must
//! fall inside the user region. Segments are mapped writable first so the
//! loader can fill them, then have their permissions rewritten to the
//! ELF-derived set. On failure the caller owns the partially populated
//! address space and discards it; no cleanup happens here.

use crate::config::{USER_END, USER_START};
use crate::error::{KernelError, KernelResult};

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;

/// Program header types; only `Load` matters here.
pub const PT_LOAD: u32 = 1;

// Segment permission flags.
pub const PF_X: u32 = 1 << 0;
pub const PF_W: u32 = 1 << 1;
pub const PF_R: u32 = 1 << 2;

/// Size of the ELF64 file header.
pub const EHDR_SIZE: usize = 64;
/// Size of one ELF64 program header.
pub const PHDR_SIZE: usize = 56;

/// The fields of the ELF64 header this loader consumes.
#[derive(Debug, Clone, Copy)]
pub struct Elf64Header {
    pub entry: u64,
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
}

impl Elf64Header {
    /// Parse and validate the 64-byte header.
    pub fn parse(raw: &[u8; EHDR_SIZE]) -> KernelResult<Self> {
        if raw[0..4] != ELF_MAGIC {
            return Err(KernelError::BadFormat { what: "ELF magic" });
        }
        if raw[4] != ELFCLASS64 {
            return Err(KernelError::BadFormat { what: "ELF class" });
        }
        if raw[5] != ELFDATA2LSB {
            return Err(KernelError::BadFormat {
                what: "ELF data encoding",
            });
        }
        if raw[6] != EV_CURRENT {
            return Err(KernelError::BadFormat { what: "ELF version" });
        }
        Ok(Self {
            entry: u64::from_le_bytes(raw[24..32].try_into().unwrap()),
            phoff: u64::from_le_bytes(raw[32..40].try_into().unwrap()),
            phentsize: u16::from_le_bytes(raw[54..56].try_into().unwrap()),
            phnum: u16::from_le_bytes(raw[56..58].try_into().unwrap()),
        })
    }
}

/// One ELF64 program header.
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
}

impl ProgramHeader {
    pub fn parse(raw: &[u8; PHDR_SIZE]) -> Self {
        Self {
            p_type: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            p_flags: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
            p_offset: u64::from_le_bytes(raw[8..16].try_into().unwrap()),
            p_vaddr: u64::from_le_bytes(raw[16..24].try_into().unwrap()),
            p_filesz: u64::from_le_bytes(raw[32..40].try_into().unwrap()),
            p_memsz: u64::from_le_bytes(raw[40..48].try_into().unwrap()),
        }
    }

    /// A LOAD segment must sit entirely inside the user region.
    pub fn check_user_bounds(&self) -> KernelResult<()> {
        let end = self
            .p_vaddr
            .checked_add(self.p_filesz)
            .ok_or(KernelError::InvalidArgument {
                what: "segment size overflows",
            })?;
        if self.p_vaddr < USER_START as u64 || end > USER_END as u64 {
            return Err(KernelError::InvalidArgument {
                what: "segment outside user region",
            });
        }
        Ok(())
    }
}

/// Map ELF segment flags onto PTE permission bits.
#[cfg(target_arch = "riscv64")]
fn segment_pte_flags(p_flags: u32) -> crate::mm::page_table::PteFlags {
    use crate::mm::page_table::PteFlags;
    let mut flags = PteFlags::empty();
    if p_flags & PF_R != 0 {
        flags |= PteFlags::READ;
    }
    if p_flags & PF_W != 0 {
        flags |= PteFlags::WRITE;
    }
    if p_flags & PF_X != 0 {
        flags |= PteFlags::EXEC;
    }
    flags
}

/// Load the executable from `io` into the active address space and return
/// its entry address.
#[cfg(target_arch = "riscv64")]
pub fn load(io: &crate::io::IoRef) -> KernelResult<usize> {
    use crate::io::IoEndpoint;
    use crate::mm::page_table::PteFlags;
    use crate::mm::space;

    let mut raw = [0u8; EHDR_SIZE];
    io.seek(0)?;
    io.read_exact(&mut raw)?;
    let header = Elf64Header::parse(&raw)?;

    for i in 0..header.phnum as u64 {
        let mut raw = [0u8; PHDR_SIZE];
        io.seek(header.phoff + i * header.phentsize as u64)?;
        io.read_exact(&mut raw)?;
        let phdr = ProgramHeader::parse(&raw);
        if phdr.p_type != PT_LOAD {
            continue;
        }
        phdr.check_user_bounds()?;
        if phdr.p_filesz == 0 {
            continue;
        }

        // Map writable for the copy, then drop to the segment's own set.
        // Memory beyond filesz (BSS, stack) is committed by demand paging.
        space::alloc_and_map_range(
            phdr.p_vaddr as usize,
            phdr.p_filesz as usize,
            PteFlags::READ | PteFlags::WRITE | PteFlags::USER,
        )?;
        io.seek(phdr.p_offset)?;
        // SAFETY: the range was just mapped R|W|U in the active space and
        // is filesz bytes long; SUM permits the supervisor store.
        let segment = unsafe {
            core::slice::from_raw_parts_mut(phdr.p_vaddr as *mut u8, phdr.p_filesz as usize)
        };
        io.read_exact(segment)?;
        space::set_range_flags(
            phdr.p_vaddr as usize,
            phdr.p_filesz as usize,
            segment_pte_flags(phdr.p_flags) | PteFlags::USER,
        );
    }

    Ok(header.entry as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_header() -> [u8; EHDR_SIZE] {
        let mut raw = [0u8; EHDR_SIZE];
        raw[0..4].copy_from_slice(&ELF_MAGIC);
        raw[4] = ELFCLASS64;
        raw[5] = ELFDATA2LSB;
        raw[6] = EV_CURRENT;
        raw[24..32].copy_from_slice(&0x8010_0000u64.to_le_bytes());
        raw[32..40].copy_from_slice(&64u64.to_le_bytes());
        raw[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        raw[56..58].copy_from_slice(&1u16.to_le_bytes());
        raw
    }

    #[test]
    fn accepts_valid_header() {
        let header = Elf64Header::parse(&valid_header()).unwrap();
        assert_eq!(header.entry, 0x8010_0000);
        assert_eq!(header.phnum, 1);
        assert_eq!(header.phentsize as usize, PHDR_SIZE);
    }

    #[test]
    fn rejects_big_endian() {
        let mut raw = valid_header();
        raw[5] = 2; // ELFDATA2MSB
        assert!(matches!(
            Elf64Header::parse(&raw),
            Err(KernelError::BadFormat {
                what: "ELF data encoding"
            })
        ));
    }

    #[test]
    fn rejects_bad_magic_class_version() {
        let mut raw = valid_header();
        raw[0] = 0x7e;
        assert!(Elf64Header::parse(&raw).is_err());

        let mut raw = valid_header();
        raw[4] = 1; // ELFCLASS32
        assert!(matches!(
            Elf64Header::parse(&raw),
            Err(KernelError::BadFormat { what: "ELF class" })
        ));

        let mut raw = valid_header();
        raw[6] = 0;
        assert!(Elf64Header::parse(&raw).is_err());
    }

    fn load_phdr(vaddr: u64, filesz: u64) -> ProgramHeader {
        ProgramHeader {
            p_type: PT_LOAD,
            p_flags: PF_R | PF_X,
            p_offset: 0x1000,
            p_vaddr: vaddr,
            p_filesz: filesz,
            p_memsz: filesz,
        }
    }

    #[test]
    fn segment_below_user_region_is_invalid() {
        let phdr = load_phdr(0x8000_0000, 0x1000);
        assert!(matches!(
            phdr.check_user_bounds(),
            Err(KernelError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn segment_past_user_end_is_invalid() {
        let phdr = load_phdr(USER_END as u64 - 0x800, 0x1000);
        assert!(phdr.check_user_bounds().is_err());
    }

    #[test]
    fn in_range_segment_is_accepted() {
        let phdr = load_phdr(USER_START as u64, 0x4000);
        assert!(phdr.check_user_bounds().is_ok());
    }

    #[test]
    fn phdr_field_extraction() {
        let mut raw = [0u8; PHDR_SIZE];
        raw[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
        raw[4..8].copy_from_slice(&(PF_R | PF_W).to_le_bytes());
        raw[8..16].copy_from_slice(&0x2000u64.to_le_bytes());
        raw[16..24].copy_from_slice(&0x8010_0000u64.to_le_bytes());
        raw[32..40].copy_from_slice(&0x1234u64.to_le_bytes());
        let phdr = ProgramHeader::parse(&raw);
        assert_eq!(phdr.p_type, PT_LOAD);
        assert_eq!(phdr.p_flags, PF_R | PF_W);
        assert_eq!(phdr.p_offset, 0x2000);
        assert_eq!(phdr.p_vaddr, 0x8010_0000);
        assert_eq!(phdr.p_filesz, 0x1234);
    }
}
