//! End-to-end tests of the I/O stack on a memory-backed disk: filesystem
//! mount, multi-block reads, patch-and-readback, endpoint reference
//! sharing, and ELF validation through the loader's parsing surface.

use std::sync::Arc;

use ferrite_kernel::elf::{Elf64Header, ELF_MAGIC, EHDR_SIZE};
use ferrite_kernel::error::KernelError;
use ferrite_kernel::fs::{FlatFs, BLOCK_SIZE, NAME_LEN};
use ferrite_kernel::io::memio::MemIo;
use ferrite_kernel::io::{IoEndpoint, IoRef};

const DENTRIES_OFFSET: usize = 64;

/// Build a one-file disk image in the flat on-disk format.
fn disk_image(name: &[u8], content: &[u8]) -> Vec<u8> {
    let blocks = content.chunks(BLOCK_SIZE).count();
    let mut img = vec![0u8; (2 + blocks) * BLOCK_SIZE];
    img[0..4].copy_from_slice(&1u32.to_le_bytes()); // one directory entry
    img[4..8].copy_from_slice(&1u32.to_le_bytes()); // one inode
    img[8..12].copy_from_slice(&(blocks as u32).to_le_bytes());
    img[DENTRIES_OFFSET..DENTRIES_OFFSET + name.len()].copy_from_slice(name);
    img[DENTRIES_OFFSET + NAME_LEN..DENTRIES_OFFSET + NAME_LEN + 4]
        .copy_from_slice(&0u32.to_le_bytes());
    assert!(name.len() <= NAME_LEN);

    let inode_base = BLOCK_SIZE;
    img[inode_base..inode_base + 4].copy_from_slice(&(content.len() as u32).to_le_bytes());
    for (k, chunk) in content.chunks(BLOCK_SIZE).enumerate() {
        img[inode_base + 4 + 4 * k..inode_base + 8 + 4 * k]
            .copy_from_slice(&(k as u32).to_le_bytes());
        let off = (2 + k) * BLOCK_SIZE;
        img[off..off + chunk.len()].copy_from_slice(chunk);
    }
    img
}

fn mount(name: &[u8], content: &[u8]) -> Arc<FlatFs> {
    let io: IoRef = Arc::new(MemIo::with_contents(disk_image(name, content)));
    FlatFs::mount(io).expect("mount")
}

#[test]
fn multi_block_file_reads_back_exactly() {
    let content: Vec<u8> = (0..3 * BLOCK_SIZE + 77).map(|i| (i * 7 % 256) as u8).collect();
    let fs = mount(b"blob", &content);
    let file = FlatFs::open(&fs, b"blob").expect("open");

    let mut back = vec![0u8; content.len()];
    file.read_exact(&mut back).expect("read all");
    assert_eq!(back, content);
    // A read at EOF reports zero bytes.
    let mut one = [0u8; 1];
    assert_eq!(file.read(&mut one).unwrap(), 0);
}

#[test]
fn patch_write_survives_reopen() {
    let fs = mount(b"notes", &vec![b'-'; 2 * BLOCK_SIZE]);
    let writer = FlatFs::open(&fs, b"notes").unwrap();
    writer.seek((BLOCK_SIZE - 3) as u64).unwrap();
    writer.write_all(b"sentinel").unwrap(); // straddles the block seam

    let reader = FlatFs::open(&fs, b"notes").unwrap();
    reader.seek((BLOCK_SIZE - 3) as u64).unwrap();
    let mut back = [0u8; 8];
    reader.read_exact(&mut back).unwrap();
    assert_eq!(&back, b"sentinel");
}

#[test]
fn endpoint_sharing_counts_references() {
    let fs = mount(b"f", b"shared");
    let io = FlatFs::open(&fs, b"f").unwrap();
    assert_eq!(Arc::strong_count(&io), 1);

    // A forked process duplicates the table entry by reference.
    let inherited = io.clone();
    assert_eq!(Arc::strong_count(&io), 2);

    // Positions are shared through the same open, unlike a second open.
    let mut buf = [0u8; 3];
    io.read_exact(&mut buf).unwrap();
    assert_eq!(inherited.position().unwrap(), 3);

    drop(inherited);
    assert_eq!(Arc::strong_count(&io), 1);
}

#[test]
fn elf_header_gate_rejects_foreign_formats() {
    let mut raw = [0u8; EHDR_SIZE];
    raw[0..4].copy_from_slice(&ELF_MAGIC);
    raw[4] = 2; // ELFCLASS64
    raw[5] = 2; // big-endian: not this machine
    raw[6] = 1;
    let err = Elf64Header::parse(&raw).unwrap_err();
    assert!(matches!(err, KernelError::BadFormat { .. }));
    assert_eq!(err.to_retval(), -ferrite_kernel::error::code::EBADFMT);
}
