//! Flat filesystem over a seekable block endpoint.
//!
//! On-disk layout (little-endian, 4 KiB blocks):
//!
//! * Block 0 — boot block: three `u32` counts (directory entries, inodes,
//!   data blocks), padding to 64 bytes, then up to 63 directory entries of
//!   `{name[32], inode u32, pad[28]}`.
//! * Blocks `1 ..= num_inodes` — inodes: `byte_len u32` followed by up to
//!   1023 data-block numbers.
//! * Remaining blocks — file data, indexed by the inode's block list
//!   relative to the end of the inode region.
//!
//! The boot block is read once at mount and cached; it is immutable
//! afterwards. Files can be opened multiply: opens share data but carry
//! independent positions in the filesystem-wide open table (capacity
//! `FD_MAX`). Reads clamp at the file length; writes clamp too and return
//! the bytes actually written (zero at end of file) — the file never
//! grows. The open table is not serialized against concurrent syscalls
//! from multiple threads; per-process syscalls are single-threaded.

pub mod pipe;

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::config::FD_MAX;
use crate::error::{KernelError, KernelResult};
use crate::io::{ioctl, IoEndpoint, IoRef};
use crate::sync::OnceLock;

/// Filesystem block size.
pub const BLOCK_SIZE: usize = 4096;
/// Directory capacity of the boot block.
pub const MAX_DENTRIES: usize = 63;
/// Data-block numbers per inode.
pub const MAX_FILE_BLOCKS: usize = 1023;
/// Bytes per directory-entry name, NUL-padded.
pub const NAME_LEN: usize = 32;

const DENTRY_SIZE: usize = 64;
const DENTRIES_OFFSET: usize = 64;

/// One directory entry of the boot block.
#[derive(Debug, Clone)]
pub struct DirEntry {
    name: [u8; NAME_LEN],
    inode: u32,
}

impl DirEntry {
    /// The entry name up to its first NUL.
    pub fn name(&self) -> &[u8] {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        &self.name[..end]
    }

    pub fn inode(&self) -> u32 {
        self.inode
    }
}

/// The cached, immutable boot block.
#[derive(Debug, Clone)]
pub struct BootBlock {
    num_inodes: u32,
    num_data: u32,
    entries: Vec<DirEntry>,
}

impl BootBlock {
    /// Parse a raw boot block.
    pub fn parse(raw: &[u8]) -> KernelResult<Self> {
        if raw.len() < BLOCK_SIZE {
            return Err(KernelError::BadFormat {
                what: "short boot block",
            });
        }
        let num_dentry = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        let num_inodes = u32::from_le_bytes(raw[4..8].try_into().unwrap());
        let num_data = u32::from_le_bytes(raw[8..12].try_into().unwrap());
        if num_dentry as usize > MAX_DENTRIES {
            return Err(KernelError::BadFormat {
                what: "directory entry count",
            });
        }
        let mut entries = Vec::with_capacity(num_dentry as usize);
        for i in 0..num_dentry as usize {
            let base = DENTRIES_OFFSET + i * DENTRY_SIZE;
            let mut name = [0u8; NAME_LEN];
            name.copy_from_slice(&raw[base..base + NAME_LEN]);
            let inode =
                u32::from_le_bytes(raw[base + NAME_LEN..base + NAME_LEN + 4].try_into().unwrap());
            if inode >= num_inodes {
                return Err(KernelError::BadFormat {
                    what: "directory inode number",
                });
            }
            entries.push(DirEntry { name, inode });
        }
        Ok(Self {
            num_inodes,
            num_data,
            entries,
        })
    }

    /// Directory lookup by exact name.
    pub fn lookup(&self, name: &[u8]) -> Option<&DirEntry> {
        self.entries.iter().find(|e| e.name() == name)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct OpenSlot {
    in_use: bool,
    pos: u64,
    size: u64,
    inode: u32,
}

/// A mounted flat filesystem.
pub struct FlatFs {
    io: IoRef,
    boot: BootBlock,
    table: Mutex<[OpenSlot; FD_MAX]>,
}

impl FlatFs {
    /// Mount on `io`: read and cache block 0.
    pub fn mount(io: IoRef) -> KernelResult<Arc<Self>> {
        let mut raw = alloc::vec![0u8; BLOCK_SIZE];
        io.seek(0)?;
        io.read_exact(&mut raw)?;
        let boot = BootBlock::parse(&raw)?;
        log::info!(
            "fs mounted: {} files, {} inodes, {} data blocks",
            boot.entries.len(),
            boot.num_inodes,
            boot.num_data
        );
        Ok(Arc::new(Self {
            io,
            boot,
            table: Mutex::new([OpenSlot::default(); FD_MAX]),
        }))
    }

    /// Open `name` on `fs`, yielding a file endpoint with its own
    /// position.
    pub fn open(fs: &Arc<Self>, name: &[u8]) -> KernelResult<IoRef> {
        let entry = fs
            .boot
            .lookup(name)
            .ok_or(KernelError::NotFound { what: "file" })?;
        let inode = entry.inode();
        let size = fs.inode_len(inode)? as u64;

        let slot = {
            let mut table = fs.table.lock();
            let slot = table
                .iter()
                .position(|s| !s.in_use)
                .ok_or(KernelError::Busy {
                    what: "open-file table",
                })?;
            table[slot] = OpenSlot {
                in_use: true,
                pos: 0,
                size,
                inode,
            };
            slot
        };
        Ok(Arc::new(FsFile {
            fs: Arc::clone(fs),
            slot,
        }))
    }

    /// Device byte offset of inode `inode`'s block.
    fn inode_offset(&self, inode: u32) -> u64 {
        (1 + inode as u64) * BLOCK_SIZE as u64
    }

    /// Device byte offset of data block `dbn`.
    fn data_offset(&self, dbn: u32) -> u64 {
        (1 + self.boot.num_inodes as u64 + dbn as u64) * BLOCK_SIZE as u64
    }

    /// Byte length recorded in inode `inode`.
    fn inode_len(&self, inode: u32) -> KernelResult<u32> {
        let mut raw = [0u8; 4];
        self.io.seek(self.inode_offset(inode))?;
        self.io.read_exact(&mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// The `index`-th data-block number of inode `inode`.
    fn data_block_num(&self, inode: u32, index: u64) -> KernelResult<u32> {
        if index >= MAX_FILE_BLOCKS as u64 {
            return Err(KernelError::BadFormat {
                what: "file block index",
            });
        }
        let mut raw = [0u8; 4];
        self.io.seek(self.inode_offset(inode) + 4 + 4 * index)?;
        self.io.read_exact(&mut raw)?;
        let dbn = u32::from_le_bytes(raw);
        if dbn >= self.boot.num_data {
            return Err(KernelError::BadFormat {
                what: "data block number",
            });
        }
        Ok(dbn)
    }
}

/// An open file: a slot in the filesystem's open table.
struct FsFile {
    fs: Arc<FlatFs>,
    slot: usize,
}

impl FsFile {
    fn slot_state(&self) -> OpenSlot {
        self.fs.table.lock()[self.slot]
    }

    fn set_pos(&self, pos: u64) {
        self.fs.table.lock()[self.slot].pos = pos;
    }
}

impl Drop for FsFile {
    fn drop(&mut self) {
        self.fs.table.lock()[self.slot] = OpenSlot::default();
    }
}

impl IoEndpoint for FsFile {
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        let state = self.slot_state();
        let remaining = state.size.saturating_sub(state.pos);
        let n = buf.len().min(remaining as usize);
        let mut pos = state.pos;
        let mut done = 0;
        while done < n {
            let blk_index = pos / BLOCK_SIZE as u64;
            let offset = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - offset).min(n - done);
            let dbn = self.fs.data_block_num(state.inode, blk_index)?;
            self.fs.io.seek(self.fs.data_offset(dbn) + offset as u64)?;
            self.fs.io.read_exact(&mut buf[done..done + chunk])?;
            done += chunk;
            pos += chunk as u64;
        }
        self.set_pos(pos);
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        let state = self.slot_state();
        // Clamped at the recorded length: files never grow.
        let remaining = state.size.saturating_sub(state.pos);
        let n = buf.len().min(remaining as usize);
        let mut pos = state.pos;
        let mut done = 0;
        while done < n {
            let blk_index = pos / BLOCK_SIZE as u64;
            let offset = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - offset).min(n - done);
            let dbn = self.fs.data_block_num(state.inode, blk_index)?;
            self.fs.io.seek(self.fs.data_offset(dbn) + offset as u64)?;
            self.fs.io.write_all(&buf[done..done + chunk])?;
            done += chunk;
            pos += chunk as u64;
        }
        self.set_pos(pos);
        Ok(n)
    }

    fn ctl(&self, cmd: u32, arg: u64) -> KernelResult<u64> {
        match cmd {
            ioctl::GETLEN => Ok(self.slot_state().size),
            ioctl::GETPOS => Ok(self.slot_state().pos),
            ioctl::SETPOS => {
                if arg > self.slot_state().size {
                    return Err(KernelError::InvalidArgument {
                        what: "position beyond file size",
                    });
                }
                self.set_pos(arg);
                Ok(arg)
            }
            ioctl::GETBLKSZ => Ok(BLOCK_SIZE as u64),
            _ => Err(KernelError::NotSupported { what: "fs ioctl" }),
        }
    }
}

static MOUNTED: OnceLock<Arc<FlatFs>> = OnceLock::new();

/// Mount the system filesystem (once, at boot).
pub fn mount_global(io: IoRef) -> KernelResult<()> {
    let fs = FlatFs::mount(io)?;
    MOUNTED
        .set(fs)
        .map_err(|_| KernelError::Busy { what: "fs mount" })
}

/// Open a file on the system filesystem.
pub fn open_file(name: &[u8]) -> KernelResult<IoRef> {
    let fs = MOUNTED.get().ok_or(KernelError::NotFound {
        what: "mounted filesystem",
    })?;
    FlatFs::open(fs, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::memio::MemIo;

    // Build a disk image: boot block, inode blocks, data blocks.
    fn image(files: &[(&[u8], &[u8])]) -> Vec<u8> {
        let num_inodes = files.len();
        let mut data_blocks: Vec<Vec<u8>> = Vec::new();
        let mut inodes: Vec<Vec<u32>> = Vec::new();
        for (_, content) in files {
            let mut blocks = Vec::new();
            for chunk in content.chunks(BLOCK_SIZE) {
                let mut block = alloc::vec![0u8; BLOCK_SIZE];
                block[..chunk.len()].copy_from_slice(chunk);
                blocks.push(data_blocks.len() as u32);
                data_blocks.push(block);
            }
            inodes.push(blocks);
        }

        let mut img = alloc::vec![0u8; (1 + num_inodes + data_blocks.len()) * BLOCK_SIZE];
        img[0..4].copy_from_slice(&(files.len() as u32).to_le_bytes());
        img[4..8].copy_from_slice(&(num_inodes as u32).to_le_bytes());
        img[8..12].copy_from_slice(&(data_blocks.len() as u32).to_le_bytes());
        for (i, (name, content)) in files.iter().enumerate() {
            let base = DENTRIES_OFFSET + i * DENTRY_SIZE;
            img[base..base + name.len()].copy_from_slice(name);
            img[base + NAME_LEN..base + NAME_LEN + 4].copy_from_slice(&(i as u32).to_le_bytes());
            let ib = (1 + i) * BLOCK_SIZE;
            img[ib..ib + 4].copy_from_slice(&(content.len() as u32).to_le_bytes());
            for (k, dbn) in inodes[i].iter().enumerate() {
                img[ib + 4 + 4 * k..ib + 8 + 4 * k].copy_from_slice(&dbn.to_le_bytes());
            }
        }
        for (b, block) in data_blocks.iter().enumerate() {
            let off = (1 + num_inodes + b) * BLOCK_SIZE;
            img[off..off + BLOCK_SIZE].copy_from_slice(block);
        }
        img
    }

    fn mount_image(files: &[(&[u8], &[u8])]) -> Arc<FlatFs> {
        let io: IoRef = Arc::new(MemIo::with_contents(image(files)));
        FlatFs::mount(io).unwrap()
    }

    #[test]
    fn boot_block_rejects_bad_counts() {
        let mut raw = alloc::vec![0u8; BLOCK_SIZE];
        raw[0..4].copy_from_slice(&64u32.to_le_bytes());
        assert!(matches!(
            BootBlock::parse(&raw),
            Err(KernelError::BadFormat { .. })
        ));
    }

    #[test]
    fn open_missing_file_is_enoent() {
        let fs = mount_image(&[(b"a.txt", b"hello")]);
        assert!(matches!(
            FlatFs::open(&fs, b"b.txt"),
            Err(KernelError::NotFound { .. })
        ));
    }

    #[test]
    fn read_returns_contents_and_clamps() {
        let fs = mount_image(&[(b"a.txt", b"hello world")]);
        let file = FlatFs::open(&fs, b"a.txt").unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(file.read(&mut buf).unwrap(), 11);
        assert_eq!(&buf[..11], b"hello world");
        assert_eq!(file.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn write_then_read_roundtrip_at_position() {
        // The shape of the ioctl sample scenario: a 435-byte lyric file,
        // patched 26 bytes at offset 10.
        let mut lyric = alloc::vec![b'.'; 435];
        lyric[..8].copy_from_slice(b"[Chorus]");
        let fs = mount_image(&[(b"ioctl.txt", &lyric)]);
        let file = FlatFs::open(&fs, b"ioctl.txt").unwrap();

        let mut head = [0u8; 8];
        file.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"[Chorus]");

        file.seek(10).unwrap();
        let patch = b"reveal the ultimate secret";
        assert_eq!(file.write(patch).unwrap(), patch.len());

        file.seek(10).unwrap();
        let mut back = [0u8; 26];
        file.read_exact(&mut back).unwrap();
        assert_eq!(&back, patch);
    }

    #[test]
    fn write_clamps_at_file_length() {
        let fs = mount_image(&[(b"f", b"12345678")]);
        let file = FlatFs::open(&fs, b"f").unwrap();
        file.seek(6).unwrap();
        assert_eq!(file.write(b"abcdef").unwrap(), 2);
        file.seek(8).unwrap();
        assert_eq!(file.write(b"x").unwrap(), 0);
        file.seek(0).unwrap();
        let mut buf = [0u8; 8];
        file.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"123456ab");
    }

    #[test]
    fn reads_cross_block_boundaries() {
        let mut content = alloc::vec![0u8; BLOCK_SIZE + 100];
        for (i, b) in content.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let fs = mount_image(&[(b"big", &content)]);
        let file = FlatFs::open(&fs, b"big").unwrap();
        file.seek(BLOCK_SIZE as u64 - 50).unwrap();
        let mut buf = [0u8; 100];
        file.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], &content[BLOCK_SIZE - 50..BLOCK_SIZE + 50]);
    }

    #[test]
    fn independent_positions_per_open() {
        let fs = mount_image(&[(b"f", b"abcdefgh")]);
        let one = FlatFs::open(&fs, b"f").unwrap();
        let two = FlatFs::open(&fs, b"f").unwrap();
        let mut buf = [0u8; 4];
        one.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
        two.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
        assert_eq!(one.position().unwrap(), 4);
        assert_eq!(two.position().unwrap(), 4);
    }

    #[test]
    fn setpos_rejected_beyond_size() {
        let fs = mount_image(&[(b"f", b"abc")]);
        let file = FlatFs::open(&fs, b"f").unwrap();
        assert!(file.seek(4).is_err());
        assert!(file.seek(3).is_ok());
        assert_eq!(file.byte_len().unwrap(), 3);
        assert_eq!(file.ctl(ioctl::GETBLKSZ, 0).unwrap(), BLOCK_SIZE as u64);
    }

    #[test]
    fn open_slots_recycle_on_drop() {
        let fs = mount_image(&[(b"f", b"abc")]);
        let mut handles = Vec::new();
        for _ in 0..FD_MAX {
            handles.push(FlatFs::open(&fs, b"f").unwrap());
        }
        assert!(matches!(FlatFs::open(&fs, b"f"), Err(KernelError::Busy { .. })));
        handles.pop();
        assert!(FlatFs::open(&fs, b"f").is_ok());
    }
}
