//! Shared test fixtures: an in-memory image builder, a fault-injecting
//! block device and mount helpers.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use ext2_lite::fs::{
    DESC_SIZE, ERRORS_CONTINUE, EXT2_SUPER_MAGIC, GroupDescriptor, RawInode, S_IFDIR,
    STATE_VALID_FS, Superblock,
};
use ext2_lite::{BlockDevice, Clock, Credentials, Ext2Fs, FsError, ManualClock, RamDisk};
use zerocopy::{FromBytes, FromZeros, IntoBytes};

pub const BLOCK_SIZE: u32 = 1024;

pub fn block_on<T>(fut: impl core::future::Future<Output = T>) -> T {
    futures_lite::future::block_on(fut)
}

pub fn creds() -> Credentials {
    Credentials::ROOT
}

/// Image geometry for [`mkfs`]. The default matches a small two-group
/// layout: 1 KiB blocks, 128-byte inodes, 8192 blocks and 1024 inodes
/// per group.
#[derive(Debug, Clone, Copy)]
pub struct MkfsParams {
    pub blocks_count: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u32,
}

impl Default for MkfsParams {
    fn default() -> Self {
        Self {
            blocks_count: 16384,
            blocks_per_group: 8192,
            inodes_per_group: 1024,
            inode_size: 128,
        }
    }
}

fn set_bit(bitmap: &mut [u8], index: usize) {
    bitmap[index / 8] |= 1 << (index % 8);
}

fn write_dirent(block: &mut [u8], pos: usize, ino: u32, rec_len: u16, name: &[u8]) {
    block[pos..pos + 4].copy_from_slice(&ino.to_le_bytes());
    block[pos + 4..pos + 6].copy_from_slice(&rec_len.to_le_bytes());
    block[pos + 6] = name.len() as u8;
    block[pos + 7] = 0;
    block[pos + 8..pos + 8 + name.len()].copy_from_slice(name);
}

/// Build a fresh image: superblock and descriptor table with backups in
/// every group, bitmaps, inode tables, reserved inodes and an empty root
/// directory.
pub fn mkfs(p: &MkfsParams) -> RamDisk {
    let bs = BLOCK_SIZE as usize;
    let first_data_block = 1u32;
    let groups = (p.blocks_count - first_data_block).div_ceil(p.blocks_per_group);
    let desc_per_block = (bs / DESC_SIZE) as u32;
    let gdb = groups.div_ceil(desc_per_block);
    let inodes_per_block = BLOCK_SIZE / p.inode_size;
    assert_eq!(p.inodes_per_group % inodes_per_block, 0);
    let itb = p.inodes_per_group / inodes_per_block;
    let meta = 1 + gdb + 2 + itb;
    let reserved_inodes = 10u32.min(p.inodes_per_group);

    let mut image = vec![0u8; p.blocks_count as usize * bs];
    let mut descs: Vec<GroupDescriptor> = Vec::new();
    let mut total_free_blocks = 0u32;
    let mut total_free_inodes = 0u32;

    for g in 0..groups {
        let first = first_data_block + g * p.blocks_per_group;
        let blocks_in_group = p.blocks_per_group.min(p.blocks_count - first);
        assert!(blocks_in_group > meta, "group {g} too small for metadata");
        let bb = first + 1 + gdb;
        let ib = bb + 1;
        let it = ib + 1;

        let mut desc = GroupDescriptor::new_zeroed();
        desc.block_bitmap.set(bb);
        desc.inode_bitmap.set(ib);
        desc.inode_table.set(it);

        let mut free_blocks = blocks_in_group - meta;
        let mut free_inodes = p.inodes_per_group;

        {
            let off = bb as usize * bs;
            let bitmap = &mut image[off..off + bs];
            for bit in 0..meta as usize {
                set_bit(bitmap, bit);
            }
            // Bits past the group's end stay unavailable.
            for bit in blocks_in_group as usize..bs * 8 {
                set_bit(bitmap, bit);
            }
        }
        {
            let off = ib as usize * bs;
            let bitmap = &mut image[off..off + bs];
            if g == 0 {
                for bit in 0..reserved_inodes as usize {
                    set_bit(bitmap, bit);
                }
                free_inodes -= reserved_inodes;
            }
            for bit in p.inodes_per_group as usize..bs * 8 {
                set_bit(bitmap, bit);
            }
        }

        if g == 0 {
            // Root directory: inode 2 with a single data chunk.
            let root_block = it + itb;
            {
                let off = bb as usize * bs;
                set_bit(&mut image[off..off + bs], meta as usize);
            }
            free_blocks -= 1;
            desc.used_dirs_count.set(1);

            let mut root = RawInode::new_zeroed();
            root.mode.set(S_IFDIR | 0o755);
            root.size.set(BLOCK_SIZE);
            root.links_count.set(2);
            root.blocks.set(BLOCK_SIZE / 512);
            root.block[0].set(root_block);
            root.atime.set(1);
            root.ctime.set(1);
            root.mtime.set(1);
            let off = it as usize * bs + p.inode_size as usize;
            image[off..off + 128].copy_from_slice(root.as_bytes());

            let off = root_block as usize * bs;
            let chunk = &mut image[off..off + bs];
            write_dirent(chunk, 0, 2, 12, b".");
            write_dirent(chunk, 12, 2, (bs - 12) as u16, b"..");
        }

        desc.free_blocks_count.set(free_blocks as u16);
        desc.free_inodes_count.set(free_inodes as u16);
        total_free_blocks += free_blocks;
        total_free_inodes += free_inodes;
        descs.push(desc);
    }

    let mut sb = Superblock::new_zeroed();
    sb.magic.set(EXT2_SUPER_MAGIC);
    sb.inodes_count.set(groups * p.inodes_per_group);
    sb.blocks_count.set(p.blocks_count);
    sb.free_blocks_count.set(total_free_blocks);
    sb.free_inodes_count.set(total_free_inodes);
    sb.first_data_block.set(first_data_block);
    sb.log_block_size.set(0);
    sb.blocks_per_group.set(p.blocks_per_group);
    sb.inodes_per_group.set(p.inodes_per_group);
    sb.state.set(STATE_VALID_FS);
    sb.errors.set(ERRORS_CONTINUE);
    sb.rev_level.set(1);
    sb.first_ino.set(11);
    sb.inode_size.set(p.inode_size as u16);
    sb.uuid = *b"ext2-lite-test!!";

    for g in 0..groups {
        let first = first_data_block + g * p.blocks_per_group;
        let sb_off = if g == 0 {
            1024
        } else {
            first as usize * bs
        };
        image[sb_off..sb_off + 1024].copy_from_slice(sb.as_bytes());
        let gdt_off = (first + 1) as usize * bs;
        for (i, desc) in descs.iter().enumerate() {
            image[gdt_off + i * DESC_SIZE..gdt_off + (i + 1) * DESC_SIZE]
                .copy_from_slice(desc.as_bytes());
        }
    }

    RamDisk::from_bytes(image)
}

/// Mount a freshly built default image writable.
pub fn mount_default() -> (Arc<Ext2Fs>, Arc<RamDisk>, Arc<ManualClock>) {
    mount_params(&MkfsParams::default())
}

pub fn mount_params(p: &MkfsParams) -> (Arc<Ext2Fs>, Arc<RamDisk>, Arc<ManualClock>) {
    let disk = Arc::new(mkfs(p));
    let clock = Arc::new(ManualClock::new(1_000_000));
    let fs = block_on(Ext2Fs::mount(disk.clone(), "", clock.clone(), false)).expect("mount");
    (fs, disk, clock)
}

/// Read a group descriptor from a raw image.
pub fn desc_from_image(image: &[u8], group: usize) -> GroupDescriptor {
    let bs = BLOCK_SIZE as usize;
    let off = 2 * bs + group * DESC_SIZE;
    GroupDescriptor::read_from_bytes(&image[off..off + DESC_SIZE]).expect("descriptor slice")
}

/// Population count of the first `nbits` of a bitmap block.
pub fn popcount(image: &[u8], bitmap_block: u32, nbits: usize) -> usize {
    let off = bitmap_block as usize * BLOCK_SIZE as usize;
    (0..nbits)
        .filter(|&bit| image[off + bit / 8] & (1 << (bit % 8)) != 0)
        .count()
}

/// A device that fails writes landing on one byte offset a limited number
/// of times, then behaves normally.
pub struct FlakyDisk {
    inner: RamDisk,
    fail_offset: u64,
    remaining: AtomicU32,
}

impl FlakyDisk {
    pub fn new(inner: RamDisk, fail_offset: u64, times: u32) -> Self {
        Self {
            inner,
            fail_offset,
            remaining: AtomicU32::new(times),
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.snapshot()
    }
}

#[async_trait::async_trait]
impl BlockDevice for FlakyDisk {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        self.inner.read_at(offset, buf).await
    }

    async fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, FsError> {
        if offset == self.fail_offset {
            let armed = self
                .remaining
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok();
            if armed {
                return Err(FsError::Io);
            }
        }
        self.inner.write_at(offset, buf).await
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }
}

/// A clock for mounts that do not care about time.
pub fn test_clock() -> Arc<dyn Clock> {
    Arc::new(ManualClock::new(1_000_000))
}
