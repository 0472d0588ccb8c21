//! The mounted filesystem.
//!
//! [`Ext2Fs::mount`] probes and validates the superblock, loads the group
//! descriptor table into pinned buffers, and wires up the allocators, the
//! inode engine and the directory engine. The other modules in this
//! directory extend [`Ext2Fs`] with the allocator, inode, directory and
//! namespace operations.

mod balloc;
mod dir;
mod file;
mod ialloc;
mod inode;
mod namei;
pub mod structs;

pub use dir::{DirEntryInfo, ReaddirCursor};
pub use inode::{Attr, Ext2Inode, InodeKind, InodeStat};
pub use namei::{Credentials, RENAME_NOREPLACE};
pub use structs::*;

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spinning_top::Spinlock;
use zerocopy::FromBytes;

use crate::cache::{BlockBuf, BlockCache};
use crate::clock::Clock;
use crate::counter::ApproxCounter;
use crate::device::BlockDevice;
use crate::error::FsError;

/// Geometry derived from the superblock at mount time. Immutable for the
/// lifetime of the mount.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {
    pub block_size: u32,
    pub inode_size: u32,
    pub blocks_count: u32,
    pub inodes_count: u32,
    pub first_data_block: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub first_ino: u32,
    pub inodes_per_block: u32,
    pub itb_per_group: u32,
    pub desc_per_block: u32,
    pub groups: u32,
    pub gdb_count: u32,
}

impl Geometry {
    fn from_superblock(sb: &Superblock) -> Option<Self> {
        let block_size = sb.block_size()?;
        let inode_size = sb.inode_size();
        let groups = sb.group_count()?;
        if groups == 0 {
            return None;
        }
        let inodes_per_block = block_size / inode_size;
        let desc_per_block = block_size / DESC_SIZE as u32;
        Some(Self {
            block_size,
            inode_size,
            blocks_count: sb.blocks_count.get(),
            inodes_count: sb.inodes_count.get(),
            first_data_block: sb.first_data_block.get(),
            blocks_per_group: sb.blocks_per_group.get(),
            inodes_per_group: sb.inodes_per_group.get(),
            first_ino: sb.first_ino(),
            inodes_per_block,
            itb_per_group: sb.inodes_per_group.get() / inodes_per_block,
            desc_per_block,
            groups,
            gdb_count: groups.div_ceil(desc_per_block),
        })
    }

    /// First block belonging to `group`.
    pub fn group_first_block(&self, group: u32) -> u32 {
        self.first_data_block + group * self.blocks_per_group
    }

    /// Number of blocks actually present in `group`. The last group may
    /// be short.
    pub fn blocks_in_group(&self, group: u32) -> u32 {
        let first = self.group_first_block(group);
        core::cmp::min(self.blocks_per_group, self.blocks_count - first)
    }

    /// Block group holding inode `ino`.
    pub fn inode_group(&self, ino: u32) -> u32 {
        (ino - 1) / self.inodes_per_group
    }

    /// Largest representable file: direct block slots only.
    pub fn max_file_size(&self) -> u64 {
        DIRECT_BLOCKS as u64 * self.block_size as u64
    }

    /// 512-byte sectors per filesystem block.
    pub fn sectors_per_block(&self) -> u32 {
        self.block_size / 512
    }
}

/// On-error behaviour, from the `errors=` mount option or the superblock
/// default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorsPolicy {
    Continue,
    RemountRo,
    Panic,
}

/// Parsed mount options.
#[derive(Debug, Clone, Copy, Default)]
pub struct MountOptions {
    /// `errors=` choice. `None` falls back to the superblock default.
    pub errors: Option<ErrorsPolicy>,
    /// Trace allocator and mount decisions through `log::debug!`.
    pub debug: bool,
}

impl MountOptions {
    /// Parse a comma-separated option list. Later `errors=` choices
    /// override earlier ones.
    pub fn parse(s: &str) -> Result<Self, FsError> {
        let mut opts = Self::default();
        for item in s.split(',') {
            match item.trim() {
                "" => {}
                "errors=continue" => opts.errors = Some(ErrorsPolicy::Continue),
                "errors=remount-ro" => opts.errors = Some(ErrorsPolicy::RemountRo),
                "errors=panic" => opts.errors = Some(ErrorsPolicy::Panic),
                "debug" => opts.debug = true,
                other => {
                    log::warn!("ext2: unrecognized mount option {other:?}");
                    return Err(FsError::InvalidInput);
                }
            }
        }
        Ok(opts)
    }
}

/// Mutable mount state, guarded by one spinlock.
struct MountState {
    /// On-disk state bits as currently understood in memory.
    state: u16,
    /// State bits found at mount time, restored at unmount.
    state_at_mount: u16,
    errors: ErrorsPolicy,
    debug: bool,
}

/// `statfs` output.
#[derive(Debug, Clone, Copy)]
pub struct Statfs {
    /// Data blocks: total blocks minus metadata overhead.
    pub blocks: u64,
    pub free_blocks: u64,
    pub files: u64,
    pub free_files: u64,
    /// Maximum name length.
    pub name_len: u32,
    pub block_size: u32,
    /// The two 64-bit halves of the volume UUID, folded together.
    pub fsid: u64,
}

impl core::fmt::Debug for Ext2Fs {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ext2Fs").finish_non_exhaustive()
    }
}

/// A mounted filesystem instance.
pub struct Ext2Fs {
    cache: BlockCache,
    clock: Arc<dyn Clock>,
    geom: Geometry,
    uuid: [u8; 16],
    /// Pinned buffer holding the superblock.
    sb_buf: Arc<BlockBuf>,
    /// Byte offset of the superblock within `sb_buf`.
    sb_offset: usize,
    /// Pinned group descriptor table blocks.
    desc_bufs: Vec<Arc<BlockBuf>>,
    /// Per-group bitmap locks. Never take two at once.
    group_locks: Vec<Spinlock<()>>,
    state: Spinlock<MountState>,
    read_only: AtomicBool,
    /// Approximate counters; hints only. Group descriptors are
    /// authoritative.
    pub(crate) free_blocks: ApproxCounter,
    pub(crate) free_inodes: ApproxCounter,
    pub(crate) dir_count: ApproxCounter,
    /// Interned in-memory inodes, keyed by inode number.
    pub(crate) icache: Spinlock<BTreeMap<u32, Arc<Ext2Inode>>>,
}

impl Ext2Fs {
    /// Mount a filesystem from `device`.
    ///
    /// `options` follows the `errors=continue|remount-ro|panic`, `debug`
    /// grammar. A writable mount clears the clean-state bit on disk;
    /// [`Ext2Fs::unmount`] restores it.
    pub async fn mount(
        device: Arc<dyn BlockDevice>,
        options: &str,
        clock: Arc<dyn Clock>,
        read_only: bool,
    ) -> Result<Arc<Self>, FsError> {
        let opts = MountOptions::parse(options)?;

        // Probe: the superblock lives at byte 1024 regardless of the
        // block size, which is not known until it has been read.
        let mut probe = [0u8; 1024];
        let n = device.read_at(SUPERBLOCK_OFFSET, &mut probe).await?;
        if n != probe.len() {
            log::error!("ext2: device too small for a superblock");
            return Err(FsError::Io);
        }
        let sb = Superblock::ref_from_bytes(&probe[..]).map_err(|_| FsError::Corrupted)?;

        if sb.magic.get() != EXT2_SUPER_MAGIC {
            log::error!("ext2: bad magic number {:#06x}", sb.magic.get());
            return Err(FsError::Corrupted);
        }
        if sb.rev_level.get() > DYNAMIC_REV {
            log::error!("ext2: unsupported revision {}", sb.rev_level.get());
            return Err(FsError::Unsupported);
        }
        if sb.unsupported_features() != 0 {
            log::error!(
                "ext2: unsupported feature bits compat={:#x} incompat={:#x} ro_compat={:#x}",
                sb.feature_compat.get(),
                sb.feature_incompat.get(),
                sb.feature_ro_compat.get()
            );
            return Err(FsError::Unsupported);
        }
        if sb.block_size().is_none() {
            log::error!(
                "ext2: unsupported block size (log_block_size {})",
                sb.log_block_size.get()
            );
            return Err(FsError::Unsupported);
        }
        if let Err(why) = sb.validate() {
            log::error!("ext2: invalid superblock: {why}");
            return Err(FsError::Corrupted);
        }

        let geom = Geometry::from_superblock(sb).ok_or(FsError::Corrupted)?;
        if geom.blocks_count as u64 * geom.block_size as u64 > device.size() {
            log::error!(
                "ext2: superblock claims {} blocks of {} bytes but the device holds {} bytes",
                geom.blocks_count,
                geom.block_size,
                device.size()
            );
            return Err(FsError::Corrupted);
        }

        // Re-read the superblock through the cache with the declared
        // block size; the buffer stays pinned until unmount.
        let cache = BlockCache::new(device, geom.block_size);
        let sb_block = (SUPERBLOCK_OFFSET / geom.block_size as u64) as u32;
        let sb_offset = (SUPERBLOCK_OFFSET % geom.block_size as u64) as usize;
        let sb_buf = cache.read(sb_block).await?;

        let (state_at_mount, errors_default, uuid) = {
            let data = sb_buf.lock_data();
            let sb = Superblock::ref_from_prefix(&data[sb_offset..])
                .map_err(|_| FsError::Corrupted)?
                .0;
            let errors = match sb.errors.get() {
                ERRORS_PANIC => ErrorsPolicy::Panic,
                ERRORS_RO => ErrorsPolicy::RemountRo,
                _ => ErrorsPolicy::Continue,
            };
            (sb.state.get(), errors, sb.uuid)
        };

        if state_at_mount & STATE_ERROR_FS != 0 {
            log::warn!("ext2: filesystem has errors recorded, mounting anyway");
        } else if state_at_mount & STATE_VALID_FS == 0 {
            log::warn!("ext2: filesystem was not cleanly unmounted");
        }

        // Pin the descriptor table, which starts in the block after the
        // superblock's.
        let desc_start = geom.first_data_block + 1;
        let mut desc_bufs = Vec::with_capacity(geom.gdb_count as usize);
        for i in 0..geom.gdb_count {
            desc_bufs.push(cache.read(desc_start + i).await?);
        }

        let fs = Arc::new(Self {
            cache,
            clock,
            geom,
            uuid,
            sb_buf,
            sb_offset,
            desc_bufs,
            group_locks: (0..geom.groups).map(|_| Spinlock::new(())).collect(),
            state: Spinlock::new(MountState {
                state: state_at_mount,
                state_at_mount,
                errors: opts.errors.unwrap_or(errors_default),
                debug: opts.debug,
            }),
            read_only: AtomicBool::new(read_only),
            free_blocks: ApproxCounter::new(0),
            free_inodes: ApproxCounter::new(0),
            dir_count: ApproxCounter::new(0),
            icache: Spinlock::new(BTreeMap::new()),
        });

        fs.check_descriptors()?;
        fs.reset_counters()?;

        if fs.debug_enabled() {
            log::debug!(
                "ext2: mounted: {} groups, block size {}, inode size {}, {} free blocks, {} free inodes",
                geom.groups,
                geom.block_size,
                geom.inode_size,
                fs.free_blocks.read(),
                fs.free_inodes.read()
            );
        }

        if !read_only {
            let now = fs.now();
            fs.with_super(|sb| {
                sb.state.set(sb.state.get() & !STATE_VALID_FS);
                sb.mnt_count.set(sb.mnt_count.get().wrapping_add(1));
                sb.mtime.set(now);
            });
            fs.write_super().await?;
        }

        Ok(fs)
    }

    /// Validate that every group's bitmap and inode table blocks sit
    /// inside the group they describe, past the group's superblock and
    /// descriptor table copies.
    fn check_descriptors(&self) -> Result<(), FsError> {
        for group in 0..self.geom.groups {
            let desc = self.read_group_desc(group)?;
            let first = self.geom.group_first_block(group);
            let meta_end = first + 1 + self.geom.gdb_count;
            let end = first + self.geom.blocks_in_group(group);
            let in_range = |b: u32| b >= meta_end && b < end;
            if !in_range(desc.block_bitmap.get()) {
                log::error!(
                    "ext2: group {group}: block bitmap {} outside [{meta_end}, {end})",
                    desc.block_bitmap.get()
                );
                return Err(FsError::Corrupted);
            }
            if !in_range(desc.inode_bitmap.get()) {
                log::error!(
                    "ext2: group {group}: inode bitmap {} outside [{meta_end}, {end})",
                    desc.inode_bitmap.get()
                );
                return Err(FsError::Corrupted);
            }
            let table = desc.inode_table.get();
            if !in_range(table) || !in_range(table + self.geom.itb_per_group - 1) {
                log::error!("ext2: group {group}: inode table {table} outside [{meta_end}, {end})");
                return Err(FsError::Corrupted);
            }
        }
        Ok(())
    }

    /// Load the approximate counters from the authoritative group
    /// descriptor counts.
    fn reset_counters(&self) -> Result<(), FsError> {
        let mut free_blocks = 0u64;
        let mut free_inodes = 0u64;
        let mut dirs = 0u64;
        for group in 0..self.geom.groups {
            let desc = self.read_group_desc(group)?;
            free_blocks += desc.free_blocks_count.get() as u64;
            free_inodes += desc.free_inodes_count.get() as u64;
            dirs += desc.used_dirs_count.get() as u64;
        }
        self.free_blocks.set(free_blocks);
        self.free_inodes.set(free_inodes);
        self.dir_count.set(dirs);
        Ok(())
    }

    pub(crate) fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub(crate) fn geometry(&self) -> &Geometry {
        &self.geom
    }

    pub(crate) fn now(&self) -> u32 {
        self.clock.now_sec()
    }

    pub(crate) fn debug_enabled(&self) -> bool {
        self.state.lock().debug
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_writable(&self) -> Result<(), FsError> {
        if self.is_read_only() {
            Err(FsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Look up a group descriptor and copy it out.
    pub(crate) fn read_group_desc(&self, group: u32) -> Result<GroupDescriptor, FsError> {
        self.with_group_desc(group, |d| *d)
    }

    /// Run `f` against a group descriptor in its pinned table buffer and
    /// mark the buffer dirty. Use [`Ext2Fs::read_group_desc`] for reads.
    pub(crate) fn update_group_desc<R>(
        &self,
        group: u32,
        f: impl FnOnce(&mut GroupDescriptor) -> R,
    ) -> Result<R, FsError> {
        let r = self.with_group_desc(group, f)?;
        let shift = self.geom.desc_per_block.trailing_zeros();
        self.desc_bufs[(group >> shift) as usize].mark_dirty();
        Ok(r)
    }

    fn with_group_desc<R>(
        &self,
        group: u32,
        f: impl FnOnce(&mut GroupDescriptor) -> R,
    ) -> Result<R, FsError> {
        if group >= self.geom.groups {
            return Err(self.fs_error(
                "get_group_desc",
                &format!("group {group} out of range ({} groups)", self.geom.groups),
            ));
        }
        let mask = self.geom.desc_per_block - 1;
        let shift = self.geom.desc_per_block.trailing_zeros();
        let buf = &self.desc_bufs[(group >> shift) as usize];
        let offset = (group & mask) as usize * DESC_SIZE;
        let mut data = buf.lock_data();
        let desc = GroupDescriptor::mut_from_prefix(&mut data[offset..])
            .map_err(|_| FsError::Corrupted)?
            .0;
        Ok(f(desc))
    }

    /// Bitmap lock for `group`.
    pub(crate) fn group_lock(&self, group: u32) -> &Spinlock<()> {
        &self.group_locks[group as usize]
    }

    /// Mutate the superblock in its pinned buffer and mark it dirty.
    pub(crate) fn with_super<R>(&self, f: impl FnOnce(&mut Superblock) -> R) -> R {
        let mut data = self.sb_buf.lock_data();
        // The buffer was validated at mount; the overlay cannot fail.
        let (sb, _) = Superblock::mut_from_prefix(&mut data[self.sb_offset..])
            .unwrap_or_else(|_| unreachable!());
        let r = f(sb);
        drop(data);
        self.sb_buf.mark_dirty();
        r
    }

    /// Read a value out of the pinned superblock buffer.
    pub(crate) fn read_super<R>(&self, f: impl FnOnce(&Superblock) -> R) -> R {
        let data = self.sb_buf.lock_data();
        let (sb, _) =
            Superblock::ref_from_prefix(&data[self.sb_offset..]).unwrap_or_else(|_| unreachable!());
        f(sb)
    }

    /// Write the superblock buffer to the device. A buffer whose previous
    /// write-back failed is retried exactly once after clearing the error
    /// latch and re-marking the contents valid.
    pub(crate) async fn write_super(&self) -> Result<(), FsError> {
        if self.sb_buf.had_write_error() {
            log::warn!("ext2: previous superblock write failed, retrying");
            self.sb_buf.clear_write_error();
        }
        match self.cache.write_buf(&self.sb_buf).await {
            Ok(()) => Ok(()),
            Err(_) => {
                self.sb_buf.clear_write_error();
                self.cache.write_buf(&self.sb_buf).await
            }
        }
    }

    /// Report a structural inconsistency.
    ///
    /// Logs the reporting function and diagnostic, records the error state
    /// on disk, then applies the mount's error policy. Returns the error
    /// for the caller to propagate when the policy allows continuing.
    pub(crate) fn fs_error(&self, func: &str, msg: &str) -> FsError {
        log::error!("ext2: {func}: {msg}");
        let policy = {
            let mut state = self.state.lock();
            state.state |= STATE_ERROR_FS;
            state.errors
        };
        self.with_super(|sb| sb.state.set(sb.state.get() | STATE_ERROR_FS));
        match policy {
            ErrorsPolicy::Continue => {}
            ErrorsPolicy::RemountRo => {
                if !self.is_read_only() {
                    log::warn!("ext2: remounting read-only after error");
                    self.read_only.store(true, Ordering::Release);
                }
            }
            ErrorsPolicy::Panic => panic!("ext2: {func}: {msg}"),
        }
        FsError::Corrupted
    }

    /// Fold the authoritative per-group counts into the superblock, write
    /// back every dirty inode and buffer, and flush the device.
    pub async fn sync_fs(&self) -> Result<(), FsError> {
        self.write_dirty_inodes().await?;

        let mut free_blocks = 0u64;
        let mut free_inodes = 0u64;
        for group in 0..self.geom.groups {
            let desc = self.read_group_desc(group)?;
            free_blocks += desc.free_blocks_count.get() as u64;
            free_inodes += desc.free_inodes_count.get() as u64;
        }
        let now = self.now();
        self.with_super(|sb| {
            sb.free_blocks_count.set(free_blocks as u32);
            sb.free_inodes_count.set(free_inodes as u32);
            sb.wtime.set(now);
        });

        self.write_super().await?;
        self.cache.sync().await
    }

    /// Cleanly detach: sync everything and restore the clean-state bit
    /// when the filesystem was healthy.
    pub async fn unmount(&self) -> Result<(), FsError> {
        if !self.is_read_only() {
            let (had_errors, state_at_mount) = {
                let state = self.state.lock();
                (state.state & STATE_ERROR_FS != 0, state.state_at_mount)
            };
            if !had_errors && state_at_mount & STATE_VALID_FS != 0 {
                self.with_super(|sb| sb.state.set(sb.state.get() | STATE_VALID_FS));
            }
            self.sync_fs().await?;
        }
        Ok(())
    }

    /// Re-parse mount options on a live mount and switch between
    /// read-only and writable.
    pub async fn remount(&self, options: &str, read_only: bool) -> Result<(), FsError> {
        let opts = MountOptions::parse(options)?;
        {
            let mut state = self.state.lock();
            if let Some(errors) = opts.errors {
                state.errors = errors;
            }
            state.debug = opts.debug;
        }
        let was_ro = self.is_read_only();
        match (was_ro, read_only) {
            (false, true) => {
                // Going read-only behaves like a clean unmount.
                let had_errors = self.state.lock().state & STATE_ERROR_FS != 0;
                if !had_errors {
                    self.with_super(|sb| sb.state.set(sb.state.get() | STATE_VALID_FS));
                }
                self.sync_fs().await?;
                self.read_only.store(true, Ordering::Release);
            }
            (true, false) => {
                let state = self.read_super(|sb| sb.state.get());
                if state & STATE_ERROR_FS != 0 {
                    log::warn!("ext2: filesystem has errors recorded, remounting writable anyway");
                }
                self.with_super(|sb| sb.state.set(sb.state.get() & !STATE_VALID_FS));
                self.read_only.store(false, Ordering::Release);
                self.write_super().await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Render the active mount options in the `show_options` format.
    pub fn show_options(&self) -> String {
        let state = self.state.lock();
        let errors = match state.errors {
            ErrorsPolicy::Continue => "errors=continue",
            ErrorsPolicy::RemountRo => "errors=remount-ro",
            ErrorsPolicy::Panic => "errors=panic",
        };
        if state.debug {
            format!("{errors},debug")
        } else {
            String::from(errors)
        }
    }

    /// Filesystem statistics.
    ///
    /// The block total excludes metadata overhead: every group's
    /// superblock copy, descriptor table copy, the two bitmaps and the
    /// inode table.
    pub fn statfs(&self) -> Result<Statfs, FsError> {
        let per_group_overhead = 1 + self.geom.gdb_count + 2 + self.geom.itb_per_group;
        let overhead = self.geom.first_data_block as u64
            + self.geom.groups as u64 * per_group_overhead as u64;

        let mut free_blocks = 0u64;
        let mut free_inodes = 0u64;
        for group in 0..self.geom.groups {
            let desc = self.read_group_desc(group)?;
            free_blocks += desc.free_blocks_count.get() as u64;
            free_inodes += desc.free_inodes_count.get() as u64;
        }

        let lo = u64::from_le_bytes(self.uuid[0..8].try_into().unwrap_or_default());
        let hi = u64::from_le_bytes(self.uuid[8..16].try_into().unwrap_or_default());

        Ok(Statfs {
            blocks: self.geom.blocks_count as u64 - overhead,
            free_blocks,
            files: self.geom.inodes_count as u64,
            free_files: free_inodes,
            name_len: NAME_LEN as u32,
            block_size: self.geom.block_size,
            fsid: lo ^ hi,
        })
    }
}
