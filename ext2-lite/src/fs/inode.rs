//! In-memory inodes: loading, mapping, write-back and eviction.
//!
//! Inodes are interned by number: the first reference materialises the
//! on-disk record into an [`Ext2Inode`], later references share it, and
//! dropping the last reference through [`Ext2Fs::iput`] writes it back and,
//! for unlinked inodes, releases its storage.
//!
//! Behaviour is selected per type when the inode is loaded: regular files
//! and directories map data through their direct block slots, fast
//! symlinks keep the target inside the slot array, slow symlinks store it
//! in a data block, and device nodes carry their identifier encoded in
//! slots 0 or 1.

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spinning_top::RwSpinlock;
use spinning_top::guard::{RwSpinlockReadGuard, RwSpinlockWriteGuard};
use zerocopy::little_endian as le;
use zerocopy::{FromBytes, IntoBytes};

use super::structs::*;
use super::Ext2Fs;
use crate::error::FsError;

/// Per-type behaviour, resolved when the inode is loaded or created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    Regular,
    Directory,
    /// Symlink whose target lives in the inode's slot array.
    SymlinkFast,
    /// Symlink whose target lives in a data block.
    SymlinkSlow,
    /// Device node, fifo or socket. Fifos and sockets carry a zero id.
    Special(DeviceId),
}

/// Mutable inode fields, guarded by a read-write spinlock.
#[derive(Debug)]
pub(crate) struct InodeState {
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub links_count: u16,
    /// Allocated storage in 512-byte sectors.
    pub sectors: u32,
    pub flags: u32,
    /// Block-number slots, kept little-endian and copied to disk
    /// verbatim. Arithmetic on a slot converts explicitly.
    pub data: [le::U32; DATA_SLOTS],
    /// The on-disk record has never been written; write-back zeroes the
    /// whole slot first.
    pub new: bool,
    /// In-memory fields differ from the on-disk record.
    pub dirty: bool,
}

/// An interned in-memory inode.
#[derive(Debug)]
pub struct Ext2Inode {
    pub(crate) ino: u32,
    /// Group the inode record lives in; block allocation starts here.
    pub(crate) block_group: u32,
    pub(crate) kind: InodeKind,
    pub(crate) state: RwSpinlock<InodeState>,
    /// Monotonic mutation token. Directory readers use it to notice
    /// concurrent entry moves and re-align their position.
    pub(crate) version: AtomicU64,
}

impl Ext2Inode {
    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn kind(&self) -> InodeKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, InodeKind::Directory)
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn lock_state(&self) -> RwSpinlockWriteGuard<'_, InodeState> {
        self.state.write()
    }

    pub(crate) fn read_state(&self) -> RwSpinlockReadGuard<'_, InodeState> {
        self.state.read()
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.read_state().size as u64
    }

    pub fn links_count(&self) -> u16 {
        self.read_state().links_count
    }

    /// Snapshot the attributes.
    pub fn stat(&self) -> InodeStat {
        let state = self.read_state();
        InodeStat {
            ino: self.ino,
            mode: state.mode,
            uid: state.uid,
            gid: state.gid,
            size: state.size as u64,
            links: state.links_count,
            sectors: state.sectors,
            atime: state.atime,
            ctime: state.ctime,
            mtime: state.mtime,
        }
    }
}

/// Attribute snapshot, the `getattr` result.
#[derive(Debug, Clone, Copy)]
pub struct InodeStat {
    pub ino: u32,
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u64,
    pub links: u16,
    pub sectors: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
}

/// Attribute changes for `setattr`. Unset fields keep their value.
#[derive(Debug, Clone, Copy, Default)]
pub struct Attr {
    pub mode: Option<u16>,
    pub uid: Option<u16>,
    pub gid: Option<u16>,
    pub size: Option<u64>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
}

impl Ext2Fs {
    /// Locate the cache block and byte offset of an inode record.
    async fn inode_slot(
        &self,
        ino: u32,
    ) -> Result<(Arc<crate::cache::BlockBuf>, usize), FsError> {
        let geom = *self.geometry();
        let group = geom.inode_group(ino);
        let desc = self.read_group_desc(group)?;
        let index = (ino - 1) % geom.inodes_per_group;
        let block = desc.inode_table.get() + index / geom.inodes_per_block;
        let offset = (index % geom.inodes_per_block) * geom.inode_size;
        let buf = self.cache().read(block).await?;
        Ok((buf, offset as usize))
    }

    /// Get the interned inode for `ino`, loading it from the inode table
    /// on first reference.
    ///
    /// Returns [`FsError::Stale`] when the on-disk record has been freed
    /// (zero link count).
    pub async fn iget(&self, ino: u32) -> Result<Arc<Ext2Inode>, FsError> {
        if let Some(inode) = self.icache.lock().get(&ino) {
            return Ok(inode.clone());
        }

        let geom = *self.geometry();
        if ino == 0 || ino > geom.inodes_count {
            return Err(self.fs_error(
                "iget",
                &format!("inode {ino} out of range (1..={})", geom.inodes_count),
            ));
        }

        let (buf, offset) = self.inode_slot(ino).await?;
        // Decode into a local copy first; the in-memory inode is built
        // only after every field has been read.
        let raw: RawInode = {
            let data = buf.lock_data();
            *RawInode::ref_from_prefix(&data[offset..])
                .map_err(|_| FsError::Corrupted)?
                .0
        };

        if raw.links_count.get() == 0 {
            return Err(FsError::Stale);
        }

        let mode = raw.mode.get();
        let kind = match mode & S_IFMT {
            S_IFREG => InodeKind::Regular,
            S_IFDIR => InodeKind::Directory,
            S_IFLNK => {
                if raw.blocks.get() == 0 {
                    InodeKind::SymlinkFast
                } else {
                    InodeKind::SymlinkSlow
                }
            }
            S_IFCHR | S_IFBLK => {
                let dev = if raw.block[0].get() != 0 {
                    DeviceId::decode_old(raw.block[0].get())
                } else {
                    DeviceId::decode_new(raw.block[1].get())
                };
                InodeKind::Special(dev)
            }
            S_IFIFO | S_IFSOCK => InodeKind::Special(DeviceId::new(0, 0)),
            _ => {
                return Err(self.fs_error(
                    "iget",
                    &format!("inode {ino} has invalid mode {mode:#06x}"),
                ));
            }
        };

        let inode = Arc::new(Ext2Inode {
            ino,
            block_group: geom.inode_group(ino),
            kind,
            state: RwSpinlock::new(InodeState {
                mode,
                uid: raw.uid.get(),
                gid: raw.gid.get(),
                size: raw.size.get(),
                atime: raw.atime.get(),
                ctime: raw.ctime.get(),
                mtime: raw.mtime.get(),
                dtime: raw.dtime.get(),
                links_count: raw.links_count.get(),
                sectors: raw.blocks.get(),
                flags: raw.flags.get(),
                data: raw.block,
                new: false,
                dirty: false,
            }),
            version: AtomicU64::new(0),
        });

        // Another task may have loaded the same inode meanwhile; the
        // first entry in the table wins.
        let inode = self
            .icache
            .lock()
            .entry(ino)
            .or_insert(inode)
            .clone();
        Ok(inode)
    }

    /// The root directory.
    pub async fn root(&self) -> Result<Arc<Ext2Inode>, FsError> {
        let root = self.iget(ROOT_INO).await?;
        if !root.is_dir() {
            return Err(self.fs_error("root", "root inode is not a directory"));
        }
        Ok(root)
    }

    /// Map a logical file block to a device block.
    ///
    /// Only the direct slots exist; a logical block past them is an I/O
    /// error. With `create` set, a hole is filled from the allocator and
    /// the returned flag reports that the block is fresh.
    pub(crate) async fn get_blocks(
        &self,
        inode: &Arc<Ext2Inode>,
        iblock: u32,
        create: bool,
    ) -> Result<Option<(u32, bool)>, FsError> {
        if iblock >= DIRECT_BLOCKS as u32 {
            return Err(FsError::Io);
        }

        let existing = inode.read_state().data[iblock as usize].get();
        if existing != 0 {
            return Ok(Some((existing, false)));
        }
        if !create {
            return Ok(None);
        }

        self.ensure_writable()?;
        let (block, _count) = self.new_blocks(inode, 1).await?;
        let spb = self.geometry().sectors_per_block();

        let raced = {
            let mut state = inode.lock_state();
            let slot = &mut state.data[iblock as usize];
            if slot.get() != 0 {
                Some(slot.get())
            } else {
                slot.set(block);
                state.sectors += spb;
                state.dirty = true;
                None
            }
        };

        if let Some(winner) = raced {
            // Another task mapped the slot first; give our block back.
            self.free_blocks(None, block, 1).await?;
            return Ok(Some((winner, false)));
        }
        Ok(Some((block, true)))
    }

    /// Encode the in-memory inode into its slot in the inode table.
    ///
    /// With `sync` set, the table block is pushed to the device before
    /// returning.
    pub(crate) async fn write_inode(&self, inode: &Ext2Inode, sync: bool) -> Result<(), FsError> {
        let geom = *self.geometry();
        let (buf, offset) = self.inode_slot(inode.ino).await?;
        {
            let mut data = buf.lock_data();
            let mut state = inode.lock_state();
            let slot = &mut data[offset..offset + geom.inode_size as usize];
            if state.new {
                slot.fill(0);
                state.new = false;
            }
            let raw = RawInode::mut_from_prefix(slot)
                .map_err(|_| FsError::Corrupted)?
                .0;
            raw.mode.set(state.mode);
            raw.uid.set(state.uid);
            raw.gid.set(state.gid);
            raw.size.set(state.size);
            raw.atime.set(state.atime);
            raw.ctime.set(state.ctime);
            raw.mtime.set(state.mtime);
            raw.dtime.set(state.dtime);
            raw.links_count.set(state.links_count);
            raw.blocks.set(state.sectors);
            raw.flags.set(state.flags);
            match inode.kind {
                InodeKind::Special(dev) => {
                    if dev.fits_old_encoding() {
                        raw.block[0].set(dev.encode_old());
                        raw.block[1].set(0);
                    } else {
                        raw.block[0].set(0);
                        raw.block[1].set(dev.encode_new());
                    }
                    raw.block[2].set(0);
                }
                // The slot array is exchanged with disk verbatim.
                _ => raw.block = state.data,
            }
            state.dirty = false;
        }
        buf.mark_dirty();
        if sync {
            self.cache().write_buf(&buf).await?;
        }
        Ok(())
    }

    /// Write back every interned inode with unwritten changes.
    pub(crate) async fn write_dirty_inodes(&self) -> Result<(), FsError> {
        let dirty: Vec<Arc<Ext2Inode>> = {
            let icache = self.icache.lock();
            icache
                .values()
                .filter(|i| i.read_state().dirty)
                .cloned()
                .collect()
        };
        for inode in dirty {
            self.write_inode(&inode, false).await?;
        }
        Ok(())
    }

    /// Release a reference obtained from [`Ext2Fs::iget`] or the
    /// namespace operations. The last reference evicts the inode: its
    /// record is written back, and an unlinked inode additionally has its
    /// data freed and its bitmap bit cleared.
    pub async fn iput(&self, inode: Arc<Ext2Inode>) -> Result<(), FsError> {
        let evict = {
            let mut icache = self.icache.lock();
            // The table itself holds one reference.
            if Arc::strong_count(&inode) <= 2 {
                icache.remove(&inode.ino);
                true
            } else {
                false
            }
        };
        if evict {
            self.evict(&inode).await?;
        }
        Ok(())
    }

    async fn evict(&self, inode: &Arc<Ext2Inode>) -> Result<(), FsError> {
        if self.is_read_only() {
            return Ok(());
        }
        let (links, flags, dirty) = {
            let state = inode.read_state();
            (state.links_count, state.flags, state.dirty)
        };
        if links == 0 {
            let now = self.now();
            {
                let mut state = inode.lock_state();
                state.dtime = now;
                state.dirty = true;
            }
            self.write_inode(inode, flags & FL_SYNC != 0).await?;
            self.truncate_blocks(inode, 0).await?;
            self.free_inode(inode).await?;
        } else if dirty {
            self.write_inode(inode, false).await?;
        }
        Ok(())
    }

    /// Free the direct blocks past `new_size`. Runs of adjacent blocks
    /// are released with single allocator calls.
    pub(crate) async fn truncate_blocks(
        &self,
        inode: &Arc<Ext2Inode>,
        new_size: u64,
    ) -> Result<(), FsError> {
        match inode.kind {
            InodeKind::Regular | InodeKind::Directory | InodeKind::SymlinkSlow => {}
            _ => return Ok(()),
        }

        let geom = *self.geometry();
        let retain = new_size.div_ceil(geom.block_size as u64) as usize;

        let dropped: Vec<u32> = {
            let mut state = inode.lock_state();
            let mut dropped = Vec::new();
            for slot in state.data[..DIRECT_BLOCKS]
                .iter_mut()
                .skip(retain.min(DIRECT_BLOCKS))
            {
                let block = slot.get();
                if block != 0 {
                    dropped.push(block);
                    slot.set(0);
                }
            }
            if !dropped.is_empty() {
                state.dirty = true;
            }
            dropped
        };

        // Coalesce adjacent block numbers into single frees, splitting at
        // group boundaries so each free stays inside one group.
        let mut i = 0;
        while i < dropped.len() {
            let start = dropped[i];
            let group = (start - geom.first_data_block) / geom.blocks_per_group;
            let mut len = 1u32;
            while i + (len as usize) < dropped.len()
                && dropped[i + len as usize] == start + len
                && (start + len - geom.first_data_block) / geom.blocks_per_group == group
            {
                len += 1;
            }
            self.free_blocks(Some(inode), start, len).await?;
            i += len as usize;
        }
        Ok(())
    }

    /// Apply attribute changes. A size change truncates: the tail of the
    /// last kept block is zeroed so later extension reads zeros, then the
    /// dropped blocks are freed.
    pub async fn setattr(&self, inode: &Arc<Ext2Inode>, attr: Attr) -> Result<(), FsError> {
        self.ensure_writable()?;
        let now = self.now();

        if let Some(size) = attr.size {
            if !matches!(inode.kind, InodeKind::Regular) {
                return Err(if inode.is_dir() {
                    FsError::IsADirectory
                } else {
                    FsError::InvalidInput
                });
            }
            let geom = *self.geometry();
            if size > geom.max_file_size() {
                return Err(FsError::Unsupported);
            }
            let old_size = inode.size();
            if size < old_size {
                let tail = (size % geom.block_size as u64) as usize;
                if tail != 0 {
                    if let Some((block, _)) =
                        self.get_blocks(inode, (size / geom.block_size as u64) as u32, false).await?
                    {
                        let buf = self.cache().read(block).await?;
                        buf.lock_data()[tail..].fill(0);
                        buf.mark_dirty();
                    }
                }
                self.truncate_blocks(inode, size).await?;
            }
            let mut state = inode.lock_state();
            state.size = size as u32;
            state.mtime = now;
            state.ctime = now;
            state.dirty = true;
        }

        let mut state = inode.lock_state();
        if let Some(mode) = attr.mode {
            state.mode = (state.mode & S_IFMT) | (mode & !S_IFMT);
        }
        if let Some(uid) = attr.uid {
            state.uid = uid;
        }
        if let Some(gid) = attr.gid {
            state.gid = gid;
        }
        if let Some(atime) = attr.atime {
            state.atime = atime;
        }
        if let Some(mtime) = attr.mtime {
            state.mtime = mtime;
        }
        state.ctime = now;
        state.dirty = true;
        Ok(())
    }

    /// Read a symlink's target.
    pub async fn readlink(&self, inode: &Arc<Ext2Inode>) -> Result<Vec<u8>, FsError> {
        match inode.kind {
            InodeKind::SymlinkFast => {
                let state = inode.read_state();
                let len = state.size as usize;
                if len > SYMLINK_INLINE_MAX {
                    return Err(self.fs_error(
                        "readlink",
                        &format!("inode {}: inline target of {len} bytes", inode.ino),
                    ));
                }
                Ok(state.data.as_bytes()[..len].to_vec())
            }
            InodeKind::SymlinkSlow => {
                let len = inode.size() as usize;
                let mut target = alloc::vec![0u8; len];
                let n = self.read_inode_data(inode, 0, &mut target).await?;
                target.truncate(n);
                Ok(target)
            }
            _ => Err(FsError::InvalidInput),
        }
    }
}
