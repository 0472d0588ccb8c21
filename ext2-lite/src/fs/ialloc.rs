//! Inode allocation and placement.
//!
//! A new inode is placed near its parent directory when possible: the
//! parent's group is used if it has both a free inode and a free block.
//! Otherwise a quadratic probe (offsets 1, 2, 4, 8, ... from a hash of
//! the parent) looks for such a group, and as a last resort a linear scan
//! accepts any group with a free inode regardless of block availability.
//!
//! Within a group the first clear bitmap bit wins. Losing a bit to a
//! concurrent allocation retries from the next bit; an exhausted group
//! moves the search to the following one.

use alloc::format;
use alloc::sync::Arc;
use core::sync::atomic::AtomicU64;
use spinning_top::RwSpinlock;
use zerocopy::little_endian as le;

use super::balloc::{find_next_zero_bit, test_and_clear_bit, test_and_set_bit};
use super::inode::{Ext2Inode, InodeKind, InodeState};
use super::namei::Credentials;
use super::structs::*;
use super::Ext2Fs;
use crate::error::FsError;

impl Ext2Fs {
    /// Pick the group a new inode should land in.
    fn find_group(&self, parent_group: u32, parent_ino: u32, debug: bool) -> Option<u32> {
        let groups = self.geometry().groups;
        let has_both = |group: u32| -> bool {
            self.read_group_desc(group)
                .map(|d| d.free_inodes_count.get() > 0 && d.free_blocks_count.get() > 0)
                .unwrap_or(false)
        };

        if has_both(parent_group) {
            return Some(parent_group);
        }

        let start = (parent_group + parent_ino) % groups;
        let mut offset = 1;
        while offset < groups {
            let group = (start + offset) % groups;
            if has_both(group) {
                if debug {
                    log::debug!("ext2: inode placement probed to group {group}");
                }
                return Some(group);
            }
            offset <<= 1;
        }

        // Any group with a free inode, block availability be damned.
        let mut group = parent_group;
        for _ in 0..groups {
            group = (group + 1) % groups;
            let free = self
                .read_group_desc(group)
                .map(|d| d.free_inodes_count.get())
                .unwrap_or(0);
            if free > 0 {
                if debug {
                    log::debug!("ext2: inode placement fell back to group {group}");
                }
                return Some(group);
            }
        }
        None
    }

    /// Allocate a new inode and intern it.
    ///
    /// The inode starts with a link count of 1; directory callers adjust
    /// it after writing the `.` entry. Ownership follows the caller's
    /// credentials, with the group inherited from a set-group-id parent.
    pub(crate) async fn new_inode(
        &self,
        parent: &Arc<Ext2Inode>,
        mut mode: u16,
        kind: InodeKind,
        creds: Credentials,
    ) -> Result<Arc<Ext2Inode>, FsError> {
        self.ensure_writable()?;
        let geom = *self.geometry();
        let is_dir = mode & S_IFMT == S_IFDIR;

        let Some(start_group) = self.find_group(parent.block_group, parent.ino(), self.debug_enabled())
        else {
            return Err(FsError::NoSpace);
        };

        let mut found = None;
        let mut group = start_group;
        for _ in 0..geom.groups {
            let desc = self.read_group_desc(group)?;
            let bitmap = self.cache().read(desc.inode_bitmap.get()).await?;

            let bit = {
                let _guard = self.group_lock(group).lock();
                let mut data = bitmap.lock_data();
                let mut from = 0;
                let mut won = None;
                while let Some(bit) =
                    find_next_zero_bit(&data, geom.inodes_per_group as usize, from)
                {
                    if test_and_set_bit(&mut data, bit) {
                        // Raced with another allocation; try the next bit.
                        from = bit + 1;
                        continue;
                    }
                    won = Some(bit);
                    break;
                }
                if won.is_some() {
                    self.update_group_desc(group, |d| {
                        let free = d.free_inodes_count.get();
                        d.free_inodes_count.set(free.saturating_sub(1));
                        if is_dir {
                            d.used_dirs_count.set(d.used_dirs_count.get() + 1);
                        }
                    })?;
                }
                won
            };

            if let Some(bit) = bit {
                bitmap.mark_dirty();
                found = Some((group, bit));
                break;
            }
            group = (group + 1) % geom.groups;
        }

        let Some((group, bit)) = found else {
            return Err(FsError::NoSpace);
        };

        let ino = group * geom.inodes_per_group + bit as u32 + 1;
        if ino < geom.first_ino || ino > geom.inodes_count {
            return Err(self.fs_error(
                "new_inode",
                &format!("allocated inode {ino} outside [{}, {}]", geom.first_ino, geom.inodes_count),
            ));
        }

        self.free_inodes.add(-1);
        if is_dir {
            self.dir_count.add(1);
        }

        let now = self.now();
        let (gid, flags) = {
            let pstate = parent.lock_state();
            let gid = if pstate.mode & S_ISGID != 0 {
                if is_dir {
                    mode |= S_ISGID;
                }
                pstate.gid
            } else {
                creds.gid
            };
            (gid, pstate.flags)
        };

        let inode = Arc::new(Ext2Inode {
            ino,
            block_group: group,
            kind,
            state: RwSpinlock::new(InodeState {
                mode,
                uid: creds.uid,
                gid,
                size: 0,
                atime: now,
                ctime: now,
                mtime: now,
                dtime: 0,
                links_count: 1,
                sectors: 0,
                flags,
                data: [le::U32::ZERO; DATA_SLOTS],
                new: true,
                dirty: true,
            }),
            version: AtomicU64::new(0),
        });

        let clashed = self
            .icache
            .lock()
            .insert(ino, inode.clone())
            .is_some();
        if clashed {
            return Err(self.fs_error(
                "new_inode",
                &format!("inode {ino} was free on disk but live in memory"),
            ));
        }

        if self.debug_enabled() {
            log::debug!("ext2: allocated inode {ino} in group {group}");
        }
        Ok(inode)
    }

    /// Release an inode's bitmap bit and descriptor counts. The caller
    /// has already freed the inode's data blocks.
    pub(crate) async fn free_inode(&self, inode: &Ext2Inode) -> Result<(), FsError> {
        self.ensure_writable()?;
        let geom = *self.geometry();
        let ino = inode.ino();
        if ino == 0 || ino > geom.inodes_count {
            return Err(self.fs_error("free_inode", &format!("inode {ino} out of range")));
        }

        let group = geom.inode_group(ino);
        let bit = ((ino - 1) % geom.inodes_per_group) as usize;
        let is_dir = matches!(inode.kind, InodeKind::Directory);

        let desc = self.read_group_desc(group)?;
        let bitmap = self.cache().read(desc.inode_bitmap.get()).await?;
        let was_set = {
            let _guard = self.group_lock(group).lock();
            let mut data = bitmap.lock_data();
            let was_set = test_and_clear_bit(&mut data, bit);
            if was_set {
                self.update_group_desc(group, |d| {
                    d.free_inodes_count.set(d.free_inodes_count.get() + 1);
                    if is_dir {
                        let dirs = d.used_dirs_count.get();
                        d.used_dirs_count.set(dirs.saturating_sub(1));
                    }
                })?;
            }
            was_set
        };

        if !was_set {
            return Err(self.fs_error(
                "free_inode",
                &format!("inode {ino} was already free"),
            ));
        }

        bitmap.mark_dirty();
        self.free_inodes.add(1);
        if is_dir {
            self.dir_count.add(-1);
        }
        if self.debug_enabled() {
            log::debug!("ext2: freed inode {ino} in group {group}");
        }
        Ok(())
    }
}
