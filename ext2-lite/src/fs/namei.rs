//! Namespace operations: create, lookup, link, unlink, symlink, mkdir,
//! rmdir, mknod and rename.
//!
//! These compose the inode allocator and the directory engine. Every
//! operation that takes multiple steps unwinds in inverse order on
//! failure: link counts come back down, fresh inodes are released and
//! evicted, and nothing stays half-linked.
//!
//! Callers serialise mutations of any one directory, the way a VFS holds
//! the parent inode lock across `create`, `unlink` and `rename`.

use alloc::format;
use alloc::sync::Arc;
use zerocopy::IntoBytes;

use super::inode::{Ext2Inode, InodeKind};
use super::structs::*;
use super::Ext2Fs;
use crate::error::FsError;

/// Fail `rename` instead of replacing an existing target.
pub const RENAME_NOREPLACE: u32 = 0x1;

/// Identity applied to newly created inodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u16,
    pub gid: u16,
}

impl Credentials {
    pub const ROOT: Self = Self { uid: 0, gid: 0 };
}

/// Validate a directory handle and an entry name.
fn check_name(dir: &Arc<Ext2Inode>, name: &str) -> Result<(), FsError> {
    if !dir.is_dir() {
        return Err(FsError::NotADirectory);
    }
    if name.is_empty() {
        return Err(FsError::InvalidInput);
    }
    if name.len() > NAME_LEN {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

/// The dot entries are maintained by the engine itself and are not valid
/// targets for namespace mutation.
fn check_not_dots(name: &str) -> Result<(), FsError> {
    if name == "." || name == ".." {
        return Err(FsError::InvalidInput);
    }
    Ok(())
}

impl Ext2Fs {
    /// `iget` for an inode number found in a directory entry. An entry
    /// pointing at a freed inode is a structural error, not a miss.
    async fn iget_entry(&self, ino: u32) -> Result<Arc<Ext2Inode>, FsError> {
        match self.iget(ino).await {
            Err(FsError::Stale) => Err(self.fs_error(
                "iget_entry",
                &format!("directory entry references freed inode {ino}"),
            )),
            other => other,
        }
    }

    fn inc_link(&self, inode: &Arc<Ext2Inode>) {
        let now = self.now();
        let mut state = inode.lock_state();
        state.links_count += 1;
        state.ctime = now;
        state.dirty = true;
    }

    fn dec_link(&self, inode: &Arc<Ext2Inode>) {
        let now = self.now();
        let mut state = inode.lock_state();
        state.links_count = state.links_count.saturating_sub(1);
        state.ctime = now;
        state.dirty = true;
    }

    /// Resolve `name` in `dir`. `Ok(None)` is a clean miss.
    pub async fn lookup(
        &self,
        dir: &Arc<Ext2Inode>,
        name: &str,
    ) -> Result<Option<Arc<Ext2Inode>>, FsError> {
        check_name(dir, name)?;
        match self.find_entry(dir, name.as_bytes()).await? {
            Some(slot) => Ok(Some(self.iget_entry(slot.ino).await?)),
            None => Ok(None),
        }
    }

    /// Create a regular file.
    pub async fn create(
        &self,
        dir: &Arc<Ext2Inode>,
        name: &str,
        mode: u16,
        creds: Credentials,
    ) -> Result<Arc<Ext2Inode>, FsError> {
        self.ensure_writable()?;
        check_name(dir, name)?;
        check_not_dots(name)?;
        if self.inode_by_name(dir, name).await?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let mode = S_IFREG | (mode & !S_IFMT);
        let inode = self
            .new_inode(dir, mode, InodeKind::Regular, creds)
            .await?;

        if let Err(err) = self.add_link(dir, name.as_bytes(), inode.ino()).await {
            inode.lock_state().links_count = 0;
            self.iput(inode).await?;
            return Err(err);
        }
        self.write_inode(&inode, false).await?;
        Ok(inode)
    }

    /// Add another name for an existing inode.
    pub async fn link(
        &self,
        inode: &Arc<Ext2Inode>,
        dir: &Arc<Ext2Inode>,
        name: &str,
    ) -> Result<(), FsError> {
        self.ensure_writable()?;
        check_name(dir, name)?;
        check_not_dots(name)?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory);
        }
        if self.inode_by_name(dir, name).await?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        self.inc_link(inode);
        if let Err(err) = self.add_link(dir, name.as_bytes(), inode.ino()).await {
            self.dec_link(inode);
            return Err(err);
        }
        self.write_inode(inode, false).await
    }

    /// Remove a name. The inode's storage is released once its link count
    /// reaches zero and the last in-memory reference is dropped.
    pub async fn unlink(&self, dir: &Arc<Ext2Inode>, name: &str) -> Result<(), FsError> {
        self.ensure_writable()?;
        check_name(dir, name)?;
        check_not_dots(name)?;

        let Some(slot) = self.find_entry(dir, name.as_bytes()).await? else {
            return Err(FsError::NotFound);
        };
        let inode = self.iget_entry(slot.ino).await?;
        if inode.is_dir() {
            self.iput(inode).await?;
            return Err(FsError::IsADirectory);
        }

        self.delete_entry(dir, slot).await?;
        {
            let parent_ctime = dir.read_state().ctime;
            let mut state = inode.lock_state();
            state.ctime = parent_ctime;
            state.links_count = state.links_count.saturating_sub(1);
            state.dirty = true;
        }
        self.iput(inode).await
    }

    /// Create a symbolic link named `name` pointing at `target`.
    ///
    /// Short targets are stored inside the inode's slot array; longer
    /// ones take one data block. A target that would not fit in a block
    /// is rejected.
    pub async fn symlink(
        &self,
        dir: &Arc<Ext2Inode>,
        name: &str,
        target: &str,
        creds: Credentials,
    ) -> Result<Arc<Ext2Inode>, FsError> {
        self.ensure_writable()?;
        check_name(dir, name)?;
        check_not_dots(name)?;
        if target.is_empty() {
            return Err(FsError::InvalidInput);
        }
        if target.len() + 1 > self.geometry().block_size as usize {
            return Err(FsError::NameTooLong);
        }
        if self.inode_by_name(dir, name).await?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let mode = S_IFLNK | 0o777;
        let inode = if target.len() <= SYMLINK_INLINE_MAX {
            let inode = self
                .new_inode(dir, mode, InodeKind::SymlinkFast, creds)
                .await?;
            {
                let mut state = inode.lock_state();
                state.data.as_mut_bytes()[..target.len()].copy_from_slice(target.as_bytes());
                state.size = target.len() as u32;
                state.dirty = true;
            }
            inode
        } else {
            let inode = self
                .new_inode(dir, mode, InodeKind::SymlinkSlow, creds)
                .await?;
            if let Err(err) = self.write_inode_data(&inode, 0, target.as_bytes()).await {
                inode.lock_state().links_count = 0;
                self.iput(inode).await?;
                return Err(err);
            }
            inode
        };

        if let Err(err) = self.add_link(dir, name.as_bytes(), inode.ino()).await {
            inode.lock_state().links_count = 0;
            self.iput(inode).await?;
            return Err(err);
        }
        self.write_inode(&inode, false).await?;
        Ok(inode)
    }

    /// Create a directory.
    pub async fn mkdir(
        &self,
        dir: &Arc<Ext2Inode>,
        name: &str,
        mode: u16,
        creds: Credentials,
    ) -> Result<Arc<Ext2Inode>, FsError> {
        self.ensure_writable()?;
        check_name(dir, name)?;
        check_not_dots(name)?;
        if self.inode_by_name(dir, name).await?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        // The child's `..` will reference the parent.
        self.inc_link(dir);

        let mode = S_IFDIR | (mode & !S_IFMT);
        let child = match self.new_inode(dir, mode, InodeKind::Directory, creds).await {
            Ok(child) => child,
            Err(err) => {
                self.dec_link(dir);
                return Err(err);
            }
        };
        // One link from the parent's entry, one from the child's own `.`.
        self.inc_link(&child);

        let undo = |child: &Arc<Ext2Inode>| {
            child.lock_state().links_count = 0;
            self.dec_link(dir);
        };

        if let Err(err) = self.make_empty(&child, dir).await {
            undo(&child);
            self.iput(child).await?;
            return Err(err);
        }
        if let Err(err) = self.add_link(dir, name.as_bytes(), child.ino()).await {
            undo(&child);
            self.iput(child).await?;
            return Err(err);
        }
        self.write_inode(&child, false).await?;
        Ok(child)
    }

    /// Remove an empty directory.
    pub async fn rmdir(&self, dir: &Arc<Ext2Inode>, name: &str) -> Result<(), FsError> {
        self.ensure_writable()?;
        check_name(dir, name)?;
        check_not_dots(name)?;

        let Some(slot) = self.find_entry(dir, name.as_bytes()).await? else {
            return Err(FsError::NotFound);
        };
        let child = self.iget_entry(slot.ino).await?;
        if !child.is_dir() {
            self.iput(child).await?;
            return Err(FsError::NotADirectory);
        }
        if !self.empty_dir(&child).await? {
            self.iput(child).await?;
            return Err(FsError::NotEmpty);
        }

        self.delete_entry(dir, slot).await?;
        {
            let parent_ctime = dir.read_state().ctime;
            let mut state = child.lock_state();
            state.size = 0;
            state.ctime = parent_ctime;
            // Once for the parent's entry, once for the child's `.`.
            state.links_count = state.links_count.saturating_sub(2);
            state.dirty = true;
        }
        self.dec_link(dir);
        self.iput(child).await
    }

    /// Create a device node, fifo or socket.
    pub async fn mknod(
        &self,
        dir: &Arc<Ext2Inode>,
        name: &str,
        mode: u16,
        dev: DeviceId,
        creds: Credentials,
    ) -> Result<Arc<Ext2Inode>, FsError> {
        self.ensure_writable()?;
        check_name(dir, name)?;
        check_not_dots(name)?;
        match mode & S_IFMT {
            S_IFCHR | S_IFBLK | S_IFIFO | S_IFSOCK => {}
            _ => return Err(FsError::InvalidInput),
        }
        if self.inode_by_name(dir, name).await?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let inode = self
            .new_inode(dir, mode, InodeKind::Special(dev), creds)
            .await?;
        if let Err(err) = self.add_link(dir, name.as_bytes(), inode.ino()).await {
            inode.lock_state().links_count = 0;
            self.iput(inode).await?;
            return Err(err);
        }
        self.write_inode(&inode, false).await?;
        Ok(inode)
    }

    /// Move `old_name` in `old_dir` to `new_name` in `new_dir`.
    ///
    /// With no flags an existing target is replaced (an existing
    /// directory target must be empty); [`RENAME_NOREPLACE`] turns that
    /// into [`FsError::AlreadyExists`]. Other flags are unsupported.
    pub async fn rename(
        &self,
        old_dir: &Arc<Ext2Inode>,
        old_name: &str,
        new_dir: &Arc<Ext2Inode>,
        new_name: &str,
        flags: u32,
    ) -> Result<(), FsError> {
        self.ensure_writable()?;
        check_name(old_dir, old_name)?;
        check_name(new_dir, new_name)?;
        check_not_dots(old_name)?;
        check_not_dots(new_name)?;
        if flags & !RENAME_NOREPLACE != 0 {
            return Err(FsError::Unsupported);
        }

        let Some(old_slot) = self.find_entry(old_dir, old_name.as_bytes()).await? else {
            return Err(FsError::NotFound);
        };
        let src = self.iget_entry(old_slot.ino).await?;

        if old_dir.ino() == new_dir.ino() && old_name == new_name {
            return self.iput(src).await;
        }

        // A directory changing parents needs its `..` rewritten.
        let dir_move = src.is_dir() && old_dir.ino() != new_dir.ino();
        let dotdot_slot = if dir_move {
            Some(self.dotdot(&src).await?)
        } else {
            None
        };

        let existing = self.find_entry(new_dir, new_name.as_bytes()).await?;
        match existing {
            Some(new_slot) => {
                if flags & RENAME_NOREPLACE != 0 {
                    self.iput(src).await?;
                    return Err(FsError::AlreadyExists);
                }
                let target = self.iget_entry(new_slot.ino).await?;
                if src.is_dir() {
                    if !target.is_dir() {
                        self.iput(target).await?;
                        self.iput(src).await?;
                        return Err(FsError::NotADirectory);
                    }
                    if !self.empty_dir(&target).await? {
                        self.iput(target).await?;
                        self.iput(src).await?;
                        return Err(FsError::NotEmpty);
                    }
                } else if target.is_dir() {
                    self.iput(target).await?;
                    self.iput(src).await?;
                    return Err(FsError::IsADirectory);
                }

                self.set_link(new_dir, new_slot, src.ino(), true).await?;
                if src.is_dir() {
                    // The target directory loses both its parent entry
                    // and its own `.`.
                    self.dec_link(&target);
                }
                self.dec_link(&target);
                self.iput(target).await?;
            }
            None => {
                if let Err(err) = self.add_link(new_dir, new_name.as_bytes(), src.ino()).await {
                    self.iput(src).await?;
                    return Err(err);
                }
                if src.is_dir() {
                    self.inc_link(new_dir);
                }
            }
        }

        {
            let now = self.now();
            let mut state = src.lock_state();
            state.ctime = now;
            state.dirty = true;
        }

        self.delete_entry(old_dir, old_slot).await?;

        if src.is_dir() {
            if let Some(dotdot_slot) = dotdot_slot {
                self.set_link(&src, dotdot_slot, new_dir.ino(), false).await?;
            }
            // The parent no longer hosts the subdirectory (or, for a
            // replaced directory target, hosts one fewer).
            self.dec_link(old_dir);
        }

        self.write_inode(&src, false).await?;
        self.iput(src).await
    }
}
