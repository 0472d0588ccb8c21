//! Whole-file data access through the direct block map.
//!
//! Reads walk the mapped blocks and fill holes with zeros. Writes
//! allocate missing blocks as they go; a block that is both fresh and
//! only partially covered is zero-filled first so stale device contents
//! never become file contents.

use alloc::sync::Arc;

use super::inode::{Ext2Inode, InodeKind};
use super::Ext2Fs;
use crate::error::FsError;

impl Ext2Fs {
    /// Read from an inode's data, without type checks. Returns the number
    /// of bytes read, stopping at the inode's size.
    pub(crate) async fn read_inode_data(
        &self,
        inode: &Arc<Ext2Inode>,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, FsError> {
        let block_size = self.geometry().block_size as u64;
        let size = inode.size();
        if offset >= size {
            return Ok(0);
        }
        let to_read = core::cmp::min(buf.len() as u64, size - offset) as usize;

        let mut done = 0;
        let mut pos = offset;
        while done < to_read {
            let iblock = (pos / block_size) as u32;
            let block_off = (pos % block_size) as usize;
            let chunk = core::cmp::min(block_size as usize - block_off, to_read - done);

            match self.get_blocks(inode, iblock, false).await? {
                Some((block, _)) => {
                    let buf_block = self.cache().read(block).await?;
                    let data = buf_block.lock_data();
                    buf[done..done + chunk].copy_from_slice(&data[block_off..block_off + chunk]);
                }
                // Hole: unwritten bytes read as zeros.
                None => buf[done..done + chunk].fill(0),
            }

            done += chunk;
            pos += chunk as u64;
        }
        Ok(done)
    }

    /// Write to an inode's data, growing the size when the write extends
    /// past it. Without type checks; the public entry point is
    /// [`Ext2Fs::write_at`].
    pub(crate) async fn write_inode_data(
        &self,
        inode: &Arc<Ext2Inode>,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, FsError> {
        self.ensure_writable()?;
        let block_size = self.geometry().block_size as u64;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(FsError::InvalidInput)?;
        if end > self.geometry().max_file_size() {
            return Err(FsError::Unsupported);
        }

        let mut done = 0;
        let mut pos = offset;
        while done < data.len() {
            let iblock = (pos / block_size) as u32;
            let block_off = (pos % block_size) as usize;
            let chunk = core::cmp::min(block_size as usize - block_off, data.len() - done);

            let Some((block, fresh)) = self.get_blocks(inode, iblock, true).await? else {
                return Err(FsError::Io);
            };
            let buf_block = if fresh {
                self.cache().get_zeroed(block)
            } else {
                self.cache().read(block).await?
            };
            {
                let mut block_data = buf_block.lock_data();
                block_data[block_off..block_off + chunk].copy_from_slice(&data[done..done + chunk]);
            }
            buf_block.mark_dirty();

            done += chunk;
            pos += chunk as u64;
        }

        {
            let mut state = inode.lock_state();
            if end > state.size as u64 {
                state.size = end as u32;
            }
            state.dirty = true;
        }
        Ok(done)
    }

    /// Read a regular file.
    pub async fn read_at(
        &self,
        inode: &Arc<Ext2Inode>,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, FsError> {
        match inode.kind {
            InodeKind::Regular => {}
            InodeKind::Directory => return Err(FsError::IsADirectory),
            _ => return Err(FsError::InvalidInput),
        }
        let n = self.read_inode_data(inode, offset, buf).await?;
        if !self.is_read_only() {
            let now = self.now();
            let mut state = inode.lock_state();
            state.atime = now;
            state.dirty = true;
        }
        Ok(n)
    }

    /// Write a regular file.
    pub async fn write_at(
        &self,
        inode: &Arc<Ext2Inode>,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, FsError> {
        match inode.kind {
            InodeKind::Regular => {}
            InodeKind::Directory => return Err(FsError::IsADirectory),
            _ => return Err(FsError::InvalidInput),
        }
        let n = self.write_inode_data(inode, offset, data).await?;
        let now = self.now();
        {
            let mut state = inode.lock_state();
            state.mtime = now;
            state.ctime = now;
            state.dirty = true;
        }
        Ok(n)
    }

    /// Push one inode's record and data blocks to the device.
    pub async fn sync_inode(&self, inode: &Arc<Ext2Inode>) -> Result<(), FsError> {
        let maps_data = matches!(
            inode.kind,
            InodeKind::Regular | InodeKind::Directory | InodeKind::SymlinkSlow
        );
        let blocks: alloc::vec::Vec<u32> = if maps_data {
            let state = inode.read_state();
            state.data[..super::structs::DIRECT_BLOCKS]
                .iter()
                .map(|slot| slot.get())
                .filter(|&b| b != 0)
                .collect()
        } else {
            alloc::vec::Vec::new()
        };
        for block in blocks {
            let buf = self.cache().read(block).await?;
            if buf.is_dirty() {
                self.cache().write_buf(&buf).await?;
            }
        }
        self.write_inode(inode, true).await
    }
}
