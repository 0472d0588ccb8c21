//! Block allocation.
//!
//! Blocks are handed out from per-group bitmaps. Allocation starts at the
//! group the owning inode lives in and walks every group in order, taking
//! the first free bit and greedily extending the run for multi-block
//! requests. Frees validate the range against the filesystem limits and
//! the group's own metadata blocks before clearing bits.
//!
//! ## Locking
//!
//! Bit mutations and the descriptor free counts are guarded by the
//! per-group lock; the bitmap buffer's payload lock nests inside it. Two
//! group locks are never held at once. The shared free-block counter is
//! adjusted outside the lock and is only a hint.

use alloc::format;
use alloc::sync::Arc;

use super::{Ext2Fs, inode::Ext2Inode};
use crate::cache::BlockBuf;
use crate::error::FsError;

/// Find the first clear bit at or after `from`, scanning up to `max_bits`.
pub(super) fn find_next_zero_bit(bitmap: &[u8], max_bits: usize, from: usize) -> Option<usize> {
    let mut index = from;
    while index < max_bits {
        let byte = bitmap[index / 8];
        if byte == 0xFF {
            // Skip to the next byte boundary.
            index = (index / 8 + 1) * 8;
            continue;
        }
        if byte & (1 << (index % 8)) == 0 {
            return Some(index);
        }
        index += 1;
    }
    None
}

/// Test whether a bit is set.
pub(super) fn get_bit(bitmap: &[u8], index: usize) -> bool {
    bitmap[index / 8] & (1 << (index % 8)) != 0
}

/// Set a bit, returning its previous value.
pub(super) fn test_and_set_bit(bitmap: &mut [u8], index: usize) -> bool {
    let mask = 1 << (index % 8);
    let prev = bitmap[index / 8] & mask != 0;
    bitmap[index / 8] |= mask;
    prev
}

/// Clear a bit, returning its previous value.
pub(super) fn test_and_clear_bit(bitmap: &mut [u8], index: usize) -> bool {
    let mask = 1 << (index % 8);
    let prev = bitmap[index / 8] & mask != 0;
    bitmap[index / 8] &= !mask;
    prev
}

impl Ext2Fs {
    /// Load a group's block bitmap and verify that the bits covering the
    /// group's own metadata blocks are set. A clear bit there means the
    /// allocator could hand out a metadata block as data.
    pub(crate) async fn read_block_bitmap(&self, group: u32) -> Result<Arc<BlockBuf>, FsError> {
        let desc = self.read_group_desc(group)?;
        let buf = self.cache().read(desc.block_bitmap.get()).await?;
        let first = self.geometry().group_first_block(group);

        let mut meta_ok = {
            let data = buf.lock_data();
            get_bit(&data, (desc.block_bitmap.get() - first) as usize)
                && get_bit(&data, (desc.inode_bitmap.get() - first) as usize)
        };
        if meta_ok {
            let data = buf.lock_data();
            let table = desc.inode_table.get() - first;
            meta_ok = (0..self.geometry().itb_per_group)
                .all(|i| get_bit(&data, (table + i) as usize));
        }
        if !meta_ok {
            return Err(self.fs_error(
                "read_block_bitmap",
                &format!("group {group}: metadata blocks not marked in the block bitmap"),
            ));
        }
        Ok(buf)
    }

    /// Allocate up to `max` contiguous blocks for `inode`.
    ///
    /// Returns the first block number and the number of blocks taken,
    /// which is at least 1. The search starts in the inode's own group
    /// and wraps over all groups.
    pub async fn new_blocks(
        &self,
        inode: &Arc<Ext2Inode>,
        max: u32,
    ) -> Result<(u32, u32), FsError> {
        self.ensure_writable()?;
        if max == 0 {
            return Err(FsError::InvalidInput);
        }
        if self.free_blocks.read() == 0 {
            return Err(FsError::NoSpace);
        }

        let geom = *self.geometry();
        let start_group = inode.block_group % geom.groups;

        for pass in 0..geom.groups {
            let group = (start_group + pass) % geom.groups;
            if self.read_group_desc(group)?.free_blocks_count.get() == 0 {
                continue;
            }

            let bitmap = self.read_block_bitmap(group).await?;
            let bits = geom.blocks_in_group(group) as usize;

            let taken = {
                let _guard = self.group_lock(group).lock();
                let mut data = bitmap.lock_data();

                let mut taken = None;
                let mut from = 0;
                while let Some(bit) = find_next_zero_bit(&data, bits, from) {
                    if test_and_set_bit(&mut data, bit) {
                        // Lost the bit; continue from the next one.
                        from = bit + 1;
                        continue;
                    }
                    let mut count = 1u32;
                    while count < max
                        && bit + (count as usize) < bits
                        && !test_and_set_bit(&mut data, bit + count as usize)
                    {
                        count += 1;
                    }
                    taken = Some((bit, count));
                    break;
                }

                if let Some((_, count)) = taken {
                    self.update_group_desc(group, |d| {
                        let free = d.free_blocks_count.get();
                        d.free_blocks_count.set(free.saturating_sub(count as u16));
                    })?;
                }
                taken
            };

            let Some((bit, count)) = taken else {
                continue;
            };

            bitmap.mark_dirty();
            self.free_blocks.add(-(count as i64));

            let first_block = geom.group_first_block(group) + bit as u32;
            if self.debug_enabled() {
                log::debug!(
                    "ext2: allocated {count} block(s) at {first_block} in group {group} for inode {}",
                    inode.ino()
                );
            }
            return Ok((first_block, count));
        }

        Err(FsError::NoSpace)
    }

    /// Release `count` blocks starting at `block`.
    ///
    /// The range must lie inside one group's data area. Bits that are
    /// already clear are reported as corruption; the remaining bits are
    /// still freed. When `inode` is given, its sector count is reduced.
    pub async fn free_blocks(
        &self,
        inode: Option<&Arc<Ext2Inode>>,
        block: u32,
        count: u32,
    ) -> Result<(), FsError> {
        self.ensure_writable()?;
        if count == 0 {
            return Ok(());
        }

        let geom = *self.geometry();
        if block <= geom.first_data_block
            || block + count > geom.blocks_count
            || block + count < block
        {
            return Err(self.fs_error(
                "free_blocks",
                &format!("range [{block}, +{count}) outside the data area"),
            ));
        }

        let rel = block - geom.first_data_block;
        let group = rel / geom.blocks_per_group;
        let bit = (rel % geom.blocks_per_group) as usize;
        if bit as u32 + count > geom.blocks_in_group(group) {
            return Err(self.fs_error(
                "free_blocks",
                &format!("range [{block}, +{count}) crosses a group boundary"),
            ));
        }

        // Refuse to clear the group's reserved metadata blocks.
        let desc = self.read_group_desc(group)?;
        let first = geom.group_first_block(group);
        let end = block + count;
        let overlaps = |lo: u32, hi: u32| block < hi && end > lo;
        if overlaps(first, first + 1 + geom.gdb_count)
            || overlaps(desc.block_bitmap.get(), desc.block_bitmap.get() + 1)
            || overlaps(desc.inode_bitmap.get(), desc.inode_bitmap.get() + 1)
            || overlaps(
                desc.inode_table.get(),
                desc.inode_table.get() + geom.itb_per_group,
            )
        {
            return Err(self.fs_error(
                "free_blocks",
                &format!("range [{block}, +{count}) covers system blocks of group {group}"),
            ));
        }

        let bitmap = self.read_block_bitmap(group).await?;
        let mut freed = 0u32;
        let mut already_clear = 0u32;
        {
            let _guard = self.group_lock(group).lock();
            let mut data = bitmap.lock_data();
            for i in 0..count as usize {
                if test_and_clear_bit(&mut data, bit + i) {
                    freed += 1;
                } else {
                    already_clear += 1;
                }
            }
            self.update_group_desc(group, |d| {
                let free = d.free_blocks_count.get();
                d.free_blocks_count.set(free + freed as u16);
            })?;
        }
        bitmap.mark_dirty();
        self.free_blocks.add(freed as i64);

        // Freed blocks must not survive in the cache with stale contents.
        for b in block..end {
            self.cache().forget(b);
        }

        if let Some(inode) = inode {
            let mut state = inode.lock_state();
            state.sectors = state
                .sectors
                .saturating_sub(freed * geom.sectors_per_block());
            state.dirty = true;
        }

        if already_clear > 0 {
            return Err(self.fs_error(
                "free_blocks",
                &format!("{already_clear} bit(s) in [{block}, +{count}) were already free"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_find_next_zero_bit_empty() {
        let bitmap = vec![0u8; 4];
        assert_eq!(find_next_zero_bit(&bitmap, 32, 0), Some(0));
        assert_eq!(find_next_zero_bit(&bitmap, 32, 31), Some(31));
        assert_eq!(find_next_zero_bit(&bitmap, 32, 32), None);
    }

    #[test]
    fn test_find_next_zero_bit_skips_full_bytes() {
        let bitmap = vec![0xFF, 0xFF, 0b0000_0111, 0x00];
        assert_eq!(find_next_zero_bit(&bitmap, 32, 0), Some(19));
    }

    #[test]
    fn test_find_next_zero_bit_respects_max() {
        let bitmap = vec![0xFF, 0x00];
        assert_eq!(find_next_zero_bit(&bitmap, 8, 0), None);
        assert_eq!(find_next_zero_bit(&bitmap, 9, 0), Some(8));
    }

    #[test]
    fn test_test_and_set_returns_previous() {
        let mut bitmap = vec![0u8; 2];
        assert!(!test_and_set_bit(&mut bitmap, 9));
        assert!(test_and_set_bit(&mut bitmap, 9));
        assert!(get_bit(&bitmap, 9));
        assert_eq!(bitmap[0], 0);
    }

    #[test]
    fn test_test_and_clear_returns_previous() {
        let mut bitmap = vec![0xFFu8; 2];
        assert!(test_and_clear_bit(&mut bitmap, 3));
        assert!(!test_and_clear_bit(&mut bitmap, 3));
        assert!(!get_bit(&bitmap, 3));
        assert_eq!(bitmap[1], 0xFF);
    }

    #[test]
    fn test_bit_ops_preserve_neighbours() {
        let mut bitmap = vec![0u8; 2];
        test_and_set_bit(&mut bitmap, 7);
        test_and_set_bit(&mut bitmap, 8);
        assert_eq!(bitmap[0], 0b1000_0000);
        assert_eq!(bitmap[1], 0b0000_0001);
        test_and_clear_bit(&mut bitmap, 7);
        assert_eq!(bitmap[0], 0);
        assert_eq!(bitmap[1], 0b0000_0001);
    }
}
