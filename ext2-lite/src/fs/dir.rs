//! Directory entry layout and mutation.
//!
//! Directory content is a sequence of chunks, each one filesystem block.
//! A chunk holds variable-length records:
//!
//! ```text
//! +--------+--------+--------+-----+--------+
//! | entry0 | entry1 | entry2 | ... | entryN |
//! +--------+--------+--------+-----+--------+
//! ```
//!
//! Each record is an 8-byte header plus the name, padded so `rec_len` is
//! 4-byte aligned. The last record's `rec_len` reaches the chunk end, and
//! no record crosses a chunk boundary. A record with a zero inode is a
//! tombstone whose space can be reused.
//!
//! Every chunk is verified once per cache residence before use. Mutations
//! follow prepare, edit, commit: the chunk buffer is locked, edited in
//! place, marked dirty, and the directory's version token is bumped so
//! concurrent readers re-align their position.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use zerocopy::FromBytes;

use super::inode::Ext2Inode;
use super::structs::*;
use super::Ext2Fs;
use crate::cache::BlockBuf;
use crate::error::FsError;

/// One `readdir` entry. The type tag is written as zero on disk and is
/// not decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub ino: u32,
}

/// Resumable `readdir` position: a byte offset into the directory file
/// plus the directory version it was valid against.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReaddirCursor {
    pub pos: u64,
    version: u64,
}

impl ReaddirCursor {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Location of a directory entry found by a scan.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DirSlot {
    pub chunk: u32,
    pub offset: usize,
    pub ino: u32,
}

/// Write a complete entry at `pos`. The caller has sized `rec_len`.
fn write_dir_entry(data: &mut [u8], pos: usize, ino: u32, rec_len: u16, name: &[u8]) {
    data[pos..pos + 4].copy_from_slice(&ino.to_le_bytes());
    data[pos + 4..pos + 6].copy_from_slice(&rec_len.to_le_bytes());
    data[pos + 6] = name.len() as u8;
    data[pos + 7] = 0;
    data[pos + 8..pos + 8 + name.len()].copy_from_slice(name);
    // Zero the alignment padding so old name bytes never leak to disk.
    let padded = pos + dir_rec_len(name.len());
    data[pos + 8 + name.len()..padded.min(pos + rec_len as usize)].fill(0);
}

fn read_header(data: &[u8], pos: usize) -> Result<DirEntryHeader, FsError> {
    DirEntryHeader::ref_from_prefix(&data[pos..])
        .map(|(h, _)| *h)
        .map_err(|_| FsError::Corrupted)
}

impl Ext2Fs {
    /// Number of chunks in a directory file.
    fn dir_chunks(&self, dir: &Arc<Ext2Inode>) -> u32 {
        (dir.size() / self.geometry().block_size as u64) as u32
    }

    /// Fetch a directory chunk, verifying its record layout the first
    /// time the buffer is consulted.
    pub(crate) async fn dir_chunk(
        &self,
        dir: &Arc<Ext2Inode>,
        chunk: u32,
    ) -> Result<Arc<BlockBuf>, FsError> {
        let mapped = self.get_blocks(dir, chunk, false).await?;
        let Some((block, _)) = mapped else {
            return Err(self.fs_error(
                "dir_chunk",
                &format!("directory inode {} has a hole at chunk {chunk}", dir.ino()),
            ));
        };
        let buf = self.cache().read(block).await?;
        if !buf.is_checked() {
            {
                let data = buf.lock_data();
                self.check_chunk(dir.ino(), chunk, &data)?;
            }
            buf.set_checked();
        }
        Ok(buf)
    }

    /// Enforce the chunk discipline: records chain from offset 0 to
    /// exactly the chunk end, every `rec_len` is 4-byte aligned, at least
    /// the minimum record, large enough for its own name, and confined to
    /// the chunk.
    fn check_chunk(&self, dir_ino: u32, chunk: u32, data: &[u8]) -> Result<(), FsError> {
        let chunk_size = self.geometry().block_size as usize;
        let bad = |pos: usize, why: &str| {
            self.fs_error(
                "check_chunk",
                &format!("directory inode {dir_ino} chunk {chunk} offset {pos}: {why}"),
            )
        };
        let mut pos = 0;
        while pos < chunk_size {
            if pos + DIR_ENTRY_HEADER_SIZE > chunk_size {
                return Err(bad(pos, "header crosses the chunk end"));
            }
            let header = read_header(data, pos)?;
            let rec_len = header.rec_len.get() as usize;
            if rec_len < dir_rec_len(1) {
                return Err(bad(pos, "record shorter than the minimum"));
            }
            if rec_len % 4 != 0 {
                return Err(bad(pos, "record length not 4-byte aligned"));
            }
            if rec_len < dir_rec_len(header.name_len as usize) {
                return Err(bad(pos, "record shorter than its own name"));
            }
            if pos + rec_len > chunk_size {
                return Err(bad(pos, "record crosses the chunk end"));
            }
            if header.inode.get() > self.geometry().inodes_count {
                return Err(bad(pos, "entry references an inode out of range"));
            }
            pos += rec_len;
        }
        Ok(())
    }

    /// Find the entry named `name`. The scan matches on length and bytes
    /// and skips tombstones.
    pub(crate) async fn find_entry(
        &self,
        dir: &Arc<Ext2Inode>,
        name: &[u8],
    ) -> Result<Option<DirSlot>, FsError> {
        let chunk_size = self.geometry().block_size as usize;
        for chunk in 0..self.dir_chunks(dir) {
            let buf = self.dir_chunk(dir, chunk).await?;
            let data = buf.lock_data();
            let mut pos = 0;
            while pos < chunk_size {
                let header = read_header(&data, pos)?;
                let rec_len = header.rec_len.get() as usize;
                if rec_len == 0 {
                    drop(data);
                    return Err(self.fs_error(
                        "find_entry",
                        &format!("zero-length record in directory inode {}", dir.ino()),
                    ));
                }
                if header.inode.get() != 0
                    && header.name_len as usize == name.len()
                    && &data[pos + DIR_ENTRY_HEADER_SIZE..pos + DIR_ENTRY_HEADER_SIZE + name.len()]
                        == name
                {
                    return Ok(Some(DirSlot {
                        chunk,
                        offset: pos,
                        ino: header.inode.get(),
                    }));
                }
                pos += rec_len;
            }
        }
        Ok(None)
    }

    /// Look a name up and return just the inode number.
    pub async fn inode_by_name(
        &self,
        dir: &Arc<Ext2Inode>,
        name: &str,
    ) -> Result<Option<u32>, FsError> {
        if !dir.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if name.len() > NAME_LEN {
            return Err(FsError::NameTooLong);
        }
        Ok(self.find_entry(dir, name.as_bytes()).await?.map(|s| s.ino))
    }

    /// The `..` entry: the second record of the first chunk.
    pub(crate) async fn dotdot(&self, dir: &Arc<Ext2Inode>) -> Result<DirSlot, FsError> {
        let buf = self.dir_chunk(dir, 0).await?;
        let data = buf.lock_data();
        let first = read_header(&data, 0)?;
        let pos = first.rec_len.get() as usize;
        let second = read_header(&data, pos)?;
        if second.name_len != 2 || &data[pos + DIR_ENTRY_HEADER_SIZE..pos + 10] != b".." {
            drop(data);
            return Err(self.fs_error(
                "dotdot",
                &format!("directory inode {} lacks a `..` entry", dir.ino()),
            ));
        }
        Ok(DirSlot {
            chunk: 0,
            offset: pos,
            ino: second.inode.get(),
        })
    }

    /// Mark a chunk mutation complete: schedule write-back and let
    /// concurrent readers know entries may have moved.
    fn commit_chunk(&self, dir: &Arc<Ext2Inode>, buf: &Arc<BlockBuf>) {
        buf.mark_dirty();
        dir.bump_version();
    }

    /// Touch the directory's times after a mutation and push its record
    /// out through the cache.
    async fn touch_dir(&self, dir: &Arc<Ext2Inode>) -> Result<(), FsError> {
        let now = self.now();
        {
            let mut state = dir.lock_state();
            state.mtime = now;
            state.ctime = now;
            state.dirty = true;
        }
        self.write_inode(dir, false).await
    }

    /// Insert an entry for `ino` under `name`.
    ///
    /// Walks the chunks looking for a tombstone large enough or an active
    /// record with enough slack to split; a full directory grows by one
    /// whole chunk. A name collision found along the way fails with
    /// [`FsError::AlreadyExists`].
    pub(crate) async fn add_link(
        &self,
        dir: &Arc<Ext2Inode>,
        name: &[u8],
        ino: u32,
    ) -> Result<(), FsError> {
        self.ensure_writable()?;
        if name.is_empty() {
            return Err(FsError::InvalidInput);
        }
        if name.len() > NAME_LEN {
            return Err(FsError::NameTooLong);
        }

        let chunk_size = self.geometry().block_size as usize;
        let needed = dir_rec_len(name.len());
        let chunks = self.dir_chunks(dir);

        for chunk in 0..=chunks {
            let buf = if chunk == chunks {
                // Every existing chunk is packed: grow the directory and
                // seed the fresh chunk with one tombstone covering it.
                let Some((block, _new)) = self.get_blocks(dir, chunk, true).await? else {
                    return Err(FsError::Io);
                };
                let buf = self.cache().get_zeroed(block);
                {
                    let mut data = buf.lock_data();
                    write_dir_entry(&mut data, 0, 0, chunk_size as u16, b"");
                }
                buf.set_checked();
                {
                    let mut state = dir.lock_state();
                    state.size += chunk_size as u32;
                    state.dirty = true;
                }
                buf
            } else {
                self.dir_chunk(dir, chunk).await?
            };

            enum Fit {
                Tombstone(usize),
                Split(usize),
            }

            let fit = {
                let data = buf.lock_data();
                let mut fit = None;
                let mut pos = 0;
                while pos < chunk_size {
                    let header = read_header(&data, pos)?;
                    let rec_len = header.rec_len.get() as usize;
                    if rec_len == 0 {
                        drop(data);
                        return Err(self.fs_error(
                            "add_link",
                            &format!("zero-length record in directory inode {}", dir.ino()),
                        ));
                    }
                    if header.inode.get() != 0 {
                        if header.name_len as usize == name.len()
                            && &data
                                [pos + DIR_ENTRY_HEADER_SIZE..pos + DIR_ENTRY_HEADER_SIZE + name.len()]
                                == name
                        {
                            return Err(FsError::AlreadyExists);
                        }
                        let used = dir_rec_len(header.name_len as usize);
                        if fit.is_none() && rec_len - used >= needed {
                            fit = Some(Fit::Split(pos));
                        }
                    } else if fit.is_none() && rec_len >= needed {
                        fit = Some(Fit::Tombstone(pos));
                    }
                    pos += rec_len;
                }
                fit
            };

            let Some(fit) = fit else {
                continue;
            };

            {
                let mut data = buf.lock_data();
                match fit {
                    Fit::Tombstone(pos) => {
                        let rec_len = read_header(&data, pos)?.rec_len.get();
                        write_dir_entry(&mut data, pos, ino, rec_len, name);
                    }
                    Fit::Split(pos) => {
                        let header = read_header(&data, pos)?;
                        let old_len = header.rec_len.get() as usize;
                        let used = dir_rec_len(header.name_len as usize);
                        data[pos + 4..pos + 6].copy_from_slice(&(used as u16).to_le_bytes());
                        write_dir_entry(&mut data, pos + used, ino, (old_len - used) as u16, name);
                    }
                }
            }
            self.commit_chunk(dir, &buf);
            return self.touch_dir(dir).await;
        }

        // The final pass inserts into the freshly grown chunk.
        Err(FsError::NoSpace)
    }

    /// Remove the entry at `slot`, absorbing its bytes into the previous
    /// record when one exists, and tombstoning it either way.
    pub(crate) async fn delete_entry(
        &self,
        dir: &Arc<Ext2Inode>,
        slot: DirSlot,
    ) -> Result<(), FsError> {
        self.ensure_writable()?;
        let buf = self.dir_chunk(dir, slot.chunk).await?;
        {
            let mut data = buf.lock_data();
            let mut pos = 0;
            let mut prev: Option<usize> = None;
            while pos < slot.offset {
                let header = read_header(&data, pos)?;
                let rec_len = header.rec_len.get() as usize;
                if rec_len == 0 {
                    drop(data);
                    return Err(self.fs_error(
                        "delete_entry",
                        &format!("zero-length record in directory inode {}", dir.ino()),
                    ));
                }
                prev = Some(pos);
                pos += rec_len;
            }
            if pos != slot.offset {
                drop(data);
                return Err(self.fs_error(
                    "delete_entry",
                    &format!(
                        "offset {} in directory inode {} is not a record boundary",
                        slot.offset,
                        dir.ino()
                    ),
                ));
            }
            let removed_len = read_header(&data, slot.offset)?.rec_len.get();
            if let Some(prev_pos) = prev {
                let prev_len = read_header(&data, prev_pos)?.rec_len.get();
                data[prev_pos + 4..prev_pos + 6]
                    .copy_from_slice(&(prev_len + removed_len).to_le_bytes());
            }
            data[slot.offset..slot.offset + 4].fill(0);
        }
        self.commit_chunk(dir, &buf);
        self.touch_dir(dir).await
    }

    /// Point an existing entry at a different inode.
    pub(crate) async fn set_link(
        &self,
        dir: &Arc<Ext2Inode>,
        slot: DirSlot,
        new_ino: u32,
        update_times: bool,
    ) -> Result<(), FsError> {
        self.ensure_writable()?;
        let buf = self.dir_chunk(dir, slot.chunk).await?;
        {
            let mut data = buf.lock_data();
            data[slot.offset..slot.offset + 4].copy_from_slice(&new_ino.to_le_bytes());
            data[slot.offset + 7] = 0;
        }
        self.commit_chunk(dir, &buf);
        if update_times {
            self.touch_dir(dir).await?;
        }
        Ok(())
    }

    /// Lay out a brand new directory: one chunk holding `.` and `..`.
    pub(crate) async fn make_empty(
        &self,
        dir: &Arc<Ext2Inode>,
        parent: &Arc<Ext2Inode>,
    ) -> Result<(), FsError> {
        self.ensure_writable()?;
        let chunk_size = self.geometry().block_size as usize;
        let Some((block, _new)) = self.get_blocks(dir, 0, true).await? else {
            return Err(FsError::Io);
        };
        let buf = self.cache().get_zeroed(block);
        {
            let mut data = buf.lock_data();
            let dot_len = dir_rec_len(1);
            write_dir_entry(&mut data, 0, dir.ino(), dot_len as u16, b".");
            write_dir_entry(
                &mut data,
                dot_len,
                parent.ino(),
                (chunk_size - dot_len) as u16,
                b"..",
            );
        }
        buf.set_checked();
        {
            let mut state = dir.lock_state();
            state.size = chunk_size as u32;
            state.dirty = true;
        }
        self.commit_chunk(dir, &buf);
        self.write_inode(dir, false).await
    }

    /// Whether the directory holds nothing but `.` and `..`.
    pub(crate) async fn empty_dir(&self, dir: &Arc<Ext2Inode>) -> Result<bool, FsError> {
        let chunk_size = self.geometry().block_size as usize;
        for chunk in 0..self.dir_chunks(dir) {
            let buf = self.dir_chunk(dir, chunk).await?;
            let data = buf.lock_data();
            let mut pos = 0;
            while pos < chunk_size {
                let header = read_header(&data, pos)?;
                let rec_len = header.rec_len.get() as usize;
                if rec_len == 0 {
                    drop(data);
                    return Err(self.fs_error(
                        "empty_dir",
                        &format!("zero-length record in directory inode {}", dir.ino()),
                    ));
                }
                if header.inode.get() != 0 {
                    let name =
                        &data[pos + DIR_ENTRY_HEADER_SIZE..pos + DIR_ENTRY_HEADER_SIZE + header.name_len as usize];
                    match name {
                        b"." => {
                            if header.inode.get() != dir.ino() {
                                return Ok(false);
                            }
                        }
                        b".." => {}
                        _ => return Ok(false),
                    }
                }
                pos += rec_len;
            }
        }
        Ok(true)
    }

    /// Emit the live entries of one chunk, advancing the cursor to the
    /// next. An empty result means the end of the directory.
    ///
    /// When the directory changed since the cursor was last used, the
    /// resume offset is re-aligned to the start of a valid record by
    /// walking the chunk from its beginning.
    pub async fn readdir(
        &self,
        dir: &Arc<Ext2Inode>,
        cursor: &mut ReaddirCursor,
    ) -> Result<Vec<DirEntryInfo>, FsError> {
        if !dir.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let chunk_size = self.geometry().block_size as u64;
        if cursor.pos >= dir.size() {
            return Ok(Vec::new());
        }

        let chunk = (cursor.pos / chunk_size) as u32;
        let buf = self.dir_chunk(dir, chunk).await?;
        let version = dir.version();

        let entries = {
            let data = buf.lock_data();
            let mut start = (cursor.pos % chunk_size) as usize;
            if start != 0 && cursor.version != version {
                start = self.realign_offset(dir.ino(), &data, start)?;
            }

            let mut out = Vec::new();
            let mut pos = start;
            while pos < chunk_size as usize {
                let header = read_header(&data, pos)?;
                let rec_len = header.rec_len.get() as usize;
                if rec_len == 0 {
                    drop(data);
                    return Err(self.fs_error(
                        "readdir",
                        &format!("zero-length record in directory inode {}", dir.ino()),
                    ));
                }
                if header.inode.get() != 0 {
                    let name = &data
                        [pos + DIR_ENTRY_HEADER_SIZE..pos + DIR_ENTRY_HEADER_SIZE + header.name_len as usize];
                    out.push(DirEntryInfo {
                        name: String::from_utf8_lossy(name).into_owned(),
                        ino: header.inode.get(),
                    });
                }
                pos += rec_len;
            }
            out
        };

        cursor.pos = (chunk as u64 + 1) * chunk_size;
        cursor.version = version;
        Ok(entries)
    }

    /// Walk a chunk from its start, summing record lengths, and return
    /// the start of the record containing `target`.
    fn realign_offset(
        &self,
        dir_ino: u32,
        data: &[u8],
        target: usize,
    ) -> Result<usize, FsError> {
        let mut pos = 0;
        while pos < target {
            let header = read_header(data, pos)?;
            let rec_len = header.rec_len.get() as usize;
            if rec_len == 0 {
                return Err(self.fs_error(
                    "readdir",
                    &format!("zero-length record in directory inode {dir_ino}"),
                ));
            }
            if pos + rec_len > target {
                break;
            }
            pos += rec_len;
        }
        Ok(pos)
    }
}
