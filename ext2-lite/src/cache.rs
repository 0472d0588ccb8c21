//! Block buffer cache.
//!
//! Every on-disk structure is read and mutated through fixed-size block
//! buffers held in this cache. A buffer tracks whether its contents are
//! up to date with the device, whether it carries modifications that have
//! not been written back, and whether the last write-back attempt failed.
//! Write-back is explicit: callers mark buffers dirty and [`BlockCache::sync`]
//! pushes every dirty buffer to the device.
//!
//! ## Locking
//!
//! The buffer map and each buffer's payload sit behind spinlocks. Locks are
//! never held across device I/O; a read populates a buffer after releasing
//! the map lock, so two tasks racing on the same missing block may both
//! issue the read. The second read stores identical bytes, which is
//! harmless for a single mounted instance.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spinning_top::Spinlock;
use spinning_top::guard::SpinlockGuard;

use crate::device::BlockDevice;
use crate::error::FsError;

/// A cached disk block.
pub struct BlockBuf {
    bno: u32,
    data: Spinlock<Vec<u8>>,
    uptodate: AtomicBool,
    dirty: AtomicBool,
    /// Set once the directory engine has verified this buffer's record
    /// layout. Meaningless for non-directory blocks.
    checked: AtomicBool,
    /// Latched when a write-back of this buffer fails.
    write_error: AtomicBool,
}

impl BlockBuf {
    fn new(bno: u32, block_size: usize) -> Self {
        Self {
            bno,
            data: Spinlock::new(vec![0u8; block_size]),
            uptodate: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            checked: AtomicBool::new(false),
            write_error: AtomicBool::new(false),
        }
    }

    pub fn bno(&self) -> u32 {
        self.bno
    }

    /// Lock the payload for reading or mutation. Do not hold the guard
    /// across an await point.
    pub fn lock_data(&self) -> SpinlockGuard<'_, Vec<u8>> {
        self.data.lock()
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn is_checked(&self) -> bool {
        self.checked.load(Ordering::Acquire)
    }

    pub fn set_checked(&self) {
        self.checked.store(true, Ordering::Release);
    }

    pub fn had_write_error(&self) -> bool {
        self.write_error.load(Ordering::Acquire)
    }

    /// Clear the write-error latch and declare the contents valid again,
    /// so a retry can be issued.
    pub fn clear_write_error(&self) {
        self.write_error.store(false, Ordering::Release);
        self.uptodate.store(true, Ordering::Release);
    }
}

/// Cache of block-sized buffers over a [`BlockDevice`].
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    block_size: u32,
    bufs: Spinlock<BTreeMap<u32, Arc<BlockBuf>>>,
}

impl BlockCache {
    pub fn new(device: Arc<dyn BlockDevice>, block_size: u32) -> Self {
        Self {
            device,
            block_size,
            bufs: Spinlock::new(BTreeMap::new()),
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    fn lookup_or_insert(&self, bno: u32) -> Arc<BlockBuf> {
        let mut bufs = self.bufs.lock();
        bufs.entry(bno)
            .or_insert_with(|| Arc::new(BlockBuf::new(bno, self.block_size as usize)))
            .clone()
    }

    /// Get the buffer for `bno`, reading it from the device if it is not
    /// yet up to date.
    pub async fn read(&self, bno: u32) -> Result<Arc<BlockBuf>, FsError> {
        let buf = self.lookup_or_insert(bno);
        if !buf.uptodate.load(Ordering::Acquire) {
            let mut data = vec![0u8; self.block_size as usize];
            let offset = bno as u64 * self.block_size as u64;
            let n = self.device.read_at(offset, &mut data).await?;
            if n != self.block_size as usize {
                return Err(FsError::Io);
            }
            *buf.data.lock() = data;
            buf.uptodate.store(true, Ordering::Release);
        }
        Ok(buf)
    }

    /// Get the buffer for `bno` zero-filled and marked up to date, without
    /// touching the device. For blocks about to be written in full, such
    /// as freshly allocated directory chunks.
    pub fn get_zeroed(&self, bno: u32) -> Arc<BlockBuf> {
        let buf = self.lookup_or_insert(bno);
        buf.data.lock().fill(0);
        buf.uptodate.store(true, Ordering::Release);
        buf.checked.store(false, Ordering::Relaxed);
        buf
    }

    /// Drop a block from the cache. Pending modifications are discarded.
    pub fn forget(&self, bno: u32) {
        self.bufs.lock().remove(&bno);
    }

    /// Write one buffer to the device regardless of its dirty state,
    /// clearing the dirty flag on success and latching the write error
    /// on failure.
    pub async fn write_buf(&self, buf: &Arc<BlockBuf>) -> Result<(), FsError> {
        let data = buf.data.lock().clone();
        let offset = buf.bno as u64 * self.block_size as u64;
        match self.device.write_at(offset, &data).await {
            Ok(n) if n == data.len() => {
                buf.dirty.store(false, Ordering::Release);
                Ok(())
            }
            _ => {
                buf.write_error.store(true, Ordering::Release);
                Err(FsError::Io)
            }
        }
    }

    /// Write every dirty buffer back to the device, then flush the device.
    pub async fn sync(&self) -> Result<(), FsError> {
        let dirty: Vec<Arc<BlockBuf>> = {
            let bufs = self.bufs.lock();
            bufs.values().filter(|b| b.is_dirty()).cloned().collect()
        };
        for buf in dirty {
            self.write_buf(&buf).await?;
        }
        self.device.sync().await
    }

    /// Number of buffers currently carrying unwritten modifications.
    pub fn dirty_count(&self) -> usize {
        self.bufs.lock().values().filter(|b| b.is_dirty()).count()
    }
}
