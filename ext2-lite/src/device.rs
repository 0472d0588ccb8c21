//! Block device interface for random-access storage.
//!
//! All block devices are async. Synchronous devices (like in-memory
//! buffers) simply return immediately-ready futures.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use async_trait::async_trait;
use spinning_top::Spinlock;

use crate::error::FsError;

/// Async block device interface for byte-level access.
///
/// Implementations handle sector alignment internally; callers address the
/// device by byte offset.
#[async_trait]
pub trait BlockDevice: Send + Sync {
    /// Read bytes at the given byte offset.
    ///
    /// Returns the number of bytes read. May return fewer bytes than
    /// requested at the device boundary.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError>;

    /// Write bytes at the given byte offset.
    ///
    /// Returns the number of bytes written.
    async fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, FsError> {
        let _ = (offset, buf);
        Err(FsError::ReadOnly)
    }

    /// Device size in bytes.
    fn size(&self) -> u64;

    /// Sector size in bytes.
    fn sector_size(&self) -> u32 {
        512
    }

    /// Flush any device-internal write buffers.
    async fn sync(&self) -> Result<(), FsError> {
        Ok(())
    }
}

/// An in-memory block device.
///
/// Backs the test suite and embedders that stage a disk image in RAM
/// before handing it to real storage.
pub struct RamDisk {
    data: Spinlock<Vec<u8>>,
}

impl RamDisk {
    /// Create a zero-filled disk of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            data: Spinlock::new(vec![0u8; size]),
        }
    }

    /// Wrap an existing image.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data: Spinlock::new(data),
        }
    }

    /// Copy out the full image, for inspection.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Mutate the raw image in place. Only sensible while no filesystem
    /// is mounted on top.
    pub fn patch(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.data.lock();
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

#[async_trait]
impl BlockDevice for RamDisk {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = core::cmp::min(buf.len(), data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    async fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, FsError> {
        let mut data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = core::cmp::min(buf.len(), data.len() - offset);
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }
}
