//! A second-extended-filesystem engine that operates directly on a block
//! device and exposes a UNIX-compatible file and directory hierarchy.
//!
//! The engine reads and writes the classical on-disk layout: a superblock
//! at byte 1024, a group descriptor table, per-group block and inode
//! bitmaps, per-group inode tables, and data blocks. Files are mapped
//! through direct block pointers only; there is no indirect mapping, no
//! journaling and no feature-flag support.
//!
//! ## Layering
//!
//! - [`device::BlockDevice`] is the async byte-addressed storage interface.
//!   [`device::RamDisk`] is an in-memory implementation for tests and
//!   embedders without real hardware.
//! - [`cache`] provides a block-sized buffer cache with dirty tracking and
//!   explicit write-back. All on-disk structures are read and mutated
//!   through it.
//! - [`fs::Ext2Fs`] is the mounted filesystem: superblock and group
//!   descriptor handling, block and inode allocators, the inode engine,
//!   the directory engine, and the namespace operations (create, lookup,
//!   link, unlink, symlink, mkdir, rmdir, mknod, rename).
//!
//! ## Concurrency
//!
//! A mounted instance may be shared between tasks. Superblock state sits
//! behind a spinlock, every block group has its own bitmap lock, and the
//! free-space counters are sharded approximations (the authoritative
//! counts live in the group descriptors). Mutations of a single directory
//! must be serialised by the caller, mirroring the usual per-inode locking
//! a VFS layer performs before invoking a filesystem.

#![no_std]

extern crate alloc;

pub mod cache;
pub mod clock;
pub mod counter;
pub mod device;
pub mod error;
pub mod fs;

pub use clock::{Clock, ManualClock};
pub use device::{BlockDevice, RamDisk};
pub use error::FsError;
pub use fs::{Credentials, Ext2Fs, MountOptions, Statfs};
