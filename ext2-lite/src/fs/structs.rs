//! On-disk structures.
//!
//! These structures match the classical second-extended-filesystem layout.
//! Every multi-byte integer is little-endian on disk; the structs use
//! explicit little-endian field types so they can be overlaid on raw block
//! bytes at any offset and copied out verbatim.

use zerocopy::little_endian as le;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Superblock magic number.
pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;

/// Root directory inode number.
pub const ROOT_INO: u32 = 2;

/// Superblock offset from the start of the device, in bytes.
pub const SUPERBLOCK_OFFSET: u64 = 1024;

/// Superblock state bit: cleanly unmounted.
pub const STATE_VALID_FS: u16 = 0x0001;
/// Superblock state bit: errors were detected.
pub const STATE_ERROR_FS: u16 = 0x0002;

/// On-error policy: keep going.
pub const ERRORS_CONTINUE: u16 = 1;
/// On-error policy: flip the mount read-only.
pub const ERRORS_RO: u16 = 2;
/// On-error policy: panic.
pub const ERRORS_PANIC: u16 = 3;

/// Original revision: fixed inode size and first non-reserved inode.
pub const GOOD_OLD_REV: u32 = 0;
/// Revision with variable inode size, read from the superblock.
pub const DYNAMIC_REV: u32 = 1;
/// Inode size under [`GOOD_OLD_REV`].
pub const GOOD_OLD_INODE_SIZE: u32 = 128;
/// First non-reserved inode under [`GOOD_OLD_REV`].
pub const GOOD_OLD_FIRST_INO: u32 = 11;

/// Maximum directory entry name length.
pub const NAME_LEN: usize = 255;

/// Number of block-number slots in an inode.
pub const DATA_SLOTS: usize = 15;
/// Slots that map file data directly. The remaining slots are never
/// consulted for block mapping.
pub const DIRECT_BLOCKS: usize = 12;
/// A symlink target of at most this many bytes is stored inside the
/// inode's slot array instead of a data block.
pub const SYMLINK_INLINE_MAX: usize = DATA_SLOTS * 4;

// Inode mode bits.
pub const S_IFMT: u16 = 0xF000;
pub const S_IFSOCK: u16 = 0xC000;
pub const S_IFLNK: u16 = 0xA000;
pub const S_IFREG: u16 = 0x8000;
pub const S_IFBLK: u16 = 0x6000;
pub const S_IFDIR: u16 = 0x4000;
pub const S_IFCHR: u16 = 0x2000;
pub const S_IFIFO: u16 = 0x1000;
pub const S_ISGID: u16 = 0x0400;

/// Inode flag: writes to this inode must reach the device synchronously.
pub const FL_SYNC: u32 = 0x0000_0008;

/// The superblock, located at byte offset 1024 from the start of the
/// device regardless of block size.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct Superblock {
    /// Total number of inodes.
    pub inodes_count: le::U32,
    /// Total number of blocks, including all metadata.
    pub blocks_count: le::U32,
    /// Blocks reserved for the superuser.
    pub reserved_blocks_count: le::U32,
    /// Free block count. A hint; the group descriptors are authoritative.
    pub free_blocks_count: le::U32,
    /// Free inode count. A hint, as above.
    pub free_inodes_count: le::U32,
    /// Block number holding the superblock (1 for 1 KiB blocks, 0 otherwise).
    pub first_data_block: le::U32,
    /// Block size is `1024 << log_block_size`.
    pub log_block_size: le::U32,
    /// Fragment size (obsolete; tracks block size).
    pub log_frag_size: le::U32,
    /// Blocks per block group.
    pub blocks_per_group: le::U32,
    /// Fragments per group (obsolete).
    pub frags_per_group: le::U32,
    /// Inodes per block group.
    pub inodes_per_group: le::U32,
    /// Last mount time.
    pub mtime: le::U32,
    /// Last write time.
    pub wtime: le::U32,
    /// Mounts since the last check.
    pub mnt_count: le::U16,
    /// Mounts allowed before a check is due.
    pub max_mnt_count: le::U16,
    /// Magic number, [`EXT2_SUPER_MAGIC`].
    pub magic: le::U16,
    /// State bits, [`STATE_VALID_FS`] and [`STATE_ERROR_FS`].
    pub state: le::U16,
    /// Default on-error policy.
    pub errors: le::U16,
    /// Minor revision level.
    pub minor_rev_level: le::U16,
    /// Time of the last check.
    pub lastcheck: le::U32,
    /// Maximum interval between checks.
    pub checkinterval: le::U32,
    /// Creator operating system.
    pub creator_os: le::U32,
    /// Revision level.
    pub rev_level: le::U32,
    /// Default uid for reserved blocks.
    pub def_resuid: le::U16,
    /// Default gid for reserved blocks.
    pub def_resgid: le::U16,
    // Fields below are valid when `rev_level` >= DYNAMIC_REV.
    /// First non-reserved inode.
    pub first_ino: le::U32,
    /// Size of an on-disk inode record.
    pub inode_size: le::U16,
    /// Group number of the group hosting this superblock copy.
    pub block_group_nr: le::U16,
    /// Compatible feature set.
    pub feature_compat: le::U32,
    /// Incompatible feature set.
    pub feature_incompat: le::U32,
    /// Read-only compatible feature set.
    pub feature_ro_compat: le::U32,
    /// Volume UUID.
    pub uuid: [u8; 16],
    /// Volume name.
    pub volume_name: [u8; 16],
    /// Last mount point.
    pub last_mounted: [u8; 64],
    /// Compression algorithm bitmap.
    pub algo_bitmap: le::U32,
    pub _padding: [u8; 820],
}

const _: () = assert!(core::mem::size_of::<Superblock>() == 1024);

impl Superblock {
    /// Largest supported `log_block_size` (2, a 4 KiB block).
    pub const MAX_LOG_BLOCK_SIZE: u32 = 2;

    /// Block size in bytes, or `None` when out of the supported range.
    pub fn block_size(&self) -> Option<u32> {
        let log = self.log_block_size.get();
        if log > Self::MAX_LOG_BLOCK_SIZE {
            return None;
        }
        Some(1024 << log)
    }

    /// Inode record size, fixed for revision 0 and read from the
    /// superblock for revision 1.
    pub fn inode_size(&self) -> u32 {
        if self.rev_level.get() >= DYNAMIC_REV {
            self.inode_size.get() as u32
        } else {
            GOOD_OLD_INODE_SIZE
        }
    }

    /// First inode number available for allocation.
    pub fn first_ino(&self) -> u32 {
        if self.rev_level.get() >= DYNAMIC_REV {
            self.first_ino.get()
        } else {
            GOOD_OLD_FIRST_INO
        }
    }

    /// Number of block groups.
    pub fn group_count(&self) -> Option<u32> {
        let bpg = self.blocks_per_group.get();
        if bpg == 0 {
            return None;
        }
        let data_blocks = self
            .blocks_count
            .get()
            .checked_sub(self.first_data_block.get())?;
        Some(data_blocks.div_ceil(bpg))
    }

    /// Check the fields a mount depends on. Feature bits are checked
    /// separately because their failure is "unsupported", not "corrupt".
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.magic.get() != EXT2_SUPER_MAGIC {
            return Err("bad magic number");
        }
        if self.log_block_size.get() > Self::MAX_LOG_BLOCK_SIZE {
            return Err("block size out of supported range");
        }
        if self.blocks_count.get() == 0 {
            return Err("blocks_count is zero");
        }
        if self.inodes_count.get() == 0 {
            return Err("inodes_count is zero");
        }
        if self.blocks_per_group.get() == 0 {
            return Err("blocks_per_group is zero");
        }
        if self.inodes_per_group.get() == 0 {
            return Err("inodes_per_group is zero");
        }
        let block_size = 1024u32 << self.log_block_size.get();
        if self.blocks_per_group.get() > block_size * 8 {
            return Err("block bitmap does not fit in one block");
        }
        if self.inodes_per_group.get() > block_size * 8 {
            return Err("inode bitmap does not fit in one block");
        }
        let inode_size = self.inode_size();
        if inode_size < GOOD_OLD_INODE_SIZE
            || !inode_size.is_power_of_two()
            || inode_size > block_size
        {
            return Err("inode_size out of range");
        }
        if self.inodes_per_group.get() % (block_size / inode_size) != 0 {
            return Err("inode table does not fill whole blocks");
        }
        Ok(())
    }

    /// Mask of feature bits the engine cannot honour. Any advertised
    /// feature is unsupported here.
    pub fn unsupported_features(&self) -> u32 {
        self.feature_compat.get() | self.feature_incompat.get() | self.feature_ro_compat.get()
    }
}

/// Per-group metadata record, packed into the group descriptor table
/// immediately after the superblock and its backups.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct GroupDescriptor {
    /// Block number of the group's block bitmap.
    pub block_bitmap: le::U32,
    /// Block number of the group's inode bitmap.
    pub inode_bitmap: le::U32,
    /// First block of the group's inode table.
    pub inode_table: le::U32,
    /// Free blocks in this group.
    pub free_blocks_count: le::U16,
    /// Free inodes in this group.
    pub free_inodes_count: le::U16,
    /// Allocated inodes in this group whose mode is directory.
    pub used_dirs_count: le::U16,
    pub _pad: le::U16,
    pub _reserved: [u8; 12],
}

pub const DESC_SIZE: usize = core::mem::size_of::<GroupDescriptor>();
const _: () = assert!(DESC_SIZE == 32);

/// On-disk inode record. The record may be larger on disk (revision 1
/// allows any power of two up to the block size); the trailing bytes are
/// not interpreted.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct RawInode {
    /// Type and permission bits.
    pub mode: le::U16,
    /// Owner uid (low 16 bits).
    pub uid: le::U16,
    /// Size in bytes.
    pub size: le::U32,
    /// Access time.
    pub atime: le::U32,
    /// Inode change time.
    pub ctime: le::U32,
    /// Modification time.
    pub mtime: le::U32,
    /// Deletion time, zero while the inode is live.
    pub dtime: le::U32,
    /// Owner gid (low 16 bits).
    pub gid: le::U16,
    /// Number of directory entries referencing this inode.
    pub links_count: le::U16,
    /// Allocated storage in 512-byte sectors.
    pub blocks: le::U32,
    /// Behaviour flags.
    pub flags: le::U32,
    pub osd1: le::U32,
    /// Block-number slots. The first [`DIRECT_BLOCKS`] map data directly;
    /// fast symlinks store their target bytes across the whole array, and
    /// device inodes keep their encoding in slots 0 and 1.
    pub block: [le::U32; DATA_SLOTS],
    /// Generation number.
    pub generation: le::U32,
    pub file_acl: le::U32,
    pub dir_acl: le::U32,
    pub faddr: le::U32,
    pub osd2: [u8; 12],
}

const _: () = assert!(core::mem::size_of::<RawInode>() == 128);

impl RawInode {
    pub fn is_dir(&self) -> bool {
        self.mode.get() & S_IFMT == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.mode.get() & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode.get() & S_IFMT == S_IFLNK
    }
}

/// Fixed header of a directory entry. `name_len` bytes of name follow,
/// then padding up to `rec_len`, which is 4-byte aligned and never crosses
/// a chunk (block) boundary.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct DirEntryHeader {
    /// Referenced inode number. Zero marks a tombstone whose space can be
    /// reused.
    pub inode: le::U32,
    /// Total record length, header + name + padding.
    pub rec_len: le::U16,
    /// Length of the name in bytes.
    pub name_len: u8,
    /// File type tag. Written as zero; readers tolerate any value.
    pub file_type: u8,
}

/// Size of [`DirEntryHeader`].
pub const DIR_ENTRY_HEADER_SIZE: usize = 8;
const _: () = assert!(core::mem::size_of::<DirEntryHeader>() == DIR_ENTRY_HEADER_SIZE);

/// Align a value up to a 4-byte boundary.
pub const fn align4(val: usize) -> usize {
    (val + 3) & !3
}

/// On-disk size of a directory entry with a name of `name_len` bytes.
pub const fn dir_rec_len(name_len: usize) -> usize {
    align4(DIR_ENTRY_HEADER_SIZE + name_len)
}

/// A device identifier split into its major and minor halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId {
    pub major: u32,
    pub minor: u32,
}

impl DeviceId {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Whether the id fits the 16-bit encoding stored in slot 0.
    pub fn fits_old_encoding(&self) -> bool {
        self.major < 256 && self.minor < 256
    }

    /// 16-bit encoding: `major` in the high byte, `minor` in the low.
    pub fn encode_old(&self) -> u32 {
        (self.major << 8) | self.minor
    }

    /// 32-bit encoding: low byte of `minor`, then 12 bits of `major`,
    /// then the high bits of `minor`.
    pub fn encode_new(&self) -> u32 {
        (self.minor & 0xFF) | (self.major << 8) | ((self.minor & !0xFF) << 12)
    }

    pub fn decode_old(raw: u32) -> Self {
        Self {
            major: (raw >> 8) & 0xFF,
            minor: raw & 0xFF,
        }
    }

    pub fn decode_new(raw: u32) -> Self {
        Self {
            major: (raw >> 8) & 0xFFF,
            minor: (raw & 0xFF) | ((raw >> 12) & !0xFF),
        }
    }
}
