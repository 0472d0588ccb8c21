//! Filesystem error taxonomy.

/// Errors surfaced by the filesystem engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// No free block or inode available after exhaustive search.
    NoSpace,
    /// An on-disk structure violates an invariant. Reported through the
    /// mount's error policy before this is returned.
    Corrupted,
    /// A block read or write failed.
    Io,
    /// Directory lookup miss.
    NotFound,
    /// Name collision on insertion.
    AlreadyExists,
    /// Directory still has entries other than `.` and `..`.
    NotEmpty,
    /// The on-disk filesystem or the request needs a feature this engine
    /// does not implement.
    Unsupported,
    /// Malformed caller input (empty name, bad mount option, bad range).
    InvalidInput,
    /// The operation requires a directory.
    NotADirectory,
    /// The operation is not valid on a directory.
    IsADirectory,
    /// The filesystem is mounted (or was remounted) read-only.
    ReadOnly,
    /// A name or symlink target exceeds the on-disk limit.
    NameTooLong,
    /// The inode number refers to an inode that has been freed on disk.
    Stale,
}

impl core::fmt::Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            FsError::NoSpace => "no space left on device",
            FsError::Corrupted => "filesystem structure is corrupted",
            FsError::Io => "input/output error",
            FsError::NotFound => "no such file or directory",
            FsError::AlreadyExists => "file exists",
            FsError::NotEmpty => "directory not empty",
            FsError::Unsupported => "operation not supported",
            FsError::InvalidInput => "invalid argument",
            FsError::NotADirectory => "not a directory",
            FsError::IsADirectory => "is a directory",
            FsError::ReadOnly => "read-only filesystem",
            FsError::NameTooLong => "name too long",
            FsError::Stale => "stale inode reference",
        };
        f.write_str(s)
    }
}
