//! Crate-wide error taxonomy --- [`ErrorKind`].
//!
//! One variant per POSIX-ish condition, covering the taxonomy AVFS needs:
//! not-found/not-dir/exists/is-dir, permission, I/O, resource, argument,
//! loop, not-supported.

use std::fmt;

/// Result type used at every internal AVFS boundary.
pub type Result<T> = std::result::Result<T, ErrorKind>;

/// AVFS error kinds, following POSIX errno conventions at every internal
/// boundary. [`crate::posix`] is the only place these are
/// translated into `(rc, errno)` pairs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
pub enum ErrorKind {
    /// No such file or directory.
    NoEntry,
    /// Component of path is not a directory.
    NotDir,
    /// Target of a directory-only operation is a directory.
    IsDir,
    /// Target already exists (e.g. exclusive create, non-empty rename target).
    Exists,
    /// Directory is not empty (rmdir on a populated directory).
    NotEmpty,
    /// Caller does not have permission to perform this operation.
    Permission,
    /// A modifying operation was attempted on a read-only filesystem
    /// (archive-backed mounts are always read-only).
    ReadOnlyFs,
    /// Base-file read error, malformed compressed input, CRC mismatch,
    /// child-process failure, or timeout.
    IO,
    /// CRC-32 validation failed at decode EOF. Distinct from [`Self::IO`]
    /// since the decoded size is still recorded in `zcache` even on a
    /// mismatch --- callers that care about data integrity specifically
    /// want to distinguish this from a generic I/O fault.
    CrcMismatch,
    /// Out of memory. Conventionally this would be fatal; AVFS still
    /// returns it rather than aborting so callers embedding the library
    /// can decide.
    OutOfMemory,
    /// Disk cache temp area is full; caller should retry after an
    /// eviction pass.
    DiskFull,
    /// Bad argument: invalid flags, negative truncate, invalid seek whence.
    InvalidArgument,
    /// Symlink hop budget exhausted.
    Loop,
    /// Path segment count exceeded the internal tripwire (cap 1000).
    PathTooComplex,
    /// Name or path exceeded [`crate::vfs_limits::MAX_NAME_LEN`] or
    /// [`crate::vfs_limits::MAX_PATH_LEN`].
    NameTooLong,
    /// Handler does not implement this operation (defaults to `ENOSYS`).
    NotSupported,
    /// Handler or mount option string could not be parsed / handler name
    /// unknown to the registry.
    NoHandler,
    /// Attempt to access an object via a stale filecache/archive handle
    /// whose base file signature no longer matches;
    /// surfaced only when the automatic reparse itself fails.
    Stale,
    /// Child process (filter codec) exceeded its read timeout and was
    /// killed.
    Timeout,
    /// Catch-all for conditions that don't map to the taxonomy above.
    ServerFault,
}

impl ErrorKind {
    /// Best-effort mapping onto a libc errno, used by [`crate::posix`].
    pub fn to_errno(self) -> i32 {
        use ErrorKind::*;
        #[cfg(unix)]
        {
            match self {
                NoEntry => libc::ENOENT,
                NotDir => libc::ENOTDIR,
                IsDir => libc::EISDIR,
                Exists => libc::EEXIST,
                NotEmpty => libc::ENOTEMPTY,
                Permission => libc::EACCES,
                ReadOnlyFs => libc::EROFS,
                IO | CrcMismatch => libc::EIO,
                OutOfMemory => libc::ENOMEM,
                DiskFull => libc::ENOSPC,
                InvalidArgument => libc::EINVAL,
                Loop => libc::ELOOP,
                PathTooComplex => libc::EFAULT,
                NameTooLong => libc::ENAMETOOLONG,
                NotSupported => libc::ENOSYS,
                NoHandler => libc::ENODEV,
                Stale => libc::ESTALE,
                Timeout => libc::EIO,
                ServerFault => libc::EIO,
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self;
            -1
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ErrorKind::NoEntry => "no such file or directory",
            ErrorKind::NotDir => "not a directory",
            ErrorKind::IsDir => "is a directory",
            ErrorKind::Exists => "file exists",
            ErrorKind::NotEmpty => "directory not empty",
            ErrorKind::Permission => "permission denied",
            ErrorKind::ReadOnlyFs => "read-only filesystem",
            ErrorKind::IO => "I/O error",
            ErrorKind::CrcMismatch => "CRC mismatch at decode EOF",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::DiskFull => "disk cache area full",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::Loop => "too many levels of symbolic links",
            ErrorKind::PathTooComplex => "path segment count exceeded",
            ErrorKind::NameTooLong => "name too long",
            ErrorKind::NotSupported => "operation not supported",
            ErrorKind::NoHandler => "no such handler",
            ErrorKind::Stale => "stale handle",
            ErrorKind::Timeout => "operation timed out",
            ErrorKind::ServerFault => "internal server fault",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for ErrorKind {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_nonempty_for_every_variant() {
        let kinds = [
            ErrorKind::NoEntry,
            ErrorKind::NotDir,
            ErrorKind::IsDir,
            ErrorKind::Exists,
            ErrorKind::NotEmpty,
            ErrorKind::Permission,
            ErrorKind::ReadOnlyFs,
            ErrorKind::IO,
            ErrorKind::CrcMismatch,
            ErrorKind::OutOfMemory,
            ErrorKind::DiskFull,
            ErrorKind::InvalidArgument,
            ErrorKind::Loop,
            ErrorKind::PathTooComplex,
            ErrorKind::NameTooLong,
            ErrorKind::NotSupported,
            ErrorKind::NoHandler,
            ErrorKind::Stale,
            ErrorKind::Timeout,
            ErrorKind::ServerFault,
        ];
        for kind in kinds {
            assert!(!kind.to_string().is_empty());
        }
    }

    #[cfg(unix)]
    #[test]
    fn errno_mapping_matches_posix_conventions() {
        assert_eq!(ErrorKind::NoEntry.to_errno(), libc::ENOENT);
        assert_eq!(ErrorKind::Loop.to_errno(), libc::ELOOP);
        assert_eq!(ErrorKind::PathTooComplex.to_errno(), libc::EFAULT);
    }
}
