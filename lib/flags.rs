//! Open-flag and permission-bit wrappers over the raw libc values.

use bitflags::bitflags;

bitflags! {
    /// Flags for opening a file, mirroring Unix open(2).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;

        /// Append on each write.
        const APPEND = libc::O_APPEND;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create file if it does not exist.
        const CREAT = libc::O_CREAT;
        /// Error if file already exists (with `CREAT`).
        const EXCL = libc::O_EXCL;

        /// Non-blocking mode.
        const NONBLOCK = libc::O_NONBLOCK;
        /// Synchronous writes.
        const SYNC = libc::O_SYNC;
        /// Do not follow symlinks.
        const NOFOLLOW = libc::O_NOFOLLOW;
        /// Set close-on-exec.
        const CLOEXEC = libc::O_CLOEXEC;
        /// Fail if not a directory.
        const DIRECTORY = libc::O_DIRECTORY;
    }
}

impl OpenFlags {
    /// True when the access mode requests any form of writing.
    ///
    /// `O_RDONLY` is zero, so the access mode must be masked out rather
    /// than tested with `contains`.
    #[must_use]
    pub fn wants_write(self) -> bool {
        let mode = self.bits() & libc::O_ACCMODE;
        mode == libc::O_WRONLY || mode == libc::O_RDWR
    }

    /// True when the access mode is read-only.
    #[must_use]
    pub fn is_read_only(self) -> bool {
        self.bits() & libc::O_ACCMODE == libc::O_RDONLY
    }
}

impl From<i32> for OpenFlags {
    fn from(val: i32) -> Self {
        Self::from_bits_truncate(val)
    }
}

/// Default mode bits for files that were never chmod'ed locally.
pub const DEFAULT_FILE_MODE: u16 = 0o644;
/// Default mode bits for directories.
pub const DEFAULT_DIR_MODE: u16 = 0o755;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rdonly_is_not_write() {
        let flags = OpenFlags::from(libc::O_RDONLY);
        assert!(flags.is_read_only());
        assert!(!flags.wants_write());
    }

    #[test]
    fn wronly_and_rdwr_want_write() {
        assert!(OpenFlags::from(libc::O_WRONLY).wants_write());
        assert!(OpenFlags::from(libc::O_RDWR).wants_write());
        assert!(OpenFlags::from(libc::O_WRONLY | libc::O_CREAT).wants_write());
    }
}
