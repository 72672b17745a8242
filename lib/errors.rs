//! Error types shared across the crate.
//!
//! The accessor boundary models error classification as data: instead of
//! predicate callbacks deciding whether a transport error means "not found"
//! or "out of quota", [`RemoteError`] carries explicit variants and the
//! call sites pattern-match.

use std::path::PathBuf;

use thiserror::Error;

/// Error returned by a [`RemoteAccessor`](crate::remote::RemoteAccessor)
/// or by the retrying wrapper around it.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The object (or listing prefix) does not exist on the remote.
    /// Never retried.
    #[error("remote object not found: {0}")]
    NotFound(String),

    /// The remote refused the operation for capacity reasons. Surfaces to
    /// FUSE as `ENOSPC`.
    #[error("remote out of quota: {0}")]
    NoQuota(String),

    /// The remote rejected the caller's credentials or the operation.
    #[error("remote permission denied: {0}")]
    PermissionDenied(String),

    /// Local disk I/O while staging or serving cached data.
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport or otherwise unclassified accessor failure. Retried up to
    /// the remote's budget, then surfaces as `EIO`.
    #[error("remote call failed: {0}")]
    Unclassified(String),
}

impl RemoteError {
    /// True when retrying cannot help.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::NoQuota(_) | Self::PermissionDenied(_)
        )
    }

    /// True for the not-exists classification.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// The errno this error maps to at the FUSE boundary.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::NoQuota(_) => libc::ENOSPC,
            Self::PermissionDenied(_) => libc::EPERM,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::Unclassified(_) => libc::EIO,
        }
    }
}

impl From<RemoteError> for i32 {
    fn from(e: RemoteError) -> Self {
        e.errno()
    }
}

/// Error returned by [`Mount`](crate::mount::Mount) lifecycle operations.
#[derive(Debug, Error)]
pub enum MountError {
    /// The mount point is missing, not a directory, not empty, or is the
    /// filesystem root.
    #[error("invalid mount point {path}: {reason}")]
    InvalidMount { path: PathBuf, reason: String },

    /// More than one remote was configured with write enabled.
    #[error("only one remote may be writable, but {count} were configured")]
    MultipleWriters { count: usize },

    /// A mount was requested with no remotes at all.
    #[error("at least one remote must be configured")]
    NoRemotes,

    /// The cache base could not be created or validated.
    #[error("invalid cache directory {path}: {source}")]
    InvalidCacheDir {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Spawning or tearing down the FUSE session failed.
    #[error("fuse session error: {0}")]
    Fuse(#[from] std::io::Error),

    /// Summary of write-back failures at unmount time.
    #[error("failed to upload {failed} files")]
    UploadsFailed { failed: usize },
}
