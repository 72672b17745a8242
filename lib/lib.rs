//! muxfs: mount object-store prefixes as a POSIX-like filesystem.
//!
//! One or more remote prefixes (S3 buckets and sub-paths, or plain local
//! directories) are overlaid into a single directory tree served over
//! FUSE. Reads can stream straight from the remote or go through a sparse
//! on-disk block cache that fetches only the byte ranges actually touched;
//! writes land in the cache and are uploaded, oldest first, when the
//! filesystem is unmounted.

/// On-disk sparse block cache for one remote object.
pub mod cachefile;
/// Injectable time source.
pub mod clock;
/// Mount and remote options.
pub mod config;
/// Crate-wide error types.
pub mod errors;
/// Open-flag wrappers.
pub mod flags;
/// The path-level filesystem core.
pub mod fs;
/// FUSE adapter over the core.
pub mod fuse;
/// Open-file handle state machine.
pub mod handle;
/// Coalescing byte-range sets.
pub mod intervals;
/// In-memory record of accessor calls.
pub mod logring;
/// Mount lifecycle.
pub mod mount;
/// Remote accessors and the retrying wrapper.
pub mod remote;
/// The in-memory virtual directory tree.
pub mod tree;

pub use errors::{MountError, RemoteError};
pub use mount::{Mount, RemoteSpec};
