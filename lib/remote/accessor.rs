//! The capability boundary between the core and an object store.
//!
//! A [`RemoteAccessor`] is everything the core needs from one remote
//! prefix. Implementations stand alone — there is no shared base — and
//! classify their failures by returning the right
//! [`RemoteError`](crate::errors::RemoteError) variant rather than
//! exposing predicate hooks.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::errors::RemoteError;

/// Attributes of one remote object, as produced by a listing.
///
/// `name` is relative to the listed directory; a trailing `/` marks a
/// subdirectory. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAttr {
    pub name: String,
    pub size: u64,
    pub mtime: SystemTime,
    /// Content hash when the store reports one (e.g. an S3 ETag).
    pub etag: Option<String>,
}

impl RemoteAttr {
    /// True when this entry denotes a subdirectory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }

    /// The entry name without any trailing `/`.
    #[must_use]
    pub fn bare_name(&self) -> &str {
        self.name.trim_end_matches('/')
    }
}

/// A readable byte stream over one remote object.
///
/// `seek` repositions the stream; implementations are free to close and
/// reopen under the hood (a ranged HTTP GET does exactly that), so callers
/// must never assume a seek is cheap.
#[async_trait]
pub trait ObjectStream: AsyncRead + Send + Unpin {
    async fn seek(&mut self, offset: u64) -> Result<(), RemoteError>;
}

/// Narrow interface over one object-store prefix.
///
/// Guarantees implementations must supply:
/// - `delete_file` is idempotent: deleting an absent object succeeds;
/// - `copy_file` is atomic with respect to observers of `dest`;
/// - `list_entries` is non-recursive and returns names relative to `dir`,
///   with a trailing `/` on subdirectories;
/// - all paths use forward-slash separators.
#[async_trait]
pub trait RemoteAccessor: Send + Sync + 'static {
    /// Fetch a whole object to a local file.
    async fn download_file(&self, src: &str, dest: &Path) -> Result<(), RemoteError>;

    /// Open a readable stream positioned at byte 0.
    async fn open_file(&self, path: &str) -> Result<Box<dyn ObjectStream>, RemoteError>;

    /// Upload a local file.
    async fn upload_file(
        &self,
        src: &Path,
        dest: &str,
        content_type: &str,
    ) -> Result<(), RemoteError>;

    /// Upload from an in-memory stream (write-through mode). Consumes the
    /// reader to end-of-stream.
    async fn upload_data(
        &self,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        dest: &str,
    ) -> Result<(), RemoteError>;

    /// Non-recursive listing of `dir`.
    async fn list_entries(&self, dir: &str) -> Result<Vec<RemoteAttr>, RemoteError>;

    /// Server-side copy within this prefix.
    async fn copy_file(&self, src: &str, dest: &str) -> Result<(), RemoteError>;

    /// Delete an object. Succeeds when the object is already absent.
    async fn delete_file(&self, path: &str) -> Result<(), RemoteError>;

    /// Clean up the partial state of an interrupted streaming upload.
    async fn delete_incomplete_upload(&self, path: &str) -> Result<(), RemoteError>;

    /// The target this accessor was configured with, for display.
    fn target(&self) -> &str;

    /// Map a mount-relative path to the full remote path.
    fn remote_path(&self, rel: &str) -> String;

    /// Where `remote_path`'s cached copy lives under `base`.
    fn local_path(&self, base: &Path, remote_path: &str) -> PathBuf;
}

/// Join two forward-slash path fragments without doubling separators.
#[must_use]
pub fn join_remote(base: &str, rel: &str) -> String {
    let rel = rel.trim_start_matches('/');
    if base.is_empty() {
        rel.to_owned()
    } else if rel.is_empty() {
        base.to_owned()
    } else {
        format!("{}/{rel}", base.trim_end_matches('/'))
    }
}
