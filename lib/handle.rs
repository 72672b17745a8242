//! Per-open file handle state machine.
//!
//! Every open selects exactly one of four I/O strategies, decided by the
//! owning remote's write/cache flags and the open flags:
//!
//! | write | cache | flags                    | mode           |
//! |-------|-------|--------------------------|----------------|
//! | no    | no    | O_RDONLY                 | UncachedRead   |
//! | no    | yes   | O_RDONLY                 | CachedRead     |
//! | yes   | yes   | any                      | CachedWrite    |
//! | yes   | no    | O_WRONLY / O_CREAT       | StreamingWrite |
//! | yes   | no    | O_RDONLY (existing file) | UncachedRead   |
//!
//! Uncached reads keep one live remote stream per handle and emulate
//! random access over it: forward jumps seek (or drain), backward jumps
//! reopen. Streaming writes pipe straight into the accessor's upload and
//! accept appends only.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt as _;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cachefile::CacheFile;
use crate::errors::RemoteError;
use crate::flags::OpenFlags;
use crate::remote::{ObjectStream, Remote};

/// Which I/O strategy an open handle uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleMode {
    CachedRead,
    UncachedRead,
    CachedWrite,
    StreamingWrite,
}

/// Pick the I/O mode for an open, per the table above.
///
/// `exists` distinguishes a read-only open of an existing file (uncached
/// read) from a create on an uncached writable remote (streaming write).
#[must_use]
pub fn select_mode(writable: bool, caches: bool, flags: OpenFlags, exists: bool) -> HandleMode {
    match (writable, caches) {
        (false, false) => HandleMode::UncachedRead,
        (false, true) => HandleMode::CachedRead,
        (true, true) => HandleMode::CachedWrite,
        (true, false) => {
            if flags.is_read_only() && exists && !flags.contains(OpenFlags::CREAT) {
                HandleMode::UncachedRead
            } else {
                HandleMode::StreamingWrite
            }
        }
    }
}

/// Sequential-looking reads at arbitrary offsets over one remote stream.
pub struct StreamReader {
    remote: Arc<Remote>,
    remote_path: String,
    stream: Box<dyn ObjectStream>,
    pos: u64,
}

impl StreamReader {
    pub async fn open(remote: Arc<Remote>, remote_path: String) -> Result<Self, RemoteError> {
        let stream = remote.open_file(&remote_path).await?;
        Ok(Self {
            remote,
            remote_path,
            stream,
            pos: 0,
        })
    }

    /// Read up to `size` bytes at `offset`. Short only at end-of-object.
    pub async fn read_at(&mut self, offset: u64, size: u32) -> Result<Bytes, RemoteError> {
        use tokio::io::AsyncReadExt as _;

        if offset < self.pos {
            // The stream cannot rewind: start over.
            debug!(path = %self.remote_path, from = self.pos, to = offset,
                   "backward read, reopening stream");
            self.stream = self.remote.open_file(&self.remote_path).await?;
            self.pos = 0;
        }
        if offset > self.pos {
            self.stream.seek(offset).await?;
            self.pos = offset;
        }

        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.pos += filled as u64;
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }
}

/// A live streaming upload: an in-process pipe whose read end is being
/// consumed by the accessor's `upload_data`.
pub struct StreamingUpload {
    writer: Option<tokio::io::WriteHalf<tokio::io::SimplexStream>>,
    offset: u64,
    task: Option<tokio::task::JoinHandle<Result<(), RemoteError>>>,
}

impl StreamingUpload {
    /// Pipe buffer between the writing FUSE op and the uploading task.
    const PIPE_CAPACITY: usize = 256 * 1024;

    /// Open the pipe and start the upload task.
    #[must_use]
    pub fn start(remote: Arc<Remote>, remote_path: String) -> Self {
        let (reader, writer) = tokio::io::simplex(Self::PIPE_CAPACITY);
        let task = tokio::spawn(async move {
            let result = remote.upload_data(Box::new(reader), &remote_path).await;
            if result.is_err() {
                // Leave nothing half-written behind.
                let _ = remote.delete_incomplete_upload(&remote_path).await;
            }
            result
        });
        Self {
            writer: Some(writer),
            offset: 0,
            task: Some(task),
        }
    }

    /// Append `data`. Only writes at the current end are possible over a
    /// pipe; anything else is EINVAL.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<u32, RemoteError> {
        if offset != self.offset {
            return Err(RemoteError::Io(std::io::Error::from_raw_os_error(
                libc::EINVAL,
            )));
        }
        let writer = self.writer.as_mut().ok_or_else(|| {
            RemoteError::Io(std::io::Error::from_raw_os_error(libc::EBADF))
        })?;
        writer.write_all(data).await?;
        self.offset += data.len() as u64;
        #[expect(
            clippy::cast_possible_truncation,
            reason = "FUSE write payloads are bounded well below u32::MAX"
        )]
        let written = data.len() as u32;
        Ok(written)
    }

    /// Bytes accepted so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.offset
    }

    /// Close the pipe and wait for the upload to complete.
    pub async fn finish(&mut self) -> Result<(), RemoteError> {
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await?;
        }
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| RemoteError::Unclassified(format!("upload task panicked: {e}")))?,
            None => Ok(()),
        }
    }
}

/// State behind one FUSE file handle.
pub enum HandleState {
    CachedRead {
        cache: Arc<CacheFile>,
        remote: Arc<Remote>,
        remote_path: String,
    },
    UncachedRead {
        reader: Mutex<StreamReader>,
    },
    CachedWrite {
        cache: Arc<CacheFile>,
        /// Present when the object also exists remotely, so reads can
        /// fault in unfetched ranges.
        remote: Option<(Arc<Remote>, String)>,
    },
    StreamingWrite {
        upload: Mutex<StreamingUpload>,
    },
}

/// One open file.
pub struct OpenHandle {
    pub path: String,
    pub flags: OpenFlags,
    pub state: HandleState,
}

impl OpenHandle {
    #[must_use]
    pub fn mode(&self) -> HandleMode {
        match &self.state {
            HandleState::CachedRead { .. } => HandleMode::CachedRead,
            HandleState::UncachedRead { .. } => HandleMode::UncachedRead,
            HandleState::CachedWrite { .. } => HandleMode::CachedWrite,
            HandleState::StreamingWrite { .. } => HandleMode::StreamingWrite,
        }
    }

    /// True when closing this handle must clear the entry's
    /// writer-present flag.
    #[must_use]
    pub fn is_write_handle(&self) -> bool {
        matches!(
            self.state,
            HandleState::CachedWrite { .. } | HandleState::StreamingWrite { .. }
        )
    }

    pub async fn read(&self, offset: u64, size: u32) -> Result<Bytes, RemoteError> {
        match &self.state {
            HandleState::CachedRead {
                cache,
                remote,
                remote_path,
            } => cache.read(Some((remote, remote_path)), offset, size).await,
            HandleState::UncachedRead { reader } => {
                reader.lock().await.read_at(offset, size).await
            }
            HandleState::CachedWrite { cache, remote } => {
                let source = remote.as_ref().map(|(r, p)| (r.as_ref(), p.as_str()));
                cache.read(source, offset, size).await
            }
            HandleState::StreamingWrite { .. } => Err(RemoteError::Io(
                std::io::Error::from_raw_os_error(libc::EBADF),
            )),
        }
    }

    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<u32, RemoteError> {
        match &self.state {
            HandleState::CachedWrite { cache, .. } => cache.write(offset, data).await,
            HandleState::StreamingWrite { upload } => {
                upload.lock().await.write(offset, data).await
            }
            HandleState::CachedRead { .. } | HandleState::UncachedRead { .. } => Err(
                RemoteError::Io(std::io::Error::from_raw_os_error(libc::EBADF)),
            ),
        }
    }

    /// Release the handle. Streaming writes block here until the upload
    /// finishes; cached writes do nothing (upload is deferred to unmount).
    pub async fn close(&self) -> Result<(), RemoteError> {
        match &self.state {
            HandleState::StreamingWrite { upload } => upload.lock().await.finish().await,
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(bits: i32) -> OpenFlags {
        OpenFlags::from_bits_truncate(bits)
    }

    #[test]
    fn mode_table_matches_policy() {
        // Read-only remotes.
        assert_eq!(
            select_mode(false, false, flags(libc::O_RDONLY), true),
            HandleMode::UncachedRead
        );
        assert_eq!(
            select_mode(false, true, flags(libc::O_RDONLY), true),
            HandleMode::CachedRead
        );
        // Writable cached remote: everything goes through the cache.
        assert_eq!(
            select_mode(true, true, flags(libc::O_RDONLY), true),
            HandleMode::CachedWrite
        );
        assert_eq!(
            select_mode(true, true, flags(libc::O_WRONLY | libc::O_CREAT), false),
            HandleMode::CachedWrite
        );
        // Writable uncached remote.
        assert_eq!(
            select_mode(true, false, flags(libc::O_WRONLY | libc::O_CREAT), false),
            HandleMode::StreamingWrite
        );
        assert_eq!(
            select_mode(true, false, flags(libc::O_RDONLY), true),
            HandleMode::UncachedRead,
            "read-only open of an existing file on an uncached writable remote streams the read"
        );
        assert_eq!(
            select_mode(true, false, flags(libc::O_RDONLY | libc::O_CREAT), false),
            HandleMode::StreamingWrite
        );
    }
}
