//! On-disk sparse cache of one remote object.
//!
//! A [`CacheFile`] pairs a sparse local file with an [`IntervalSet`] saying
//! which of its bytes are real. Reads fill only the missing sub-ranges, so
//! partial, out-of-order access converges to a complete local copy without
//! ever transferring a byte twice. The interval set and the file are
//! mutated under one mutex; a range is never reported present before its
//! bytes are on disk.
//!
//! Range fetches are de-duplicated across concurrent readers: the first
//! requester of a missing range claims it, later requesters wait for the
//! claim to resolve and re-check. Disjoint ranges download in parallel.

use std::path::{Path, PathBuf};
use std::sync::Mutex as SyncMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::errors::RemoteError;
use crate::intervals::{ByteRange, IntervalSet};
use crate::remote::Remote;

/// Invoked (synchronously) whenever the cache contents diverge from the
/// remote. Installed by the owner; the cache file itself holds no
/// reference back into the directory tree.
pub type DirtyCallback = Box<dyn Fn() + Send + Sync>;

/// What the owning listing last said about the remote object, used to
/// decide whether an existing on-disk file can be trusted.
#[derive(Debug, Clone, Copy)]
pub struct RemoteStamp {
    pub size: u64,
    pub mtime: SystemTime,
}

struct CacheState {
    intervals: IntervalSet,
    /// Current logical size. May exceed what is present on disk.
    size: u64,
}

/// Sparse local mirror of one remote object.
pub struct CacheFile {
    path: PathBuf,
    state: Mutex<CacheState>,
    /// Ranges currently being fetched by some reader.
    in_flight: SyncMutex<Vec<ByteRange>>,
    fetch_done: Notify,
    handles: AtomicUsize,
    on_dirty: DirtyCallback,
}

impl CacheFile {
    /// Open or create the cache file.
    ///
    /// For a mirror of a remote object (`remote` is `Some`), an existing
    /// file is adopted — its interval set re-derived from its on-disk
    /// size — only when it still matches the remote: same size, and not
    /// older than the remote's listed mtime. A mismatch discards it, to
    /// be refilled on demand. For a file that exists only locally
    /// (`remote` is `None`), whatever is on disk IS the content and is
    /// adopted unconditionally.
    pub async fn open(
        path: PathBuf,
        remote: Option<RemoteStamp>,
        on_dirty: DirtyCallback,
    ) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let disk = tokio::fs::metadata(&path).await.ok();
        let (size, adopted) = match (remote, &disk) {
            (Some(stamp), Some(meta)) => {
                let stale = meta
                    .modified()
                    .is_ok_and(|local| stamp.mtime > local);
                if meta.len() == stamp.size && !stale {
                    (stamp.size, Some(meta.len()))
                } else {
                    (stamp.size, None)
                }
            }
            (Some(stamp), None) => (stamp.size, None),
            (None, Some(meta)) => (meta.len(), Some(meta.len())),
            (None, None) => (0, None),
        };

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(disk.is_some() && adopted.is_none())
            .open(&path)
            .await?;
        // Full logical length up front: unfetched regions are holes, so a
        // huge object costs no disk until real bytes land.
        file.set_len(size).await?;

        let intervals = match adopted {
            Some(len) => {
                debug!(path = %path.display(), len, "adopted existing cache file");
                IntervalSet::full(len)
            }
            None => IntervalSet::new(),
        };

        Ok(Self {
            path,
            state: Mutex::new(CacheState { intervals, size }),
            in_flight: SyncMutex::new(Vec::new()),
            fetch_done: Notify::new(),
            handles: AtomicUsize::new(0),
            on_dirty,
        })
    }

    /// Where this cache file lives.
    #[must_use]
    pub fn on_disk_path(&self) -> &Path {
        &self.path
    }

    /// Current logical size.
    pub async fn size(&self) -> u64 {
        self.state.lock().await.size
    }

    /// Snapshot of the present byte ranges.
    pub async fn intervals(&self) -> IntervalSet {
        self.state.lock().await.intervals.clone()
    }

    /// Note another open handle on this file.
    pub fn acquire(&self) -> usize {
        self.handles.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Note an open handle going away; returns the remaining count.
    pub fn release(&self) -> usize {
        self.handles.fetch_sub(1, Ordering::Relaxed).saturating_sub(1)
    }

    /// Read up to `len` bytes at `offset`, fetching any missing ranges
    /// from `remote` first. `remote` is `None` for files that exist only
    /// locally, where holes simply read as zeros.
    pub async fn read(
        &self,
        remote: Option<(&Remote, &str)>,
        offset: u64,
        len: u32,
    ) -> Result<Bytes, RemoteError> {
        let size = self.size().await;
        let end = offset.saturating_add(u64::from(len)).min(size);
        if offset >= end {
            return Ok(Bytes::new());
        }
        let want = ByteRange { start: offset, end };

        if let Some((remote, remote_path)) = remote {
            self.fetch(remote, remote_path, want).await?;
        }

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; (end - offset) as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                // Logical size beyond the physical file: remaining bytes
                // are holes.
                break;
            }
            filled += n;
        }
        Ok(Bytes::from(buf))
    }

    /// Write `data` at `offset`, extending the logical size as needed and
    /// stamping the range as present.
    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<u32, RemoteError> {
        let mut state = self.state.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;

        let range = ByteRange::at(offset, data.len() as u64);
        state.intervals.add(range);
        state.size = state.size.max(range.end);
        drop(state);

        (self.on_dirty)();
        #[expect(
            clippy::cast_possible_truncation,
            reason = "FUSE write payloads are bounded well below u32::MAX"
        )]
        let written = data.len() as u32;
        Ok(written)
    }

    /// Truncate (or extend) to `n` bytes.
    pub async fn truncate(&self, n: u64) -> Result<(), RemoteError> {
        let mut state = self.state.lock().await;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await?;
        file.set_len(n).await?;
        if n < state.size {
            state.intervals.truncate(n);
        } else {
            // Extension: the new tail is all zeros and entirely ours, so
            // it is present by definition.
            let old = state.size;
            state.intervals.add(ByteRange { start: old, end: n });
        }
        state.size = n;
        drop(state);
        (self.on_dirty)();
        Ok(())
    }

    /// Make every byte of `want` present, fetching missing sub-ranges from
    /// the remote. The same missing range is fetched by at most one
    /// caller; others wait for the claim to resolve.
    pub async fn fetch(
        &self,
        remote: &Remote,
        remote_path: &str,
        want: ByteRange,
    ) -> Result<(), RemoteError> {
        loop {
            let missing = {
                let state = self.state.lock().await;
                state.intervals.missing(want)
            };
            if missing.is_empty() {
                return Ok(());
            }

            // Arm the wait before deciding, so a claim resolving between
            // our check and our await cannot be missed.
            let notified = self.fetch_done.notified();

            let claimed: Vec<ByteRange> = {
                let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                let free: Vec<ByteRange> = missing
                    .iter()
                    .filter(|gap| !in_flight.iter().any(|busy| busy.overlaps(gap)))
                    .copied()
                    .collect();
                in_flight.extend_from_slice(&free);
                free
            };

            if claimed.is_empty() {
                // Every gap is already being fetched by someone else.
                notified.await;
                continue;
            }

            let mut completed = Vec::new();
            let result = remote
                .download_ranges(remote_path, &self.path, &claimed, &mut completed)
                .await;

            {
                let mut state = self.state.lock().await;
                for range in &completed {
                    state.intervals.add(*range);
                }
            }
            {
                let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                in_flight.retain(|r| !claimed.contains(r));
            }
            self.fetch_done.notify_waiters();

            result?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_dirty() -> DirtyCallback {
        Box::new(|| {})
    }

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CacheFile::open(tmp.path().join("f"), None, no_dirty())
            .await
            .unwrap();

        cache.write(0, b"hello world").await.unwrap();
        let data = cache.read(None, 0, 64).await.unwrap();
        assert_eq!(&data[..], b"hello world");
        assert_eq!(cache.size().await, 11);
    }

    #[tokio::test]
    async fn write_marks_dirty() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicUsize;

        let tmp = tempfile::tempdir().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let cache = CacheFile::open(
            tmp.path().join("f"),
            None,
            Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
        )
        .await
        .unwrap();

        cache.write(0, b"x").await.unwrap();
        cache.truncate(0).await.unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn truncate_clips_size_and_intervals() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CacheFile::open(tmp.path().join("f"), None, no_dirty())
            .await
            .unwrap();

        cache.write(0, b"write test\n").await.unwrap();
        cache.truncate(3).await.unwrap();

        assert_eq!(cache.size().await, 3);
        let data = cache.read(None, 0, 64).await.unwrap();
        assert_eq!(&data[..], b"wri");
        // Reads past the new size return nothing.
        let empty = cache.read(None, 5, 10).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn extension_reads_zeros() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CacheFile::open(tmp.path().join("f"), None, no_dirty())
            .await
            .unwrap();

        cache.write(0, b"ab").await.unwrap();
        cache.truncate(6).await.unwrap();
        let data = cache.read(None, 0, 6).await.unwrap();
        assert_eq!(&data[..], b"ab\0\0\0\0");
    }

    #[tokio::test]
    async fn adoption_requires_matching_size() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f");
        std::fs::write(&path, b"0123456789").unwrap();

        // Size matches: adopted, fully present.
        let stamp = |size| RemoteStamp {
            size,
            mtime: SystemTime::UNIX_EPOCH,
        };
        let cache = CacheFile::open(path.clone(), Some(stamp(10)), no_dirty())
            .await
            .unwrap();
        assert!(cache.intervals().await.covers(ByteRange { start: 0, end: 10 }));
        drop(cache);

        // Remote grew: stale copy is discarded.
        std::fs::write(&path, b"0123456789").unwrap();
        let cache = CacheFile::open(path, Some(stamp(12)), no_dirty())
            .await
            .unwrap();
        assert!(cache.intervals().await.ranges().is_empty());
        assert_eq!(cache.size().await, 12);
    }
}
