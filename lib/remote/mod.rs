//! Per-target remote wrapper.
//!
//! A [`Remote`] owns one [`RemoteAccessor`] and is the only way the rest of
//! the crate talks to it: every outbound call goes through a bounded-retry
//! wrapper that records the call into the shared [`CallLog`] and emits a
//! `tracing` event. Listings are cached per directory and invalidated by
//! version comparison, not by time.

pub mod accessor;
pub mod local;
pub mod s3;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};
use tracing::{debug, warn};

pub use accessor::{ObjectStream, RemoteAccessor, RemoteAttr};

use crate::errors::RemoteError;
use crate::intervals::ByteRange;
use crate::logring::{CallLog, CallRecord};

/// When the next wanted range starts within this many bytes of the stream
/// cursor, the gap is read and discarded instead of reseeking; a reseek
/// over HTTP means a fresh request.
const STREAM_GAP_REUSE: u64 = 512 * 1024;

/// Base delay for retry back-off; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

struct CachedListing {
    /// Tree-side list-cache version this listing was taken at. A local
    /// mutation under the directory bumps the tree's version, making this
    /// snapshot stale.
    version: u64,
    entries: Arc<Vec<RemoteAttr>>,
}

/// One configured remote target.
pub struct Remote {
    accessor: Box<dyn RemoteAccessor>,
    retries: u32,
    /// Cache base for this remote's sparse files.
    cache_dir: PathBuf,
    cache_data: bool,
    write: bool,
    log: Arc<CallLog>,
    lists: scc::HashMap<String, CachedListing>,
}

impl Remote {
    pub fn new(
        accessor: Box<dyn RemoteAccessor>,
        retries: u32,
        cache_dir: PathBuf,
        cache_data: bool,
        write: bool,
        log: Arc<CallLog>,
    ) -> Self {
        Self {
            accessor,
            retries,
            cache_dir,
            cache_data,
            write,
            log,
            lists: scc::HashMap::new(),
        }
    }

    /// True when this remote accepts writes.
    #[must_use]
    pub fn writable(&self) -> bool {
        self.write
    }

    /// True when reads on this remote go through the on-disk block cache.
    #[must_use]
    pub fn caches_data(&self) -> bool {
        self.cache_data
    }

    /// The target this remote was configured with.
    #[must_use]
    pub fn target(&self) -> &str {
        self.accessor.target()
    }

    /// Map a mount-relative path to this remote's full object path.
    #[must_use]
    pub fn remote_path(&self, rel: &str) -> String {
        self.accessor.remote_path(rel)
    }

    /// Where the cache file for `remote_path` lives on disk.
    #[must_use]
    pub fn cache_path(&self, remote_path: &str) -> PathBuf {
        self.accessor.local_path(&self.cache_dir, remote_path)
    }

    /// Run one accessor call with bounded retry, back-off, and logging.
    ///
    /// A fatal classification (not-found, no-quota, permission) aborts the
    /// retry loop immediately.
    async fn call<T, Fut>(
        &self,
        name: &'static str,
        path: &str,
        mut op: impl FnMut() -> Fut,
    ) -> Result<T, RemoteError>
    where
        Fut: std::future::Future<Output = Result<T, RemoteError>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => {
                    debug!(call = name, path, retries = attempt, "remote call ok");
                    self.log.record(CallRecord {
                        call: name,
                        path: path.to_owned(),
                        retries: attempt,
                        walltime: started.elapsed(),
                        error: None,
                    });
                    return Ok(value);
                }
                Err(e) if e.is_fatal() || attempt >= self.retries => {
                    if !e.is_not_found() {
                        warn!(call = name, path, retries = attempt, error = %e,
                              "remote call failed");
                    }
                    self.log.record(CallRecord {
                        call: name,
                        path: path.to_owned(),
                        retries: attempt,
                        walltime: started.elapsed(),
                        error: Some(e.to_string()),
                    });
                    return Err(e);
                }
                Err(e) => {
                    let delay = RETRY_BASE_DELAY
                        .saturating_mul(1 << attempt.min(16))
                        .min(RETRY_MAX_DELAY);
                    warn!(call = name, path, attempt, error = %e, ?delay,
                          "remote call failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// List `dir`, serving the cached listing when its version still
    /// matches the tree's current version for that directory.
    pub async fn list(
        &self,
        dir: &str,
        version: u64,
    ) -> Result<Arc<Vec<RemoteAttr>>, RemoteError> {
        if let Some(entries) = self
            .lists
            .read_async(dir, |_, cached| {
                (cached.version == version).then(|| Arc::clone(&cached.entries))
            })
            .await
            .flatten()
        {
            return Ok(entries);
        }

        let entries = Arc::new(
            self.call("ListEntries", dir, || self.accessor.list_entries(dir))
                .await?,
        );
        let _ = self
            .lists
            .upsert_async(
                dir.to_owned(),
                CachedListing {
                    version,
                    entries: Arc::clone(&entries),
                },
            )
            .await;
        Ok(entries)
    }

    /// Attributes of `name` within `dir`, from the (possibly cached)
    /// listing of `dir`. Never issues a HEAD-style round trip: an entry
    /// absent from the listing is `NotFound`.
    pub async fn get_attr(
        &self,
        dir: &str,
        name: &str,
        version: u64,
    ) -> Result<RemoteAttr, RemoteError> {
        let entries = self.list(dir, version).await?;
        entries
            .iter()
            .find(|attr| attr.bare_name() == name)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(accessor::join_remote(dir, name)))
    }

    /// Drop the cached listing for `dir` outright (used when a mutation
    /// must be visible before the tree version has been re-read).
    pub async fn invalidate_list(&self, dir: &str) {
        self.lists.remove_async(dir).await;
    }

    pub async fn download_file(&self, src: &str, dest: &Path) -> Result<(), RemoteError> {
        self.call("DownloadFile", src, || {
            self.accessor.download_file(src, dest)
        })
        .await
    }

    pub async fn open_file(&self, path: &str) -> Result<Box<dyn ObjectStream>, RemoteError> {
        self.call("OpenFile", path, || self.accessor.open_file(path))
            .await
    }

    pub async fn upload(&self, local: &Path, remote: &str) -> Result<(), RemoteError> {
        self.call("UploadFile", remote, || {
            self.accessor
                .upload_file(local, remote, "application/octet-stream")
        })
        .await
    }

    /// Stream `reader` to `dest`. Not retryable — the reader is consumed —
    /// so failures are logged and returned as-is.
    pub async fn upload_data(
        &self,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        dest: &str,
    ) -> Result<(), RemoteError> {
        let started = Instant::now();
        let result = self.accessor.upload_data(reader, dest).await;
        self.log.record(CallRecord {
            call: "UploadData",
            path: dest.to_owned(),
            retries: 0,
            walltime: started.elapsed(),
            error: result.as_ref().err().map(ToString::to_string),
        });
        if let Err(e) = &result {
            warn!(path = dest, error = %e, "streaming upload failed");
        }
        result
    }

    pub async fn copy_file(&self, src: &str, dest: &str) -> Result<(), RemoteError> {
        self.call("CopyFile", src, || self.accessor.copy_file(src, dest))
            .await
    }

    pub async fn delete_file(&self, path: &str) -> Result<(), RemoteError> {
        self.call("DeleteFile", path, || self.accessor.delete_file(path))
            .await
    }

    pub async fn delete_incomplete_upload(&self, path: &str) -> Result<(), RemoteError> {
        self.call("DeleteIncompleteUpload", path, || {
            self.accessor.delete_incomplete_upload(path)
        })
        .await
    }

    /// Fill `ranges` of `remote` into the sparse file at `local`.
    ///
    /// One stream serves all ranges: the stream seeks to the first range,
    /// reads exactly its length into the file at the same offset, then
    /// either discards the gap up to the next range (small gaps) or
    /// reseeks (large ones). Each range is pushed onto `completed` as soon
    /// as its bytes are on disk, so a mid-transfer failure still lets the
    /// caller commit what landed.
    pub async fn download_ranges(
        &self,
        remote: &str,
        local: &Path,
        ranges: &[ByteRange],
        completed: &mut Vec<ByteRange>,
    ) -> Result<(), RemoteError> {
        if ranges.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let result = self
            .download_ranges_inner(remote, local, ranges, completed)
            .await;
        self.log.record(CallRecord {
            call: "DownloadRanges",
            path: remote.to_owned(),
            retries: 0,
            walltime: started.elapsed(),
            error: result.as_ref().err().map(ToString::to_string),
        });
        result
    }

    async fn download_ranges_inner(
        &self,
        remote: &str,
        local: &Path,
        ranges: &[ByteRange],
        completed: &mut Vec<ByteRange>,
    ) -> Result<(), RemoteError> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(local)
            .await?;

        let mut stream = self.open_file(remote).await?;
        let mut cursor = ranges[0].start;
        stream.seek(cursor).await?;

        let mut scratch = vec![0u8; 128 * 1024];
        for range in ranges {
            debug_assert!(range.start >= cursor, "ranges must be ascending");
            if range.start > cursor {
                let gap = range.start - cursor;
                if gap <= STREAM_GAP_REUSE {
                    // Read and discard: cheaper than a fresh request.
                    let mut left = gap;
                    while left > 0 {
                        let take = scratch.len().min(left as usize);
                        let n = stream.read(&mut scratch[..take]).await?;
                        if n == 0 {
                            return Err(RemoteError::Unclassified(format!(
                                "{remote}: stream ended inside gap"
                            )));
                        }
                        left -= n as u64;
                    }
                } else {
                    stream.seek(range.start).await?;
                }
                cursor = range.start;
            }

            file.seek(std::io::SeekFrom::Start(range.start)).await?;
            let mut left = range.len();
            while left > 0 {
                let take = scratch.len().min(left as usize);
                let n = stream.read(&mut scratch[..take]).await?;
                if n == 0 {
                    return Err(RemoteError::Unclassified(format!(
                        "{remote}: object shorter than requested range {range}"
                    )));
                }
                file.write_all(&scratch[..n]).await?;
                left -= n as u64;
            }
            cursor = range.end;
            file.flush().await?;
            completed.push(*range);
            debug!(path = remote, %range, "range downloaded");
        }
        Ok(())
    }

    /// Snapshot of retained call records.
    #[must_use]
    pub fn logs(&self) -> Vec<CallRecord> {
        self.log.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::local::LocalAccessor;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn remote_over(root: &Path, retries: u32) -> Remote {
        Remote::new(
            Box::new(LocalAccessor::new(root)),
            retries,
            root.join("unused-cache"),
            true,
            false,
            Arc::new(CallLog::new(true)),
        )
    }

    #[tokio::test]
    async fn list_is_cached_per_version() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a"), b"1").unwrap();
        let remote = remote_over(tmp.path(), 0);

        let first = remote.list("", 0).await.unwrap();
        assert_eq!(first.len(), 1);

        // Same version: served from cache even though the store changed.
        std::fs::write(tmp.path().join("b"), b"2").unwrap();
        let again = remote.list("", 0).await.unwrap();
        assert_eq!(again.len(), 1);

        // A bumped version forces a fresh listing.
        let fresh = remote.list("", 1).await.unwrap();
        assert_eq!(fresh.len(), 2);
    }

    #[tokio::test]
    async fn get_attr_never_heads_the_remote() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("known"), b"12345").unwrap();
        let remote = remote_over(tmp.path(), 0);

        let attr = remote.get_attr("", "known", 0).await.unwrap();
        assert_eq!(attr.size, 5);

        let err = remote.get_attr("", "missing", 0).await.err().unwrap();
        assert!(err.is_not_found());

        // Both answers came from a single listing.
        let lists = remote
            .logs()
            .iter()
            .filter(|r| r.call == "ListEntries")
            .count();
        assert_eq!(lists, 1);
    }

    #[tokio::test]
    async fn not_found_aborts_retries() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = remote_over(tmp.path(), 3);

        let err = remote
            .download_file("absent", &tmp.path().join("out"))
            .await
            .err()
            .unwrap();
        assert!(err.is_not_found());
        let record = remote
            .logs()
            .into_iter()
            .find(|r| r.call == "DownloadFile")
            .unwrap();
        assert_eq!(record.retries, 0, "a miss must not burn the retry budget");
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        struct Flaky {
            inner: LocalAccessor,
            failures_left: AtomicU32,
        }

        #[async_trait::async_trait]
        impl RemoteAccessor for Flaky {
            async fn download_file(&self, src: &str, dest: &Path) -> Result<(), RemoteError> {
                if self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(RemoteError::Unclassified("transient".to_owned()));
                }
                self.inner.download_file(src, dest).await
            }

            async fn open_file(
                &self,
                path: &str,
            ) -> Result<Box<dyn ObjectStream>, RemoteError> {
                self.inner.open_file(path).await
            }

            async fn upload_file(
                &self,
                src: &Path,
                dest: &str,
                content_type: &str,
            ) -> Result<(), RemoteError> {
                self.inner.upload_file(src, dest, content_type).await
            }

            async fn upload_data(
                &self,
                reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
                dest: &str,
            ) -> Result<(), RemoteError> {
                self.inner.upload_data(reader, dest).await
            }

            async fn list_entries(&self, dir: &str) -> Result<Vec<RemoteAttr>, RemoteError> {
                self.inner.list_entries(dir).await
            }

            async fn copy_file(&self, src: &str, dest: &str) -> Result<(), RemoteError> {
                self.inner.copy_file(src, dest).await
            }

            async fn delete_file(&self, path: &str) -> Result<(), RemoteError> {
                self.inner.delete_file(path).await
            }

            async fn delete_incomplete_upload(&self, path: &str) -> Result<(), RemoteError> {
                self.inner.delete_incomplete_upload(path).await
            }

            fn target(&self) -> &str {
                self.inner.target()
            }

            fn remote_path(&self, rel: &str) -> String {
                self.inner.remote_path(rel)
            }

            fn local_path(&self, base: &Path, remote_path: &str) -> PathBuf {
                self.inner.local_path(base, remote_path)
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("src"), b"payload").unwrap();
        let remote = Remote::new(
            Box::new(Flaky {
                inner: LocalAccessor::new(tmp.path()),
                failures_left: AtomicU32::new(2),
            }),
            3,
            tmp.path().join("cache"),
            false,
            false,
            Arc::new(CallLog::new(true)),
        );

        let dest = tmp.path().join("copy");
        remote.download_file("src", &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
        let record = remote
            .logs()
            .into_iter()
            .find(|r| r.call == "DownloadFile")
            .unwrap();
        assert_eq!(record.retries, 2);
    }

    #[tokio::test]
    async fn download_ranges_fills_exactly_the_requested_spans() {
        let tmp = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        std::fs::write(tmp.path().join("obj"), &data).unwrap();
        let remote = remote_over(tmp.path(), 0);

        let local = tmp.path().join("sparse");
        let ranges = [
            ByteRange { start: 100, end: 200 },
            ByteRange { start: 300, end: 400 },
            ByteRange {
                start: 4000,
                end: 4096,
            },
        ];
        let mut completed = Vec::new();
        remote
            .download_ranges("obj", &local, &ranges, &mut completed)
            .await
            .unwrap();
        assert_eq!(completed, ranges);

        let on_disk = std::fs::read(&local).unwrap();
        assert_eq!(&on_disk[100..200], &data[100..200]);
        assert_eq!(&on_disk[300..400], &data[300..400]);
        assert_eq!(&on_disk[4000..4096], &data[4000..4096]);
    }

    #[tokio::test]
    async fn download_ranges_reports_partial_progress() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("short"), vec![1u8; 256]).unwrap();
        let remote = remote_over(tmp.path(), 0);

        let local = tmp.path().join("sparse");
        let ranges = [
            ByteRange { start: 0, end: 128 },
            // Past end-of-object: the transfer fails here.
            ByteRange {
                start: 512,
                end: 1024,
            },
        ];
        let mut completed = Vec::new();
        let err = remote
            .download_ranges("short", &local, &ranges, &mut completed)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RemoteError::Unclassified(_)));
        assert_eq!(
            completed,
            [ByteRange { start: 0, end: 128 }],
            "ranges that landed before the failure must be reported"
        );
    }
}
