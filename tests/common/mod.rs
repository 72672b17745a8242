#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use muxfs::clock::Clock;
use muxfs::config::{MountOptions, RemoteOptions};
use muxfs::errors::RemoteError;
use muxfs::flags::OpenFlags;
use muxfs::mount::{Mount, RemoteSpec, SignalSource};
use muxfs::remote::local::LocalAccessor;
use muxfs::remote::{ObjectStream, RemoteAccessor, RemoteAttr};
use tokio::io::AsyncRead;

// ---- flags ---------------------------------------------------------------

pub fn rdonly() -> OpenFlags {
    OpenFlags::from_bits_truncate(libc::O_RDONLY)
}

pub fn wronly_creat() -> OpenFlags {
    OpenFlags::from_bits_truncate(libc::O_WRONLY | libc::O_CREAT)
}

pub fn rdwr() -> OpenFlags {
    OpenFlags::from_bits_truncate(libc::O_RDWR)
}

// ---- deterministic clock -------------------------------------------------

/// A clock that advances one second per observation, so mtimes are
/// strictly ordered by the order operations happened.
pub struct StepClock {
    base: SystemTime,
    ticks: AtomicU64,
}

impl StepClock {
    pub fn new() -> Self {
        Self {
            base: SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            ticks: AtomicU64::new(0),
        }
    }
}

impl Clock for StepClock {
    fn now(&self) -> SystemTime {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed);
        self.base + Duration::from_secs(tick)
    }
}

// ---- signal / exit fakes -------------------------------------------------

pub struct ChannelSignals(pub tokio::sync::mpsc::UnboundedReceiver<&'static str>);

#[async_trait]
impl SignalSource for ChannelSignals {
    async fn recv(&mut self) -> Option<&'static str> {
        self.0.recv().await
    }
}

pub struct ExitRecorder(pub Arc<Mutex<Vec<i32>>>);

impl ExitRecorder {
    pub fn new() -> (Self, Arc<Mutex<Vec<i32>>>) {
        let codes = Arc::new(Mutex::new(Vec::new()));
        (Self(Arc::clone(&codes)), codes)
    }
}

// ---- failure-injecting accessor -----------------------------------------

/// Delegates to a [`LocalAccessor`] but fails uploads on demand.
pub struct FlakyAccessor {
    inner: LocalAccessor,
    pub fail_uploads: bool,
}

impl FlakyAccessor {
    pub fn new(root: &Path, fail_uploads: bool) -> Self {
        Self {
            inner: LocalAccessor::new(root),
            fail_uploads,
        }
    }
}

#[async_trait]
impl RemoteAccessor for FlakyAccessor {
    async fn download_file(&self, src: &str, dest: &Path) -> Result<(), RemoteError> {
        self.inner.download_file(src, dest).await
    }

    async fn open_file(&self, path: &str) -> Result<Box<dyn ObjectStream>, RemoteError> {
        self.inner.open_file(path).await
    }

    async fn upload_file(
        &self,
        src: &Path,
        dest: &str,
        content_type: &str,
    ) -> Result<(), RemoteError> {
        if self.fail_uploads {
            return Err(RemoteError::Unclassified(format!("{dest}: injected")));
        }
        self.inner.upload_file(src, dest, content_type).await
    }

    async fn upload_data(
        &self,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        dest: &str,
    ) -> Result<(), RemoteError> {
        if self.fail_uploads {
            return Err(RemoteError::Unclassified(format!("{dest}: injected")));
        }
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

// ---- harness -------------------------------------------------------------

pub fn local_spec(root: &Path, write: bool, cache_data: bool) -> RemoteSpec {
    RemoteSpec {
        accessor: Box::new(LocalAccessor::new(root)),
        options: RemoteOptions {
            cache_data,
            write,
            cache_dir: None,
        },
    }
}

/// A mount over local-directory "remotes", with fakes injected.
pub struct Harness {
    pub mount: Arc<Mount>,
    pub mount_dir: tempfile::TempDir,
    pub signal_tx: tokio::sync::mpsc::UnboundedSender<&'static str>,
    pub exit_codes: Arc<Mutex<Vec<i32>>>,
}

impl Harness {
    pub fn build(specs: Vec<RemoteSpec>, cache_base: Option<PathBuf>) -> Self {
        let mount_dir = tempfile::tempdir().unwrap();
        let options = MountOptions {
            mount_point: mount_dir.path().join("mnt"),
            cache_base,
            retries: 0,
            verbose: true,
        };
        let (signal_tx, signal_rx) = tokio::sync::mpsc::unbounded_channel();
        let (exit, exit_codes) = ExitRecorder::new();
        let mount = Mount::with_parts(
            options,
            specs,
            Arc::new(StepClock::new()),
            Box::new(ChannelSignals(signal_rx)),
            Box::new(move |code| {
                exit.0.lock().unwrap().push(code);
            }),
        )
        .unwrap();
        Self {
            mount: Arc::new(mount),
            mount_dir,
            signal_tx,
            exit_codes,
        }
    }

    /// Single local remote.
    pub fn single(store: &Path, write: bool, cache_data: bool) -> Self {
        Self::build(vec![local_spec(store, write, cache_data)], None)
    }
}

// ---- convenience ops -----------------------------------------------------

/// Write `data` to `path` through the mount, creating the file.
pub async fn write_file(harness: &Harness, path: &str, data: &[u8]) {
    let fs = harness.mount.fs();
    let (_, fh) = fs.create(path, wronly_creat()).await.unwrap();
    fs.write(fh, 0, data).await.unwrap();
    fs.release(fh).await.unwrap();
}

/// Read the whole of `path` through the mount.
pub async fn read_file(harness: &Harness, path: &str) -> Vec<u8> {
    let fs = harness.mount.fs();
    let fh = fs.open(path, rdonly()).await.unwrap();
    let size = fs.getattr(path).await.unwrap().size;
    let mut out = Vec::new();
    let mut offset = 0u64;
    while offset < size {
        let chunk = fs.read(fh, offset, 64 * 1024).await.unwrap();
        if chunk.is_empty() {
            break;
        }
        offset += chunk.len() as u64;
        out.extend_from_slice(&chunk);
    }
    fs.release(fh).await.unwrap();
    out
}

/// Names of the accessor calls recorded so far, oldest first.
pub fn call_names(harness: &Harness) -> Vec<(String, String)> {
    harness
        .mount
        .logs()
        .into_iter()
        .map(|r| (r.call.to_owned(), r.path))
        .collect()
}

/// How many records of `call` have been logged.
pub fn count_calls(harness: &Harness, call: &str) -> usize {
    harness
        .mount
        .logs()
        .iter()
        .filter(|r| r.call == call)
        .count()
}
