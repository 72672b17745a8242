//! Mount lifecycle: wiring remotes, spawning the FUSE session, write-back
//! on unmount, and signal-driven emergency unmount.
//!
//! Time, signal delivery and process exit are injected at construction so
//! tests can drive the lifecycle without real signals or `exit(2)`; the
//! defaults are the real thing.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{MountOptions, RemoteOptions, validate_mount_point};
use crate::errors::MountError;
use crate::fs::MuxFs;
use crate::fuse::FuseAdapter;
use crate::logring::{CallLog, CallRecord, LogSink};
use crate::remote::{Remote, RemoteAccessor};

/// Source of deadly signals. The default listens for SIGINT/SIGTERM;
/// tests substitute a channel.
#[async_trait]
pub trait SignalSource: Send + 'static {
    /// Wait until a deadly signal arrives. Returning `None` disarms the
    /// handler without unmounting.
    async fn recv(&mut self) -> Option<&'static str>;
}

/// SIGINT/SIGTERM via tokio's signal handling.
pub struct DeathSignals;

#[async_trait]
impl SignalSource for DeathSignals {
    async fn recv(&mut self) -> Option<&'static str> {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                return None;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => Some("SIGINT"),
            _ = sigterm.recv() => Some("SIGTERM"),
        }
    }
}

/// Invoked with the process exit code after a signal-driven unmount.
pub type ExitHook = Box<dyn Fn(i32) + Send + Sync>;

/// One remote to attach: the accessor plus its flags.
pub struct RemoteSpec {
    pub accessor: Box<dyn RemoteAccessor>,
    pub options: RemoteOptions,
}

/// Where the cache tree lives, and whether unmount owns its removal.
enum CacheRoot {
    /// Auto-assigned temp dir; removed on unmount.
    Auto(tempfile::TempDir),
    /// User-supplied; preserved across mounts.
    Explicit(PathBuf),
}

impl CacheRoot {
    fn path(&self) -> &Path {
        match self {
            Self::Auto(tmp) => tmp.path(),
            Self::Explicit(path) => path,
        }
    }
}

/// The in-process owner of one mount point and its remotes.
pub struct Mount {
    fs: Arc<MuxFs>,
    mount_point: PathBuf,
    cache_root: SyncMutex<Option<CacheRoot>>,
    session: SyncMutex<Option<fuser::BackgroundSession>>,
    log: Arc<CallLog>,
    signals: SyncMutex<Option<Box<dyn SignalSource>>>,
    exit: ExitHook,
    unmounted: AtomicBool,
}

impl Mount {
    /// Validate options, wire the remotes, and build the core. The FUSE
    /// session itself starts in [`mount`](Self::mount).
    pub fn new(options: MountOptions, specs: Vec<RemoteSpec>) -> Result<Self, MountError> {
        Self::with_parts(
            options,
            specs,
            Arc::new(SystemClock),
            Box::new(DeathSignals),
            Box::new(|code| std::process::exit(code)),
        )
    }

    /// Full-injection constructor used by tests.
    pub fn with_parts(
        options: MountOptions,
        mut specs: Vec<RemoteSpec>,
        clock: Arc<dyn Clock>,
        signals: Box<dyn SignalSource>,
        exit: ExitHook,
    ) -> Result<Self, MountError> {
        if specs.is_empty() {
            return Err(MountError::NoRemotes);
        }
        let writers = specs.iter().filter(|s| s.options.write).count();
        if writers > 1 {
            return Err(MountError::MultipleWriters { count: writers });
        }
        // The writable remote (if any) goes first; overlay resolution and
        // the write path both key off index 0.
        specs.sort_by_key(|s| !s.options.write);

        let mount_point = validate_mount_point(&options.resolved_mount_point())?;

        let cache_root = match &options.cache_base {
            Some(base) => {
                std::fs::create_dir_all(base).map_err(|e| MountError::InvalidCacheDir {
                    path: base.clone(),
                    source: e,
                })?;
                CacheRoot::Explicit(base.clone())
            }
            None => {
                let tmp = tempfile::Builder::new()
                    .prefix("muxfs-cache-")
                    .tempdir()
                    .map_err(|e| MountError::InvalidCacheDir {
                        path: PathBuf::from("<tempdir>"),
                        source: e,
                    })?;
                CacheRoot::Auto(tmp)
            }
        };

        let log = Arc::new(CallLog::new(options.verbose));
        let remotes: Vec<Arc<Remote>> = specs
            .into_iter()
            .map(|spec| {
                Arc::new(Remote::new(
                    spec.accessor,
                    options.retries,
                    spec.options.cache_dir_under(cache_root.path()),
                    spec.options.cache_data,
                    spec.options.write,
                    Arc::clone(&log),
                ))
            })
            .collect();

        let owner = (
            nix::unistd::Uid::current().as_raw(),
            nix::unistd::Gid::current().as_raw(),
        );
        let fs = Arc::new(MuxFs::new(remotes, owner, clock));

        Ok(Self {
            fs,
            mount_point,
            cache_root: SyncMutex::new(Some(cache_root)),
            session: SyncMutex::new(None),
            log,
            signals: SyncMutex::new(Some(signals)),
            exit,
            unmounted: AtomicBool::new(false),
        })
    }

    /// The filesystem core (also the test entry point for file ops).
    #[must_use]
    pub fn fs(&self) -> &Arc<MuxFs> {
        &self.fs
    }

    #[must_use]
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// The cache base currently in use, if not yet released.
    #[must_use]
    pub fn cache_root(&self) -> Option<PathBuf> {
        self.cache_root
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|root| root.path().to_path_buf())
    }

    /// Snapshot of recorded accessor calls. Survives unmount.
    #[must_use]
    pub fn logs(&self) -> Vec<CallRecord> {
        self.log.snapshot()
    }

    /// Route every call record to an external handler as well.
    pub fn set_log_sink(&self, sink: LogSink) {
        self.log.set_sink(sink);
    }

    /// Start serving the mount point.
    pub fn mount(&self) -> Result<(), MountError> {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if session.is_some() {
            return Ok(());
        }

        let adapter = FuseAdapter::new(Arc::clone(&self.fs), tokio::runtime::Handle::current());
        let mut mount_opts = vec![
            fuser::MountOption::FSName("muxfs".to_owned()),
            fuser::MountOption::NoDev,
            fuser::MountOption::AutoUnmount,
            fuser::MountOption::DefaultPermissions,
        ];
        if self.fs.has_writer() {
            mount_opts.push(fuser::MountOption::RW);
        } else {
            mount_opts.push(fuser::MountOption::RO);
        }

        info!(mount_point = %self.mount_point.display(), "mounting");
        *session = Some(fuser::spawn_mount2(adapter, &self.mount_point, &mount_opts)?);
        self.unmounted.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stop serving and write back local changes.
    ///
    /// Order: stop the FUSE session (quiesces new operations), close any
    /// handles left open, upload dirty entries oldest-mtime-first, apply
    /// deferred deletes, then release an auto-assigned cache directory.
    /// Upload failures are counted and summarised, never fatal mid-sweep.
    pub async fn unmount(&self, skip_upload: bool) -> Result<(), MountError> {
        if self.unmounted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let session = self
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(session) = session {
            debug!("tearing down fuse session");
            session.join();
            self.force_kernel_unmount();
        }

        let closed = self.fs.close_all_handles().await;
        if closed > 0 {
            debug!(closed, "closed leftover handles");
        }

        let mut failed = 0;
        if !skip_upload && self.fs.has_writer() {
            failed = self.fs.upload_dirty().await;
            let delete_failures = self.fs.apply_pending_deletes().await;
            if delete_failures > 0 {
                warn!(delete_failures, "some deferred deletes failed");
            }
        }

        // An auto-assigned cache base dies with the mount; an explicit one
        // is the user's to keep.
        let root = self
            .cache_root
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match root {
            Some(CacheRoot::Auto(tmp)) => {
                if let Err(e) = tmp.close() {
                    warn!(error = %e, "failed to remove cache directory");
                }
            }
            Some(CacheRoot::Explicit(path)) => {
                debug!(path = %path.display(), "preserving explicit cache directory");
            }
            None => {}
        }

        if failed > 0 {
            return Err(MountError::UploadsFailed { failed });
        }
        info!("unmounted");
        Ok(())
    }

    /// Belt-and-braces kernel unmount for the case where the session
    /// thread exited without the kernel releasing the mount point.
    fn force_kernel_unmount(&self) {
        #[cfg(target_os = "linux")]
        {
            use nix::errno::Errno;
            match nix::mount::umount2(&self.mount_point, nix::mount::MntFlags::MNT_DETACH) {
                Ok(()) | Err(Errno::EINVAL | Errno::ENOENT) => {}
                Err(e) => warn!(error = %e, "forced unmount failed"),
            }
        }
    }

    /// Arm the emergency unmount: when a deadly signal arrives, unmount
    /// and exit — 1 after a clean unmount, 2 after a failed one.
    pub fn unmount_on_death(self: &Arc<Self>) {
        let Some(mut signals) = self
            .signals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            // Already armed.
            return;
        };
        let mount = Arc::clone(self);
        tokio::spawn(async move {
            let Some(signal) = signals.recv().await else {
                return;
            };
            warn!(signal, "deadly signal, unmounting");
            let code = match mount.unmount(false).await {
                Ok(()) => 1,
                Err(e) => {
                    error!(error = %e, "emergency unmount failed");
                    2
                }
            };
            (mount.exit)(code);
        });
    }
}
