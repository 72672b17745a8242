//! The filesystem core: path-level operations over the virtual tree.
//!
//! [`MuxFs`] owns the ordered remotes, the shared tree, and the open-handle
//! table, and implements every operation the FUSE adapter exposes. Paths
//! here are mount-relative. Each operation resolves the path, decides which
//! remote owns it (lowest-indexed remote wins on overlay conflicts), and
//! drives the cache or handle machinery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::SystemTime;

use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cachefile::{CacheFile, RemoteStamp};
use crate::clock::Clock;
use crate::errors::RemoteError;
use crate::flags::OpenFlags;
use crate::handle::{
    HandleMode, HandleState, OpenHandle, StreamReader, StreamingUpload, select_mode,
};
use crate::intervals::ByteRange;
use crate::remote::Remote;
use crate::tree::{EntryKind, FileEntry, Tree, split_parent};

/// Attributes of one tree node, ready for conversion at the FUSE boundary.
#[derive(Debug, Clone, Copy)]
pub struct Attr {
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

/// Virtual filesystem statistics.
#[derive(Debug, Clone, Copy)]
pub struct FsStats {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub available_blocks: u64,
    pub total_inodes: u64,
    pub max_filename_length: u32,
}

/// Attribute changes requested through setattr.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttrs {
    pub size: Option<u64>,
    pub mtime: Option<SystemTime>,
    pub mode: Option<u32>,
}

/// Insertion-ordered set of paths awaiting write-back.
#[derive(Default)]
struct DirtyQueue {
    order: Vec<String>,
}

impl DirtyQueue {
    fn insert(&mut self, path: &str) {
        if !self.order.iter().any(|p| p == path) {
            self.order.push(path.to_owned());
        }
    }

    fn remove(&mut self, path: &str) {
        self.order.retain(|p| p != path);
    }

    fn rename(&mut self, old: &str, new: &str) {
        for p in &mut self.order {
            if p == old {
                new.clone_into(p);
            }
        }
    }

    fn snapshot(&self) -> Vec<String> {
        self.order.clone()
    }
}

/// A remote delete recorded by unlink, applied at unmount.
struct PendingDelete {
    remote_index: usize,
    remote_path: String,
}

fn errno_err(code: i32) -> RemoteError {
    RemoteError::Io(std::io::Error::from_raw_os_error(code))
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_owned()
}

fn join_child(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_owned()
    } else {
        format!("{dir}/{name}")
    }
}

/// Snapshot of the fields an operation needs from a [`FileEntry`], taken
/// under the tree lock so no await happens while holding it.
struct FileSnapshot {
    remote_index: usize,
    remote_path: String,
    size: u64,
    mtime: SystemTime,
    exists_remotely: bool,
    writer_present: bool,
    open_handles: u32,
    is_symlink: bool,
    cache: Option<Arc<CacheFile>>,
}

impl FileSnapshot {
    fn of(entry: &FileEntry) -> Self {
        Self {
            remote_index: entry.remote_index,
            remote_path: entry.remote_path.clone(),
            size: entry.attrs.size,
            mtime: entry.attrs.mtime,
            exists_remotely: entry.exists_remotely,
            writer_present: entry.writer_present,
            open_handles: entry.open_handles,
            is_symlink: entry.symlink_target.is_some(),
            cache: entry.cache.as_ref().map(Arc::clone),
        }
    }
}

/// The filesystem core shared by the FUSE adapter and the mount lifecycle.
pub struct MuxFs {
    remotes: Vec<Arc<Remote>>,
    owner: (u32, u32),
    clock: Arc<dyn Clock>,
    tree: RwLock<Tree>,
    handles: scc::HashMap<u64, Arc<OpenHandle>>,
    /// Monotonic handle counter; 0 is reserved.
    next_fh: AtomicU64,
    dirty: Arc<SyncMutex<DirtyQueue>>,
    pending_deletes: SyncMutex<Vec<PendingDelete>>,
}

impl MuxFs {
    /// Build the core. `remotes` must already be ordered with the writable
    /// remote (if any) at index 0; the config layer enforces that.
    #[must_use]
    pub fn new(remotes: Vec<Arc<Remote>>, owner: (u32, u32), clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            remotes,
            owner,
            clock,
            tree: RwLock::new(Tree::new(now)),
            handles: scc::HashMap::new(),
            next_fh: AtomicU64::new(1),
            dirty: Arc::new(SyncMutex::new(DirtyQueue::default())),
            pending_deletes: SyncMutex::new(Vec::new()),
        }
    }

    /// The writable remote, when one is configured.
    fn writable_remote(&self) -> Result<&Arc<Remote>, RemoteError> {
        self.remotes
            .first()
            .filter(|r| r.writable())
            .ok_or_else(|| RemoteError::PermissionDenied("mount is read-only".to_owned()))
    }

    /// True when any remote accepts writes.
    #[must_use]
    pub fn has_writer(&self) -> bool {
        self.remotes.first().is_some_and(|r| r.writable())
    }

    fn mark_dirty(&self, path: &str) {
        self.dirty
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path);
    }

    fn dirty_callback(&self, path: &str) -> Box<dyn Fn() + Send + Sync> {
        let queue = Arc::clone(&self.dirty);
        let path = path.to_owned();
        Box::new(move || {
            queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(&path);
        })
    }

    /// Paths currently queued for write-back, in insertion order.
    #[must_use]
    pub fn dirty_paths(&self) -> Vec<String> {
        self.dirty
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot()
    }

    // ---- population ------------------------------------------------------

    /// List `dir` on every remote and merge the results into the tree,
    /// once. Remotes that do not know the directory are skipped; the
    /// lowest-indexed remote's entries win conflicts because merging
    /// happens in remote order.
    async fn populate(&self, dir: &str) -> Result<(), RemoteError> {
        {
            let tree = self.tree.read().await;
            if tree.dir(dir).is_some_and(|d| d.listed) {
                return Ok(());
            }
        }
        let version = self.tree.read().await.version(dir);

        let mut listings = Vec::new();
        for (index, remote) in self.remotes.iter().enumerate() {
            let remote_dir = remote.remote_path(dir);
            match remote.list(&remote_dir, version).await {
                Ok(entries) => listings.push((index, remote_dir, entries)),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        let now = self.clock.now();
        let mut tree = self.tree.write().await;
        if tree.dir(dir).is_some_and(|d| d.listed) {
            // Raced with another populate; theirs won.
            return Ok(());
        }
        for (index, remote_dir, entries) in listings {
            tree.merge_listing(dir, index, &remote_dir, &entries, self.owner, now);
        }
        tree.ensure_dir(dir, now).listed = true;
        Ok(())
    }

    /// Walk from the root to `dir`, populating every directory on the way
    /// and verifying each component actually is a directory.
    async fn ensure_listed(&self, dir: &str) -> Result<(), RemoteError> {
        let mut cur = String::new();
        loop {
            self.populate(&cur).await?;
            if cur == dir {
                return Ok(());
            }
            let rest = dir[cur.len()..].trim_start_matches('/');
            let next = rest.split('/').next().unwrap_or(rest);
            let child = join_child(&cur, next);
            let kind = self.tree.read().await.kind(&child);
            match kind {
                Some(EntryKind::Dir) => cur = child,
                Some(_) => return Err(errno_err(libc::ENOTDIR)),
                None => return Err(RemoteError::NotFound(child)),
            }
        }
    }

    /// Resolve a file (or symlink) entry, populating its parent if needed.
    async fn resolve_file(&self, path: &str) -> Result<FileSnapshot, RemoteError> {
        let (parent, _) = split_parent(path);
        self.ensure_listed(parent).await?;
        let tree = self.tree.read().await;
        match tree.file(path) {
            Some(entry) => Ok(FileSnapshot::of(entry)),
            None => Err(RemoteError::NotFound(path.to_owned())),
        }
    }

    fn dir_attr(&self, mode: u16, mtime: SystemTime) -> Attr {
        Attr {
            kind: EntryKind::Dir,
            size: 0,
            mode,
            uid: self.owner.0,
            gid: self.owner.1,
            atime: mtime,
            mtime,
            ctime: mtime,
        }
    }

    fn file_attr(entry: &FileEntry) -> Attr {
        Attr {
            kind: entry.kind(),
            size: entry.attrs.size,
            mode: entry.attrs.mode,
            uid: entry.attrs.uid,
            gid: entry.attrs.gid,
            atime: entry.attrs.atime,
            mtime: entry.attrs.mtime,
            ctime: entry.attrs.ctime,
        }
    }

    // ---- lookup / attributes --------------------------------------------

    pub async fn lookup(&self, parent: &str, name: &str) -> Result<Attr, RemoteError> {
        let parent = normalize(parent);
        self.ensure_listed(&parent).await?;
        let path = join_child(&parent, name);
        let tree = self.tree.read().await;
        if let Some(dir) = tree.dir(&path) {
            if !tree.is_deleted(&path) {
                return Ok(self.dir_attr(dir.mode, dir.mtime));
            }
        }
        match tree.file(&path) {
            Some(entry) => Ok(Self::file_attr(entry)),
            None => Err(RemoteError::NotFound(path)),
        }
    }

    pub async fn getattr(&self, path: &str) -> Result<Attr, RemoteError> {
        let path = normalize(path);
        if path.is_empty() {
            let tree = self.tree.read().await;
            let root = tree.dir("").map_or_else(
                || self.dir_attr(crate::flags::DEFAULT_DIR_MODE, self.clock.now()),
                |d| self.dir_attr(d.mode, d.mtime),
            );
            return Ok(root);
        }
        let (parent, name) = split_parent(&path);
        self.lookup(parent, name).await
    }

    pub async fn readdir(&self, path: &str) -> Result<Vec<(String, EntryKind)>, RemoteError> {
        let path = normalize(path);
        self.ensure_listed(&path).await?;
        let tree = self.tree.read().await;
        if tree.dir(&path).is_none() {
            return Err(errno_err(libc::ENOTDIR));
        }
        Ok(tree.children(&path))
    }

    pub async fn readlink(&self, path: &str) -> Result<String, RemoteError> {
        let path = normalize(path);
        let (parent, _) = split_parent(&path);
        self.ensure_listed(parent).await?;
        let tree = self.tree.read().await;
        tree.file(&path)
            .and_then(|e| e.symlink_target.clone())
            .ok_or_else(|| errno_err(libc::EINVAL))
    }

    pub fn statfs(&self) -> FsStats {
        FsStats {
            block_size: 4096,
            total_blocks: u64::MAX / 4096,
            free_blocks: u64::MAX / 4096,
            available_blocks: u64::MAX / 4096,
            total_inodes: 0,
            max_filename_length: 255,
        }
    }

    // ---- open / io -------------------------------------------------------

    async fn cache_for(
        &self,
        path: &str,
        remote: &Arc<Remote>,
        snapshot: &FileSnapshot,
    ) -> Result<Arc<CacheFile>, RemoteError> {
        if let Some(cache) = &snapshot.cache {
            return Ok(Arc::clone(cache));
        }
        let stamp = snapshot.exists_remotely.then_some(RemoteStamp {
            size: snapshot.size,
            mtime: snapshot.mtime,
        });
        let cache = Arc::new(
            CacheFile::open(
                remote.cache_path(&snapshot.remote_path),
                stamp,
                self.dirty_callback(path),
            )
            .await?,
        );
        let mut tree = self.tree.write().await;
        if let Some(entry) = tree.file_mut(path) {
            // Another open may have raced us here; share theirs.
            match &entry.cache {
                Some(existing) => return Ok(Arc::clone(existing)),
                None => entry.cache = Some(Arc::clone(&cache)),
            }
        }
        Ok(cache)
    }

    pub async fn open(&self, path: &str, flags: OpenFlags) -> Result<u64, RemoteError> {
        let path = normalize(path);
        let snapshot = self.resolve_file(&path).await?;
        if snapshot.is_symlink {
            return Err(errno_err(libc::ELOOP));
        }

        let remote = Arc::clone(&self.remotes[snapshot.remote_index]);
        if flags.wants_write() && !remote.writable() {
            return Err(RemoteError::PermissionDenied(format!(
                "{path}: remote {} is read-only",
                remote.target()
            )));
        }

        let mode = select_mode(
            remote.writable(),
            remote.caches_data(),
            flags,
            snapshot.exists_remotely,
        );

        // Single-writer policy: a write handle shares with nobody; read
        // handles only need the writer to be absent.
        let is_write = matches!(mode, HandleMode::CachedWrite | HandleMode::StreamingWrite)
            && flags.wants_write();
        {
            let mut tree = self.tree.write().await;
            let entry = tree
                .file_mut(&path)
                .ok_or_else(|| RemoteError::NotFound(path.clone()))?;
            if entry.writer_present || (is_write && entry.open_handles > 0) {
                return Err(errno_err(libc::EBUSY));
            }
            entry.open_handles += 1;
            if is_write {
                entry.writer_present = true;
            }
        }

        let state = match self
            .build_state(&path, flags, mode, &remote, &snapshot)
            .await
        {
            Ok(state) => state,
            Err(e) => {
                self.abort_open(&path, is_write).await;
                return Err(e);
            }
        };

        if let HandleState::CachedRead { cache, .. } | HandleState::CachedWrite { cache, .. } =
            &state
        {
            cache.acquire();
        }

        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(OpenHandle {
            path: path.clone(),
            flags,
            state,
        });
        debug!(path, fh, mode = ?handle.mode(), "opened");
        let _ = self.handles.insert_async(fh, handle).await;
        Ok(fh)
    }

    /// Construct the per-mode handle state for an open.
    async fn build_state(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: HandleMode,
        remote: &Arc<Remote>,
        snapshot: &FileSnapshot,
    ) -> Result<HandleState, RemoteError> {
        match mode {
            HandleMode::CachedRead => Ok(HandleState::CachedRead {
                cache: self.cache_for(path, remote, snapshot).await?,
                remote: Arc::clone(remote),
                remote_path: snapshot.remote_path.clone(),
            }),
            HandleMode::UncachedRead => {
                let reader =
                    StreamReader::open(Arc::clone(remote), snapshot.remote_path.clone()).await?;
                Ok(HandleState::UncachedRead {
                    reader: tokio::sync::Mutex::new(reader),
                })
            }
            HandleMode::CachedWrite => {
                let cache = self.cache_for(path, remote, snapshot).await?;
                if flags.contains(OpenFlags::TRUNC) && flags.wants_write() {
                    cache.truncate(0).await?;
                    let now = self.clock.now();
                    let mut tree = self.tree.write().await;
                    if let Some(entry) = tree.file_mut(path) {
                        entry.attrs.size = 0;
                        entry.attrs.mtime = now;
                        entry.dirty = true;
                    }
                }
                let source = snapshot
                    .exists_remotely
                    .then(|| (Arc::clone(remote), snapshot.remote_path.clone()));
                Ok(HandleState::CachedWrite {
                    cache,
                    remote: source,
                })
            }
            HandleMode::StreamingWrite => {
                {
                    // The object is rewritten from byte 0; whatever size
                    // the listing reported no longer applies.
                    let mut tree = self.tree.write().await;
                    if let Some(entry) = tree.file_mut(path) {
                        entry.attrs.size = 0;
                    }
                }
                Ok(HandleState::StreamingWrite {
                    upload: tokio::sync::Mutex::new(StreamingUpload::start(
                        Arc::clone(remote),
                        snapshot.remote_path.clone(),
                    )),
                })
            }
        }
    }

    /// Roll back the handle bookkeeping after a failed open.
    async fn abort_open(&self, path: &str, was_writer: bool) {
        let mut tree = self.tree.write().await;
        if let Some(entry) = tree.file_mut(path) {
            entry.open_handles = entry.open_handles.saturating_sub(1);
            if was_writer {
                entry.writer_present = false;
            }
        }
    }

    pub async fn create(&self, path: &str, flags: OpenFlags) -> Result<(Attr, u64), RemoteError> {
        let path = normalize(path);
        let remote = Arc::clone(self.writable_remote()?);
        let (parent, _) = split_parent(&path);
        self.ensure_listed(parent).await?;

        let now = self.clock.now();
        let mut created = false;
        {
            let mut tree = self.tree.write().await;
            match tree.kind(&path) {
                Some(EntryKind::Dir) => return Err(errno_err(libc::EISDIR)),
                Some(_) if flags.contains(OpenFlags::EXCL) => {
                    return Err(errno_err(libc::EEXIST));
                }
                Some(_) => {}
                None => {
                    let entry =
                        FileEntry::created(0, remote.remote_path(&path), now, self.owner);
                    tree.insert_file(&path, entry, now);
                    created = true;
                }
            }
        }

        if created {
            remote.invalidate_list(&remote.remote_path(parent)).await;
            if remote.caches_data() {
                // Even an empty created file must reach the remote at
                // unmount.
                self.mark_dirty(&path);
                let mut tree = self.tree.write().await;
                if let Some(entry) = tree.file_mut(&path) {
                    entry.dirty = true;
                }
            }
        }

        let fh = self.open(&path, flags).await?;
        let attr = self.getattr(&path).await?;
        Ok((attr, fh))
    }

    pub async fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Bytes, RemoteError> {
        let handle = self
            .handles
            .read_async(&fh, |_, h| Arc::clone(h))
            .await
            .ok_or_else(|| errno_err(libc::EBADF))?;
        handle.read(offset, size).await
    }

    pub async fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32, RemoteError> {
        let handle = self
            .handles
            .read_async(&fh, |_, h| Arc::clone(h))
            .await
            .ok_or_else(|| errno_err(libc::EBADF))?;
        let written = handle.write(offset, data).await?;

        let now = self.clock.now();
        let mut tree = self.tree.write().await;
        if let Some(entry) = tree.file_mut(&handle.path) {
            entry.attrs.size = entry.attrs.size.max(offset + u64::from(written));
            entry.attrs.mtime = now;
            if handle.mode() == HandleMode::CachedWrite {
                entry.dirty = true;
            }
        }
        Ok(written)
    }

    pub async fn release(&self, fh: u64) -> Result<(), RemoteError> {
        let Some((_, handle)) = self.handles.remove_async(&fh).await else {
            return Err(errno_err(libc::EBADF));
        };
        let result = handle.close().await;
        let streaming = matches!(handle.state, HandleState::StreamingWrite { .. });

        if let HandleState::CachedRead { cache, .. } | HandleState::CachedWrite { cache, .. } =
            &handle.state
        {
            cache.release();
        }

        let mut tree = self.tree.write().await;
        if let Some(entry) = tree.file_mut(&handle.path) {
            entry.open_handles = entry.open_handles.saturating_sub(1);
            if handle.is_write_handle() {
                entry.writer_present = false;
            }
            if streaming {
                match &result {
                    Ok(()) => {
                        entry.exists_remotely = true;
                        entry.created_locally = false;
                        entry.dirty = false;
                    }
                    Err(e) => {
                        warn!(path = %handle.path, error = %e, "streaming upload failed on close");
                        entry.upload_failed = true;
                    }
                }
            }
        }
        result
    }

    // ---- mutation --------------------------------------------------------

    pub async fn unlink(&self, path: &str) -> Result<(), RemoteError> {
        let path = normalize(path);
        let snapshot = self.resolve_file(&path).await?;
        let remote = &self.remotes[snapshot.remote_index];
        if !remote.writable() {
            return Err(RemoteError::PermissionDenied(format!(
                "{path}: remote {} is read-only",
                remote.target()
            )));
        }
        if snapshot.open_handles > 0 {
            return Err(errno_err(libc::EBUSY));
        }

        let now = self.clock.now();
        let removed = {
            let mut tree = self.tree.write().await;
            tree.remove_file(&path, now)
        };
        let Some(entry) = removed else {
            return Err(RemoteError::NotFound(path));
        };

        self.dirty
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&path);

        let (parent, _) = split_parent(&path);
        remote.invalidate_list(&remote.remote_path(parent)).await;

        if entry.exists_remotely {
            self.pending_deletes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(PendingDelete {
                    remote_index: entry.remote_index,
                    remote_path: entry.remote_path.clone(),
                });
        }
        if let Some(cache) = &entry.cache {
            if let Err(e) = tokio::fs::remove_file(cache.on_disk_path()).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path, error = %e, "failed to drop cache file of unlinked entry");
                }
            }
        }
        Ok(())
    }

    pub async fn rename(&self, src: &str, dst: &str) -> Result<(), RemoteError> {
        let src = normalize(src);
        let dst = normalize(dst);

        // Directories never rename: remotes model them flatly, so there is
        // no object to move.
        {
            self.ensure_listed(split_parent(&src).0).await?;
            let tree = self.tree.read().await;
            if matches!(tree.kind(&src), Some(EntryKind::Dir)) {
                return Err(RemoteError::PermissionDenied(format!(
                    "{src}: directories cannot be renamed"
                )));
            }
        }

        let snapshot = self.resolve_file(&src).await?;
        let remote = Arc::clone(&self.remotes[snapshot.remote_index]);
        if !remote.writable() {
            return Err(RemoteError::PermissionDenied(format!(
                "{src}: remote {} is read-only",
                remote.target()
            )));
        }
        if snapshot.open_handles > 0 {
            return Err(errno_err(libc::EBUSY));
        }

        let (dst_parent, _) = split_parent(&dst);
        self.ensure_listed(dst_parent).await?;
        {
            let tree = self.tree.read().await;
            match tree.kind(&dst) {
                Some(EntryKind::Dir) => return Err(errno_err(libc::EISDIR)),
                Some(_) => {
                    drop(tree);
                    // Renaming over an existing destination unlinks it
                    // first.
                    self.unlink(&dst).await?;
                }
                None => {}
            }
        }

        let dst_remote_path = remote.remote_path(&dst);

        if snapshot.exists_remotely && !snapshot.is_symlink {
            remote
                .copy_file(&snapshot.remote_path, &dst_remote_path)
                .await?;
            remote.delete_file(&snapshot.remote_path).await?;
            // If the destination was an uploaded file we just unlinked,
            // its deferred delete would clobber the copy at unmount.
            self.pending_deletes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|d| {
                    d.remote_index != snapshot.remote_index || d.remote_path != dst_remote_path
                });
        }

        // Carry any cached bytes across; the interval set is re-derived
        // when the file is next opened.
        let old_cache_path = remote.cache_path(&snapshot.remote_path);
        let new_cache_path = remote.cache_path(&dst_remote_path);
        match tokio::fs::metadata(&old_cache_path).await {
            Ok(_) => {
                if let Some(parent) = new_cache_path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::rename(&old_cache_path, &new_cache_path).await?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(RemoteError::Io(e)),
        }

        let now = self.clock.now();
        {
            let mut tree = self.tree.write().await;
            tree.move_file(&src, &dst, dst_remote_path, now);
            if let Some(entry) = tree.file_mut(&dst) {
                // The Arc points at the old on-disk path; reopen lazily.
                entry.cache = None;
            }
        }
        self.dirty
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .rename(&src, &dst);
        remote
            .invalidate_list(&remote.remote_path(split_parent(&src).0))
            .await;
        remote.invalidate_list(&remote.remote_path(dst_parent)).await;
        info!(src, dst, "renamed");
        Ok(())
    }

    pub async fn mkdir(&self, path: &str) -> Result<Attr, RemoteError> {
        let path = normalize(path);
        self.writable_remote()?;
        let (parent, _) = split_parent(&path);
        self.ensure_listed(parent).await?;

        let now = self.clock.now();
        let mut tree = self.tree.write().await;
        if tree.kind(&path).is_some() {
            return Err(errno_err(libc::EEXIST));
        }
        let state = tree.ensure_dir(&path, now);
        state.created_locally = true;
        state.listed = true;
        let attr = self.dir_attr(state.mode, state.mtime);
        tree.bump_version(parent, now);
        Ok(attr)
    }

    pub async fn rmdir(&self, path: &str) -> Result<(), RemoteError> {
        let path = normalize(path);
        self.writable_remote()?;
        self.ensure_listed(&path).await?;

        let now = self.clock.now();
        let mut tree = self.tree.write().await;
        let Some(dir) = tree.dir(&path) else {
            return Err(errno_err(libc::ENOTDIR));
        };
        if !dir.created_locally {
            // An object store has no empty remote directory to remove.
            return Err(RemoteError::PermissionDenied(format!(
                "{path}: only locally-created directories can be removed"
            )));
        }
        if !dir.children.is_empty() {
            return Err(errno_err(libc::ENOTEMPTY));
        }
        tree.remove_dir(&path, now);
        Ok(())
    }

    pub async fn symlink(&self, path: &str, target: &str) -> Result<Attr, RemoteError> {
        let path = normalize(path);
        let remote = Arc::clone(self.writable_remote()?);
        let (parent, _) = split_parent(&path);
        self.ensure_listed(parent).await?;

        let now = self.clock.now();
        let mut tree = self.tree.write().await;
        if tree.kind(&path).is_some() {
            return Err(errno_err(libc::EEXIST));
        }
        let mut entry = FileEntry::created(0, remote.remote_path(&path), now, self.owner);
        entry.symlink_target = Some(target.to_owned());
        entry.attrs.size = target.len() as u64;
        let attr = Self::file_attr(&entry);
        tree.insert_file(&path, entry, now);
        Ok(attr)
    }

    pub async fn setattr(&self, path: &str, changes: SetAttrs) -> Result<Attr, RemoteError> {
        let path = normalize(path);

        let is_dir = if path.is_empty() {
            true
        } else {
            self.ensure_listed(split_parent(&path).0).await?;
            matches!(self.tree.read().await.kind(&path), Some(EntryKind::Dir))
        };
        if is_dir {
            // Directories: only mode changes are meaningful.
            let mut tree = self.tree.write().await;
            let dir = tree
                .dir_mut(&path)
                .ok_or_else(|| RemoteError::NotFound(path.clone()))?;
            if changes.size.is_some() {
                return Err(errno_err(libc::EISDIR));
            }
            if let Some(mode) = changes.mode {
                dir.mode = (mode & 0o7777) as u16;
            }
            let attr = self.dir_attr(dir.mode, dir.mtime);
            return Ok(attr);
        }

        let snapshot = self.resolve_file(&path).await?;
        let remote = Arc::clone(&self.remotes[snapshot.remote_index]);

        if let Some(new_size) = changes.size {
            if !remote.writable() {
                return Err(RemoteError::PermissionDenied(format!(
                    "{path}: remote {} is read-only",
                    remote.target()
                )));
            }
            if !remote.caches_data() {
                // Truncation needs a local copy to operate on.
                return Err(RemoteError::PermissionDenied(format!(
                    "{path}: cannot truncate without a data cache"
                )));
            }
            let cache = self.cache_for(&path, &remote, &snapshot).await?;
            cache.truncate(new_size).await?;
            let now = self.clock.now();
            let mut tree = self.tree.write().await;
            if let Some(entry) = tree.file_mut(&path) {
                entry.attrs.size = new_size;
                entry.attrs.mtime = now;
                entry.dirty = true;
            }
        }

        {
            let mut tree = self.tree.write().await;
            let entry = tree
                .file_mut(&path)
                .ok_or_else(|| RemoteError::NotFound(path.clone()))?;
            if let Some(mtime) = changes.mtime {
                // Only meaningful when the bytes live locally; an uncached
                // entry's mtime is whatever the remote listing said.
                if remote.caches_data() {
                    entry.attrs.mtime = mtime;
                }
            }
            if let Some(mode) = changes.mode {
                entry.attrs.mode = (mode & 0o7777) as u16;
            }
            Ok(Self::file_attr(entry))
        }
    }

    // ---- unmount support -------------------------------------------------

    /// Dirty paths ordered for upload: ascending mtime, stable on ties, so
    /// write-back replays local history.
    pub async fn upload_order(&self) -> Vec<String> {
        let queued = self
            .dirty
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot();
        let tree = self.tree.read().await;
        let mut with_mtimes: Vec<(String, SystemTime)> = queued
            .into_iter()
            .filter_map(|path| {
                let entry = tree.file(&path)?;
                if entry.symlink_target.is_some() {
                    // Symlinks live and die in memory.
                    return None;
                }
                Some((path, entry.attrs.mtime))
            })
            .collect();
        with_mtimes.sort_by_key(|(_, mtime)| *mtime);
        with_mtimes.into_iter().map(|(path, _)| path).collect()
    }

    /// Upload every dirty entry, in order. Returns the number of failures;
    /// failures never abort the sweep.
    pub async fn upload_dirty(&self) -> usize {
        let order = self.upload_order().await;
        let mut failures = 0;
        for path in order {
            match self.upload_one(&path).await {
                Ok(()) => {
                    self.dirty
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&path);
                    let mut tree = self.tree.write().await;
                    if let Some(entry) = tree.file_mut(&path) {
                        entry.dirty = false;
                        entry.exists_remotely = true;
                        entry.created_locally = false;
                    }
                }
                Err(e) => {
                    warn!(path, error = %e, "write-back upload failed");
                    failures += 1;
                    let mut tree = self.tree.write().await;
                    if let Some(entry) = tree.file_mut(&path) {
                        entry.upload_failed = true;
                    }
                }
            }
        }
        failures
    }

    async fn upload_one(&self, path: &str) -> Result<(), RemoteError> {
        let snapshot = self.resolve_file(path).await?;
        let remote = Arc::clone(&self.remotes[snapshot.remote_index]);

        let cache = self.cache_for(path, &remote, &snapshot).await?;
        if snapshot.exists_remotely {
            // A partially-fetched dirty file must be whole before its
            // bytes can stand in for the object.
            let size = cache.size().await;
            cache
                .fetch(
                    &remote,
                    &snapshot.remote_path,
                    ByteRange {
                        start: 0,
                        end: size,
                    },
                )
                .await?;
        }
        info!(path, remote_path = %snapshot.remote_path, "uploading");
        remote
            .upload(cache.on_disk_path(), &snapshot.remote_path)
            .await?;

        // A pending delete for this remote path (e.g. from a rename over
        // an existing file) must not clobber the object just uploaded.
        self.pending_deletes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|d| {
                d.remote_index != snapshot.remote_index || d.remote_path != snapshot.remote_path
            });
        Ok(())
    }

    /// Apply unlink-time remote deletes. Returns the number of failures.
    pub async fn apply_pending_deletes(&self) -> usize {
        let pending = {
            let mut guard = self
                .pending_deletes
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        let mut failures = 0;
        for delete in pending {
            let remote = &self.remotes[delete.remote_index];
            if let Err(e) = remote.delete_file(&delete.remote_path).await {
                warn!(path = %delete.remote_path, error = %e, "deferred delete failed");
                failures += 1;
            }
        }
        failures
    }

    /// Paths of entries whose deferred or streaming upload failed.
    pub async fn failed_uploads(&self) -> Vec<String> {
        let tree = self.tree.read().await;
        let mut failed: Vec<String> = tree
            .file_paths()
            .filter(|path| tree.file(path).is_some_and(|e| e.upload_failed))
            .cloned()
            .collect();
        failed.sort();
        failed
    }

    /// Release every remaining open handle (used while tearing down).
    pub async fn close_all_handles(&self) -> usize {
        let mut fhs = Vec::new();
        self.handles
            .scan_async(|fh, _| {
                fhs.push(*fh);
            })
            .await;
        let mut closed = 0;
        for fh in fhs {
            if self.release(fh).await.is_ok() {
                closed += 1;
            }
        }
        closed
    }
}

// Unit coverage for the pure pieces lives beside them (intervals, tree,
// handle); MuxFs itself is exercised end-to-end in tests/.
