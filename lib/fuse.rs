//! FUSE adapter: maps `fuser::Filesystem` callbacks onto [`MuxFs`].
//!
//! fuser addresses everything by inode, while the core is path-keyed, so
//! the adapter owns the inode⇄path table. Callbacks arrive on fuser's
//! session thread; each one is dispatched onto the tokio runtime and
//! replies from there, keeping the session thread free.

use std::ffi::OsStr;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use fuser::TimeOrNow;
use tracing::Instrument as _;
use tracing::{debug, error};

use crate::errors::RemoteError;
use crate::flags::OpenFlags;
use crate::fs::{Attr, MuxFs, SetAttrs};
use crate::tree::EntryKind;

/// Kernel attribute/entry cache TTL. Kept short because the backing store
/// can change underneath us between operations.
const ATTR_TTL: Duration = Duration::from_secs(1);

/// The conventional root inode number.
const ROOT_INO: u64 = 1;

struct InodeEntry {
    path: String,
    /// Kernel lookup count; the entry is dropped when `forget` brings
    /// this to zero.
    rc: u64,
}

/// Bidirectional inode⇄path table.
struct InodeTable {
    by_ino: scc::HashMap<u64, InodeEntry>,
    by_path: scc::HashMap<String, u64>,
    next: AtomicU64,
}

impl InodeTable {
    fn new() -> Self {
        let table = Self {
            by_ino: scc::HashMap::new(),
            by_path: scc::HashMap::new(),
            next: AtomicU64::new(ROOT_INO + 1),
        };
        let _ = table.by_ino.insert(
            ROOT_INO,
            InodeEntry {
                path: String::new(),
                rc: 1,
            },
        );
        let _ = table.by_path.insert(String::new(), ROOT_INO);
        table
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.by_ino.read(&ino, |_, e| e.path.clone())
    }

    /// Inode for `path`, allocating one if needed. `bump` increments the
    /// kernel reference count (true for lookup/create, false for readdir).
    fn ino_for(&self, path: &str, bump: bool) -> u64 {
        loop {
            if let Some(ino) = self.by_path.read(path, |_, &ino| ino) {
                if !bump {
                    return ino;
                }
                let bumped = self
                    .by_ino
                    .update(&ino, |_, e| {
                        e.rc += 1;
                        ino
                    })
                    .is_some();
                if bumped {
                    return ino;
                }
                // Raced with a forget that dropped the entry; retry.
                self.by_path.remove(path);
                continue;
            }
            let ino = self.next.fetch_add(1, Ordering::Relaxed);
            let entry = InodeEntry {
                path: path.to_owned(),
                rc: u64::from(bump),
            };
            if self.by_ino.insert(ino, entry).is_ok() {
                let _ = self.by_path.insert(path.to_owned(), ino);
                return ino;
            }
        }
    }

    fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let gone = self
            .by_ino
            .update(&ino, |_, e| {
                e.rc = e.rc.saturating_sub(nlookup);
                (e.rc == 0).then(|| e.path.clone())
            })
            .flatten();
        if let Some(path) = gone {
            self.by_ino.remove(&ino);
            self.by_path.remove_if(&path, |stored| *stored == ino);
        }
    }

    /// Rewrite the path of a renamed entry so subsequent ops on its inode
    /// resolve to the new location.
    fn rename(&self, old: &str, new: &str) {
        if let Some((_, ino)) = self.by_path.remove(old) {
            let _ = self.by_ino.update(&ino, |_, e| {
                new.clone_into(&mut e.path);
            });
            let _ = self.by_path.insert(new.to_owned(), ino);
        }
    }
}

fn kind_to_fuser(kind: EntryKind) -> fuser::FileType {
    match kind {
        EntryKind::Dir => fuser::FileType::Directory,
        EntryKind::File => fuser::FileType::RegularFile,
        EntryKind::Symlink => fuser::FileType::Symlink,
    }
}

fn attr_to_fuser(ino: u64, attr: &Attr) -> fuser::FileAttr {
    fuser::FileAttr {
        ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: kind_to_fuser(attr.kind),
        perm: attr.mode,
        nlink: 1,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn join_child(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_owned()
    } else {
        format!("{dir}/{name}")
    }
}

/// Bridges `fuser::Filesystem` to the async core.
pub struct FuseAdapter {
    fs: Arc<MuxFs>,
    runtime: tokio::runtime::Handle,
    inodes: Arc<InodeTable>,
}

impl FuseAdapter {
    #[must_use]
    pub fn new(fs: Arc<MuxFs>, runtime: tokio::runtime::Handle) -> Self {
        Self {
            fs,
            runtime,
            inodes: Arc::new(InodeTable::new()),
        }
    }

    fn spawn<Fut>(&self, span: tracing::Span, f: impl FnOnce(Arc<MuxFs>) -> Fut + Send + 'static)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let fs = Arc::clone(&self.fs);
        self.runtime.spawn(f(fs).instrument(span));
    }
}

fn errno(e: &RemoteError) -> i32 {
    e.errno()
}

impl fuser::Filesystem for FuseAdapter {
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let Some(parent_path) = self.inodes.path_of(parent) else {
            error!(parent, "lookup under unknown inode");
            reply.error(libc::ENOENT);
            return;
        };
        let name = name.to_string_lossy().into_owned();
        let inodes = Arc::clone(&self.inodes);
        let span = tracing::debug_span!("fuse::lookup", parent, name);
        self.spawn(span, move |fs| async move {
            match fs.lookup(&parent_path, &name).await {
                Ok(attr) => {
                    let path = join_child(&parent_path, &name);
                    let ino = inodes.ino_for(&path, true);
                    reply.entry(&ATTR_TTL, &attr_to_fuser(ino, &attr), 0);
                }
                Err(e) => {
                    debug!(error = %e, "lookup failed");
                    reply.error(errno(&e));
                }
            }
        });
    }

    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let span = tracing::debug_span!("fuse::getattr", ino);
        self.spawn(span, move |fs| async move {
            match fs.getattr(&path).await {
                Ok(attr) => reply.attr(&ATTR_TTL, &attr_to_fuser(ino, &attr)),
                Err(e) => reply.error(errno(&e)),
            }
        });
    }

    #[expect(
        clippy::too_many_arguments,
        reason = "signature dictated by fuser::Filesystem"
    )]
    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let changes = SetAttrs {
            size,
            mtime: mtime.map(|t| match t {
                TimeOrNow::SpecificTime(t) => t,
                TimeOrNow::Now => SystemTime::now(),
            }),
            mode,
        };
        let span = tracing::debug_span!("fuse::setattr", ino, ?size);
        self.spawn(span, move |fs| async move {
            match fs.setattr(&path, changes).await {
                Ok(attr) => reply.attr(&ATTR_TTL, &attr_to_fuser(ino, &attr)),
                Err(e) => reply.error(errno(&e)),
            }
        });
    }

    fn readlink(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyData) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let span = tracing::debug_span!("fuse::readlink", ino);
        self.spawn(span, move |fs| async move {
            match fs.readlink(&path).await {
                Ok(target) => reply.data(target.as_bytes()),
                Err(e) => reply.error(errno(&e)),
            }
        });
    }

    fn mkdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        let Some(parent_path) = self.inodes.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join_child(&parent_path, &name.to_string_lossy());
        let inodes = Arc::clone(&self.inodes);
        let span = tracing::debug_span!("fuse::mkdir", parent, path);
        self.spawn(span, move |fs| async move {
            match fs.mkdir(&path).await {
                Ok(attr) => {
                    let ino = inodes.ino_for(&path, true);
                    reply.entry(&ATTR_TTL, &attr_to_fuser(ino, &attr), 0);
                }
                Err(e) => reply.error(errno(&e)),
            }
        });
    }

    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let Some(parent_path) = self.inodes.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join_child(&parent_path, &name.to_string_lossy());
        let span = tracing::debug_span!("fuse::unlink", path);
        self.spawn(span, move |fs| async move {
            match fs.unlink(&path).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno(&e)),
            }
        });
    }

    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let Some(parent_path) = self.inodes.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join_child(&parent_path, &name.to_string_lossy());
        let span = tracing::debug_span!("fuse::rmdir", path);
        self.spawn(span, move |fs| async move {
            match fs.rmdir(&path).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno(&e)),
            }
        });
    }

    fn symlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: fuser::ReplyEntry,
    ) {
        let Some(parent_path) = self.inodes.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join_child(&parent_path, &link_name.to_string_lossy());
        let target = target.to_string_lossy().into_owned();
        let inodes = Arc::clone(&self.inodes);
        let span = tracing::debug_span!("fuse::symlink", path);
        self.spawn(span, move |fs| async move {
            match fs.symlink(&path, &target).await {
                Ok(attr) => {
                    let ino = inodes.ino_for(&path, true);
                    reply.entry(&ATTR_TTL, &attr_to_fuser(ino, &attr), 0);
                }
                Err(e) => reply.error(errno(&e)),
            }
        });
    }

    fn rename(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        let (Some(src_parent), Some(dst_parent)) =
            (self.inodes.path_of(parent), self.inodes.path_of(newparent))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        let src = join_child(&src_parent, &name.to_string_lossy());
        let dst = join_child(&dst_parent, &newname.to_string_lossy());
        let inodes = Arc::clone(&self.inodes);
        let span = tracing::debug_span!("fuse::rename", src, dst);
        self.spawn(span, move |fs| async move {
            match fs.rename(&src, &dst).await {
                Ok(()) => {
                    inodes.rename(&src, &dst);
                    reply.ok();
                }
                Err(e) => reply.error(errno(&e)),
            }
        });
    }

    fn link(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        // Hard links have no object-store representation.
        reply.error(libc::EPERM);
    }

    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let flags = OpenFlags::from(flags);
        let span = tracing::debug_span!("fuse::open", ino, ?flags);
        self.spawn(span, move |fs| async move {
            match fs.open(&path, flags).await {
                Ok(fh) => reply.opened(fh, 0),
                Err(e) => reply.error(errno(&e)),
            }
        });
    }

    fn create(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let Some(parent_path) = self.inodes.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join_child(&parent_path, &name.to_string_lossy());
        let flags = OpenFlags::from(flags) | OpenFlags::CREAT;
        let inodes = Arc::clone(&self.inodes);
        let span = tracing::debug_span!("fuse::create", path);
        self.spawn(span, move |fs| async move {
            match fs.create(&path, flags).await {
                Ok((attr, fh)) => {
                    let ino = inodes.ino_for(&path, true);
                    reply.created(&ATTR_TTL, &attr_to_fuser(ino, &attr), 0, fh, 0);
                }
                Err(e) => reply.error(errno(&e)),
            }
        });
    }

    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let span = tracing::debug_span!("fuse::read", ino, fh, offset, size);
        self.spawn(span, move |fs| async move {
            match fs.read(fh, offset.cast_unsigned(), size).await {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(errno(&e)),
            }
        });
    }

    #[expect(
        clippy::too_many_arguments,
        reason = "signature dictated by fuser::Filesystem"
    )]
    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        let data = data.to_vec();
        let span = tracing::debug_span!("fuse::write", ino, fh, offset, len = data.len());
        self.spawn(span, move |fs| async move {
            match fs.write(fh, offset.cast_unsigned(), &data).await {
                Ok(written) => reply.written(written),
                Err(e) => reply.error(errno(&e)),
            }
        });
    }

    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        // Writes are already durable locally (cache) or in the upload pipe
        // (streaming); completion is enforced at release.
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        let span = tracing::debug_span!("fuse::release", ino, fh);
        self.spawn(span, move |fs| async move {
            match fs.release(fh).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno(&e)),
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let inodes = Arc::clone(&self.inodes);
        let span = tracing::debug_span!("fuse::readdir", ino, offset);
        self.spawn(span, move |fs| async move {
            let children = match fs.readdir(&path).await {
                Ok(children) => children,
                Err(e) => {
                    reply.error(errno(&e));
                    return;
                }
            };

            let mut entries: Vec<(u64, fuser::FileType, String)> = Vec::with_capacity(
                children.len() + 2,
            );
            entries.push((ino, fuser::FileType::Directory, ".".to_owned()));
            entries.push((ino, fuser::FileType::Directory, "..".to_owned()));
            for (name, kind) in children {
                let child_ino = inodes.ino_for(&join_child(&path, &name), false);
                entries.push((child_ino, kind_to_fuser(kind), name));
            }

            #[expect(
                clippy::cast_possible_truncation,
                reason = "directory offsets fit in usize on 64-bit targets"
            )]
            for (i, (child_ino, kind, name)) in
                entries.iter().enumerate().skip(offset.cast_unsigned() as usize)
            {
                let next_offset = (i + 1) as i64;
                if reply.add(*child_ino, next_offset, *kind, name) {
                    break;
                }
            }
            reply.ok();
        });
    }

    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let stats = self.fs.statfs();
        reply.statfs(
            stats.total_blocks,
            stats.free_blocks,
            stats.available_blocks,
            stats.total_inodes,
            0,
            stats.block_size,
            stats.max_filename_length,
            stats.block_size,
        );
    }
}
