//! In-memory virtual directory tree.
//!
//! Paths are mount-relative, forward-slash separated, with no leading
//! slash; the root directory is the empty string. The tree is plain data —
//! all remote traffic happens outside it — and is shared behind a single
//! `RwLock` owned by the filesystem core.
//!
//! Each directory carries a list-cache `version`, bumped on any local
//! mutation beneath it. Remote listings are tagged with the version they
//! were taken at, so staleness is a version comparison, never a timer.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;

use crate::cachefile::CacheFile;
use crate::flags::{DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
use crate::remote::RemoteAttr;

/// What kind of child a directory entry names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
}

/// POSIX-visible attributes of a file entry.
#[derive(Debug, Clone, Copy)]
pub struct FileAttrs {
    pub size: u64,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl FileAttrs {
    #[must_use]
    pub fn new(size: u64, mtime: SystemTime, uid: u32, gid: u32) -> Self {
        Self {
            size,
            mode: DEFAULT_FILE_MODE,
            uid,
            gid,
            atime: mtime,
            mtime,
            ctime: mtime,
        }
    }
}

/// One regular file or symlink in the tree.
pub struct FileEntry {
    /// Index into the mount's remote list; which remote owns this path.
    pub remote_index: usize,
    /// Absolute path on the owning remote.
    pub remote_path: String,
    pub attrs: FileAttrs,
    /// The object exists on the remote (was listed or uploaded).
    pub exists_remotely: bool,
    /// Created through this mount and not uploaded yet.
    pub created_locally: bool,
    /// Local bytes differ from the remote object.
    pub dirty: bool,
    /// A deferred upload for this entry failed; reported at unmount.
    pub upload_failed: bool,
    /// A write handle is currently open; excludes any other handle.
    pub writer_present: bool,
    /// Total open handles (read and write) on this entry.
    pub open_handles: u32,
    pub cache: Option<Arc<CacheFile>>,
    /// Symlink target; `Some` makes this entry a symlink. Never uploaded.
    pub symlink_target: Option<String>,
}

impl FileEntry {
    #[must_use]
    pub fn from_listing(remote_index: usize, remote_path: String, attr: &RemoteAttr, owner: (u32, u32)) -> Self {
        Self {
            remote_index,
            remote_path,
            attrs: FileAttrs::new(attr.size, attr.mtime, owner.0, owner.1),
            exists_remotely: true,
            created_locally: false,
            dirty: false,
            upload_failed: false,
            writer_present: false,
            open_handles: 0,
            cache: None,
            symlink_target: None,
        }
    }

    #[must_use]
    pub fn created(remote_index: usize, remote_path: String, now: SystemTime, owner: (u32, u32)) -> Self {
        Self {
            remote_index,
            remote_path,
            attrs: FileAttrs::new(0, now, owner.0, owner.1),
            exists_remotely: false,
            created_locally: true,
            dirty: false,
            upload_failed: false,
            writer_present: false,
            open_handles: 0,
            cache: None,
            symlink_target: None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> EntryKind {
        if self.symlink_target.is_some() {
            EntryKind::Symlink
        } else {
            EntryKind::File
        }
    }
}

/// One directory in the tree.
pub struct DirState {
    /// Whether a remote listing has ever been merged in. A second readdir
    /// of an unchanged directory never re-lists.
    pub listed: bool,
    /// List-cache version; bumped on any local mutation under this dir.
    pub version: u64,
    /// Directory was mkdir'ed through this mount (object stores have no
    /// first-class directories, so these exist only here).
    pub created_locally: bool,
    pub mode: u16,
    pub mtime: SystemTime,
    pub children: BTreeMap<String, EntryKind>,
}

impl DirState {
    fn new(now: SystemTime) -> Self {
        Self {
            listed: false,
            version: 0,
            created_locally: false,
            mode: DEFAULT_DIR_MODE,
            mtime: now,
            children: BTreeMap::new(),
        }
    }
}

/// Split a path into `(parent, name)`. The root's parent is itself.
#[must_use]
pub fn split_parent(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}

/// The whole virtual tree.
pub struct Tree {
    dirs: HashMap<String, DirState>,
    files: HashMap<String, FileEntry>,
    /// Paths unlinked through this mount. Hidden from every operation
    /// until unmount, even if a listing still reports them.
    deleted: HashSet<String>,
}

impl Tree {
    #[must_use]
    pub fn new(now: SystemTime) -> Self {
        let mut dirs = HashMap::new();
        dirs.insert(String::new(), DirState::new(now));
        Self {
            dirs,
            files: HashMap::new(),
            deleted: HashSet::new(),
        }
    }

    #[must_use]
    pub fn dir(&self, path: &str) -> Option<&DirState> {
        self.dirs.get(path)
    }

    pub fn dir_mut(&mut self, path: &str) -> Option<&mut DirState> {
        self.dirs.get_mut(path)
    }

    #[must_use]
    pub fn file(&self, path: &str) -> Option<&FileEntry> {
        if self.deleted.contains(path) {
            return None;
        }
        self.files.get(path)
    }

    pub fn file_mut(&mut self, path: &str) -> Option<&mut FileEntry> {
        if self.deleted.contains(path) {
            return None;
        }
        self.files.get_mut(path)
    }

    #[must_use]
    pub fn is_deleted(&self, path: &str) -> bool {
        self.deleted.contains(path)
    }

    /// What `path` currently resolves to, if anything.
    #[must_use]
    pub fn kind(&self, path: &str) -> Option<EntryKind> {
        if self.deleted.contains(path) {
            return None;
        }
        if self.dirs.contains_key(path) {
            return Some(EntryKind::Dir);
        }
        self.files.get(path).map(FileEntry::kind)
    }

    /// Current list-cache version of `dir` (0 for unknown directories).
    #[must_use]
    pub fn version(&self, dir: &str) -> u64 {
        self.dirs.get(dir).map_or(0, |d| d.version)
    }

    /// Bump `dir`'s version: its cached listings are now stale.
    pub fn bump_version(&mut self, dir: &str, now: SystemTime) {
        if let Some(state) = self.dirs.get_mut(dir) {
            state.version += 1;
            state.mtime = now;
        }
    }

    /// Create `path` (and any missing ancestors) as directories.
    pub fn ensure_dir(&mut self, path: &str, now: SystemTime) -> &mut DirState {
        if !self.dirs.contains_key(path) {
            let (parent, name) = split_parent(path);
            if !name.is_empty() {
                self.ensure_dir(parent, now)
                    .children
                    .insert(name.to_owned(), EntryKind::Dir);
            }
            self.dirs.insert(path.to_owned(), DirState::new(now));
            self.deleted.remove(path);
        }
        self.dirs.get_mut(path).unwrap_or_else(|| {
            unreachable!("directory {path} was just inserted")
        })
    }

    /// Merge a remote listing into `dir`. Entries already present keep
    /// their current owner (overlay rule: the lowest-indexed remote wins,
    /// and listings are merged in remote order), and locally-deleted paths
    /// stay hidden.
    pub fn merge_listing(
        &mut self,
        dir: &str,
        remote_index: usize,
        remote_dir: &str,
        entries: &[RemoteAttr],
        owner: (u32, u32),
        now: SystemTime,
    ) {
        for attr in entries {
            let name = attr.bare_name().to_owned();
            let child_path = if dir.is_empty() {
                name.clone()
            } else {
                format!("{dir}/{name}")
            };
            if self.deleted.contains(&child_path) {
                continue;
            }
            if attr.is_dir() {
                if !self.dirs.contains_key(&child_path) && !self.files.contains_key(&child_path) {
                    self.dirs.insert(child_path.clone(), DirState::new(attr.mtime));
                    self.ensure_dir(dir, now)
                        .children
                        .insert(name, EntryKind::Dir);
                }
            } else if !self.files.contains_key(&child_path) && !self.dirs.contains_key(&child_path)
            {
                let remote_path = crate::remote::accessor::join_remote(remote_dir, &name);
                self.files.insert(
                    child_path,
                    FileEntry::from_listing(remote_index, remote_path, attr, owner),
                );
                self.ensure_dir(dir, now)
                    .children
                    .insert(name, EntryKind::File);
            }
        }
    }

    /// Children of `dir`, excluding anything unlinked locally.
    #[must_use]
    pub fn children(&self, dir: &str) -> Vec<(String, EntryKind)> {
        let Some(state) = self.dirs.get(dir) else {
            return Vec::new();
        };
        state
            .children
            .iter()
            .filter(|(name, _)| {
                let path = if dir.is_empty() {
                    (*name).clone()
                } else {
                    format!("{dir}/{name}")
                };
                !self.deleted.contains(&path)
            })
            .map(|(name, kind)| (name.clone(), *kind))
            .collect()
    }

    /// Insert a file entry, registering it with its parent and clearing
    /// any tombstone.
    pub fn insert_file(&mut self, path: &str, entry: FileEntry, now: SystemTime) {
        let (parent, name) = split_parent(path);
        let kind = entry.kind();
        self.deleted.remove(path);
        self.files.insert(path.to_owned(), entry);
        let parent_state = self.ensure_dir(parent, now);
        parent_state.children.insert(name.to_owned(), kind);
        parent_state.version += 1;
        parent_state.mtime = now;
    }

    /// Unlink a file entry. Returns the removed entry; the path is
    /// tombstoned so later listings cannot resurrect it.
    pub fn remove_file(&mut self, path: &str, now: SystemTime) -> Option<FileEntry> {
        let entry = self.files.remove(path)?;
        self.deleted.insert(path.to_owned());
        let (parent, name) = split_parent(path);
        if let Some(parent_state) = self.dirs.get_mut(parent) {
            parent_state.children.remove(name);
            parent_state.version += 1;
            parent_state.mtime = now;
        }
        Some(entry)
    }

    /// Move a file entry from `src` to `dst`, rewriting its remote path.
    pub fn move_file(&mut self, src: &str, dst: &str, dst_remote_path: String, now: SystemTime) {
        if let Some(mut entry) = self.remove_file(src, now) {
            entry.remote_path = dst_remote_path;
            self.insert_file(dst, entry, now);
        }
    }

    /// Remove an empty locally-created directory.
    pub fn remove_dir(&mut self, path: &str, now: SystemTime) -> bool {
        let removable = self
            .dirs
            .get(path)
            .is_some_and(|d| d.created_locally && d.children.is_empty());
        if !removable {
            return false;
        }
        self.dirs.remove(path);
        let (parent, name) = split_parent(path);
        if let Some(parent_state) = self.dirs.get_mut(parent) {
            parent_state.children.remove(name);
            parent_state.version += 1;
            parent_state.mtime = now;
        }
        true
    }

    /// All file paths, for unmount-time sweeps.
    pub fn file_paths(&self) -> impl Iterator<Item = &String> {
        self.files.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> SystemTime {
        SystemTime::UNIX_EPOCH
    }

    fn listing(names: &[&str]) -> Vec<RemoteAttr> {
        names
            .iter()
            .map(|name| RemoteAttr {
                name: (*name).to_owned(),
                size: 7,
                mtime: now(),
                etag: None,
            })
            .collect()
    }

    #[test]
    fn merge_listing_populates_children() {
        let mut tree = Tree::new(now());
        tree.merge_listing("", 0, "base", &listing(&["a.txt", "sub/"]), (0, 0), now());

        assert_eq!(tree.kind("a.txt"), Some(EntryKind::File));
        assert_eq!(tree.kind("sub"), Some(EntryKind::Dir));
        assert_eq!(tree.file("a.txt").unwrap().remote_path, "base/a.txt");
        assert_eq!(tree.children("").len(), 2);
    }

    #[test]
    fn overlay_first_remote_wins() {
        let mut tree = Tree::new(now());
        tree.merge_listing("", 0, "first", &listing(&["shared.txt"]), (0, 0), now());
        tree.merge_listing("", 1, "second", &listing(&["shared.txt"]), (0, 0), now());

        let entry = tree.file("shared.txt").unwrap();
        assert_eq!(entry.remote_index, 0, "lowest-indexed remote must win");
        assert_eq!(entry.remote_path, "first/shared.txt");
    }

    #[test]
    fn removed_file_is_tombstoned() {
        let mut tree = Tree::new(now());
        tree.merge_listing("", 0, "", &listing(&["gone.txt"]), (0, 0), now());

        assert!(tree.remove_file("gone.txt", now()).is_some());
        assert!(tree.is_deleted("gone.txt"));
        assert_eq!(tree.kind("gone.txt"), None);

        // A later listing cannot bring it back.
        tree.merge_listing("", 0, "", &listing(&["gone.txt"]), (0, 0), now());
        assert_eq!(tree.kind("gone.txt"), None);
        assert!(tree.children("").is_empty());
    }

    #[test]
    fn mutation_bumps_parent_version() {
        let mut tree = Tree::new(now());
        let before = tree.version("");
        tree.insert_file(
            "new.txt",
            FileEntry::created(0, "new.txt".to_owned(), now(), (0, 0)),
            now(),
        );
        assert!(tree.version("") > before);
    }

    #[test]
    fn rmdir_only_removes_empty_local_dirs() {
        let mut tree = Tree::new(now());
        tree.merge_listing("", 0, "", &listing(&["remote_dir/"]), (0, 0), now());
        assert!(!tree.remove_dir("remote_dir", now()), "remote dirs stay");

        tree.ensure_dir("made", now()).created_locally = true;
        assert!(tree.remove_dir("made", now()));
        assert_eq!(tree.kind("made"), None);
    }
}
