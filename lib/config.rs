//! Mount and remote options, path expansion, and mount-point validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::MountError;

/// A `PathBuf` that expands a leading `~` during deserialization, so any
/// path coming out of configuration is already resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ExpandedPathBuf(PathBuf);

impl<'de> Deserialize<'de> for ExpandedPathBuf {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_str(&raw))
    }
}

impl ExpandedPathBuf {
    /// Expand `~` in `raw` and wrap the result.
    #[must_use]
    pub fn from_str(raw: &str) -> Self {
        let expanded = shellexpand::tilde(raw);
        Self(PathBuf::from(expanded.into_owned()))
    }

    /// Wrap an already-resolved path without expansion.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self(path)
    }
}

impl std::ops::Deref for ExpandedPathBuf {
    type Target = Path;

    fn deref(&self) -> &Path {
        &self.0
    }
}

impl AsRef<Path> for ExpandedPathBuf {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl std::fmt::Display for ExpandedPathBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.display().fmt(f)
    }
}

/// Options for one mount.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Target mount directory. Empty means `./mnt`.
    pub mount_point: PathBuf,
    /// Parent directory for per-remote cache dirs. `None` means a fresh
    /// temp dir, removed on unmount.
    pub cache_base: Option<PathBuf>,
    /// Retries per remote call; 0 means a single attempt.
    pub retries: u32,
    /// Record every call in the in-memory ring, not just failures.
    pub verbose: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            mount_point: PathBuf::from("./mnt"),
            cache_base: None,
            retries: 3,
            verbose: false,
        }
    }
}

impl MountOptions {
    /// Resolve the configured mount point: tilde-expanded, defaulted to
    /// `./mnt` when empty.
    #[must_use]
    pub fn resolved_mount_point(&self) -> PathBuf {
        if self.mount_point.as_os_str().is_empty() {
            return PathBuf::from("./mnt");
        }
        ExpandedPathBuf::from_str(&self.mount_point.to_string_lossy())
            .as_ref()
            .to_path_buf()
    }
}

/// Per-remote options (the accessor itself is wired separately).
#[derive(Debug, Clone, Default)]
pub struct RemoteOptions {
    /// Enable the on-disk block cache for this remote's reads. Required
    /// when `write` is set and random writes are expected.
    pub cache_data: bool,
    /// Enable write paths. At most one remote per mount may set this.
    pub write: bool,
    /// Override this remote's cache location (absolute, relative, or
    /// `~`-prefixed). Overrides `cache_base`.
    pub cache_dir: Option<PathBuf>,
}

impl RemoteOptions {
    /// The cache dir this remote should use, given the mount-wide base.
    #[must_use]
    pub fn cache_dir_under(&self, base: &Path) -> PathBuf {
        match &self.cache_dir {
            Some(dir) => ExpandedPathBuf::from_str(&dir.to_string_lossy())
                .as_ref()
                .to_path_buf(),
            None => base.to_path_buf(),
        }
    }
}

/// Check that `path` is usable as a mount point: an existing (or
/// creatable), empty, non-root directory.
pub fn validate_mount_point(path: &Path) -> Result<PathBuf, MountError> {
    if path.parent().is_none() {
        return Err(MountError::InvalidMount {
            path: path.to_path_buf(),
            reason: "refusing to mount over the filesystem root".to_owned(),
        });
    }
    match std::fs::read_dir(path) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(MountError::InvalidMount {
                    path: path.to_path_buf(),
                    reason: "directory is not empty".to_owned(),
                });
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir_all(path).map_err(|e| MountError::InvalidMount {
                path: path.to_path_buf(),
                reason: format!("could not create: {e}"),
            })?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotADirectory => {
            return Err(MountError::InvalidMount {
                path: path.to_path_buf(),
                reason: "not a directory".to_owned(),
            });
        }
        Err(e) => {
            return Err(MountError::InvalidMount {
                path: path.to_path_buf(),
                reason: e.to_string(),
            });
        }
    }
    path.canonicalize().map_err(|e| MountError::InvalidMount {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
