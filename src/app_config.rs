//! Configuration file handling for the muxfs binary.
//!
//! Mounts are described in a TOML file:
//!
//! ```toml
//! mount-point = "~/mnt"
//! cache-base = "~/.cache/muxfs"   # omit for a throwaway cache
//! retries = 3
//!
//! [[targets]]
//! target = "https://s3.amazonaws.com/mybucket/subpath"
//! region = "eu-west-2"            # optional
//! cache-data = true
//! write = true
//! ```
//!
//! S3 credentials come from the usual environment ($AWS_ACCESS_KEY_ID /
//! $AWS_SECRET_ACCESS_KEY, shared credential files) unless given
//! explicitly per target.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use muxfs::config::{ExpandedPathBuf, MountOptions, RemoteOptions};

/// One remote target block.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TargetConfig {
    /// Bucket URL (`https://host/bucket/path`) or a local directory
    /// (absolute path or `file://` URL), mainly useful for trying things
    /// out.
    pub target: String,

    /// Region override for S3 targets.
    #[serde(default)]
    pub region: Option<String>,

    /// Explicit credentials; the SDK default chain applies when unset.
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,

    /// Cache object data on disk for this target.
    #[serde(default)]
    pub cache_data: bool,

    /// Allow writes through this target. At most one target may set this.
    #[serde(default)]
    pub write: bool,

    /// Override the cache location for this target.
    #[serde(default)]
    pub cache_dir: Option<ExpandedPathBuf>,
}

impl TargetConfig {
    /// The per-remote options this block describes.
    #[must_use]
    pub fn remote_options(&self) -> RemoteOptions {
        RemoteOptions {
            cache_data: self.cache_data,
            write: self.write,
            cache_dir: self.cache_dir.as_ref().map(|d| d.as_ref().to_path_buf()),
        }
    }
}

/// The whole config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Where to mount. Empty or missing means `./mnt`.
    #[serde(default)]
    pub mount_point: Option<ExpandedPathBuf>,

    /// Parent directory for cache data. Missing means a temp dir that is
    /// removed on unmount.
    #[serde(default)]
    pub cache_base: Option<ExpandedPathBuf>,

    /// Retries per remote call.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Record every remote call in the in-memory log.
    #[serde(default)]
    pub verbose: bool,

    pub targets: Vec<TargetConfig>,
}

fn default_retries() -> u32 {
    3
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no config file found (tried {0:?})")]
    NotFound(Vec<PathBuf>),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("config has no targets")]
    NoTargets,
}

impl Config {
    /// Config file paths in descending priority order.
    fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("muxfs").join("config.toml"));
        }
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("muxfs").join("config.toml"));
        }
        paths.push(PathBuf::from("/etc/muxfs/config.toml"));
        paths
    }

    fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        if config.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Load from `explicit` or the first existing search path.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_file(path);
        }
        let candidates = Self::search_paths();
        match candidates.iter().find(|p| p.exists()) {
            Some(path) => Self::load_file(path),
            None => Err(ConfigError::NotFound(candidates)),
        }
    }

    /// The mount-wide options this config describes.
    #[must_use]
    pub fn mount_options(&self) -> MountOptions {
        MountOptions {
            mount_point: self
                .mount_point
                .as_ref()
                .map_or_else(PathBuf::new, |p| p.as_ref().to_path_buf()),
            cache_base: self.cache_base.as_ref().map(|p| p.as_ref().to_path_buf()),
            retries: self.retries,
            verbose: self.verbose,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [[targets]]
            target = "https://s3.amazonaws.com/bucket/sub"
            cache-data = true
            write = true
            "#,
        )
        .unwrap();
        assert_eq!(config.retries, 3);
        assert_eq!(config.targets.len(), 1);
        assert!(config.targets[0].write);
        let opts = config.mount_options();
        assert!(opts.cache_base.is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            mount-pint = "/mnt"
            [[targets]]
            target = "x"
            "#,
        );
        assert!(result.is_err(), "typo'd keys should not parse silently");
    }
}
