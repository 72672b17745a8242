//! A [`RemoteAccessor`] backed by a plain local directory.
//!
//! Exists for two reasons: it lets the whole stack be exercised in tests
//! without network access, and it makes `file://` targets mountable. The
//! directory plays the role of the bucket prefix; nested directories are
//! first-class, unlike on a flat object store, but the listing contract
//! (trailing `/`, names relative to the listed dir) is identical.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeekExt as _, ReadBuf};

use crate::errors::RemoteError;
use crate::remote::accessor::{ObjectStream, RemoteAccessor, RemoteAttr, join_remote};

/// Directory-backed accessor.
pub struct LocalAccessor {
    root: PathBuf,
    target: String,
}

impl LocalAccessor {
    /// Wrap `root` as a remote prefix. The directory must already exist.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let target = format!("file://{}", root.display());
        Self { root, target }
    }

    fn resolve(&self, remote: &str) -> PathBuf {
        self.root.join(remote.trim_start_matches('/'))
    }

    fn classify(path: &str, e: std::io::Error) -> RemoteError {
        if e.kind() == std::io::ErrorKind::NotFound {
            RemoteError::NotFound(path.to_owned())
        } else if e.raw_os_error() == Some(libc::ENOSPC) {
            RemoteError::NoQuota(path.to_owned())
        } else {
            RemoteError::Io(e)
        }
    }
}

struct LocalStream {
    file: tokio::fs::File,
}

impl AsyncRead for LocalStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

#[async_trait]
impl ObjectStream for LocalStream {
    async fn seek(&mut self, offset: u64) -> Result<(), RemoteError> {
        self.file
            .seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(RemoteError::Io)?;
        Ok(())
    }
}

#[async_trait]
impl RemoteAccessor for LocalAccessor {
    async fn download_file(&self, src: &str, dest: &Path) -> Result<(), RemoteError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(self.resolve(src), dest)
            .await
            .map_err(|e| Self::classify(src, e))?;
        Ok(())
    }

    async fn open_file(&self, path: &str) -> Result<Box<dyn ObjectStream>, RemoteError> {
        let file = tokio::fs::File::open(self.resolve(path))
            .await
            .map_err(|e| Self::classify(path, e))?;
        Ok(Box::new(LocalStream { file }))
    }

    async fn upload_file(
        &self,
        src: &Path,
        dest: &str,
        _content_type: &str,
    ) -> Result<(), RemoteError> {
        let target = self.resolve(dest);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(src, &target)
            .await
            .map_err(|e| Self::classify(dest, e))?;
        Ok(())
    }

    async fn upload_data(
        &self,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
        dest: &str,
    ) -> Result<(), RemoteError> {
        let target = self.resolve(dest);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&target)
            .await
            .map_err(|e| Self::classify(dest, e))?;
        tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| Self::classify(dest, e))?;
        Ok(())
    }

    async fn list_entries(&self, dir: &str) -> Result<Vec<RemoteAttr>, RemoteError> {
        let mut read_dir = tokio::fs::read_dir(self.resolve(dir))
            .await
            .map_err(|e| Self::classify(dir, e))?;

        let mut attrs = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let meta = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if meta.is_dir() {
                attrs.push(RemoteAttr {
                    name: format!("{name}/"),
                    size: 0,
                    mtime: meta.modified()?,
                    etag: None,
                });
            } else if meta.is_file() {
                attrs.push(RemoteAttr {
                    name,
                    size: meta.len(),
                    mtime: meta.modified()?,
                    etag: None,
                });
            }
            // Anything else (sockets, fifos) has no object-store analogue.
        }
        attrs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(attrs)
    }

    async fn copy_file(&self, src: &str, dest: &str) -> Result<(), RemoteError> {
        let target = self.resolve(dest);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(self.resolve(src), target)
            .await
            .map_err(|e| Self::classify(src, e))?;
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<(), RemoteError> {
        match tokio::fs::remove_file(self.resolve(path)).await {
            Ok(()) => Ok(()),
            // Idempotent per the accessor contract.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::classify(path, e)),
        }
    }

    async fn delete_incomplete_upload(&self, path: &str) -> Result<(), RemoteError> {
        // A partial local upload is just a partial file.
        self.delete_file(path).await
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn remote_path(&self, rel: &str) -> String {
        join_remote("", rel)
    }

    fn local_path(&self, base: &Path, remote_path: &str) -> PathBuf {
        base.join("local").join(remote_path.trim_start_matches('/'))
    }
}
