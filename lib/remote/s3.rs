//! S3 implementation of the [`RemoteAccessor`] capability.
//!
//! The target is given as a URL, `https://host/bucket/subpath`; the deepest
//! subpath holding the files of interest should be used, since every remote
//! path is resolved relative to it. Credentials come from explicit config
//! keys or, when absent, the SDK's default provider chain
//! ($AWS_ACCESS_KEY_ID, shared credential files, instance metadata).

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::SystemTime;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use tokio::io::{AsyncRead, AsyncWriteExt as _, ReadBuf};

use crate::errors::RemoteError;
use crate::remote::accessor::{ObjectStream, RemoteAccessor, RemoteAttr, join_remote};

/// Connection details for one S3 bucket prefix.
#[derive(Debug, Clone, Default)]
pub struct S3Config {
    /// Full URL of the bucket and optional sub-path,
    /// e.g. `https://cog.domain.com/bucket/subpath`.
    pub target: String,
    /// Region override. When unset the SDK's default chain decides.
    pub region: Option<String>,
    /// Explicit credentials; when unset the default chain is used.
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

/// [`RemoteAccessor`] over an S3-compatible store.
pub struct S3Accessor {
    client: Client,
    bucket: String,
    target: String,
    host: String,
    base_path: String,
}

impl S3Accessor {
    /// Parse the target URL and build an SDK client for it.
    pub async fn new(config: &S3Config) -> Result<Self, RemoteError> {
        if config.target.is_empty() {
            return Err(RemoteError::Unclassified("no target defined".to_owned()));
        }
        let url = url::Url::parse(&config.target)
            .map_err(|e| RemoteError::Unclassified(format!("bad target url: {e}")))?;

        let host = url
            .host_str()
            .ok_or_else(|| RemoteError::Unclassified("target url has no host".to_owned()))?
            .to_owned();
        let mut segments = url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()))
            .into_iter()
            .flatten();
        let bucket = segments
            .next()
            .ok_or_else(|| {
                RemoteError::Unclassified(format!(
                    "no bucket could be determined from [{}]",
                    config.target
                ))
            })?
            .to_owned();
        let base_path = segments.collect::<Vec<_>>().join("/");

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let (Some(key), Some(secret)) = (&config.access_key, &config.secret_key) {
            loader = loader
                .credentials_provider(Credentials::new(key, secret, None, None, "muxfs-config"));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if !host.ends_with("amazonaws.com") {
            // Non-AWS endpoints generally only speak path-style addressing.
            builder = builder
                .endpoint_url(format!("{}://{host}", url.scheme()))
                .force_path_style(true);
        }
        let client = Client::from_conf(builder.build());

        Ok(Self {
            client,
            bucket,
            target: config.target.clone(),
            host,
            base_path,
        })
    }

    fn classify<E, R>(path: &str, err: SdkError<E, R>) -> RemoteError
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
        R: std::fmt::Debug + Send + Sync + 'static,
    {
        match err.code() {
            Some("NoSuchKey" | "NoSuchBucket" | "NotFound") => {
                RemoteError::NotFound(path.to_owned())
            }
            Some("QuotaExceeded" | "ServiceQuotaExceededException") => {
                RemoteError::NoQuota(path.to_owned())
            }
            Some("AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch") => {
                RemoteError::PermissionDenied(format!("{path}: {err}"))
            }
            _ => RemoteError::Unclassified(format!("{path}: {err}")),
        }
    }

    async fn open_ranged(
        client: &Client,
        bucket: &str,
        key: &str,
        offset: u64,
    ) -> Result<ByteStream, RemoteError> {
        let mut req = client.get_object().bucket(bucket).key(key);
        if offset > 0 {
            req = req.range(format!("bytes={offset}-"));
        }
        let output = req.send().await.map_err(|e| Self::classify(key, e))?;
        Ok(output.body)
    }
}

/// A seekable stream over one object; a seek becomes a fresh ranged GET.
struct S3Stream {
    client: Client,
    bucket: String,
    key: String,
    pos: u64,
    body: Pin<Box<dyn AsyncRead + Send>>,
}

impl AsyncRead for S3Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = self.body.as_mut().poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let read = buf.filled().len() - before;
            self.pos += read as u64;
        }
        poll
    }
}

#[async_trait]
impl ObjectStream for S3Stream {
    async fn seek(&mut self, offset: u64) -> Result<(), RemoteError> {
        if offset == self.pos {
            return Ok(());
        }
        // No cheap repositioning over HTTP: close and reopen at the new
        // offset.
        let body = S3Accessor::open_ranged(&self.client, &self.bucket, &self.key, offset).await?;
        self.body = Box::pin(body.into_async_read());
        self.pos = offset;
        Ok(())
    }
}

#[async_trait]
impl RemoteAccessor for S3Accessor {
    async fn download_file(&self, src: &str, dest: &Path) -> Result<(), RemoteError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut body = Self::open_ranged(&self.client, &self.bucket, src, 0).await?;
        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| RemoteError::Unclassified(format!("{src}: {e}")))?
        {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn open_file(&self, path: &str) -> Result<Box<dyn ObjectStream>, RemoteError> {
        let body = Self::open_ranged(&self.client, &self.bucket, path, 0).await?;
        Ok(Box::new(S3Stream {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: path.to_owned(),
            pos: 0,
            body: Box::pin(body.into_async_read()),
        }))
    }

    async fn upload_file(
        &self,
        src: &Path,
        dest: &str,
        content_type: &str,
    ) -> Result<(), RemoteError> {
        let body = ByteStream::from_path(src).await.map_err(|e| {
            RemoteError::Io(std::io::Error::other(format!(
                "staging {}: {e}",
                src.display()
            )))
        })?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(dest)
            .content_type(content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| Self::classify(dest, e))?;
        Ok(())
    }

    async fn upload_data(
        &self,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
        dest: &str,
    ) -> Result<(), RemoteError> {
        // put_object needs a known content length, so the stream is spooled
        // to a scratch file first. Callers never observe the spool.
        let spool = tempfile::NamedTempFile::new().map_err(RemoteError::Io)?;
        let mut file = tokio::fs::File::create(spool.path()).await?;
        tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        drop(file);
        self.upload_file(spool.path(), dest, "application/octet-stream")
            .await
    }

    async fn list_entries(&self, dir: &str) -> Result<Vec<RemoteAttr>, RemoteError> {
        let prefix = if dir.is_empty() || dir.ends_with('/') {
            dir.to_owned()
        } else {
            format!("{dir}/")
        };

        let mut attrs = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .delimiter("/")
                .prefix(&prefix);
            if let Some(token) = continuation.take() {
                req = req.continuation_token(token);
            }
            let output = req.send().await.map_err(|e| Self::classify(dir, e))?;

            for common in output.common_prefixes() {
                if let Some(sub) = common.prefix() {
                    if let Some(rel) = sub.strip_prefix(&prefix) {
                        attrs.push(RemoteAttr {
                            name: rel.to_owned(),
                            size: 0,
                            mtime: SystemTime::UNIX_EPOCH,
                            etag: None,
                        });
                    }
                }
            }
            for object in output.contents() {
                let Some(key) = object.key() else { continue };
                let Some(rel) = key.strip_prefix(&prefix) else {
                    continue;
                };
                if rel.is_empty() {
                    // Zero-byte marker some tools create for the
                    // "directory" itself.
                    continue;
                }
                let mtime = object
                    .last_modified()
                    .and_then(|dt| SystemTime::try_from(*dt).ok())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                attrs.push(RemoteAttr {
                    name: rel.to_owned(),
                    size: object.size().unwrap_or(0).max(0).unsigned_abs(),
                    mtime,
                    etag: object.e_tag().map(|t| t.trim_matches('"').to_owned()),
                });
            }

            match output.next_continuation_token() {
                Some(token) => continuation = Some(token.to_owned()),
                None => break,
            }
        }
        attrs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(attrs)
    }

    async fn copy_file(&self, src: &str, dest: &str) -> Result<(), RemoteError> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{src}", self.bucket))
            .key(dest)
            .send()
            .await
            .map_err(|e| Self::classify(src, e))?;
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<(), RemoteError> {
        // S3 DeleteObject already succeeds for absent keys.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| Self::classify(path, e))?;
        Ok(())
    }

    async fn delete_incomplete_upload(&self, path: &str) -> Result<(), RemoteError> {
        // Spooled uploads are single PutObject calls, so an interrupted one
        // leaves either nothing or a complete stale object; remove the key
        // either way.
        self.delete_file(path).await
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn remote_path(&self, rel: &str) -> String {
        join_remote(&self.base_path, rel)
    }

    fn local_path(&self, base: &Path, remote_path: &str) -> PathBuf {
        base.join(&self.host)
            .join(&self.bucket)
            .join(remote_path.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn target_parsing_extracts_bucket_and_base() {
        let accessor = S3Accessor::new(&S3Config {
            target: "https://cog.example.com/mybucket/sub/path".to_owned(),
            region: Some("eu-west-2".to_owned()),
            access_key: Some("k".to_owned()),
            secret_key: Some("s".to_owned()),
        })
        .await
        .unwrap();

        assert_eq!(accessor.bucket, "mybucket");
        assert_eq!(accessor.base_path, "sub/path");
        assert_eq!(accessor.remote_path("a/b.txt"), "sub/path/a/b.txt");
        assert_eq!(
            accessor.local_path(Path::new("/cache"), "sub/path/a.txt"),
            PathBuf::from("/cache/cog.example.com/mybucket/sub/path/a.txt")
        );
    }

    #[tokio::test]
    async fn target_without_bucket_is_rejected() {
        let err = S3Accessor::new(&S3Config {
            target: "https://cog.example.com".to_owned(),
            ..S3Config::default()
        })
        .await
        .err()
        .unwrap();
        assert!(matches!(err, RemoteError::Unclassified(_)));
    }
}
