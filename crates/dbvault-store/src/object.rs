//! Object-store backend with streaming uploads.
//!
//! Wraps any [`object_store`] implementation. The writer returned by
//! `open_writer` feeds a multipart upload that runs while the pipeline is
//! still producing bytes; commit blocks until the service confirms the
//! upload, abort cancels it so no object appears.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{DynObjectStore, ObjectStore as _};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::{ObjectInfo, ObjectWriter, OpenedWriter, Prunable, Store};

/// Connection settings for an S3-compatible bucket.
#[derive(Debug, Clone, Default)]
pub struct S3Options {
    /// Bucket name. Required.
    pub bucket: String,
    /// Bucket region. Required.
    pub region: String,
    /// Key prefix inside the bucket, without leading or trailing slashes.
    pub prefix: String,
    /// Static access key; falls back to ambient credentials when empty.
    pub access_key: String,
    /// Static secret key.
    pub secret_key: String,
}

/// Store backed by an object service.
#[derive(Debug)]
pub struct ObjectBackend {
    name: String,
    inner: Arc<DynObjectStore>,
    prefix: String,
    base_url: String,
}

impl ObjectBackend {
    /// Wraps an arbitrary object store client.
    pub fn new(
        name: impl Into<String>,
        inner: Arc<DynObjectStore>,
        prefix: &str,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            inner,
            prefix: prefix.trim_matches('/').to_string(),
            base_url: base_url.into(),
        }
    }

    /// Builds an S3-backed store from connection options.
    pub fn s3(name: impl Into<String>, opts: &S3Options) -> StoreResult<Self> {
        let name = name.into();
        if opts.bucket.is_empty() || opts.region.is_empty() {
            return Err(StoreError::InvalidConfig {
                name,
                reason: "s3 bucket and region are required".to_string(),
            });
        }

        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&opts.bucket)
            .with_region(&opts.region);
        if !opts.access_key.is_empty() {
            builder = builder
                .with_access_key_id(&opts.access_key)
                .with_secret_access_key(&opts.secret_key);
        }
        let store = builder.build()?;

        let base_url = format!("s3://{}", opts.bucket);
        Ok(Self::new(name, Arc::new(store), &opts.prefix, base_url))
    }

    /// In-memory store, used by tests and dry runs.
    pub fn in_memory(name: impl Into<String>) -> Self {
        let name = name.into();
        let base_url = format!("mem://{name}");
        Self::new(name, Arc::new(InMemory::new()), "", base_url)
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    fn relative_key(&self, location: &str) -> String {
        if self.prefix.is_empty() {
            location.to_string()
        } else {
            location
                .strip_prefix(&format!("{}/", self.prefix))
                .unwrap_or(location)
                .to_string()
        }
    }
}

#[async_trait]
impl Store for ObjectBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open_writer(&self, key: &str) -> StoreResult<OpenedWriter> {
        let full_key = self.full_key(key);
        let path = ObjectPath::from(full_key.clone());
        let writer = BufWriter::new(self.inner.clone(), path);
        debug!(key = %full_key, store = %self.name, "opened object upload");

        Ok(OpenedWriter {
            writer: Box::new(ObjectUploadWriter {
                inner: writer,
                done: false,
            }),
            location: format!("{}/{}", self.base_url, full_key),
        })
    }

    fn prunable(&self) -> Option<&dyn Prunable> {
        Some(self)
    }
}

#[async_trait]
impl Prunable for ObjectBackend {
    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectInfo>> {
        let full_prefix = ObjectPath::from(self.full_key(prefix));
        let mut stream = self.inner.list(Some(&full_prefix));

        let mut out = Vec::new();
        while let Some(meta) = stream.next().await {
            let meta = meta?;
            out.push(ObjectInfo {
                key: self.relative_key(meta.location.as_ref()),
                size: meta.size as u64,
                modified: meta.last_modified,
            });
        }
        Ok(out)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let path = ObjectPath::from(self.full_key(key));
        match self.inner.delete(&path).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Streaming upload writer; the upload runs concurrently with the writes.
struct ObjectUploadWriter {
    inner: BufWriter,
    done: bool,
}

impl AsyncWrite for ObjectUploadWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let me = self.get_mut();
        if me.done {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "artifact writer is closed",
            )));
        }
        Pin::new(&mut me.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl ObjectWriter for ObjectUploadWriter {
    async fn commit(&mut self) -> StoreResult<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        // shutdown completes the multipart upload and waits for the
        // service's confirmation; errors surface here.
        self.inner.shutdown().await.map_err(StoreError::Io)
    }

    async fn abort(&mut self) -> StoreResult<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        self.inner.abort().await.map_err(StoreError::Backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_roundtrip() {
        let st = ObjectBackend::in_memory("mem");
        let mut opened = st.open_writer("db/a.dump").await.unwrap();
        opened.writer.write_all(b"archive").await.unwrap();
        opened.writer.commit().await.unwrap();

        assert_eq!(opened.location, "mem://mem/db/a.dump");
        let listed = st.list("db").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "db/a.dump");
        assert_eq!(listed[0].size, 7);
    }

    #[tokio::test]
    async fn abort_discards_upload() {
        let st = ObjectBackend::in_memory("mem");
        let mut opened = st.open_writer("db/a.dump").await.unwrap();
        opened.writer.write_all(b"half").await.unwrap();
        opened.writer.abort().await.unwrap();

        assert!(st.list("db").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_missing_is_ok() {
        let st = ObjectBackend::in_memory("mem");
        st.delete("db/never-there.dump").await.unwrap();
    }

    #[tokio::test]
    async fn prefix_is_applied_and_stripped() {
        let inner: Arc<DynObjectStore> = Arc::new(InMemory::new());
        let st = ObjectBackend::new("mem", inner.clone(), "team/backups", "mem://mem");

        let mut opened = st.open_writer("db/a.dump").await.unwrap();
        opened.writer.write_all(b"x").await.unwrap();
        opened.writer.commit().await.unwrap();

        assert_eq!(opened.location, "mem://mem/team/backups/db/a.dump");
        let listed = st.list("db").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "db/a.dump");

        st.delete("db/a.dump").await.unwrap();
        assert!(st.list("db").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn s3_requires_bucket_and_region() {
        let err = ObjectBackend::s3("bad", &S3Options::default()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidConfig { .. }));
    }
}
