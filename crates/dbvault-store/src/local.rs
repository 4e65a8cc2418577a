//! Local filesystem store with atomic commit.
//!
//! Writes land in a sibling `<final>.tmp` file; commit is fsync-then-rename
//! so a crash or failure at any earlier point leaves nothing visible at the
//! final path.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::{ObjectInfo, ObjectWriter, OpenedWriter, Prunable, Store};

/// Store rooted at a base directory on the local filesystem.
pub struct LocalStore {
    name: String,
    base: PathBuf,
}

impl LocalStore {
    /// Creates a store rooted at `base`. The directory is created lazily on
    /// the first write.
    pub fn new(name: impl Into<String>, base: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            base: base.into(),
        }
    }

    /// The configured base directory.
    pub fn base(&self) -> &Path {
        &self.base
    }

    fn resolve(&self, key: &str) -> PathBuf {
        let mut path = self.base.clone();
        for part in key.split('/') {
            path.push(part);
        }
        path
    }
}

#[async_trait]
impl Store for LocalStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open_writer(&self, key: &str) -> StoreResult<OpenedWriter> {
        let final_path = self.resolve(key);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut tmp_os = final_path.clone().into_os_string();
        tmp_os.push(".tmp");
        let tmp_path = PathBuf::from(tmp_os);

        let file = fs::File::create(&tmp_path).await?;
        debug!(key, tmp = %tmp_path.display(), "opened local artifact writer");

        let location = final_path.display().to_string();
        Ok(OpenedWriter {
            writer: Box::new(LocalWriter {
                file: Some(file),
                tmp_path,
                final_path,
                done: false,
            }),
            location,
        })
    }

    fn prunable(&self) -> Option<&dyn Prunable> {
        Some(self)
    }
}

#[async_trait]
impl Prunable for LocalStore {
    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectInfo>> {
        let dir = self.resolve(prefix);
        let mut rd = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            // Stray temp files from an interrupted run are not artifacts.
            if name.ends_with(".tmp") {
                continue;
            }
            let key = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix.trim_end_matches('/'), name)
            };
            out.push(ObjectInfo {
                key,
                size: meta.len(),
                modified: meta.modified()?.into(),
            });
        }
        Ok(out)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        match fs::remove_file(self.resolve(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Writer into a sibling temp file; rename happens only on commit.
struct LocalWriter {
    file: Option<fs::File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    done: bool,
}

impl AsyncWrite for LocalWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut().file.as_mut() {
            Some(f) => Pin::new(f).poll_write(cx, buf),
            None => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "artifact writer is closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut().file.as_mut() {
            Some(f) => Pin::new(f).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut().file.as_mut() {
            Some(f) => Pin::new(f).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

#[async_trait]
impl ObjectWriter for LocalWriter {
    async fn commit(&mut self) -> StoreResult<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;

        let mut file = self.file.take().ok_or(StoreError::WriterClosed)?;
        let synced: std::io::Result<()> = async {
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;
        drop(file);

        if let Err(e) = synced {
            let _ = fs::remove_file(&self.tmp_path).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&self.tmp_path, &self.final_path).await {
            let _ = fs::remove_file(&self.tmp_path).await;
            return Err(e.into());
        }
        debug!(path = %self.final_path.display(), "artifact committed");
        Ok(())
    }

    async fn abort(&mut self) -> StoreResult<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        self.file.take();
        match fs::remove_file(&self.tmp_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LocalWriter {
    fn drop(&mut self) {
        // Last-resort cleanup when neither commit nor abort ran.
        if !self.done {
            self.file.take();
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}
