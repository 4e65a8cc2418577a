//! Store and pruning contracts shared by all backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWrite;

use crate::error::StoreResult;

/// One stored artifact, as reported by [`Prunable::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Slash-joined key relative to the store root.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: DateTime<Utc>,
}

/// An in-flight artifact write.
///
/// The writer moves through `open → writing → (committed | aborted)`.
/// [`commit`](ObjectWriter::commit) is the only transition that makes the
/// artifact visible at its final location; [`abort`](ObjectWriter::abort)
/// discards everything written so far. Both are terminal — a second call is
/// a no-op and further writes fail.
#[async_trait]
pub trait ObjectWriter: AsyncWrite + Send + Unpin {
    /// Finalizes the artifact and makes it visible. Blocks until the
    /// backend has confirmed the data is durable.
    async fn commit(&mut self) -> StoreResult<()>;

    /// Discards the partial artifact. Never leaves a visible object.
    async fn abort(&mut self) -> StoreResult<()>;
}

/// The result of opening a store writer: the stream plus the final
/// location string the artifact will be visible at after commit.
pub struct OpenedWriter {
    /// Append-only artifact stream.
    pub writer: Box<dyn ObjectWriter>,
    /// Human-readable final location (filesystem path, `s3://…`, …).
    pub location: String,
}

/// A named artifact store.
#[async_trait]
pub trait Store: Send + Sync {
    /// The configured store name.
    fn name(&self) -> &str;

    /// Opens an append-only writer for `key` (slash-joined, relative).
    async fn open_writer(&self, key: &str) -> StoreResult<OpenedWriter>;

    /// The pruning interface, for stores that support listing and
    /// deleting. Stores without it silently opt out of retention.
    fn prunable(&self) -> Option<&dyn Prunable> {
        None
    }
}

/// Listing and deletion, the two operations retention needs.
#[async_trait]
pub trait Prunable: Send + Sync {
    /// Lists artifacts under a key prefix.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectInfo>>;

    /// Deletes one artifact. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;
}
