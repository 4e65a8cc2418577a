//! Error types for the store crate.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error variants for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Wraps standard I/O errors from the local backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wraps errors surfaced by the object-store client.
    #[error("object store: {0}")]
    Backend(#[from] object_store::Error),

    /// The store was configured with missing or contradictory settings.
    #[error("storage {name}: {reason}")]
    InvalidConfig {
        /// Name of the offending store.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A write was attempted on a writer that already committed or aborted.
    #[error("artifact writer is already closed")]
    WriterClosed,
}
