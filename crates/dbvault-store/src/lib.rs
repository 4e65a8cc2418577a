#![warn(missing_docs)]

//! dbvault artifact stores: an atomically-committing local filesystem
//! backend, an object-store backend with streaming uploads, and the
//! grandfather–father–son retention selector that prunes old artifacts.
//!
//! An artifact becomes visible at its final location only when its writer
//! commits; a failed or abandoned write never leaves a visible partial
//! object.

pub mod error;
pub mod local;
pub mod object;
pub mod retention;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use local::LocalStore;
pub use object::{ObjectBackend, S3Options};
pub use retention::{
    apply_retention, parse_artifact_time, select_keep, ArtifactEntry, RetentionError,
    RetentionOutcome, RetentionPolicy, ARTIFACT_TIMESTAMP_FORMAT,
};
pub use store::{ObjectInfo, ObjectWriter, OpenedWriter, Prunable, Store};
