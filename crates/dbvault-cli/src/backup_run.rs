//! The backup orchestrator.
//!
//! For each configured database, in order: start the dump, assemble the
//! encode pipeline, stream into the store writer, then tear down in LIFO
//! order (stages, source, sink). Only a clean copy commits the artifact;
//! every failure path aborts the writer so no partial object becomes
//! visible. Retention runs after a successful commit and downgrades the
//! result on failure without rewinding the commit. Each run ends with a
//! detached notification.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};

use dbvault_codec::expected_ext;
use dbvault_schedule::ScheduleError;
use dbvault_store::{
    apply_retention, RetentionError, Store, StoreError, ARTIFACT_TIMESTAMP_FORMAT,
};

use crate::cancel::{CancelReason, CancelToken};
use crate::config::{Config, ConfigError, DatabaseConfig};
use crate::notify::{Dispatcher, Event, NotifyError, Status};
use crate::pipeline::{encrypt_stage, gzip_stage, BoxedReader, CloseStack};
use crate::postgres::{AdapterError, DumpSource};
use crate::stores::build_stores;

/// Outcome of one database's backup, success or not.
#[derive(Debug)]
pub struct BackupResult {
    /// Database name.
    pub db: String,
    /// Final status.
    pub status: Status,
    /// Bytes written to the store before the run ended.
    pub bytes: u64,
    /// Artifact location, when a writer was opened.
    pub dest: String,
    /// Wall-clock duration of this database's run.
    pub duration: Duration,
    /// Error string; empty on success.
    pub error: String,
}

/// Backup failure taxonomy.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Configuration did not validate.
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    /// A store could not be constructed from its configuration.
    #[error("storage: {0}")]
    StoreSetup(StoreError),

    /// Notification routes could not be constructed.
    #[error("notifications: {0}")]
    Notify(NotifyError),

    /// A database has an unsupported kind.
    #[error("unsupported database type: {kind} {{db: {db}}}")]
    UnsupportedType {
        /// Database name.
        db: String,
        /// The offending kind.
        kind: String,
    },

    /// A database references a store that was not built.
    #[error("db {db}: storage {name:?} not found")]
    StoreNotFound {
        /// Database name.
        db: String,
        /// The dangling store name.
        name: String,
    },

    /// The dump tool could not be started.
    #[error("backup failed for {db}: {source}")]
    Dump {
        /// Database name.
        db: String,
        /// Underlying adapter error.
        source: AdapterError,
    },

    /// The store writer could not be opened.
    #[error("open storage writer: {0}")]
    OpenWriter(StoreError),

    /// The streaming copy failed for a reason other than cancellation.
    #[error("write backup: {0}")]
    Write(io::Error),

    /// The governing deadline expired mid-run.
    #[error("backup timed out for {db}")]
    Timeout {
        /// Database name.
        db: String,
    },

    /// The run was cancelled mid-copy.
    #[error("backup canceled for {db}")]
    Canceled {
        /// Database name.
        db: String,
    },

    /// The dump stream reported a failure at close.
    #[error("close dump stream: {0}")]
    DumpClose(io::Error),

    /// The store writer failed to commit.
    #[error("finalize storage write: {0}")]
    Finalize(StoreError),

    /// Retention failed after a successful commit; the artifact remains.
    #[error("retention failed for {db}: {source}")]
    Retention {
        /// Database name.
        db: String,
        /// Underlying retention error.
        source: RetentionError,
    },

    /// A scheduled database carries an unparseable cron expression.
    #[error("db {db}: invalid schedule {schedule:?}: {source}")]
    Schedule {
        /// Database name.
        db: String,
        /// The raw expression.
        schedule: String,
        /// Parse failure.
        source: ScheduleError,
    },

    /// The daemon found nothing to schedule.
    #[error("no databases with a valid non-empty backup schedule")]
    NothingScheduled,
}

/// Runs a backup of every database in `cfg`, sequentially.
///
/// Stops at the first failing database and returns its error; earlier
/// successes stand. Every database run, failed or not, emits a
/// notification event first.
pub async fn run_backup(
    token: &CancelToken,
    cfg: &Config,
    dump: &dyn DumpSource,
) -> Result<Vec<BackupResult>, BackupError> {
    cfg.validate()?;

    let used: HashSet<String> = cfg
        .databases
        .iter()
        .map(|db| db.backup.storage.clone())
        .collect();
    let stores = build_stores(cfg, &used).map_err(BackupError::StoreSetup)?;
    let dispatcher = Dispatcher::from_config(&cfg.notifications).map_err(BackupError::Notify)?;

    let mut results = Vec::with_capacity(cfg.databases.len());
    for db in &cfg.databases {
        let (result, error) = backup_database(token, db, &stores, dump).await;
        dispatcher.dispatch(&result_event(&result)).await;

        if let Some(err) = error {
            results.push(result);
            return Err(err);
        }
        println!(
            "backup OK: db={} bytes={} dest={} duration={:?}",
            result.db,
            result.bytes,
            result.dest,
            round_millis(result.duration),
        );
        results.push(result);
    }
    Ok(results)
}

async fn backup_database(
    token: &CancelToken,
    db: &DatabaseConfig,
    stores: &HashMap<String, Arc<dyn Store>>,
    dump: &dyn DumpSource,
) -> (BackupResult, Option<BackupError>) {
    let started = Instant::now();
    let fail = |bytes: u64, dest: String, err: BackupError| {
        let result = BackupResult {
            db: db.name.clone(),
            status: Status::Failure,
            bytes,
            dest,
            duration: started.elapsed(),
            error: err.to_string(),
        };
        (result, Some(err))
    };

    if db.kind != "postgres" {
        return fail(
            0,
            String::new(),
            BackupError::UnsupportedType {
                db: db.name.clone(),
                kind: db.kind.clone(),
            },
        );
    }

    let Some(store) = stores.get(&db.backup.storage) else {
        return fail(
            0,
            String::new(),
            BackupError::StoreNotFound {
                db: db.name.clone(),
                name: db.backup.storage.clone(),
            },
        );
    };

    debug!(
        db = %db.name,
        compression = db.backup.compression,
        encryption = db.backup.encryption.enabled,
        storage = store.name(),
        "starting backup pipeline"
    );

    let source = match dump.open(db).await {
        Ok(stream) => stream,
        Err(e) => {
            return fail(
                0,
                String::new(),
                BackupError::Dump {
                    db: db.name.clone(),
                    source: e,
                },
            )
        }
    };
    let source_handle = source.handle();

    let ts = Utc::now().format(ARTIFACT_TIMESTAMP_FORMAT).to_string();
    let ext = expected_ext(db.backup.compression, db.backup.encryption.enabled);
    let key = format!("{}/{}{}", db.name, ts, ext);

    let opened = match store.open_writer(&key).await {
        Ok(opened) => opened,
        Err(e) => {
            source_handle.force_close();
            return fail(0, String::new(), BackupError::OpenWriter(e));
        }
    };
    let mut writer = opened.writer;
    let dest = opened.location;

    // Assemble stages in dataflow order, registering each pipe on the
    // close-stack.
    let mut stack = CloseStack::new();
    let mut stream: BoxedReader = Box::new(source);
    if db.backup.compression {
        stream = gzip_stage(stream, &mut stack);
    }
    if db.backup.encryption.enabled {
        stream = encrypt_stage(stream, db.backup.encryption.password.clone(), &mut stack);
    }

    // The copy races the governing token; cancellation wins immediately
    // and teardown below unblocks any stuck producer.
    let copy_res: io::Result<u64> = tokio::select! {
        r = tokio::io::copy(&mut stream, &mut writer) => r,
        _ = token.cancelled() => Err(io::Error::new(io::ErrorKind::Interrupted, "run cancelled")),
    };

    // Close order matters: stages (reverse of construction), then the
    // dump source, then the sink.
    stack.close_all();
    let dump_close = source_handle.close();

    match copy_res {
        Err(copy_err) => {
            if let Err(e) = writer.abort().await {
                warn!(db = %db.name, error = %e, "abort of store writer failed");
            }
            let err = if token.is_cancelled() {
                match token.reason() {
                    Some(CancelReason::DeadlineExceeded) => BackupError::Timeout {
                        db: db.name.clone(),
                    },
                    _ => BackupError::Canceled {
                        db: db.name.clone(),
                    },
                }
            } else {
                BackupError::Write(copy_err)
            };
            fail(0, dest, err)
        }
        Ok(bytes) => {
            if let Err(e) = dump_close {
                if let Err(abort_err) = writer.abort().await {
                    warn!(db = %db.name, error = %abort_err, "abort of store writer failed");
                }
                return fail(bytes, dest, BackupError::DumpClose(e));
            }
            if let Err(e) = writer.commit().await {
                return fail(bytes, dest, BackupError::Finalize(e));
            }

            match apply_retention(store.as_ref(), &db.name, db.backup.retention.policy()).await {
                Ok(outcome) => {
                    if outcome.deleted > 0 || outcome.skipped > 0 {
                        debug!(
                            db = %db.name,
                            deleted = outcome.deleted,
                            skipped = outcome.skipped,
                            "retention pruned artifacts"
                        );
                    }
                    let result = BackupResult {
                        db: db.name.clone(),
                        status: Status::Success,
                        bytes,
                        dest,
                        duration: started.elapsed(),
                        error: String::new(),
                    };
                    (result, None)
                }
                Err(e) => fail(
                    bytes,
                    dest,
                    BackupError::Retention {
                        db: db.name.clone(),
                        source: e,
                    },
                ),
            }
        }
    }
}

fn result_event(result: &BackupResult) -> Event {
    Event {
        db: result.db.clone(),
        status: result.status,
        bytes: result.bytes,
        dest: result.dest.clone(),
        duration: format!("{:?}", round_millis(result.duration)),
        error: result.error.clone(),
    }
}

fn round_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}
