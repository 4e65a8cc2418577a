//! The restore orchestrator.
//!
//! The decode pipeline is built from what the artifact actually contains,
//! not from configuration: the raw head is sniffed, each decoded layer is
//! sniffed again, and the final stream is gated on being a recognizable
//! archive (or SQL text when the fallback is allowed). A configured shape
//! that disagrees with the bytes is fatal only under strict sniffing.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, warn};

use dbvault_codec::{
    artifact_suffix, expected_ext, expected_raw_kind, sniff_decoded, sniff_leading, sniff_raw,
    CodecError, DecodedKind, LeadingKind, Peek, RawKind,
};

use crate::config::{Config, DatabaseConfig};
use crate::pipeline::{decrypt_stage, gunzip_stage, BoxedReader, CloseStack};
use crate::postgres::{run_restore_tool, tool_on_path, AdapterError};

/// Restore invocation options, straight off the command line.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Database to restore into; the first configured one when absent.
    pub db: Option<String>,
    /// Artifact file to restore from.
    pub from: PathBuf,
    /// Pass `--clean --if-exists` to the archive tool.
    pub clean: bool,
    /// Make any sniff/config mismatch fatal.
    pub strict_sniff: bool,
    /// Allow falling back to the SQL client for plain SQL dumps.
    pub allow_sql_fallback: bool,
}

/// Restore failure taxonomy.
#[derive(Debug, Error)]
pub enum RestoreError {
    /// No databases are configured to pick from.
    #[error("no databases configured")]
    NoDatabases,

    /// The named database is absent from the configuration.
    #[error("db {0:?} not found in config")]
    UnknownDatabase(String),

    /// The selected database has an unsupported kind.
    #[error("unsupported database type: {kind} {{db: {db}}}")]
    UnsupportedType {
        /// Database name.
        db: String,
        /// The offending kind.
        kind: String,
    },

    /// A required external tool is missing.
    #[error("{tool} not found in PATH")]
    ToolMissing {
        /// Tool name.
        tool: &'static str,
    },

    /// The artifact file could not be opened.
    #[error("open {path}: {source}")]
    Open {
        /// Path that failed.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// A sniff operation failed on I/O or an empty stream.
    #[error("sniff: {0}")]
    Sniff(CodecError),

    /// Strict sniffing found the artifact head disagreeing with config.
    #[error(
        "backup header mismatch for db={db}: expected {expected:?} from config, got {got:?}"
    )]
    StrictMismatch {
        /// Database name.
        db: String,
        /// Kind the configuration predicts.
        expected: String,
        /// Kind the bytes show.
        got: String,
    },

    /// The artifact is encrypted but no password is configured.
    #[error("encryption password is empty (db={0})")]
    MissingPassword(String),

    /// The raw head matched nothing and SQL fallback is off.
    #[error(
        "unrecognized backup header; rerun with --allow-sql-fallback if this may be a plain SQL dump"
    )]
    UnknownRaw,

    /// The decoded stream is SQL text and SQL fallback is off.
    #[error(
        "decoded stream looks like SQL text; rerun with --allow-sql-fallback to restore with psql"
    )]
    SqlNotAllowed,

    /// The decoded stream matched nothing usable.
    #[error("decoded stream is neither a custom-format archive nor recognizable SQL text")]
    UnknownDecoded,

    /// Streaming into the tool failed.
    #[error("restore stream: {0}")]
    Stream(io::Error),

    /// The restore tool failed.
    #[error("{0}")]
    Tool(AdapterError),

    /// The restore tool failed because target objects already exist.
    #[error(
        "{source}\nhint: target database is not empty. rerun with --clean or restore into a fresh database"
    )]
    ToolConflict {
        /// Underlying tool failure.
        source: AdapterError,
    },
}

/// Restores one database from an artifact file.
pub async fn run_restore(cfg: &Config, opts: &RestoreOptions) -> Result<(), RestoreError> {
    let db = select_database(cfg, opts.db.as_deref())?;
    if db.kind != "postgres" {
        return Err(RestoreError::UnsupportedType {
            db: db.name.clone(),
            kind: db.kind.clone(),
        });
    }
    if !tool_on_path("pg_restore") {
        return Err(RestoreError::ToolMissing { tool: "pg_restore" });
    }

    let mut file = tokio::fs::File::open(&opts.from)
        .await
        .map_err(|source| RestoreError::Open {
            path: opts.from.clone(),
            source,
        })?;

    let raw = sniff_raw(&mut file).await.map_err(RestoreError::Sniff)?;
    let expected = expected_raw_kind(db.backup.compression, db.backup.encryption.enabled);
    if raw != expected {
        if opts.strict_sniff {
            return Err(RestoreError::StrictMismatch {
                db: db.name.clone(),
                expected: expected.to_string(),
                got: raw.to_string(),
            });
        }
        warn!(
            db = %db.name,
            expected = %expected,
            got = %raw,
            from = %opts.from.display(),
            "backup header mismatch; restoring what the file contains"
        );
    }

    // A wrong suffix is only ever a warning.
    let file_name = opts
        .from
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let expected_suffix = expected_ext(db.backup.compression, db.backup.encryption.enabled);
    let got_suffix = artifact_suffix(&file_name).unwrap_or("<unknown>");
    if got_suffix != expected_suffix {
        warn!(
            db = %db.name,
            expected = expected_suffix,
            got = got_suffix,
            from = %opts.from.display(),
            "backup suffix mismatch"
        );
    }

    // Decode stages follow the observed head, not the configuration.
    let mut stack = CloseStack::new();
    let mut stream: BoxedReader = Box::new(file);
    match raw {
        RawKind::Encrypted => {
            if db.backup.encryption.password.is_empty() {
                return Err(RestoreError::MissingPassword(db.name.clone()));
            }
            stream = decrypt_stage(stream, db.backup.encryption.password.clone(), &mut stack);
        }
        RawKind::Gzip => {
            stream = gunzip_stage(stream, &mut stack);
        }
        RawKind::Archive => {}
        RawKind::Unknown => {
            if !opts.allow_sql_fallback {
                return Err(RestoreError::UnknownRaw);
            }
        }
    }

    let mut peek = Peek::new(stream);
    let mut inner = LeadingKind::Unknown;
    if raw == RawKind::Encrypted {
        inner = match sniff_leading(&mut peek).await {
            Ok(kind) => kind,
            Err(e) => {
                stack.close_all();
                return Err(RestoreError::Sniff(e));
            }
        };
        if inner == LeadingKind::Gzip {
            let stream = gunzip_stage(Box::new(peek), &mut stack);
            peek = Peek::new(stream);
        }
    }

    let decoded = match sniff_decoded(&mut peek).await {
        Ok(kind) => kind,
        Err(e) => {
            stack.close_all();
            return Err(RestoreError::Sniff(e));
        }
    };
    match decoded {
        DecodedKind::Archive => {}
        DecodedKind::Sql => {
            if !opts.allow_sql_fallback {
                stack.close_all();
                return Err(RestoreError::SqlNotAllowed);
            }
        }
        DecodedKind::Unknown => {
            stack.close_all();
            return Err(RestoreError::UnknownDecoded);
        }
    }

    debug!(
        db = %db.name,
        raw = %raw,
        inner = %inner,
        decoded = %decoded,
        clean = opts.clean,
        "restore pipeline assembled"
    );

    let conn = &db.connection;
    let mut args = vec![
        "--host".to_string(),
        conn.host.clone(),
        "--port".to_string(),
        conn.port.to_string(),
        "--dbname".to_string(),
        conn.database.clone(),
        "--username".to_string(),
        conn.user.clone(),
    ];

    let result = if decoded == DecodedKind::Sql {
        if !tool_on_path("psql") {
            stack.close_all();
            return Err(RestoreError::ToolMissing { tool: "psql" });
        }
        if opts.clean {
            warn!("--clean is ignored when falling back to psql");
        }
        debug!(db = %db.name, tool = "psql", "restore tool fallback");
        args.push("-v".to_string());
        args.push("ON_ERROR_STOP=1".to_string());
        run_restore_tool("psql", &args, &conn.password, &mut peek).await
    } else {
        args.push("--format=custom".to_string());
        args.push("--exit-on-error".to_string());
        if opts.clean {
            args.push("--clean".to_string());
            args.push("--if-exists".to_string());
        }
        run_restore_tool("pg_restore", &args, &conn.password, &mut peek).await
    };
    stack.close_all();

    match result {
        Ok(()) => {
            println!("restore OK: db={} from={}", db.name, opts.from.display());
            Ok(())
        }
        Err(err) => {
            if let AdapterError::ToolFailed { stderr, .. } = &err {
                if stderr.contains("already exists") {
                    return Err(RestoreError::ToolConflict { source: err });
                }
            }
            Err(match err {
                AdapterError::Io(e) => RestoreError::Stream(e),
                other => RestoreError::Tool(other),
            })
        }
    }
}

fn select_database<'a>(
    cfg: &'a Config,
    name: Option<&str>,
) -> Result<&'a DatabaseConfig, RestoreError> {
    match name {
        None => cfg.databases.first().ok_or(RestoreError::NoDatabases),
        Some(name) => cfg
            .database(name)
            .ok_or_else(|| RestoreError::UnknownDatabase(name.to_string())),
    }
}
