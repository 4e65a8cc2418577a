//! YAML configuration: schema, `${VAR}` environment expansion, validation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use dbvault_store::RetentionPolicy;

/// Errors from loading or validating a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("read config {path}: {source}")]
    Read {
        /// Path that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not valid YAML for the schema.
    #[error("parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The file parsed but violates a structural rule.
    #[error("{0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Schema version; must be greater than zero.
    pub version: u32,
    /// Configured stores.
    #[serde(default)]
    pub storage: Vec<StorageConfig>,
    /// Configured databases.
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
    /// Notification routes.
    #[serde(default)]
    pub notifications: Vec<NotificationConfig>,
}

/// One named store.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Name referenced by `databases[].backup.storage`.
    pub name: String,
    /// `local` or `s3`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Settings for the local backend.
    #[serde(default)]
    pub local: Option<LocalStorageConfig>,
    /// Settings for the S3 backend.
    #[serde(default)]
    pub s3: Option<S3StorageConfig>,
}

/// Local backend settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// Base directory artifacts live under.
    pub path: String,
}

/// S3 backend settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct S3StorageConfig {
    /// Bucket name.
    pub bucket: String,
    /// Bucket region.
    pub region: String,
    /// Key prefix inside the bucket.
    #[serde(default)]
    pub prefix: String,
    /// Static access key; empty uses ambient credentials.
    #[serde(default)]
    pub access_key: String,
    /// Static secret key.
    #[serde(default)]
    pub secret_key: String,
}

/// One database target.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Identifier; also the artifact key prefix.
    pub name: String,
    /// Database kind; only `postgres` is supported.
    #[serde(rename = "type")]
    pub kind: String,
    /// Connection settings handed to the external tools.
    pub connection: ConnectionConfig,
    /// Backup options.
    pub backup: BackupConfig,
}

/// Connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Database name.
    pub database: String,
    /// User name.
    pub user: String,
    /// Password, passed to the tools via the environment.
    #[serde(default)]
    pub password: String,
}

/// Per-database backup options.
#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    /// Five-field cron expression; empty means manual-only.
    #[serde(default)]
    pub schedule: String,
    /// Name of the store artifacts go to.
    pub storage: String,
    /// Gzip the dump stream.
    #[serde(default)]
    pub compression: bool,
    /// Encrypt the (possibly compressed) stream.
    #[serde(default)]
    pub encryption: EncryptionConfig,
    /// Pruning quotas.
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Encryption switch and password.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EncryptionConfig {
    /// Whether the artifact is encrypted.
    #[serde(default)]
    pub enabled: bool,
    /// Password the key is derived from.
    #[serde(default)]
    pub password: String,
}

/// Per-tier retention quotas.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RetentionConfig {
    /// Daily tier quota; zero disables.
    #[serde(default)]
    pub keep_daily: u32,
    /// Weekly tier quota; zero disables.
    #[serde(default)]
    pub keep_weekly: u32,
    /// Monthly tier quota; zero disables.
    #[serde(default)]
    pub keep_monthly: u32,
}

impl RetentionConfig {
    /// The store-level policy this configuration describes.
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            keep_daily: self.keep_daily,
            keep_weekly: self.keep_weekly,
            keep_monthly: self.keep_monthly,
        }
    }
}

/// One notification route.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// Transport kind; `webhook` is supported.
    #[serde(rename = "type")]
    pub kind: String,
    /// Which outcomes to report: `success`, `failure`, or `both`.
    #[serde(default)]
    pub on: Vec<String>,
    /// Transport settings.
    #[serde(default)]
    pub config: NotificationDetails,
}

/// Transport settings shared by notification kinds.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationDetails {
    /// Webhook endpoint.
    #[serde(default)]
    pub url: String,
    /// Extra request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Config {
    /// Loads, expands, and returns a configuration. Validation is separate
    /// so callers can report all the context they have.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg: Config = serde_yaml::from_str(&contents)?;
        cfg.expand_env();
        Ok(cfg)
    }

    /// Expands `${VAR}` references in every string field from the process
    /// environment. Unset variables expand to the empty string.
    pub fn expand_env(&mut self) {
        for db in &mut self.databases {
            expand_in(&mut db.name);
            expand_in(&mut db.kind);
            expand_in(&mut db.connection.host);
            expand_in(&mut db.connection.database);
            expand_in(&mut db.connection.user);
            expand_in(&mut db.connection.password);
            expand_in(&mut db.backup.schedule);
            expand_in(&mut db.backup.storage);
            expand_in(&mut db.backup.encryption.password);
        }
        for st in &mut self.storage {
            expand_in(&mut st.name);
            expand_in(&mut st.kind);
            if let Some(local) = &mut st.local {
                expand_in(&mut local.path);
            }
            if let Some(s3) = &mut st.s3 {
                expand_in(&mut s3.bucket);
                expand_in(&mut s3.region);
                expand_in(&mut s3.prefix);
                expand_in(&mut s3.access_key);
                expand_in(&mut s3.secret_key);
            }
        }
        for nt in &mut self.notifications {
            expand_in(&mut nt.kind);
            for on in &mut nt.on {
                expand_in(on);
            }
            expand_in(&mut nt.config.url);
            for value in nt.config.headers.values_mut() {
                expand_in(value);
            }
        }
    }

    /// Structural validation: version, store uniqueness, reference
    /// integrity, complete connection blocks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version == 0 {
            return Err(ConfigError::Invalid("version must be > 0".to_string()));
        }

        let mut storage_names = std::collections::HashSet::new();
        for st in &self.storage {
            if st.name.is_empty() {
                return Err(ConfigError::Invalid("storage name is required".to_string()));
            }
            if !storage_names.insert(st.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate storage name {:?}",
                    st.name
                )));
            }
            if st.kind.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "storage {}: type is required",
                    st.name
                )));
            }
        }

        for (i, db) in self.databases.iter().enumerate() {
            if db.name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "databases[{i}].name is required"
                )));
            }
            if db.kind.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "databases[{i}].type is required (e.g. postgres)"
                )));
            }
            let conn = &db.connection;
            if conn.host.is_empty()
                || conn.port == 0
                || conn.database.is_empty()
                || conn.user.is_empty()
            {
                return Err(ConfigError::Invalid(format!(
                    "databases[{i}] connection is incomplete (host/port/database/user required)"
                )));
            }
            if db.backup.storage.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "databases[{i}] backup.storage is required (must match a storage name)"
                )));
            }
            if !storage_names.contains(db.backup.storage.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "databases[{i}] backup.storage={:?} not found in storage list",
                    db.backup.storage
                )));
            }
        }
        Ok(())
    }

    /// Looks up a database by name.
    pub fn database(&self, name: &str) -> Option<&DatabaseConfig> {
        self.databases.iter().find(|db| db.name == name)
    }
}

fn expand_in(value: &mut String) {
    if value.contains("${") {
        *value = expand(value);
    }
}

fn expand(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let var = &rest[start + 2..start + 2 + end];
                if let Ok(v) = std::env::var(var) {
                    out.push_str(&v);
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
