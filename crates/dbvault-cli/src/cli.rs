//! Command-line surface.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use dbvault_schedule::CronSpec;
use dbvault_store::Store;

use crate::backup_run::run_backup;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::daemon::run_daemon;
use crate::postgres::{tool_on_path, PostgresDump};
use crate::restore_run::{run_restore, RestoreOptions};
use crate::stores::build_stores;

const SAMPLE_CONFIG: &str = r#"# dbvault configuration
version: 1

storage:
  - name: primary
    type: local
    local:
      path: ./backups
  # - name: offsite
  #   type: s3
  #   s3:
  #     bucket: my-backups
  #     region: eu-central-1
  #     prefix: dbvault
  #     access_key: "${AWS_ACCESS_KEY_ID}"
  #     secret_key: "${AWS_SECRET_ACCESS_KEY}"

databases:
  - name: app
    type: postgres
    connection:
      host: localhost
      port: 5432
      database: app
      user: postgres
      password: "${PGPASSWORD}"
    backup:
      schedule: "0 2 * * *"
      storage: primary
      compression: true
      encryption:
        enabled: false
        password: ""
      retention:
        keep_daily: 7
        keep_weekly: 4
        keep_monthly: 6

notifications: []
#  - type: webhook
#    on: [failure]
#    config:
#      url: https://hooks.example.com/dbvault
"#;

/// Streaming PostgreSQL backups with retention and scheduling.
#[derive(Parser)]
#[command(name = "dbvault", version)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    pub config: PathBuf,

    /// Enable debug logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// The verbs.
#[derive(Subcommand)]
pub enum Command {
    /// Write a starter configuration file at the --config path.
    Init,
    /// Back up every configured database.
    Backup,
    /// Restore one database from an artifact file.
    Restore {
        /// Database to restore into; defaults to the first configured.
        #[arg(long)]
        db: Option<String>,
        /// Artifact file to restore from.
        #[arg(long)]
        from: PathBuf,
        /// Drop existing objects before recreating them.
        #[arg(long)]
        clean: bool,
        /// Fail when the artifact disagrees with the configured pipeline.
        #[arg(long)]
        strict_sniff: bool,
        /// Allow restoring plain SQL dumps through psql.
        #[arg(long)]
        allow_sql_fallback: bool,
    },
    /// Validate the configuration and probe its targets.
    Test,
    /// Run scheduled backups until interrupted.
    Daemon {
        /// Per-run timeout in seconds; 0 disables it.
        #[arg(long, default_value_t = 0)]
        run_timeout: u64,
    },
}

impl Cli {
    /// Dispatches the selected verb.
    pub async fn run(self, token: CancelToken) -> anyhow::Result<()> {
        match self.command {
            Command::Init => init(&self.config),
            Command::Backup => {
                let cfg = Config::load(&self.config)?;
                run_backup(&token, &cfg, &PostgresDump).await?;
                Ok(())
            }
            Command::Restore {
                db,
                from,
                clean,
                strict_sniff,
                allow_sql_fallback,
            } => {
                let cfg = Config::load(&self.config)?;
                cfg.validate()?;
                let opts = RestoreOptions {
                    db,
                    from,
                    clean,
                    strict_sniff,
                    allow_sql_fallback,
                };
                run_restore(&cfg, &opts).await?;
                Ok(())
            }
            Command::Test => test(&self.config).await,
            Command::Daemon { run_timeout } => {
                let cfg = Config::load(&self.config)?;
                let timeout = (run_timeout > 0).then(|| Duration::from_secs(run_timeout));
                run_daemon(&token, &cfg, timeout, &PostgresDump).await?;
                Ok(())
            }
        }
    }
}

fn init(path: &std::path::Path) -> anyhow::Result<()> {
    if path.exists() {
        bail!("refusing to overwrite existing config {}", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    std::fs::write(path, SAMPLE_CONFIG).with_context(|| format!("write {}", path.display()))?;
    println!("wrote starter config to {}", path.display());
    Ok(())
}

async fn test(path: &std::path::Path) -> anyhow::Result<()> {
    let cfg = Config::load(path)?;
    cfg.validate()?;
    println!("config OK: {} database(s), {} store(s)", cfg.databases.len(), cfg.storage.len());

    // Local base directories must exist and be writable before a backup
    // ever runs against them.
    for st in &cfg.storage {
        if st.kind == "local" {
            if let Some(local) = &st.local {
                std::fs::create_dir_all(&local.path)
                    .with_context(|| format!("storage {}: create {}", st.name, local.path))?;
            }
        }
    }

    let all_names: HashSet<String> = cfg.storage.iter().map(|s| s.name.clone()).collect();
    let stores = build_stores(&cfg, &all_names)?;
    for store in stores.values() {
        probe_store(store.as_ref()).await?;
    }

    for db in &cfg.databases {
        let schedule = db.backup.schedule.trim();
        if !schedule.is_empty() {
            CronSpec::parse(schedule)
                .map_err(|e| anyhow::anyhow!("db {}: invalid schedule {:?}: {e}", db.name, schedule))?;
            println!("schedule OK: db={} spec={:?}", db.name, schedule);
        }
        if db.backup.encryption.enabled && db.backup.encryption.password.is_empty() {
            bail!("db {}: encryption enabled but password is empty", db.name);
        }
    }

    if !tool_on_path("pg_dump") {
        bail!("pg_dump not found in PATH");
    }
    println!("pg_dump OK");
    if !tool_on_path("pg_restore") {
        println!("warning: pg_restore not found in PATH (restores will fail)");
    }
    Ok(())
}

async fn probe_store(store: &dyn Store) -> anyhow::Result<()> {
    // Listing the store root proves the backend is reachable.
    if let Some(prunable) = store.prunable() {
        prunable
            .list("")
            .await
            .with_context(|| format!("storage {} is not usable", store.name()))?;
    }
    println!("storage OK: {}", store.name());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_restore_flags() {
        let cli = Cli::parse_from([
            "dbvault",
            "--config",
            "cfg.yaml",
            "restore",
            "--db",
            "orders",
            "--from",
            "/tmp/a.dump",
            "--clean",
            "--strict-sniff",
            "--allow-sql-fallback",
        ]);
        match cli.command {
            Command::Restore {
                db,
                from,
                clean,
                strict_sniff,
                allow_sql_fallback,
            } => {
                assert_eq!(db.as_deref(), Some("orders"));
                assert_eq!(from, PathBuf::from("/tmp/a.dump"));
                assert!(clean && strict_sniff && allow_sql_fallback);
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn config_flag_is_required() {
        assert!(Cli::try_parse_from(["dbvault", "backup"]).is_err());
    }

    #[test]
    fn init_writes_a_loadable_config_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dbvault.yaml");

        init(&path).unwrap();
        let cfg = Config::load(&path).unwrap();
        cfg.validate().unwrap();

        // a second init must refuse to overwrite
        assert!(init(&path).is_err());
    }

    #[test]
    fn sample_config_validates() {
        let cfg: Config = serde_yaml::from_str(SAMPLE_CONFIG).unwrap();
        cfg.validate().unwrap();
    }
}
