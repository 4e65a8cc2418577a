//! Minute-quantized backup scheduling.
//!
//! The loop samples UTC time, truncates to the minute, and evaluates
//! schedules only when the minute changes; inside a minute it sleeps in
//! short cancellable intervals. A database fires at most once per minute,
//! enforced by a per-database last-run map. A run timeout is reported and
//! the loop continues; any other orchestrator error stops the daemon.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tracing::{debug, warn};

use dbvault_schedule::CronSpec;

use crate::backup_run::{run_backup, BackupError};
use crate::cancel::CancelToken;
use crate::config::{Config, DatabaseConfig};
use crate::postgres::DumpSource;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

struct Job {
    db: DatabaseConfig,
    spec: CronSpec,
}

/// Runs scheduled backups until cancelled.
pub async fn run_daemon(
    token: &CancelToken,
    cfg: &Config,
    run_timeout: Option<Duration>,
    dump: &dyn DumpSource,
) -> Result<(), BackupError> {
    cfg.validate()?;

    let mut jobs = Vec::new();
    for db in &cfg.databases {
        let schedule = db.backup.schedule.trim();
        if schedule.is_empty() {
            debug!(db = %db.name, "daemon: skipped (empty schedule)");
            continue;
        }
        let spec = CronSpec::parse(schedule).map_err(|source| BackupError::Schedule {
            db: db.name.clone(),
            schedule: schedule.to_string(),
            source,
        })?;
        jobs.push(Job {
            db: db.clone(),
            spec,
        });
    }
    if jobs.is_empty() {
        return Err(BackupError::NothingScheduled);
    }
    debug!(jobs = jobs.len(), "daemon started");

    let mut last_minute: Option<DateTime<Utc>> = None;
    let mut last_run: HashMap<String, DateTime<Utc>> = HashMap::with_capacity(jobs.len());

    loop {
        if token.is_cancelled() {
            debug!("daemon: shutdown requested");
            return Ok(());
        }

        let minute = truncate_minute(Utc::now());
        if last_minute == Some(minute) {
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = token.cancelled() => {}
            }
            continue;
        }
        last_minute = Some(minute);

        let due = due_databases(&jobs, minute, &last_run);
        if due.is_empty() {
            continue;
        }
        debug!(count = due.len(), minute = %minute, "daemon: triggering backups");

        let mut run_cfg = cfg.clone();
        run_cfg.databases = due.clone();

        let run_token = token.child();
        let deadline_guard = run_timeout.map(|t| run_token.deadline(t));
        let result = run_backup(&run_token, &run_cfg, dump).await;
        drop(deadline_guard);

        match result {
            Ok(_) => {
                for fired in &due {
                    last_run.insert(fired.name.clone(), minute);
                }
            }
            Err(BackupError::Timeout { db }) => {
                // Reported, not fatal: the databases fired this minute and
                // the loop keeps scheduling.
                warn!(db = %db, minute = %minute, "daemon: run timed out");
                for fired in &due {
                    last_run.insert(fired.name.clone(), minute);
                }
            }
            Err(BackupError::Canceled { .. }) if token.is_cancelled() => {
                debug!("daemon: shutdown requested mid-run");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

fn truncate_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

fn due_databases(
    jobs: &[Job],
    minute: DateTime<Utc>,
    last_run: &HashMap<String, DateTime<Utc>>,
) -> Vec<DatabaseConfig> {
    jobs.iter()
        .filter(|job| job.spec.matches(minute) && last_run.get(&job.db.name) != Some(&minute))
        .map(|job| job.db.clone())
        .collect()
}
