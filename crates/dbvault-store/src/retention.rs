//! Grandfather–father–son retention.
//!
//! Keeps the newest artifact of each day, ISO week, and month, up to the
//! configured per-tier quotas, and deletes the rest. Selection is
//! deterministic for a given key list and policy; keys whose names do not
//! parse as artifact timestamps are never touched.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::error::StoreError;
use crate::store::Store;

/// `chrono` format of the timestamp embedded in artifact keys.
pub const ARTIFACT_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S%.9fZ";

/// Per-tier keep quotas. A zero disables that tier; an all-zero policy
/// disables retention entirely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Newest artifact per day, up to this many days.
    pub keep_daily: u32,
    /// Newest artifact per ISO week, up to this many weeks.
    pub keep_weekly: u32,
    /// Newest artifact per month, up to this many months.
    pub keep_monthly: u32,
}

impl RetentionPolicy {
    /// True when every tier is disabled.
    pub fn is_disabled(&self) -> bool {
        self.keep_daily == 0 && self.keep_weekly == 0 && self.keep_monthly == 0
    }
}

/// A parseable artifact under a database prefix.
#[derive(Debug, Clone)]
pub struct ArtifactEntry {
    /// Store key.
    pub key: String,
    /// Timestamp parsed from the key.
    pub time: DateTime<Utc>,
}

/// What one retention pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionOutcome {
    /// Artifacts claimed by at least one tier.
    pub kept: usize,
    /// Artifacts deleted.
    pub deleted: usize,
    /// Keys that did not parse and were left alone.
    pub skipped: usize,
}

/// Errors from a retention pass; listing and deleting fail distinctly.
#[derive(Debug, Error)]
pub enum RetentionError {
    /// The store could not enumerate artifacts.
    #[error("retention list: {0}")]
    List(#[source] StoreError),

    /// A delete failed; earlier deletes in the same pass stand.
    #[error("retention delete {key}: {source}")]
    Delete {
        /// The key that could not be deleted.
        key: String,
        /// The underlying store error.
        source: StoreError,
    },
}

/// Parses the artifact timestamp out of a store key.
///
/// The basename up to the first `.dump` must be a UTC timestamp of the form
/// `YYYYMMDD_HHMMSS.nnnnnnnnnZ` (nine fractional digits, literal `Z`).
pub fn parse_artifact_time(key: &str) -> Option<DateTime<Utc>> {
    let base = key.rsplit('/').next().unwrap_or(key);
    let idx = base.find(".dump")?;
    if idx == 0 {
        return None;
    }
    NaiveDateTime::parse_from_str(&base[..idx], ARTIFACT_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Selects the keys to keep from entries sorted newest-first.
///
/// Walks the entries once; each enabled tier claims the first entry it sees
/// in each not-yet-filled bucket until its quota is reached. An entry kept
/// by any tier is kept. Stops early once every enabled tier is full.
pub fn select_keep(entries: &[ArtifactEntry], policy: RetentionPolicy) -> HashSet<String> {
    let mut keep = HashSet::new();

    let mut daily_buckets = HashSet::new();
    let mut weekly_buckets = HashSet::new();
    let mut monthly_buckets = HashSet::new();

    for entry in entries {
        let t = entry.time;

        if policy.keep_daily > 0 && daily_buckets.len() < policy.keep_daily as usize {
            let bucket = t.format("%Y-%m-%d").to_string();
            if daily_buckets.insert(bucket) {
                keep.insert(entry.key.clone());
            }
        }

        if policy.keep_weekly > 0 && weekly_buckets.len() < policy.keep_weekly as usize {
            let week = t.iso_week();
            let bucket = format!("{:04}-W{:02}", week.year(), week.week());
            if weekly_buckets.insert(bucket) {
                keep.insert(entry.key.clone());
            }
        }

        if policy.keep_monthly > 0 && monthly_buckets.len() < policy.keep_monthly as usize {
            let bucket = t.format("%Y-%m").to_string();
            if monthly_buckets.insert(bucket) {
                keep.insert(entry.key.clone());
            }
        }

        let daily_full = policy.keep_daily == 0 || daily_buckets.len() >= policy.keep_daily as usize;
        let weekly_full =
            policy.keep_weekly == 0 || weekly_buckets.len() >= policy.keep_weekly as usize;
        let monthly_full =
            policy.keep_monthly == 0 || monthly_buckets.len() >= policy.keep_monthly as usize;
        if daily_full && weekly_full && monthly_full {
            break;
        }
    }

    keep
}

/// Runs one retention pass for a database prefix against a store.
///
/// No-op (with a debug log) when the policy is disabled or the store cannot
/// prune. Deletes every parseable, unclaimed artifact.
pub async fn apply_retention(
    store: &dyn Store,
    db: &str,
    policy: RetentionPolicy,
) -> Result<RetentionOutcome, RetentionError> {
    if policy.is_disabled() {
        return Ok(RetentionOutcome::default());
    }

    let Some(prunable) = store.prunable() else {
        debug!(db, store = store.name(), "retention skipped: store is not prunable");
        return Ok(RetentionOutcome::default());
    };

    let objects = prunable.list(db).await.map_err(RetentionError::List)?;
    if objects.is_empty() {
        return Ok(RetentionOutcome::default());
    }

    let mut entries = Vec::with_capacity(objects.len());
    let mut skipped = 0usize;
    for obj in objects {
        match parse_artifact_time(&obj.key) {
            Some(time) => entries.push(ArtifactEntry { key: obj.key, time }),
            None => skipped += 1,
        }
    }
    entries.sort_by(|a, b| b.time.cmp(&a.time));

    let keep = select_keep(&entries, policy);

    let mut deleted = 0usize;
    for entry in &entries {
        if keep.contains(&entry.key) {
            continue;
        }
        prunable
            .delete(&entry.key)
            .await
            .map_err(|source| RetentionError::Delete {
                key: entry.key.clone(),
                source,
            })?;
        deleted += 1;
    }

    let outcome = RetentionOutcome {
        kept: keep.len(),
        deleted,
        skipped,
    };
    debug!(
        db,
        store = store.name(),
        kept = outcome.kept,
        deleted = outcome.deleted,
        skipped = outcome.skipped,
        "retention applied"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalStore;
    use crate::store::Prunable;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn entry(key: &str, time: &str) -> ArtifactEntry {
        ArtifactEntry {
            key: key.to_string(),
            time: NaiveDateTime::parse_from_str(time, "%Y-%m-%d %H:%M:%S")
                .unwrap()
                .and_utc(),
        }
    }

    fn sorted(mut entries: Vec<ArtifactEntry>) -> Vec<ArtifactEntry> {
        entries.sort_by(|a, b| b.time.cmp(&a.time));
        entries
    }

    #[test]
    fn parse_valid_keys() {
        let t = parse_artifact_time("orders/20260217_224501.123456789Z.dump").unwrap();
        assert_eq!(
            t,
            Utc.with_ymd_and_hms(2026, 2, 17, 22, 45, 1).unwrap()
                + chrono::Duration::nanoseconds(123_456_789)
        );
        assert!(parse_artifact_time("orders/20260217_224501.000000000Z.dump.gz.enc").is_some());
    }

    #[test]
    fn parse_rejects_foreign_keys() {
        assert!(parse_artifact_time("orders/manual-backup.dump").is_none());
        assert!(parse_artifact_time("orders/.dump").is_none());
        assert!(parse_artifact_time("orders/20260217_224501Z.dump").is_none());
        assert!(parse_artifact_time("orders/readme.txt").is_none());
    }

    #[test]
    fn daily_keeps_newest_per_day() {
        // two same-day artifacts and one from the day before, keep_daily = 2
        let entries = sorted(vec![
            entry("db/a", "2026-02-18 12:00:00"),
            entry("db/b", "2026-02-18 08:00:00"),
            entry("db/c", "2026-02-17 23:00:00"),
        ]);
        let keep = select_keep(
            &entries,
            RetentionPolicy {
                keep_daily: 2,
                ..Default::default()
            },
        );
        assert_eq!(keep.len(), 2);
        assert!(keep.contains("db/a"));
        assert!(keep.contains("db/c"));
        assert!(!keep.contains("db/b"));
    }

    #[test]
    fn one_entry_can_serve_multiple_tiers() {
        let entries = sorted(vec![entry("db/only", "2026-02-18 12:00:00")]);
        let keep = select_keep(
            &entries,
            RetentionPolicy {
                keep_daily: 1,
                keep_weekly: 1,
                keep_monthly: 1,
            },
        );
        assert_eq!(keep.len(), 1);
    }

    #[test]
    fn weekly_uses_iso_weeks() {
        // 2026-01-04 is a Sunday (ISO week 1), 2026-01-05 a Monday (week 2)
        let entries = sorted(vec![
            entry("db/mon", "2026-01-05 10:00:00"),
            entry("db/sun", "2026-01-04 10:00:00"),
        ]);
        let keep = select_keep(
            &entries,
            RetentionPolicy {
                keep_weekly: 2,
                ..Default::default()
            },
        );
        assert_eq!(keep.len(), 2);
    }

    #[test]
    fn zero_policy_keeps_nothing_and_is_noop() {
        let entries = sorted(vec![entry("db/a", "2026-02-18 12:00:00")]);
        let keep = select_keep(&entries, RetentionPolicy::default());
        assert!(keep.is_empty());
        assert!(RetentionPolicy::default().is_disabled());
    }

    #[test]
    fn selection_is_idempotent() {
        let policy = RetentionPolicy {
            keep_daily: 2,
            keep_weekly: 1,
            ..Default::default()
        };
        let entries = sorted(vec![
            entry("db/a", "2026-02-18 12:00:00"),
            entry("db/b", "2026-02-18 08:00:00"),
            entry("db/c", "2026-02-17 23:00:00"),
            entry("db/d", "2026-02-10 09:00:00"),
        ]);
        let first = select_keep(&entries, policy);

        let survivors: Vec<ArtifactEntry> = entries
            .iter()
            .filter(|e| first.contains(&e.key))
            .cloned()
            .collect();
        let second = select_keep(&survivors, policy);
        assert_eq!(first, second);
    }

    #[test]
    fn adding_a_tier_never_drops_a_kept_key() {
        let entries = sorted(vec![
            entry("db/a", "2026-02-18 12:00:00"),
            entry("db/b", "2026-02-17 08:00:00"),
            entry("db/c", "2026-01-20 23:00:00"),
            entry("db/d", "2025-12-30 09:00:00"),
        ]);
        let small = RetentionPolicy {
            keep_daily: 2,
            ..Default::default()
        };
        let bigger = RetentionPolicy {
            keep_daily: 2,
            keep_monthly: 3,
            ..Default::default()
        };
        let kept_small = select_keep(&entries, small);
        let kept_bigger = select_keep(&entries, bigger);
        assert!(kept_small.is_subset(&kept_bigger));
    }

    #[tokio::test]
    async fn apply_deletes_unkept_and_skips_unparseable() {
        let dir = TempDir::new().unwrap();
        let st = LocalStore::new("local", dir.path());

        for name in [
            "20260218_120000.000000000Z.dump",
            "20260218_080000.000000000Z.dump",
            "20260217_230000.000000000Z.dump",
            "hand-rolled.dump",
        ] {
            let mut w = st.open_writer(&format!("db/{name}")).await.unwrap();
            tokio::io::AsyncWriteExt::write_all(&mut w.writer, b"x")
                .await
                .unwrap();
            w.writer.commit().await.unwrap();
        }

        let outcome = apply_retention(
            &st,
            "db",
            RetentionPolicy {
                keep_daily: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.kept, 2);
        assert_eq!(outcome.deleted, 1);
        assert_eq!(outcome.skipped, 1);

        let mut remaining: Vec<String> = st
            .list("db")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        remaining.sort();
        assert_eq!(
            remaining,
            vec![
                "db/20260217_230000.000000000Z.dump".to_string(),
                "db/20260218_120000.000000000Z.dump".to_string(),
                "db/hand-rolled.dump".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn apply_twice_deletes_nothing_second_time() {
        let dir = TempDir::new().unwrap();
        let st = LocalStore::new("local", dir.path());

        for name in [
            "20260218_120000.000000000Z.dump",
            "20260217_230000.000000000Z.dump",
            "20260216_010000.000000000Z.dump",
        ] {
            let mut w = st.open_writer(&format!("db/{name}")).await.unwrap();
            tokio::io::AsyncWriteExt::write_all(&mut w.writer, b"x")
                .await
                .unwrap();
            w.writer.commit().await.unwrap();
        }

        let policy = RetentionPolicy {
            keep_daily: 2,
            ..Default::default()
        };
        let first = apply_retention(&st, "db", policy).await.unwrap();
        assert_eq!(first.deleted, 1);
        let second = apply_retention(&st, "db", policy).await.unwrap();
        assert_eq!(second.deleted, 0);
        assert_eq!(second.kept, 2);
    }
}
