//! Five-field cron expressions.
//!
//! `minute hour day-of-month month day-of-week`, space separated. Each
//! field accepts `*`, a single integer, a comma list, an inclusive `a-b`
//! range, or a `*/n` step. Day-of-month and day-of-week are both required
//! to match (AND, not the classical vixie OR). Sunday is 0.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Timelike, Utc};
use thiserror::Error;

/// Errors from parsing a cron expression.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    /// The expression did not have exactly five fields.
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),

    /// One field could not be parsed; carries the field name and detail.
    #[error("{field}: {reason}")]
    Field {
        /// Which of the five fields failed.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    minute: FieldSet,
    hour: FieldSet,
    dom: FieldSet,
    month: FieldSet,
    dow: FieldSet,
}

impl CronSpec {
    /// Parses a five-field expression.
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(ScheduleError::FieldCount(parts.len()));
        }

        Ok(Self {
            minute: FieldSet::parse(parts[0], 0, 59).map_err(field_err("minute"))?,
            hour: FieldSet::parse(parts[1], 0, 23).map_err(field_err("hour"))?,
            dom: FieldSet::parse(parts[2], 1, 31).map_err(field_err("day-of-month"))?,
            month: FieldSet::parse(parts[3], 1, 12).map_err(field_err("month"))?,
            dow: FieldSet::parse(parts[4], 0, 6).map_err(field_err("day-of-week"))?,
        })
    }

    /// True when `t`'s UTC wall-clock components satisfy every field.
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.minute.has(t.minute())
            && self.hour.has(t.hour())
            && self.dom.has(t.day())
            && self.month.has(t.month())
            && self.dow.has(t.weekday().num_days_from_sunday())
    }
}

impl FromStr for CronSpec {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn field_err(field: &'static str) -> impl Fn(String) -> ScheduleError {
    move |reason| ScheduleError::Field { field, reason }
}

/// The set of accepted values for one field.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldSet {
    any: bool,
    values: BTreeSet<u32>,
}

impl FieldSet {
    fn has(&self, v: u32) -> bool {
        self.any || self.values.contains(&v)
    }

    fn parse(token: &str, min: u32, max: u32) -> Result<Self, String> {
        let token = token.trim();
        if token.is_empty() {
            return Err("empty field".to_string());
        }
        if token == "*" {
            return Ok(Self {
                any: true,
                values: BTreeSet::new(),
            });
        }

        let mut values = BTreeSet::new();
        for part in token.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err("empty list element".to_string());
            }

            if let Some(step) = part.strip_prefix("*/") {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step {part:?}"))?;
                if step == 0 {
                    return Err(format!("invalid step {part:?}"));
                }
                let mut v = min;
                while v <= max {
                    values.insert(v);
                    v += step;
                }
                continue;
            }

            if let Some((a, b)) = part.split_once('-') {
                let start: u32 = a
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid range {part:?}"))?;
                let end: u32 = b
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid range {part:?}"))?;
                if start > end || start < min || end > max {
                    return Err(format!("range out of bounds {part:?}"));
                }
                for v in start..=end {
                    values.insert(v);
                }
                continue;
            }

            let v: u32 = part
                .parse()
                .map_err(|_| format!("invalid value {part:?}"))?;
            if v < min || v > max {
                return Err(format!("value out of bounds {v}"));
            }
            values.insert(v);
        }

        if values.is_empty() {
            return Err("no values".to_string());
        }
        Ok(Self { any: false, values })
    }
}
