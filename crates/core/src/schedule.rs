//! Cron expressions for the cleanup jobs.

use crate::error::{Error, Result};
use std::str::FromStr;
use time::OffsetDateTime;

/// A parsed cron schedule.
///
/// Accepts the classic five-field form (`min hour dom month dow`) as well as
/// the six- and seven-field forms with a leading seconds column.
#[derive(Clone, Debug)]
pub struct CronSchedule {
    expr: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    /// Parse a cron expression.
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        let normalized = match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            6 | 7 => trimmed.to_string(),
            n => {
                return Err(Error::InvalidCron {
                    expr: expr.to_string(),
                    reason: format!("expected 5 to 7 fields, found {n}"),
                });
            }
        };
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| Error::InvalidCron {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            expr: expr.to_string(),
            schedule,
        })
    }

    /// The expression as configured.
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: OffsetDateTime) -> Option<OffsetDateTime> {
        let after = chrono::DateTime::from_timestamp(after.unix_timestamp(), after.nanosecond())?;
        let next = self.schedule.after(&after).next()?;
        let secs = OffsetDateTime::from_unix_timestamp(next.timestamp()).ok()?;
        Some(secs + time::Duration::nanoseconds(i64::from(next.timestamp_subsec_nanos())))
    }
}
