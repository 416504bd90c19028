use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// An expression with no match inside this horizon is treated as permanently
/// inactive.
const SATISFIABILITY_HORIZON_DAYS: i64 = 366;

#[derive(Error, Debug)]
pub enum CronParseError {
    #[error("expected 6 fields (sec min hour day-of-month month day-of-week), got {0}")]
    FieldCount(usize),

    #[error("{0}")]
    Expression(#[from] cron::error::Error),
}

/// A parsed 6-field cron expression (seconds included).
///
/// Evaluation is pure: [`CronSchedule::next_after`] depends only on its
/// arguments, so the ticking task is a thin wrapper that sleeps until the
/// returned instant.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    source: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CronParseError> {
        let trimmed = expr.trim();
        let fields = trimmed.split_whitespace().count();
        if fields != 6 {
            return Err(CronParseError::FieldCount(fields));
        }
        let schedule = Schedule::from_str(trimmed)?;
        Ok(Self {
            source: trimmed.to_string(),
            schedule,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// The smallest instant strictly greater than `from` matching the
    /// expression, or `None` if no match exists within a year of `from`.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let next = self.schedule.after(&from).next()?;
        (next - from <= ChronoDuration::days(SATISFIABILITY_HORIZON_DAYS)).then_some(next)
    }

    /// Wall-clock distance from `from` to the next fire, for sleeping.
    pub fn delay_after(&self, from: DateTime<Utc>) -> Option<Duration> {
        let next = self.next_after(from)?;
        (next - from).to_std().ok()
    }
}
