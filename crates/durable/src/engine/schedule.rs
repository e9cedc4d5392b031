//! Cron schedules for recurring workflows
//!
//! A run started with a cron schedule does not execute right away: it
//! sleeps until the schedule's next fire time. When it completes or
//! fails, the next run of the same workflow id is created for the fire
//! time after that. Cancellation and timeouts end the chain.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use super::executor::ExecutorError;

/// Parsed cron expression
///
/// Accepts the classic five fields (`minute hour day-of-month month
/// day-of-week`) as well as the six and seven field forms with leading
/// seconds and trailing year. Day names (`MON-FRI`) are the portable way to
/// write day-of-week ranges.
///
/// # Example
///
/// ```
/// use durable_replay::engine::CronSchedule;
///
/// let every_minute = CronSchedule::parse("* * * * *").unwrap();
/// let start = chrono::DateTime::UNIX_EPOCH;
/// assert_eq!(every_minute.next_after(start).unwrap().timestamp(), 60);
/// ```
#[derive(Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, ExecutorError> {
        let expression = expression.trim();
        let normalized = match expression.split_whitespace().count() {
            5 => format!("0 {expression}"),
            _ => expression.to_string(),
        };
        let schedule = cron::Schedule::from_str(&normalized).map_err(|err| {
            ExecutorError::Configuration(format!("invalid cron schedule {expression:?}: {err}"))
        })?;

        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    /// The expression as given
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`; `None` once the schedule is
    /// exhausted
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expression).finish()
    }
}
