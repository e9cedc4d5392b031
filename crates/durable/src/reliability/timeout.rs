//! Activity timeout bookkeeping
//!
//! Deadlines are evaluated against an explicit `now` so the same logic
//! serves the worker (local enforcement) and the coordinator sweep.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which activity deadline expired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutType {
    /// Single attempt ran longer than StartToClose
    StartToClose,
    /// Whole activity, retries included, exceeded ScheduleToClose
    ScheduleToClose,
}

impl std::fmt::Display for TimeoutType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutType::StartToClose => write!(f, "StartToClose"),
            TimeoutType::ScheduleToClose => write!(f, "ScheduleToClose"),
        }
    }
}

/// Deadlines of one activity task at its current attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityDeadlines {
    pub scheduled_at: DateTime<Utc>,
    /// When the current attempt was claimed by a worker
    pub started_at: Option<DateTime<Utc>>,
    pub start_to_close: Option<Duration>,
    pub schedule_to_close: Option<Duration>,
}

impl ActivityDeadlines {
    pub fn schedule_to_close_deadline(&self) -> Option<DateTime<Utc>> {
        self.schedule_to_close
            .map(|limit| self.scheduled_at + chrono_duration(limit))
    }

    pub fn start_to_close_deadline(&self) -> Option<DateTime<Utc>> {
        match (self.started_at, self.start_to_close) {
            (Some(started), Some(limit)) => Some(started + chrono_duration(limit)),
            _ => None,
        }
    }

    /// First expired deadline at `now`; ScheduleToClose wins a tie
    pub fn expired(&self, now: DateTime<Utc>) -> Option<TimeoutType> {
        if self.schedule_to_close_deadline().is_some_and(|d| now >= d) {
            return Some(TimeoutType::ScheduleToClose);
        }
        if self.start_to_close_deadline().is_some_and(|d| now >= d) {
            return Some(TimeoutType::StartToClose);
        }
        None
    }

    /// How long the current attempt may run when started at `now`, and which
    /// deadline bounds it
    pub fn attempt_limit(&self, now: DateTime<Utc>) -> Option<(Duration, TimeoutType)> {
        let overall = self
            .schedule_to_close_deadline()
            .map(|d| (remaining(now, d), TimeoutType::ScheduleToClose));
        let attempt = self.start_to_close.map(|d| (d, TimeoutType::StartToClose));

        match (attempt, overall) {
            (Some(a), Some(o)) => Some(if o.0 < a.0 { o } else { a }),
            (a, o) => a.or(o),
        }
    }

    /// Time left before ScheduleToClose, used to bound retry backoff
    pub fn retry_budget(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.schedule_to_close_deadline()
            .map(|deadline| remaining(now, deadline))
    }
}

/// Saturating `deadline - now`
pub fn remaining(now: DateTime<Utc>, deadline: DateTime<Utc>) -> Duration {
    deadline
        .signed_duration_since(now)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Convert a std duration, saturating at a century
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
