//! Reliability patterns for activity execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with exponential backoff
//! - [`ActivityDeadlines`] - StartToClose / ScheduleToClose evaluation

mod retry;
mod timeout;

pub use retry::{RetryDecision, RetryPolicy};
pub use timeout::{remaining, ActivityDeadlines, TimeoutType};

pub(crate) use timeout::chrono_duration;
