//! Time sources for the engine
//!
//! The executor never reads the system clock directly: event timestamps,
//! timer deadlines and activity deadlines all come from a [`Clock`], which
//! lets tests skip time with a [`ManualClock`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::reliability::chrono_duration;

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use durable_replay::engine::{Clock, ManualClock};
///
/// let clock = ManualClock::new(chrono::DateTime::UNIX_EPOCH);
/// clock.advance(Duration::from_secs(3600));
/// assert_eq!(clock.now().timestamp(), 3600);
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.write() += chrono_duration(by);
    }

    /// Move to `at`; moving backwards is ignored
    pub fn set(&self, at: DateTime<Utc>) {
        let mut now = self.now.write();
        if at > *now {
            *now = at;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_never_moves_backwards() {
        let start = DateTime::UNIX_EPOCH;
        let clock = ManualClock::new(start);

        clock.advance(Duration::from_secs(10));
        clock.set(start);
        assert_eq!(clock.now(), start + chrono::Duration::seconds(10));

        clock.set(start + chrono::Duration::seconds(60));
        assert_eq!(clock.now().timestamp(), 60);
    }
}
