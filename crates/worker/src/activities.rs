//! Activities served by this worker
//!
//! Activities run outside the replay sandbox: they may do I/O, read the
//! clock and fail. Their results are recorded into workflow history.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use durable_replay::activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};

/// Outcome of an SSN trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceResult {
    Pass,
    Fail,
}

/// Looks up a social security number against the trace provider.
///
/// The demo provider accepts a single known-good number.
#[derive(Debug, Clone)]
pub struct SsnTrace {
    accepted: String,
}

impl SsnTrace {
    pub fn new(accepted: impl Into<String>) -> Self {
        Self {
            accepted: accepted.into(),
        }
    }
}

impl Default for SsnTrace {
    fn default() -> Self {
        Self::new("555-55-5555")
    }
}

#[async_trait]
impl Activity for SsnTrace {
    const TYPE: &'static str = "ssn_trace";
    type Input = String;
    type Output = TraceResult;

    async fn execute(&self, ctx: &ActivityContext, ssn: String) -> Result<TraceResult, ActivityError> {
        if !is_well_formed(&ssn) {
            return Err(ActivityError::non_retryable(format!("malformed SSN: {ssn}"))
                .with_type("InvalidSsn"));
        }
        if ctx.is_cancelled() {
            return Err(ActivityError::retryable("trace canceled before lookup"));
        }

        let result = if ssn == self.accepted {
            TraceResult::Pass
        } else {
            TraceResult::Fail
        };
        info!(?result, "ssn trace finished");
        Ok(result)
    }
}

fn is_well_formed(ssn: &str) -> bool {
    let parts: Vec<&str> = ssn.split('-').collect();
    matches!(parts.as_slice(), [a, b, c] if a.len() == 3 && b.len() == 2 && c.len() == 4)
        && ssn.chars().all(|c| c == '-' || c.is_ascii_digit())
}

/// Registry with every activity this worker serves
pub fn registry() -> ActivityRegistry {
    let mut activities = ActivityRegistry::new();
    activities.register(SsnTrace::default());
    activities
}
