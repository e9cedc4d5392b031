//! Signals sent to running workflows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named payload waiting in an instance's inbox
///
/// Sending never blocks on the workflow: the signal is buffered by the store
/// and turned into a `SignalReceived` history event the next time the
/// instance is processed. Duplicate sends produce duplicate events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSignal {
    /// Name of the channel the payload is delivered to
    pub signal_name: String,

    pub payload: serde_json::Value,

    pub sent_at: DateTime<Utc>,
}

impl WorkflowSignal {
    pub fn new(signal_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            signal_name: signal_name.into(),
            payload,
            sent_at: Utc::now(),
        }
    }

    /// Override the send time, e.g. with a simulated clock reading
    pub fn sent_at(mut self, at: DateTime<Utc>) -> Self {
        self.sent_at = at;
        self
    }
}
