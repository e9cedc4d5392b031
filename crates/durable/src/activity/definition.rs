//! Activity trait and failure type

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;

/// Typed failure returned by an activity attempt
///
/// The coordinator consults `retryable` and `error_type` (against the
/// retry policy's non-retryable list) before scheduling another attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    pub message: String,

    /// Error type for programmatic handling and non-retryable matching
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,

    /// Non-retryable errors end the activity on the current attempt
    pub retryable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_type {
            Some(error_type) => write!(f, "{error_type}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for ActivityError {
    fn from(err: serde_json::Error) -> Self {
        Self::non_retryable(format!("invalid activity payload: {err}")).with_type("Serialization")
    }
}

/// A unit of non-deterministic work invoked by workflows
///
/// Activities run on workers, outside the replay executor, and may do
/// arbitrary I/O. They receive a cancellable [`ActivityContext`].
///
/// # Example
///
/// ```ignore
/// use durable_replay::prelude::*;
///
/// struct SsnTrace;
///
/// #[async_trait]
/// impl Activity for SsnTrace {
///     const TYPE: &'static str = "ssn_trace";
///     type Input = String;
///     type Output = String;
///
///     async fn execute(&self, _ctx: &ActivityContext, ssn: String) -> Result<String, ActivityError> {
///         Ok(if ssn.len() == 11 { "pass" } else { "fail" }.to_string())
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Registered type name, used for routing and replay matching
    const TYPE: &'static str;

    type Input: Serialize + DeserializeOwned + Send;

    type Output: Serialize + DeserializeOwned + Send;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        let err = ActivityError::retryable("connection reset");
        assert!(err.retryable);
        assert_eq!(err.to_string(), "connection reset");

        let err = ActivityError::non_retryable("no such account").with_type("NotFound");
        assert!(!err.retryable);
        assert_eq!(err.to_string(), "NotFound: no such account");
    }

    #[test]
    fn test_from_anyhow_is_retryable() {
        let err: ActivityError = anyhow::anyhow!("upstream unavailable").into();
        assert!(err.retryable);
        assert!(err.message.contains("upstream unavailable"));
    }

    #[test]
    fn test_serialization_skips_empty_fields() {
        let err = ActivityError::retryable("x");
        let json = serde_json::to_value(&err).expect("should serialize");
        assert!(json.get("error_type").is_none());

        let parsed: ActivityError = serde_json::from_value(json).expect("should deserialize");
        assert_eq!(parsed, err);
    }
}
