//! Workflow trait and the error type visible to workflow code

use std::future::Future;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::context::WorkflowContext;
use crate::activity::ActivityError;
use crate::reliability::TimeoutType;

/// Category of a [`WorkflowError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowErrorKind {
    /// Raised by workflow code itself
    Application,
    /// An activity failed terminally (retries exhausted or non-retryable)
    ActivityFailure,
    /// An activity, child workflow or workflow run exceeded its deadline
    Timeout,
    /// The instance or the awaited operation was canceled
    Canceled,
    /// Invalid options or selector usage, rejected before anything is recorded
    Configuration,
    /// A child workflow closed with an error
    ChildWorkflowFailure,
    /// Request to close this run and start a fresh one; `details` holds the input
    ContinueAsNew,
}

/// Error observed or raised by workflow code
///
/// Failures surface as values: workflow code may catch any of them,
/// including cancellation, to run cleanup before returning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowError {
    pub kind: WorkflowErrorKind,

    pub message: String,

    /// Error type for programmatic handling (e.g. the activity's `error_type`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl WorkflowError {
    /// Application error raised by workflow code
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_kind(WorkflowErrorKind::Application, message)
    }

    pub fn with_kind(kind: WorkflowErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            details: None,
        }
    }

    pub fn activity_failure(error: &ActivityError, attempts: u32) -> Self {
        Self {
            kind: WorkflowErrorKind::ActivityFailure,
            message: format!("activity failed after {attempts} attempt(s): {}", error.message),
            code: error.error_type.clone(),
            details: error.details.clone(),
        }
    }

    pub fn activity_timeout(timeout_type: TimeoutType) -> Self {
        Self::with_kind(
            WorkflowErrorKind::Timeout,
            format!("activity exceeded its {timeout_type} timeout"),
        )
        .with_code(timeout_type.to_string())
    }

    pub fn canceled(reason: impl Into<String>) -> Self {
        Self::with_kind(WorkflowErrorKind::Canceled, reason)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::with_kind(WorkflowErrorKind::Configuration, message)
    }

    /// Wrap the error a child workflow closed with
    pub fn child_failure(workflow_type: &str, cause: &WorkflowError) -> Self {
        let kind = match cause.kind {
            WorkflowErrorKind::Timeout | WorkflowErrorKind::Canceled => cause.kind,
            _ => WorkflowErrorKind::ChildWorkflowFailure,
        };
        Self {
            kind,
            message: format!("child workflow {workflow_type} failed: {}", cause.message),
            code: cause.code.clone(),
            details: cause.details.clone(),
        }
    }

    pub(crate) fn continue_as_new(input: serde_json::Value) -> Self {
        Self {
            kind: WorkflowErrorKind::ContinueAsNew,
            message: "continue as new".to_string(),
            code: None,
            details: Some(input),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_canceled(&self) -> bool {
        self.kind == WorkflowErrorKind::Canceled
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == WorkflowErrorKind::Timeout
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{code}] {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for WorkflowError {}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("payload conversion failed: {err}")).with_code("Serialization")
    }
}

/// Durable workflow definition
///
/// `run` is ordinary sequential async code. It is re-executed from the top
/// on every activation and must be deterministic: all I/O goes through
/// activities, all randomness through [`WorkflowContext::side_effect`], and
/// time is read with [`WorkflowContext::now`]. The returned future is polled
/// on the driver's thread only, so it need not be `Send`.
///
/// # Example
///
/// ```ignore
/// struct BackgroundCheck;
///
/// impl Workflow for BackgroundCheck {
///     const TYPE: &'static str = "background_check";
///     type Input = String;
///     type Output = String;
///
///     async fn run(ctx: WorkflowContext, ssn: String) -> Result<String, WorkflowError> {
///         ctx.sleep(Duration::from_secs(60)).await?;
///         ctx.execute_activity("ssn_trace", &ssn, ActivityOptions::start_to_close(Duration::from_secs(10)))
///             .await
///     }
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Registered type name
    const TYPE: &'static str;

    type Input: Serialize + DeserializeOwned + 'static;

    type Output: Serialize + DeserializeOwned + 'static;

    fn run(
        ctx: WorkflowContext,
        input: Self::Input,
    ) -> impl Future<Output = Result<Self::Output, WorkflowError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_failure_keeps_error_type() {
        let activity_error = ActivityError::non_retryable("account closed").with_type("AccountClosed");
        let err = WorkflowError::activity_failure(&activity_error, 1);

        assert_eq!(err.kind, WorkflowErrorKind::ActivityFailure);
        assert_eq!(err.code.as_deref(), Some("AccountClosed"));
        assert!(err.message.contains("account closed"));
    }

    #[test]
    fn test_child_failure_preserves_cancellation() {
        let cause = WorkflowError::canceled("parent gave up");
        let err = WorkflowError::child_failure("payment", &cause);
        assert!(err.is_canceled());

        let cause = WorkflowError::new("boom");
        let err = WorkflowError::child_failure("payment", &cause);
        assert_eq!(err.kind, WorkflowErrorKind::ChildWorkflowFailure);
    }

    #[test]
    fn test_display_includes_code() {
        let err = WorkflowError::new("bad input").with_code("InvalidInput");
        assert_eq!(err.to_string(), "[InvalidInput] bad input");
    }

    #[test]
    fn test_serialization_roundtrip() {
        let err = WorkflowError::activity_timeout(TimeoutType::StartToClose);
        let json = serde_json::to_string(&err).expect("should serialize");
        assert!(json.contains("\"kind\":\"timeout\""));

        let parsed: WorkflowError = serde_json::from_str(&json).expect("should deserialize");
        assert_eq!(parsed, err);
    }
}
