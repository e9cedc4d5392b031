//! Activity execution context

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Error from heartbeat operations
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// The owning workflow was canceled or the task timed out
    #[error("activity was cancelled")]
    Cancelled,
}

/// Context handed to an activity attempt
///
/// Provides attempt metadata, a cancellation token that fires when the
/// owning workflow is canceled (reported through heartbeats) or the worker
/// shuts down, and a heartbeat slot the worker forwards to the store.
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &ActivityContext, batch: Vec<Item>) -> Result<usize, ActivityError> {
///     for (i, item) in batch.iter().enumerate() {
///         ctx.heartbeat(Some(json!({"processed": i})))?;
///         tokio::select! {
///             _ = ctx.cancelled() => return Err(ActivityError::non_retryable("cancelled")),
///             res = process(item) => res?,
///         }
///     }
///     Ok(batch.len())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub task_id: Uuid,

    /// Workflow instance that scheduled this activity
    pub instance_id: Uuid,

    /// Correlation id of the activity within the instance
    pub seq: u32,

    pub activity_type: String,

    /// Current attempt number (1-based)
    pub attempt: u32,

    pub max_attempts: u32,

    cancellation: CancellationToken,

    heartbeat: Arc<Mutex<Option<serde_json::Value>>>,
}

impl ActivityContext {
    pub fn new(
        task_id: Uuid,
        instance_id: Uuid,
        seq: u32,
        activity_type: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            task_id,
            instance_id,
            seq,
            activity_type: activity_type.into(),
            attempt,
            max_attempts,
            cancellation: CancellationToken::new(),
            heartbeat: Arc::new(Mutex::new(None)),
        }
    }

    /// Token the worker cancels when the attempt should stop
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Record liveness and optional progress details.
    ///
    /// The latest details are picked up by the worker's heartbeat loop.
    pub fn heartbeat(&self, details: Option<serde_json::Value>) -> Result<(), HeartbeatError> {
        if self.is_cancelled() {
            return Err(HeartbeatError::Cancelled);
        }
        *self.heartbeat.lock() = Some(details.unwrap_or(serde_json::Value::Null));
        Ok(())
    }

    /// Take the details recorded since the last call
    pub(crate) fn take_heartbeat(&self) -> Option<serde_json::Value> {
        self.heartbeat.lock().take()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
