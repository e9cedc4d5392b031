//! Workflows served by this worker

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use durable_replay::engine::WorkflowExecutor;
use durable_replay::persistence::WorkflowEventStore;
use durable_replay::reliability::RetryPolicy;
use durable_replay::workflow::{ActivityOptions, Workflow, WorkflowContext, WorkflowError};

use crate::activities::{SsnTrace, TraceResult};

/// How long a candidate has to submit their details
pub const SUBMISSION_WINDOW: Duration = Duration::from_secs(7 * 24 * 3600);

fn trace_options() -> ActivityOptions {
    ActivityOptions::start_to_close(Duration::from_secs(30))
        .with_retry_policy(RetryPolicy::exponential().with_max_attempts(5))
}

/// Background check: waits out the consent grace period, then traces the SSN
pub struct BackgroundCheck;

impl Workflow for BackgroundCheck {
    const TYPE: &'static str = "background_check";
    type Input = String;
    type Output = TraceResult;

    async fn run(ctx: WorkflowContext, ssn: String) -> Result<TraceResult, WorkflowError> {
        ctx.logger().info("waiting out consent grace period");
        ctx.sleep(Duration::from_secs(60)).await?;
        ctx.activity::<SsnTrace>(&ssn, trace_options()).await
    }
}

/// Candidate details delivered on the `submission` signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    #[serde(rename = "Verified")]
    pub verified: bool,
}

/// Waits for the candidate's submission; an expired window counts as
/// unverified. Answers the `waiting` query while open.
pub struct AwaitSubmission;

impl Workflow for AwaitSubmission {
    const TYPE: &'static str = "await_submission";
    type Input = ();
    type Output = Submission;

    async fn run(ctx: WorkflowContext, _: ()) -> Result<Submission, WorkflowError> {
        let waiting = Rc::new(Cell::new(true));
        let view = Rc::clone(&waiting);
        ctx.set_query_handler("waiting", move || view.get());

        let submission = ctx
            .wait_signal_or_timeout::<Submission>("submission", SUBMISSION_WINDOW)
            .await?;
        waiting.set(false);

        Ok(submission.unwrap_or(Submission { verified: false }))
    }
}

/// Register every workflow this worker serves
pub fn register<S: WorkflowEventStore>(executor: &mut WorkflowExecutor<S>) {
    executor
        .register::<BackgroundCheck>()
        .register::<AwaitSubmission>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use durable_replay::testing::TestEnvironment;
    use serde_json::json;

    fn env() -> TestEnvironment {
        let mut env = TestEnvironment::new();
        env.register_workflow::<BackgroundCheck>()
            .register_workflow::<AwaitSubmission>()
            .register_activity(SsnTrace::default());
        env
    }

    #[tokio::test]
    async fn test_background_check_passes_known_ssn() {
        let env = env();
        let result = env
            .execute_workflow::<BackgroundCheck>(&"555-55-5555".to_string())
            .await
            .expect("engine should not fail");
        assert_eq!(result.expect("should complete"), TraceResult::Pass);
        assert_eq!(env.now().timestamp(), 60);
    }

    #[tokio::test]
    async fn test_background_check_fails_malformed_ssn_without_retry() {
        let env = env();
        let result = env
            .execute_workflow::<BackgroundCheck>(&"nope".to_string())
            .await
            .expect("engine should not fail");
        let err = result.expect_err("should fail");
        assert!(err.message.contains("malformed SSN"));
    }

    #[tokio::test]
    async fn test_submission_query_and_signal() {
        let env = env();
        let id = env
            .start_workflow::<AwaitSubmission>(&(), Default::default())
            .await
            .expect("should start");

        let waiting: bool = env.query(id, "waiting").await.expect("should query");
        assert!(waiting);

        env.signal(id, "submission", &json!({"Verified": true}))
            .await
            .expect("should signal");
        assert_eq!(
            env.get_result(id).await.expect("should load"),
            Some(Ok(json!({"Verified": true})))
        );
    }

    #[tokio::test]
    async fn test_submission_window_expires() {
        let env = env();
        let result = env
            .execute_workflow::<AwaitSubmission>(&())
            .await
            .expect("engine should not fail");
        assert_eq!(
            result.expect("should complete"),
            Submission { verified: false }
        );
        assert_eq!(env.now().timestamp(), SUBMISSION_WINDOW.as_secs() as i64);
    }
}
