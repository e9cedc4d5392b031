//! End-to-end scenarios on the time-skipping test environment
//!
//! Run with: cargo test -p durable-replay --test scenarios_test

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use durable_replay::activity::{ActivityContext, ActivityError};
use durable_replay::engine::StartWorkflowOptions;
use durable_replay::persistence::WorkflowStatus;
use durable_replay::reliability::RetryPolicy;
use durable_replay::testing::TestEnvironment;
use durable_replay::workflow::{
    ActivityOptions, HistoryEvent, Workflow, WorkflowContext, WorkflowError, WorkflowErrorKind,
};

const HOUR: Duration = Duration::from_secs(3600);
const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);

// ============================================
// Workflows under test
// ============================================

/// Waits a minute, then traces the SSN
struct BackgroundCheck;

impl Workflow for BackgroundCheck {
    const TYPE: &'static str = "background_check";
    type Input = String;
    type Output = String;

    async fn run(ctx: WorkflowContext, ssn: String) -> Result<String, WorkflowError> {
        ctx.sleep(Duration::from_secs(60)).await?;
        ctx.execute_activity(
            "ssn_trace",
            &ssn,
            ActivityOptions::start_to_close(Duration::from_secs(10)),
        )
        .await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Submission {
    #[serde(rename = "Verified")]
    verified: bool,
}

/// Waits up to a week for the candidate's submission
struct AwaitSubmission;

impl Workflow for AwaitSubmission {
    const TYPE: &'static str = "await_submission";
    type Input = ();
    type Output = Submission;

    async fn run(ctx: WorkflowContext, _: ()) -> Result<Submission, WorkflowError> {
        let submission = ctx.signal_channel("submission");
        let deadline = ctx.timer(WEEK);

        match ctx.selector().add(&submission).add(&deadline).select().await? {
            0 => {
                ctx.cancel_timer(&deadline);
                submission.recv().await
            }
            _ => Ok(Submission { verified: false }),
        }
    }
}

fn trace_ssn(ssn: &str) -> &'static str {
    if ssn == "555-55-5555" {
        "pass"
    } else {
        "fail"
    }
}

fn env() -> TestEnvironment {
    let mut env = TestEnvironment::new();
    env.register_workflow::<BackgroundCheck>()
        .register_workflow::<AwaitSubmission>()
        .register_activity_fn("ssn_trace", |_ctx: ActivityContext, ssn: String| async move {
            Ok::<_, ActivityError>(trace_ssn(&ssn))
        });
    env
}

// ============================================
// Background check
// ============================================

#[tokio::test]
async fn test_background_check_end_to_end() {
    let env = env();

    let result = env
        .execute_workflow::<BackgroundCheck>(&"555-55-5555".to_string())
        .await
        .expect("engine should not fail");
    assert_eq!(result.expect("workflow should complete"), "pass");

    // The 60s sleep was skipped, not waited
    assert_eq!(env.now().timestamp(), 60);
}

#[tokio::test]
async fn test_background_check_history_order() {
    let env = env();
    let id = env
        .start_workflow::<BackgroundCheck>(&"555-55-5555".to_string(), StartWorkflowOptions::new())
        .await
        .expect("should start");
    tokio_test::assert_ok!(env.wait_for_result(id).await);

    assert_eq!(
        env.event_names(id).await.expect("should load"),
        vec![
            "workflow_started",
            "timer_started",
            "timer_fired",
            "activity_scheduled",
            "activity_completed",
            "workflow_completed",
        ]
    );

    let info = env.workflow_info(id).await.expect("should load");
    assert_eq!(info.status, WorkflowStatus::Completed);
    assert_eq!(info.result, Some(json!("pass")));
}

#[tokio::test]
async fn test_background_check_unknown_ssn() {
    let env = env();
    let result = env
        .execute_workflow::<BackgroundCheck>(&"000-00-0000".to_string())
        .await
        .expect("engine should not fail");
    assert_eq!(result.expect("workflow should complete"), "fail");
}

// ============================================
// Signal vs timer race
// ============================================

#[tokio::test]
async fn test_submission_signal_wins_race() {
    let env = env();
    let id = env
        .start_workflow::<AwaitSubmission>(&(), StartWorkflowOptions::new())
        .await
        .expect("should start");

    env.sleep(HOUR).await.expect("should sleep");
    env.signal(id, "submission", &json!({"Verified": true}))
        .await
        .expect("should signal");

    let result = env.get_result(id).await.expect("should load");
    assert_eq!(result, Some(Ok(json!({"Verified": true}))));

    let history = env.history(id).await.expect("should load");
    let signal_at = history
        .iter()
        .find(|r| matches!(r.event, HistoryEvent::SignalReceived { .. }))
        .map(|r| r.recorded_at.timestamp())
        .expect("signal should be recorded");
    assert_eq!(signal_at, HOUR.as_secs() as i64);
    assert!(history
        .iter()
        .any(|r| matches!(r.event, HistoryEvent::TimerCanceled { seq: 1 })));

    // The canceled deadline never fires
    env.sleep(WEEK).await.expect("should sleep");
    assert!(!env
        .event_names(id)
        .await
        .expect("should load")
        .contains(&"timer_fired"));
}

#[tokio::test]
async fn test_submission_times_out_after_exactly_a_week() {
    let env = env();
    let id = env
        .start_workflow::<AwaitSubmission>(&(), StartWorkflowOptions::new())
        .await
        .expect("should start");

    env.sleep(WEEK - Duration::from_secs(1))
        .await
        .expect("should sleep");
    assert_eq!(env.get_result(id).await.expect("should load"), None);

    let result = env.wait_for_result(id).await.expect("should run");
    assert_eq!(result, Some(Ok(json!({"Verified": false}))));
    assert_eq!(env.now().timestamp(), WEEK.as_secs() as i64);

    let history = env.history(id).await.expect("should load");
    let closed = history.last().expect("history should not be empty");
    assert_eq!(closed.event.name(), "workflow_completed");
    assert_eq!(closed.recorded_at.timestamp(), WEEK.as_secs() as i64);
}

#[tokio::test]
async fn test_signal_before_earlier_timer_wins() {
    let mut env = env();
    env.register_workflow_fn("first_of", |ctx: WorkflowContext, _: ()| async move {
        let early = ctx.timer(HOUR);
        let late = ctx.timer(2 * HOUR);
        let poke = ctx.signal_channel("poke");
        let winner = ctx
            .selector()
            .add(&early)
            .add(&late)
            .add(&poke)
            .select()
            .await?;
        Ok::<_, WorkflowError>(winner)
    });

    let id = env
        .start_workflow_by_type("first_of", json!(null), StartWorkflowOptions::new())
        .await
        .expect("should start");
    env.sleep(HOUR / 2).await.expect("should sleep");
    env.signal(id, "poke", &json!(null)).await.expect("should signal");

    assert_eq!(
        env.get_result(id).await.expect("should load"),
        Some(Ok(json!(2)))
    );
}

#[tokio::test]
async fn test_signal_payloads_queue_in_order() {
    let mut env = env();
    env.register_workflow_fn("collect", |ctx: WorkflowContext, count: usize| async move {
        let channel = ctx.signal_channel("item");
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let item: String = channel.recv().await?;
            items.push(item);
        }
        Ok::<_, WorkflowError>(items)
    });

    let id = env
        .start_workflow_by_type("collect", json!(3), StartWorkflowOptions::new())
        .await
        .expect("should start");
    for item in ["a", "b", "a"] {
        env.signal(id, "item", item).await.expect("should signal");
    }

    assert_eq!(
        env.get_result(id).await.expect("should load"),
        Some(Ok(json!(["a", "b", "a"])))
    );
}

// ============================================
// Activity timeouts and retries
// ============================================

#[tokio::test(start_paused = true)]
async fn test_activity_start_to_close_timeout() {
    let mut env = env();
    env.register_activity_fn("hang", |_ctx: ActivityContext, _: ()| async move {
        futures::future::pending::<()>().await;
        Ok::<_, ActivityError>(())
    })
    .register_workflow_fn("call_hang", |ctx: WorkflowContext, _: ()| async move {
        let options = ActivityOptions::start_to_close(Duration::from_secs(1));
        match ctx.execute_activity::<_, ()>("hang", &(), options).await {
            Ok(()) => Ok("returned".to_string()),
            Err(err) if err.is_timeout() => Ok(format!("timed out: {}", err.code.unwrap_or_default())),
            Err(err) => Err(err),
        }
    });

    let id = env
        .start_workflow_by_type("call_hang", json!(null), StartWorkflowOptions::new())
        .await
        .expect("should start");

    assert_eq!(
        env.get_result(id).await.expect("should load"),
        Some(Ok(json!("timed out: StartToClose")))
    );
    let elapsed = env.now().timestamp_millis();
    assert!((1000..1100).contains(&elapsed), "took {elapsed}ms");

    assert!(env
        .event_names(id)
        .await
        .expect("should load")
        .contains(&"activity_timed_out"));
}

#[tokio::test]
async fn test_retry_exhaustion_after_three_attempts() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);

    let mut env = env();
    env.register_activity_fn("always_fails", move |_ctx: ActivityContext, _: ()| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Err::<(), _>(ActivityError::retryable("upstream unavailable").with_type("Unavailable")) }
    })
    .register_workflow_fn("call_failing", |ctx: WorkflowContext, _: ()| async move {
        let options = ActivityOptions::start_to_close(Duration::from_secs(5))
            .with_retry_policy(RetryPolicy::fixed(Duration::from_secs(1), 3));
        ctx.execute_activity::<_, ()>("always_fails", &(), options).await
    });

    let id = env
        .start_workflow_by_type("call_failing", json!(null), StartWorkflowOptions::new())
        .await
        .expect("should start");
    let err = env
        .wait_for_result(id)
        .await
        .expect("should run")
        .expect("should close")
        .expect_err("workflow should fail");

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(err.kind, WorkflowErrorKind::ActivityFailure);
    assert_eq!(err.code.as_deref(), Some("Unavailable"));

    // Retries are invisible: one scheduled, one terminal failure
    let history = env.history(id).await.expect("should load");
    let failures: Vec<u32> = history
        .iter()
        .filter_map(|r| match &r.event {
            HistoryEvent::ActivityFailed { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![3]);
    assert_eq!(
        env.workflow_info(id).await.expect("should load").status,
        WorkflowStatus::Failed
    );
}

#[tokio::test]
async fn test_non_retryable_error_type_stops_retries() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);

    let mut env = env();
    env.register_activity_fn("charge", move |_ctx: ActivityContext, _: ()| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Err::<(), _>(ActivityError::retryable("card declined").with_type("CardDeclined")) }
    })
    .register_workflow_fn("checkout", |ctx: WorkflowContext, _: ()| async move {
        let options = ActivityOptions::start_to_close(Duration::from_secs(5)).with_retry_policy(
            RetryPolicy::exponential().with_non_retryable_error("CardDeclined"),
        );
        match ctx.execute_activity::<_, ()>("charge", &(), options).await {
            Ok(()) => Ok("charged".to_string()),
            Err(err) => Ok(format!("compensated: {}", err.code.unwrap_or_default())),
        }
    });

    let id = env
        .start_workflow_by_type("checkout", json!(null), StartWorkflowOptions::new())
        .await
        .expect("should start");

    assert_eq!(
        env.wait_for_result(id).await.expect("should run"),
        Some(Ok(json!("compensated: CardDeclined")))
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missing_timeouts_rejected_before_recording() {
    let mut env = env();
    env.register_workflow_fn("misconfigured", |ctx: WorkflowContext, _: ()| async move {
        let err = ctx
            .execute_activity::<_, String>("ssn_trace", "555-55-5555", ActivityOptions::new())
            .await
            .expect_err("options without timeouts should be rejected");
        Ok::<_, WorkflowError>(err.kind == WorkflowErrorKind::Configuration)
    });

    let id = env
        .start_workflow_by_type("misconfigured", json!(null), StartWorkflowOptions::new())
        .await
        .expect("should start");

    assert_eq!(
        env.get_result(id).await.expect("should load"),
        Some(Ok(json!(true)))
    );
    assert_eq!(
        env.event_names(id).await.expect("should load"),
        vec!["workflow_started", "workflow_completed"]
    );
}

#[tokio::test]
async fn test_parallel_activities() {
    let mut env = env();
    env.register_workflow_fn("fan_out", |ctx: WorkflowContext, ssns: Vec<String>| async move {
        let options = ActivityOptions::start_to_close(Duration::from_secs(10));
        let handles: Vec<_> = ssns
            .iter()
            .map(|ssn| ctx.execute_activity::<_, String>("ssn_trace", ssn, options.clone()))
            .collect();
        futures::future::join_all(handles)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
    });

    let id = env
        .start_workflow_by_type(
            "fan_out",
            json!(["555-55-5555", "123-45-6789", "555-55-5555"]),
            StartWorkflowOptions::new(),
        )
        .await
        .expect("should start");

    assert_eq!(
        env.get_result(id).await.expect("should load"),
        Some(Ok(json!(["pass", "fail", "pass"])))
    );

    // All three were scheduled before any completed
    let names = env.event_names(id).await.expect("should load");
    assert_eq!(
        &names[1..4],
        &["activity_scheduled", "activity_scheduled", "activity_scheduled"]
    );
}

#[tokio::test]
async fn test_wide_fan_out_resolves_every_handle() {
    let mut env = env();
    env.register_workflow_fn("wide_fan_out", |ctx: WorkflowContext, count: usize| async move {
        let options = ActivityOptions::start_to_close(Duration::from_secs(10));
        let handles: Vec<_> = (0..count)
            .map(|i| {
                let ssn = if i % 2 == 0 { "555-55-5555" } else { "000-00-0000" };
                ctx.execute_activity::<_, String>("ssn_trace", ssn, options.clone())
            })
            .collect();
        // Past 30 futures join_all only re-polls children whose waker fired
        futures::future::join_all(handles)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
    });

    let id = env
        .start_workflow_by_type("wide_fan_out", json!(40), StartWorkflowOptions::new())
        .await
        .expect("should start");

    let results = env
        .wait_for_result(id)
        .await
        .expect("should run")
        .expect("should close")
        .expect("should complete");
    let results: Vec<String> = serde_json::from_value(results).expect("should decode");
    assert_eq!(results.len(), 40);
    assert!(results
        .iter()
        .enumerate()
        .all(|(i, r)| r == if i % 2 == 0 { "pass" } else { "fail" }));

    let completed = env
        .history(id)
        .await
        .expect("should load")
        .iter()
        .filter(|r| matches!(r.event, HistoryEvent::ActivityCompleted { .. }))
        .count();
    assert_eq!(completed, 40);
}

// ============================================
// Cron schedules
// ============================================

fn cron_env(runs: Arc<AtomicU32>) -> TestEnvironment {
    let mut env = env();
    env.register_workflow_fn("scheduled", move |ctx: WorkflowContext, name: String| {
        let runs = Arc::clone(&runs);
        async move {
            let run = runs.fetch_add(1, Ordering::SeqCst) + 1;
            if name == "flaky" && run == 1 {
                return Err(WorkflowError::new("first run fails"));
            }
            Ok::<_, WorkflowError>(format!("Hello, {name}! ({})", ctx.now().timestamp()))
        }
    });
    env
}

#[tokio::test]
async fn test_cron_workflow_runs_every_minute_until_canceled() {
    let runs = Arc::new(AtomicU32::new(0));
    let env = cron_env(Arc::clone(&runs));
    let id = env
        .start_workflow_by_type(
            "scheduled",
            json!("Temporal"),
            StartWorkflowOptions::new()
                .with_workflow_id("my-schedule")
                .with_cron_schedule("* * * * *"),
        )
        .await
        .expect("should start");

    // Nothing runs before the first scheduled minute
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(
        env.event_names(id).await.expect("should load"),
        vec!["workflow_started"]
    );

    env.sleep(Duration::from_secs(60)).await.expect("should advance");
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        env.event_names(id).await.expect("should load"),
        vec!["workflow_started", "workflow_completed", "workflow_cron_scheduled"]
    );
    let first = env.workflow_info(id).await.expect("should load");
    assert_eq!(first.result, Some(json!("Hello, Temporal! (60)")));

    env.sleep(Duration::from_secs(120)).await.expect("should advance");
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(env.get_result(id).await.expect("should load"), None);

    let next = env.executor().latest_run(id).await.expect("should resolve");
    assert_ne!(next, id);
    let next_info = env.workflow_info(next).await.expect("should load");
    assert_eq!(next_info.workflow_id, "my-schedule");
    assert_eq!(next_info.status, WorkflowStatus::Running);
    match &env.history(next).await.expect("should load")[0].event {
        HistoryEvent::WorkflowStarted {
            cron_schedule,
            scheduled_start,
            continued_from,
            ..
        } => {
            assert_eq!(cron_schedule.as_deref(), Some("* * * * *"));
            assert_eq!(scheduled_start.map(|at| at.timestamp()), Some(240));
            assert!(continued_from.is_some());
        }
        other => panic!("unexpected first event {other:?}"),
    }

    // Canceling the waiting run ends the schedule without running it
    env.cancel(id, "schedule removed").await.expect("should cancel");
    env.sleep(Duration::from_secs(300)).await.expect("should advance");
    assert_eq!(runs.load(Ordering::SeqCst), 3);

    let err = env
        .get_result(id)
        .await
        .expect("should load")
        .expect("chain should be closed")
        .expect_err("chain should end canceled");
    assert!(err.is_canceled());
    assert_eq!(
        env.event_names(next).await.expect("should load"),
        vec!["workflow_started", "workflow_cancel_requested", "workflow_canceled"]
    );
}

#[tokio::test]
async fn test_failed_cron_run_still_schedules_next() {
    let runs = Arc::new(AtomicU32::new(0));
    let env = cron_env(Arc::clone(&runs));
    let id = env
        .start_workflow_by_type(
            "scheduled",
            json!("flaky"),
            StartWorkflowOptions::new().with_cron_schedule("*/5 * * * *"),
        )
        .await
        .expect("should start");

    env.sleep(Duration::from_secs(600)).await.expect("should advance");
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    let first = env.workflow_info(id).await.expect("should load");
    assert_eq!(first.status, WorkflowStatus::Failed);
    assert_eq!(
        env.event_names(id).await.expect("should load"),
        vec!["workflow_started", "workflow_failed", "workflow_cron_scheduled"]
    );

    let second = env
        .history(id)
        .await
        .expect("should load")
        .iter()
        .find_map(|r| r.event.successor())
        .expect("next run should be linked");
    let info = env.workflow_info(second).await.expect("should load");
    assert_eq!(info.status, WorkflowStatus::Completed);
    assert_eq!(info.result, Some(json!("Hello, flaky! (600)")));
}
