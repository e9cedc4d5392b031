//! Replay determinism, side effects, and the run lifecycle
//!
//! Run with: cargo test -p durable-replay --test replay_test

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use durable_replay::activity::{ActivityContext, ActivityError};
use durable_replay::engine::{
    ExecutorConfig, ExecutorError, ManualClock, Replayer, StartWorkflowOptions, WorkflowExecutor,
};
use durable_replay::persistence::{InMemoryWorkflowEventStore, WorkflowEventStore, WorkflowStatus};
use durable_replay::testing::{HistoryBuilder, TestEnvironment};
use durable_replay::workflow::{
    ActivityOptions, ChildWorkflowOptions, HistoryEvent, PendingCommand, Workflow, WorkflowContext,
    WorkflowError, WorkflowOutcome,
};

fn options() -> ActivityOptions {
    ActivityOptions::start_to_close(Duration::from_secs(10))
}

/// Picks a reviewer at random, waits a day, then asks them to review
fn register_assign_review(env: &mut TestEnvironment, picks: Arc<AtomicUsize>) {
    env.register_workflow_fn("assign_review", move |ctx: WorkflowContext, reviewers: Vec<String>| {
        let picks = Arc::clone(&picks);
        async move {
            let index: usize = ctx.side_effect(|| {
                picks.fetch_add(1, Ordering::SeqCst);
                rand::random::<usize>() % reviewers.len()
            })?;
            let reviewer = reviewers[index].clone();

            ctx.sleep(Duration::from_secs(24 * 3600)).await?;
            let verdict: String = ctx.execute_activity("review", &reviewer, options()).await?;
            Ok::<_, WorkflowError>(format!("{reviewer}: {verdict}"))
        }
    });
}

fn review_env(picks: Arc<AtomicUsize>) -> TestEnvironment {
    let mut env = TestEnvironment::new();
    register_assign_review(&mut env, picks);
    env.register_activity_fn("review", |_ctx: ActivityContext, reviewer: String| async move {
        Ok::<_, ActivityError>(format!("approved by {reviewer}"))
    });
    env
}

// ============================================
// Determinism
// ============================================

#[tokio::test]
async fn test_replaying_history_is_repeatable() {
    let picks = Arc::new(AtomicUsize::new(0));
    let env = review_env(Arc::clone(&picks));
    let id = env
        .start_workflow_by_type(
            "assign_review",
            json!(["ada", "grace", "barbara"]),
            StartWorkflowOptions::new(),
        )
        .await
        .expect("should start");
    let result = env
        .wait_for_result(id)
        .await
        .expect("should run")
        .expect("should close")
        .expect("should complete");
    let history = env.history(id).await.expect("should load");

    let mut replayer = Replayer::new();
    *replayer.registry_mut() = env.executor().workflows().clone();

    let first = replayer
        .replay_history("assign_review", &history)
        .expect("should replay");
    for _ in 0..5 {
        let again = replayer
            .replay_history("assign_review", &history)
            .expect("should replay");
        assert_eq!(again, first);
    }
    assert_eq!(first.outcome, Some(WorkflowOutcome::Completed { result }));
    assert!(first.commands.is_empty());

    // Every open prefix of the history decides the same next commands
    for cut in 1..history.len() {
        let a = replayer
            .replay_history("assign_review", &history[..cut])
            .expect("prefix should replay");
        let b = replayer
            .replay_history("assign_review", &history[..cut])
            .expect("prefix should replay");
        assert_eq!(a, b);
    }

    // The prefix holding only the start reaches the unrecorded pick
    let started_only = replayer
        .replay_history("assign_review", &history[..1])
        .expect("prefix should replay");
    assert_eq!(
        started_only.commands,
        vec![PendingCommand::RecordSideEffect {
            seq: 1,
            value: serde_json::Value::Null
        }]
    );
    assert_eq!(started_only.outcome, None);
    assert_eq!(picks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_side_effect_runs_once_across_replays() {
    let picks = Arc::new(AtomicUsize::new(0));
    let env = review_env(Arc::clone(&picks));

    let id = env
        .start_workflow_by_type("assign_review", json!(["ada", "grace"]), StartWorkflowOptions::new())
        .await
        .expect("should start");
    env.wait_for_result(id).await.expect("should run");

    // Started, timer fired and activity completed each replayed the code
    assert_eq!(picks.load(Ordering::SeqCst), 1);

    for _ in 0..3 {
        env.executor()
            .query_workflow(id, "missing")
            .await
            .expect_err("no handler is registered");
    }
    let history = env.history(id).await.expect("should load");
    let mut replayer = Replayer::new();
    *replayer.registry_mut() = env.executor().workflows().clone();
    for _ in 0..10 {
        replayer
            .replay_history("assign_review", &history)
            .expect("should replay");
    }
    assert_eq!(picks.load(Ordering::SeqCst), 1);

    let recorded: Vec<_> = history
        .iter()
        .filter(|r| matches!(r.event, HistoryEvent::SideEffectRecorded { .. }))
        .collect();
    assert_eq!(recorded.len(), 1);
}

#[tokio::test]
async fn test_selector_replays_recorded_order() {
    let mut replayer = Replayer::new();
    replayer
        .registry_mut()
        .register_fn("race", |ctx: WorkflowContext, _: ()| async move {
            let poke = ctx.signal_channel("poke");
            let timer = ctx.timer(Duration::from_secs(60));
            let winner = ctx.selector().add(&poke).add(&timer).select().await?;
            Ok::<_, WorkflowError>(winner)
        });

    // Both branches are ready, but the timer's event came first
    let history = HistoryBuilder::new("race", json!(null))
        .timer_started(1, Duration::from_secs(60))
        .timer_fired(1)
        .signal_received("poke", json!(null))
        .build();
    let result = replayer.replay_history("race", &history).expect("should replay");
    assert_eq!(result.outcome, Some(WorkflowOutcome::Completed { result: json!(1) }));

    let history = HistoryBuilder::new("race", json!(null))
        .timer_started(1, Duration::from_secs(60))
        .signal_received("poke", json!(null))
        .timer_fired(1)
        .build();
    let result = replayer.replay_history("race", &history).expect("should replay");
    assert_eq!(result.outcome, Some(WorkflowOutcome::Completed { result: json!(0) }));
}

#[test_log::test(tokio::test)]
async fn test_changed_code_is_non_deterministic() {
    let store = Arc::new(InMemoryWorkflowEventStore::new());
    let clock = Arc::new(ManualClock::default());

    let mut v1 = WorkflowExecutor::from_shared(Arc::clone(&store), ExecutorConfig::default())
        .with_clock(clock.clone());
    v1.register_fn("onboard", |ctx: WorkflowContext, _: ()| async move {
        ctx.sleep(Duration::from_secs(3600)).await?;
        Ok::<_, WorkflowError>("done")
    });
    let id = v1
        .start_workflow_by_type("onboard", json!(null), StartWorkflowOptions::new())
        .await
        .expect("should start");

    // A redeploy replaced the sleep with an activity
    let mut v2 = WorkflowExecutor::from_shared(Arc::clone(&store), ExecutorConfig::default())
        .with_clock(clock.clone());
    v2.register_fn("onboard", |ctx: WorkflowContext, _: ()| async move {
        let greeting: String = ctx.execute_activity("send_welcome", &(), options()).await?;
        Ok::<_, WorkflowError>(greeting)
    });

    let before = store.load_events(id).await.expect("should load").len();
    let err = v2
        .process_workflow(id)
        .await
        .expect_err("replay should diverge");
    assert!(matches!(err, ExecutorError::NonDeterminism { instance_id, .. } if instance_id == id));

    // Nothing was committed and the run stays open for an operator
    assert_eq!(store.load_events(id).await.expect("should load").len(), before);
    assert_eq!(
        store.get_workflow_status(id).await.expect("should load"),
        WorkflowStatus::Running
    );
    assert_eq!(store.pending_task_count(), 0);
}

#[test]
fn test_unknown_resolution_is_non_deterministic() {
    let mut replayer = Replayer::new();
    replayer
        .registry_mut()
        .register_fn("idle", |ctx: WorkflowContext, _: ()| async move {
            ctx.signal_channel("never").recv::<()>().await?;
            Ok::<_, WorkflowError>(())
        });

    let history = HistoryBuilder::new("idle", json!(null))
        .activity_completed(7, json!("ghost"))
        .build();
    let err = replayer
        .replay_history("idle", &history)
        .expect_err("seq 7 was never issued");
    assert!(matches!(err, ExecutorError::NonDeterminism { .. }));
}

// ============================================
// Queries
// ============================================

#[tokio::test]
async fn test_query_reads_state_without_writing() {
    let mut env = TestEnvironment::new();
    env.register_workflow_fn("tally", |ctx: WorkflowContext, target: u32| async move {
        let count = std::rc::Rc::new(std::cell::Cell::new(0u32));
        let view = std::rc::Rc::clone(&count);
        ctx.set_query_handler("count", move || view.get());

        let votes = ctx.signal_channel("vote");
        while count.get() < target {
            votes.recv::<()>().await?;
            count.set(count.get() + 1);
        }
        Ok::<_, WorkflowError>(count.get())
    });

    let id = env
        .start_workflow_by_type("tally", json!(3), StartWorkflowOptions::new())
        .await
        .expect("should start");
    env.signal(id, "vote", &()).await.expect("should signal");
    env.signal(id, "vote", &()).await.expect("should signal");

    let before = env.history(id).await.expect("should load").len();
    let count: u32 = env.query(id, "count").await.expect("should answer");
    assert_eq!(count, 2);
    assert_eq!(env.history(id).await.expect("should load").len(), before);

    let err = env
        .query::<u32>(id, "unknown")
        .await
        .expect_err("should not answer");
    assert!(matches!(err, ExecutorError::QueryNotFound { .. }));
}

// ============================================
// Cancellation
// ============================================

#[tokio::test]
async fn test_cancellation_allows_cleanup() {
    let mut env = TestEnvironment::new();
    env.register_activity_fn("release_hold", |_ctx: ActivityContext, hold: String| async move {
        Ok::<_, ActivityError>(format!("released {hold}"))
    })
    .register_workflow_fn("reserve", |ctx: WorkflowContext, hold: String| async move {
        match ctx.sleep(Duration::from_secs(24 * 3600)).await {
            Ok(()) => Ok::<_, WorkflowError>("expired".to_string()),
            Err(err) if err.is_canceled() => {
                assert!(ctx.is_cancel_requested());
                let _: String = ctx.execute_activity("release_hold", &hold, options()).await?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    });

    let id = env
        .start_workflow_by_type("reserve", json!("seat-12"), StartWorkflowOptions::new())
        .await
        .expect("should start");
    env.cancel(id, "customer left").await.expect("should cancel");

    let err = env
        .get_result(id)
        .await
        .expect("should load")
        .expect("should close")
        .expect_err("should be canceled");
    assert!(err.is_canceled());

    assert_eq!(
        env.event_names(id).await.expect("should load"),
        vec![
            "workflow_started",
            "timer_started",
            "workflow_cancel_requested",
            "activity_scheduled",
            "activity_completed",
            "workflow_canceled",
        ]
    );
    assert_eq!(
        env.workflow_info(id).await.expect("should load").status,
        WorkflowStatus::Canceled
    );
    assert_eq!(env.store().timer_count(), 0);
}

#[tokio::test]
async fn test_cancel_closed_workflow_fails() {
    let mut env = TestEnvironment::new();
    env.register_workflow_fn("quick", |_ctx: WorkflowContext, _: ()| async move {
        Ok::<_, WorkflowError>(())
    });
    let id = env
        .start_workflow_by_type("quick", json!(null), StartWorkflowOptions::new())
        .await
        .expect("should start");

    let err = env
        .cancel(id, "too late")
        .await
        .expect_err("closed runs cannot be canceled");
    assert!(matches!(err, ExecutorError::WorkflowClosed(_)));

    let err = env
        .signal(id, "poke", &())
        .await
        .expect_err("closed runs cannot be signaled");
    assert!(matches!(err, ExecutorError::WorkflowClosed(_)));
}

// ============================================
// Child workflows
// ============================================

struct Trace;

impl Workflow for Trace {
    const TYPE: &'static str = "trace";
    type Input = String;
    type Output = String;

    async fn run(ctx: WorkflowContext, ssn: String) -> Result<String, WorkflowError> {
        ctx.execute_activity("ssn_trace", &ssn, options()).await
    }
}

#[tokio::test]
async fn test_child_workflows_fan_in() {
    let mut env = TestEnvironment::new();
    env.register_workflow::<Trace>()
        .register_activity_fn("ssn_trace", |_ctx: ActivityContext, ssn: String| async move {
            Ok::<_, ActivityError>(if ssn.starts_with("555") { "pass" } else { "fail" })
        })
        .register_workflow_fn("screening", |ctx: WorkflowContext, ssns: Vec<String>| async move {
            let children: Vec<_> = ssns
                .iter()
                .map(|ssn| ctx.start_child_workflow::<Trace>(ssn, ChildWorkflowOptions::new()))
                .collect();
            let results = futures::future::join_all(children).await;
            results.into_iter().collect::<Result<Vec<_>, _>>()
        });

    let id = env
        .start_workflow_by_type(
            "screening",
            json!(["555-55-5555", "111-11-1111"]),
            StartWorkflowOptions::new().with_workflow_id("screening-42"),
        )
        .await
        .expect("should start");

    assert_eq!(
        env.get_result(id).await.expect("should load"),
        Some(Ok(json!(["pass", "fail"])))
    );

    let runs = env.store().list_workflows(None).await.expect("should list");
    let mut child_ids: Vec<_> = runs
        .iter()
        .filter(|run| run.parent.is_some_and(|p| p.instance_id == id))
        .map(|run| run.workflow_id.clone())
        .collect();
    child_ids.sort();
    assert_eq!(child_ids, vec!["screening-42-child-1", "screening-42-child-2"]);
}

// ============================================
// Continue-as-new
// ============================================

#[tokio::test]
async fn test_continue_as_new_chain() {
    let mut env = TestEnvironment::new();
    env.register_workflow_fn("countdown", |ctx: WorkflowContext, n: u32| async move {
        ctx.sleep(Duration::from_secs(60)).await?;
        if n == 0 {
            return Ok::<_, WorkflowError>(ctx.info().workflow_id);
        }
        Err(ctx.continue_as_new(&(n - 1)))
    });

    let first = env
        .start_workflow_by_type(
            "countdown",
            json!(3),
            StartWorkflowOptions::new().with_workflow_id("countdown"),
        )
        .await
        .expect("should start");

    assert_eq!(
        env.wait_for_result(first).await.expect("should run"),
        Some(Ok(json!("countdown")))
    );
    assert_eq!(env.now().timestamp(), 4 * 60);

    let first_info = env.workflow_info(first).await.expect("should load");
    assert_eq!(first_info.status, WorkflowStatus::ContinuedAsNew);

    let last = env.executor().latest_run(first).await.expect("should follow");
    assert_ne!(last, first);
    let last_info = env.workflow_info(last).await.expect("should load");
    assert_eq!(last_info.status, WorkflowStatus::Completed);
    assert_eq!(last_info.workflow_id, "countdown");
    assert_eq!(last_info.input, json!(0));

    let runs = env.store().list_workflows(None).await.expect("should list");
    assert_eq!(runs.len(), 4);
}
