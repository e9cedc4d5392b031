//! Offline history replay
//!
//! Runs workflow code against a captured history without a store. Used to
//! check that a new version of workflow code is still compatible with runs
//! recorded by the old one.

use uuid::Uuid;

use crate::workflow::{EventRecord, HistoryEvent, PendingCommand, Workflow, WorkflowOutcome};

use super::executor::ExecutorError;
use super::registry::WorkflowRegistry;
use super::replay::{self, ActivationMode, ActivationParams};

/// What the workflow code decided when replayed against a history
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayResult {
    /// Commands issued beyond the end of the recorded history
    pub commands: Vec<PendingCommand>,
    /// Set when the code returned
    pub outcome: Option<WorkflowOutcome>,
}

/// Replays recorded histories against registered workflow code
///
/// # Example
///
/// ```ignore
/// let mut replayer = Replayer::new();
/// replayer.register::<BackgroundCheck>();
///
/// let history: Vec<EventRecord> = serde_json::from_str(&captured)?;
/// replayer.replay_history("background_check", &history)?;
/// ```
#[derive(Debug, Default)]
pub struct Replayer {
    workflows: WorkflowRegistry,
}

impl Replayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<W: Workflow>(&mut self) -> &mut Self {
        self.workflows.register::<W>();
        self
    }

    pub fn registry_mut(&mut self) -> &mut WorkflowRegistry {
        &mut self.workflows
    }

    /// Replay `history` and return the code's decisions.
    ///
    /// Side effect generators are never called. When the code reaches a side
    /// effect the history did not record, the result ends with that
    /// `RecordSideEffect` command (value `null`) and no outcome.
    ///
    /// Fails with `NonDeterminism` when the code diverges from the recorded
    /// commands or closes differently than the history did.
    pub fn replay_history(
        &self,
        workflow_type: &str,
        history: &[EventRecord],
    ) -> Result<ReplayResult, ExecutorError> {
        let descriptor = self.workflows.get(workflow_type)?;
        let instance_id = Uuid::nil();
        let params = ActivationParams {
            instance_id,
            namespace: "replay".to_string(),
            mode: ActivationMode::Validate,
            continue_as_new_after: usize::MAX,
        };

        let output = replay::activate(descriptor, history, &params).map_err(|err| match err {
            replay::ActivationError::NonDeterminism(message) => ExecutorError::NonDeterminism {
                instance_id,
                message,
            },
            replay::ActivationError::MalformedHistory(message) => {
                ExecutorError::MalformedHistory(instance_id, message)
            }
        })?;

        if let Some(recorded) = output
            .recorded_terminal
            .as_ref()
            .filter(|event| !matches!(event, HistoryEvent::WorkflowTimedOut))
        {
            let matches = output
                .outcome
                .as_ref()
                .is_some_and(|outcome| same_close(outcome, recorded));
            if !matches {
                return Err(ExecutorError::NonDeterminism {
                    instance_id,
                    message: format!(
                        "history closed with {} but the workflow {}",
                        recorded.name(),
                        match &output.outcome {
                            Some(outcome) => format!("decided {outcome:?}"),
                            None => "is still blocked".to_string(),
                        }
                    ),
                });
            }
        }

        Ok(ReplayResult {
            commands: output.commands,
            outcome: output.outcome,
        })
    }

    /// Replay a history serialized as a JSON array of event records
    pub fn replay_json(
        &self,
        workflow_type: &str,
        history_json: &str,
    ) -> Result<ReplayResult, ExecutorError> {
        let history: Vec<EventRecord> = serde_json::from_str(history_json)?;
        self.replay_history(workflow_type, &history)
    }
}

fn same_close(outcome: &WorkflowOutcome, recorded: &HistoryEvent) -> bool {
    match (outcome, recorded) {
        (WorkflowOutcome::Completed { result }, HistoryEvent::WorkflowCompleted { result: r }) => {
            result == r
        }
        (WorkflowOutcome::Failed { .. }, HistoryEvent::WorkflowFailed { .. }) => true,
        (WorkflowOutcome::Canceled { .. }, HistoryEvent::WorkflowCanceled { .. }) => true,
        (
            WorkflowOutcome::ContinuedAsNew { input },
            HistoryEvent::WorkflowContinuedAsNew { input: i, .. },
        ) => input == i,
        _ => false,
    }
}
