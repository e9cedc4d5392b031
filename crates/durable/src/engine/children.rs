//! Child workflow runs
//!
//! A child is an independent run linked to the `(parent, seq)` operation
//! that started it. When the child closes, its outcome is appended to the
//! parent's history as `ChildWorkflowCompleted` or `ChildWorkflowFailed`.

use tracing::{debug, info};

use crate::persistence::{NewWorkflowInstance, StoreError, WorkflowEventStore};
use crate::workflow::{HistoryEvent, ParentLink, WorkflowError, WorkflowErrorKind};

use super::executor::{ExecutorError, FollowUp, WorkflowExecutor};

impl<S: WorkflowEventStore> WorkflowExecutor<S> {
    /// Create a child run committed by its parent.
    ///
    /// Creating a child that already exists is a no-op. An unregistered
    /// child type fails the parent's operation instead of the parent.
    pub(crate) async fn start_child_run(
        &self,
        child: NewWorkflowInstance,
    ) -> Result<Vec<FollowUp>, ExecutorError> {
        let child_id = child.id;
        let parent = child.parent;

        match self.store.get_workflow_info(child_id).await {
            Ok(_) => {
                debug!(%child_id, "child workflow already exists");
                return Ok(vec![]);
            }
            Err(StoreError::WorkflowNotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        if !self.workflows.contains(&child.workflow_type) {
            let error = WorkflowError::with_kind(
                WorkflowErrorKind::ChildWorkflowFailure,
                format!("unknown workflow type: {}", child.workflow_type),
            );
            return Ok(parent
                .map(|parent| FollowUp::NotifyParent {
                    parent,
                    event: HistoryEvent::ChildWorkflowFailed {
                        seq: parent.seq,
                        error,
                    },
                })
                .into_iter()
                .collect());
        }

        info!(
            %child_id,
            workflow_type = %child.workflow_type,
            parent = ?parent.map(|p| p.instance_id),
            "starting child workflow"
        );
        self.create_run(child).await?;
        Ok(vec![FollowUp::Process(child_id)])
    }

    /// Append a child's close event to its parent and wake the parent
    pub(crate) async fn resolve_child(
        &self,
        parent: ParentLink,
        event: HistoryEvent,
    ) -> Result<Vec<FollowUp>, ExecutorError> {
        if !self.append_resolution(parent.instance_id, event).await? {
            return Ok(vec![]);
        }
        debug!(parent = %parent.instance_id, seq = parent.seq, "child result delivered");
        Ok(vec![FollowUp::Process(parent.instance_id)])
    }
}
