//! Workflow registry for type-erased workflow instantiation
//!
//! The registry maps workflow type names to handlers that start the
//! workflow's code from JSON input without the executor knowing the
//! concrete type.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::LocalBoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::workflow::{Workflow, WorkflowContext, WorkflowError};

/// Type-erased workflow entry point
///
/// The returned future borrows nothing and is polled only by the replay
/// driver, so it does not need to be `Send`.
pub type WorkflowFn =
    dyn Fn(WorkflowContext, Value) -> LocalBoxFuture<'static, Result<Value, WorkflowError>>
        + Send
        + Sync;

/// Registered workflow: its type name, payload types and entry point
#[derive(Clone)]
pub struct WorkflowDescriptor {
    pub workflow_type: String,
    pub input_type: &'static str,
    pub output_type: &'static str,
    handler: Arc<WorkflowFn>,
}

impl WorkflowDescriptor {
    /// Start the workflow's code; nothing runs until the future is polled
    pub(crate) fn instantiate(
        &self,
        ctx: WorkflowContext,
        input: Value,
    ) -> LocalBoxFuture<'static, Result<Value, WorkflowError>> {
        (self.handler)(ctx, input)
    }
}

impl fmt::Debug for WorkflowDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDescriptor")
            .field("workflow_type", &self.workflow_type)
            .field("input_type", &self.input_type)
            .field("output_type", &self.output_type)
            .finish()
    }
}

/// Registry of workflow definitions
#[derive(Default, Clone)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, WorkflowDescriptor>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow type
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = WorkflowRegistry::new();
    /// registry.register::<BackgroundCheck>();
    /// ```
    pub fn register<W: Workflow>(&mut self) -> &mut Self {
        let handler: Arc<WorkflowFn> = Arc::new(|ctx, input| {
            Box::pin(async move {
                let input: W::Input = serde_json::from_value(input)?;
                let output = W::run(ctx, input).await?;
                Ok(serde_json::to_value(output)?)
            })
        });

        self.insert(WorkflowDescriptor {
            workflow_type: W::TYPE.to_string(),
            input_type: std::any::type_name::<W::Input>(),
            output_type: std::any::type_name::<W::Output>(),
            handler,
        })
    }

    /// Register a plain async function as a workflow
    pub fn register_fn<I, O, F, Fut>(&mut self, workflow_type: &str, f: F) -> &mut Self
    where
        I: DeserializeOwned + 'static,
        O: Serialize + 'static,
        F: Fn(WorkflowContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, WorkflowError>> + 'static,
    {
        let handler: Arc<WorkflowFn> = Arc::new(move |ctx, input| {
            let input: I = match serde_json::from_value(input) {
                Ok(input) => input,
                Err(err) => return Box::pin(futures::future::ready(Err(err.into()))),
            };
            let run = f(ctx, input);
            Box::pin(async move { Ok(serde_json::to_value(run.await?)?) })
        });

        self.insert(WorkflowDescriptor {
            workflow_type: workflow_type.to_string(),
            input_type: std::any::type_name::<I>(),
            output_type: std::any::type_name::<O>(),
            handler,
        })
    }

    fn insert(&mut self, descriptor: WorkflowDescriptor) -> &mut Self {
        self.workflows
            .insert(descriptor.workflow_type.clone(), descriptor);
        self
    }

    pub fn get(&self, workflow_type: &str) -> Result<&WorkflowDescriptor, RegistryError> {
        self.workflows
            .get(workflow_type)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.workflows.contains_key(workflow_type)
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    /// Registered workflow type names, sorted
    pub fn workflow_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.workflows.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.workflow_types())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),
}
