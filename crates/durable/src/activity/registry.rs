//! Activity registry
//!
//! Maps activity type names to type-erased handlers. Input and output are
//! converted from and to JSON at the boundary so the worker and the test
//! environment can invoke any registered activity by name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};

use super::{Activity, ActivityContext, ActivityError};

type ActivityFn = dyn Fn(ActivityContext, serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, ActivityError>>
    + Send
    + Sync;

/// Registered activity: its type name, payload types and handler
#[derive(Clone)]
pub struct ActivityDescriptor {
    pub activity_type: String,
    pub input_type: &'static str,
    pub output_type: &'static str,
    handler: Arc<ActivityFn>,
}

impl ActivityDescriptor {
    /// Run one attempt
    pub fn invoke(
        &self,
        ctx: ActivityContext,
        input: serde_json::Value,
    ) -> BoxFuture<'static, Result<serde_json::Value, ActivityError>> {
        (self.handler)(ctx, input)
    }
}

impl std::fmt::Debug for ActivityDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityDescriptor")
            .field("activity_type", &self.activity_type)
            .field("input_type", &self.input_type)
            .field("output_type", &self.output_type)
            .finish()
    }
}

/// Registry of activity handlers available to a worker
#[derive(Default, Clone)]
pub struct ActivityRegistry {
    activities: HashMap<String, ActivityDescriptor>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an [`Activity`] implementation under its `TYPE`
    pub fn register<A: Activity>(&mut self, activity: A) -> &mut Self {
        let activity = Arc::new(activity);
        let handler: Arc<ActivityFn> = Arc::new(move |ctx, input| {
            let activity = Arc::clone(&activity);
            Box::pin(async move {
                let input: A::Input = serde_json::from_value(input)?;
                let output = activity.execute(&ctx, input).await?;
                Ok(serde_json::to_value(output)?)
            })
        });

        self.insert(ActivityDescriptor {
            activity_type: A::TYPE.to_string(),
            input_type: std::any::type_name::<A::Input>(),
            output_type: std::any::type_name::<A::Output>(),
            handler,
        })
    }

    /// Register a plain async function as an activity
    pub fn register_fn<I, O, F, Fut>(&mut self, activity_type: &str, f: F) -> &mut Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(ActivityContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, ActivityError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: Arc<ActivityFn> = Arc::new(move |ctx, input| {
            let f = Arc::clone(&f);
            Box::pin(async move {
                let input: I = serde_json::from_value(input)?;
                let output = f(ctx, input).await?;
                Ok(serde_json::to_value(output)?)
            })
        });

        self.insert(ActivityDescriptor {
            activity_type: activity_type.to_string(),
            input_type: std::any::type_name::<I>(),
            output_type: std::any::type_name::<O>(),
            handler,
        })
    }

    fn insert(&mut self, descriptor: ActivityDescriptor) -> &mut Self {
        self.activities
            .insert(descriptor.activity_type.clone(), descriptor);
        self
    }

    pub fn get(&self, activity_type: &str) -> Option<&ActivityDescriptor> {
        self.activities.get(activity_type)
    }

    pub fn contains(&self, activity_type: &str) -> bool {
        self.activities.contains_key(activity_type)
    }

    pub fn activity_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.activities.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }
}

impl std::fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("activity_types", &self.activity_types())
            .finish()
    }
}
