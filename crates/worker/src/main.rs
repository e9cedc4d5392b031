use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use durable_replay::engine::{ExecutorConfig, StartWorkflowOptions, WorkflowExecutor};
use durable_replay::persistence::{
    InMemoryWorkflowEventStore, PostgresWorkflowEventStore, WorkflowEventStore,
};
use durable_replay::worker::{WorkerPool, WorkerPoolConfig};
use durable_replay_worker::workflows::{self, BackgroundCheck};
use durable_replay_worker::{activities, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // RUST_LOG wins; otherwise LOG_LEVEL applies to this worker and the engine
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("durable_replay_worker={log_level},durable_replay={log_level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("durable-replay-worker starting...");

    let config = WorkerConfig::from_env();

    match config.database_url.clone() {
        Some(url) => {
            let store = PostgresWorkflowEventStore::connect(&url, config.max_db_connections)
                .await
                .context("Failed to connect to PostgreSQL")?;
            store.migrate().await.context("Failed to run migrations")?;
            tracing::info!("Using PostgreSQL event store");
            serve(store, config).await
        }
        None => {
            tracing::warn!("DATABASE_URL not set, histories are kept in memory only");
            serve(InMemoryWorkflowEventStore::new(), config).await
        }
    }
}

async fn serve<S: WorkflowEventStore>(store: S, config: WorkerConfig) -> Result<()> {
    let executor_config = ExecutorConfig::default()
        .with_namespace(config.namespace.clone())
        .with_default_task_queue(config.task_queue.clone());
    let mut executor = WorkflowExecutor::with_config(store, executor_config);
    workflows::register(&mut executor);
    let executor = Arc::new(executor);

    let recovered = executor
        .recover()
        .await
        .context("Failed to recover running workflows")?;
    tracing::info!(recovered, "Recovered running workflows");

    let pool_config = WorkerPoolConfig::new(config.task_queue.clone())
        .with_worker_id(config.worker_id.clone())
        .with_max_concurrent_tasks(config.max_concurrent_tasks)
        .with_poll_interval(config.poll_interval);

    tracing::info!(
        worker_id = %config.worker_id,
        task_queue = %config.task_queue,
        max_concurrent = config.max_concurrent_tasks,
        "Starting worker pool"
    );

    let pool = WorkerPool::new(Arc::clone(&executor), activities::registry(), pool_config);
    pool.start().context("Failed to start worker pool")?;

    if config.run_demo {
        let instance_id = executor
            .start_workflow::<BackgroundCheck>(
                &"555-55-5555".to_string(),
                StartWorkflowOptions::new().with_workflow_id("demo-background-check"),
            )
            .await
            .context("Failed to start demo workflow")?;
        tracing::info!(%instance_id, "Started demo background check");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    pool.shutdown().await.context("Failed to shut down worker pool")?;

    tracing::info!("Worker shutdown complete");
    Ok(())
}
