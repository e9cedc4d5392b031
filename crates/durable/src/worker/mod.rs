//! Worker pool for activity execution
//!
//! This module provides:
//! - [`WorkerPool`] - Bounded-concurrency activity execution plus the
//!   periodic timer and activity-timeout sweeps
//! - [`TaskPoller`] - Task claiming with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                             │
//! │  ┌─────────────┐  ┌──────────────┐  ┌─────────────────────┐  │
//! │  │ TaskPoller  │  │ Timer sweep  │  │ Activity timeouts   │  │
//! │  │  (backoff)  │  │  (250ms)     │  │      (1s)           │  │
//! │  └──────┬──────┘  └──────┬───────┘  └──────────┬──────────┘  │
//! │         │                │                     │             │
//! │         ▼                ▼                     ▼             │
//! │  ┌───────────────────────────┐   ┌──────────────────────┐    │
//! │  │ Attempts (Semaphore)      │──▶│  WorkflowExecutor    │    │
//! │  │ heartbeats, deadlines     │   │  (report outcomes)   │    │
//! │  └───────────────────────────┘   └──────────────────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod poller;
mod pool;

pub use poller::{PollerConfig, PollerError, TaskPoller};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};

pub(crate) use pool::run_attempt;
