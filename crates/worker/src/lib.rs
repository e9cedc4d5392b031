//! Durable Replay Worker
//!
//! Hosts the background-check workflows and their activities on a
//! [`durable_replay::WorkerPool`], backed by PostgreSQL when `DATABASE_URL`
//! is set and by the in-memory store otherwise.

pub mod activities;
pub mod config;
pub mod workflows;

pub use config::WorkerConfig;
