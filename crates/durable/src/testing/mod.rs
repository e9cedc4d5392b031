//! Test support
//!
//! - [`TestEnvironment`] runs workflows in-process with a manual clock and
//!   skips time whenever every run is blocked
//! - [`HistoryBuilder`] assembles histories for [`Replayer`](crate::engine::Replayer)
//!   tests

mod environment;
mod history;

pub use environment::TestEnvironment;
pub use history::HistoryBuilder;
