//! Activity abstractions
//!
//! Activities are units of work that are executed by workers. They:
//! - May fail and be retried according to the retry policy
//! - Can send heartbeats to indicate liveness
//! - Support cancellation via tokens

mod context;
mod definition;
mod registry;

pub use context::{ActivityContext, HeartbeatError};
pub use definition::{Activity, ActivityError};
pub use registry::{ActivityDescriptor, ActivityRegistry};
