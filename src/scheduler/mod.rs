// src/scheduler/mod.rs - Activity scheduler
//
// `types` holds the requests and snapshots, `core` the synchronous task state
// machine and `service` the actor that drives it from a clock and model
// updates.

mod core;
mod service;
mod types;

pub use self::core::{SchedulerAction, SchedulerCore};
pub use service::SchedulerService;
pub use types::{
    ConflictStrategy, CreationConflictStrategy, ScheduledActivityData, SchedulingRequest, SchedulingState, Trigger,
};

use crate::error::Result;
use crate::input::ActivityRequest;
use async_trait::async_trait;

/// Activity layer used by the scheduler to start and abort what it runs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActivityExecutor: Send + Sync {
    /// Start an occurrence and return its id
    async fn start_activity(&self, request: ActivityRequest) -> Result<u64>;

    async fn abort_activity(&self, activity_id: i32, occurrence_id: u64) -> Result<()>;
}
