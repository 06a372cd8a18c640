// src/scheduler/types.rs - Scheduling requests, triggers and snapshots
use crate::input::ActivityRequest;
use crate::path::EntityPath;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulingState {
    Scheduled,
    Waiting,
    Running,
    FinishedNominal,
    FinishedFail,
    Aborted,
    Ignored,
    Removed,
    Disabled,
}

impl SchedulingState {
    /// Final states; a task in one of them has left the schedule
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            SchedulingState::Scheduled | SchedulingState::Waiting | SchedulingState::Running
        )
    }

    /// Final states that satisfy a relative trigger waiting on the task
    pub fn is_completed(&self) -> bool {
        self.is_terminal()
    }
}

/// Policy when the resources of a firing task are held by another task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStrategy {
    Wait,
    DoNotStartAndForget,
    AbortOtherAndStart,
}

/// Policy when a new request overlaps an existing task at scheduling time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreationConflictStrategy {
    /// Reject the request
    Abort,
    /// Accept silently without scheduling it
    SkipNew,
    /// Remove the conflicting tasks, then schedule
    RemovePrevious,
    /// Schedule regardless of the conflict
    AddAnyway,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fires as soon as the task is scheduled
    Now,
    Absolute {
        time: DateTime<Utc>,
    },
    /// Fires once every predecessor (by external id) has completed
    Relative {
        predecessors: BTreeSet<String>,
        #[serde(default)]
        delay_secs: u64,
    },
    /// Standing trigger: fires on each occurrence of the event, at most
    /// once per protection window
    EventBased {
        event: EntityPath,
        #[serde(default)]
        protection_ms: u64,
        #[serde(default = "default_true")]
        enabled: bool,
    },
}

fn default_true() -> bool {
    true
}

impl Trigger {
    pub fn is_event_based(&self) -> bool {
        matches!(self, Trigger::EventBased { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingRequest {
    pub request: ActivityRequest,
    #[serde(default)]
    pub resources: BTreeSet<String>,
    pub source: String,
    pub external_id: String,
    pub trigger: Trigger,
    #[serde(default)]
    pub latest_invocation_time: Option<DateTime<Utc>>,
    pub conflict_strategy: ConflictStrategy,
    #[serde(default)]
    pub expected_duration_ms: u64,
}

impl SchedulingRequest {
    pub fn new(request: ActivityRequest, source: impl Into<String>, external_id: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            request,
            resources: BTreeSet::new(),
            source: source.into(),
            external_id: external_id.into(),
            trigger,
            latest_invocation_time: None,
            conflict_strategy: ConflictStrategy::Wait,
            expected_duration_ms: 0,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resources.insert(resource.into());
        self
    }

    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    pub fn with_expected_duration(mut self, duration: Duration) -> Self {
        self.expected_duration_ms = duration.num_milliseconds().max(0) as u64;
        self
    }

    pub fn with_latest_invocation_time(mut self, time: DateTime<Utc>) -> Self {
        self.latest_invocation_time = Some(time);
        self
    }

    pub fn expected_duration(&self) -> Duration {
        Duration::milliseconds(self.expected_duration_ms as i64)
    }
}

/// Snapshot of one scheduled task, emitted on every state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledActivityData {
    /// Task id, stable across the task's snapshots
    pub id: u64,
    /// Snapshot sequence
    pub sequence: u64,
    pub generation_time: DateTime<Utc>,
    pub request: ActivityRequest,
    pub activity_occurrence: Option<u64>,
    pub resources: BTreeSet<String>,
    pub source: String,
    pub external_id: String,
    pub trigger: Trigger,
    pub latest_invocation_time: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub conflict_strategy: ConflictStrategy,
    pub state: SchedulingState,
}

impl ScheduledActivityData {
    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time + Duration::milliseconds(self.duration_ms as i64)
    }

    /// True if `[start, end)` intersects the task window
    pub fn overlaps_with(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start_time < end && start < self.end_time()
    }
}
