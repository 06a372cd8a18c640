// src/operation.rs - Model operations carried by a processing batch
use crate::data::Status;
use crate::handler::ActivityInvocation;
use crate::input::{ActivityProgress, EventOccurrence, ParameterSample};

/// One unit of work addressed to a single processor
#[derive(Debug, Clone)]
pub enum Operation {
    ParameterSample(ParameterSample),
    EventOccurrence {
        occurrence: EventOccurrence,
        /// Raised from inside the model (parameter trigger) rather than
        /// injected by a producer
        internal: bool,
    },
    ActivityInvoke(ActivityInvocation),
    /// Occurrence started outside the model, registered without forwarding
    ActivityCreate {
        invocation: ActivityInvocation,
        progress: Option<ActivityProgress>,
    },
    ActivityProgress(ActivityProgress),
    /// Timer expiry for an occurrence; re-checks its timeout and verification
    ActivityTimeout {
        activity_id: i32,
        occurrence_id: u64,
    },
    ActivityPurge {
        activity_id: i32,
        occurrence_id: u64,
    },
    SetStatus {
        id: i32,
        status: Status,
    },
}

impl Operation {
    /// External id of the processor the operation is addressed to
    pub fn target(&self) -> i32 {
        match self {
            Operation::ParameterSample(s) => s.id,
            Operation::EventOccurrence { occurrence, .. } => occurrence.id,
            Operation::ActivityInvoke(inv) => inv.activity_id,
            Operation::ActivityCreate { invocation, .. } => invocation.activity_id,
            Operation::ActivityProgress(p) => p.activity_id,
            Operation::ActivityTimeout { activity_id, .. } => *activity_id,
            Operation::ActivityPurge { activity_id, .. } => *activity_id,
            Operation::SetStatus { id, .. } => *id,
        }
    }

    pub fn description(&self) -> String {
        match self {
            Operation::ParameterSample(s) => format!("parameter sample for {} ({})", s.id, s.value),
            Operation::EventOccurrence { occurrence, internal } => format!(
                "{} occurrence of event {}",
                if *internal { "internal" } else { "external" },
                occurrence.id
            ),
            Operation::ActivityInvoke(inv) => format!(
                "invocation {} of activity {} on route {}",
                inv.occurrence_id, inv.activity_id, inv.route
            ),
            Operation::ActivityCreate { invocation, .. } => format!(
                "creation of occurrence {} of activity {}",
                invocation.occurrence_id, invocation.activity_id
            ),
            Operation::ActivityProgress(p) => format!(
                "progress '{}' of occurrence {} of activity {}",
                p.name, p.occurrence_id, p.activity_id
            ),
            Operation::ActivityTimeout {
                activity_id,
                occurrence_id,
            } => format!("timeout check of occurrence {} of activity {}", occurrence_id, activity_id),
            Operation::ActivityPurge {
                activity_id,
                occurrence_id,
            } => format!("purge of occurrence {} of activity {}", occurrence_id, activity_id),
            Operation::SetStatus { id, status } => format!("status {:?} for entity {}", status, id),
        }
    }
}
