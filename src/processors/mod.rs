// src/processors/mod.rs - System-entity processors
//
// One processor per graph node. A processor owns the mutable state of its
// entity; everything it produces leaves as an immutable snapshot, either in
// the batch output or in the node's published snapshot read by bindings.

use crate::data::{
    ActivityOccurrenceData, AlarmParameterData, AlarmState, DataItem, EntityType, EventData,
    ParameterData, Status, SystemEntity,
};
use crate::error::{ProcessingError, Result};
use crate::graph::GraphModel;
use crate::handler::HandlerRegistry;
use crate::operation::Operation;
use crate::path::EntityPath;
use crate::sequencer::{DataKind, Sequencer};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod activity;
pub mod container;
pub mod event;
pub mod parameter;

pub use activity::ActivityProcessor;
pub use container::ContainerProcessor;
pub use event::EventProcessor;
pub use parameter::ParameterProcessor;

// ============================================================================
// PROCESSING CONTEXT
// ============================================================================

/// Identifies the timeout timer of one activity occurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutToken {
    pub activity_id: i32,
    pub occurrence_id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimerCommand {
    Arm {
        deadline: DateTime<Utc>,
        token: TimeoutToken,
    },
    Cancel(TimeoutToken),
}

/// Everything a batch produces besides processor state
#[derive(Debug, Default)]
pub struct Effects {
    /// Snapshots in production order
    pub items: Vec<DataItem>,
    /// Operations to run in a later batch (trigger-raised events)
    pub follow_ups: Vec<Operation>,
    pub timers: Vec<TimerCommand>,
}

/// Environment handed to processors while a batch executes
pub struct ProcessContext<'a> {
    pub graph: &'a GraphModel,
    pub sequencer: &'a Sequencer,
    pub handlers: &'a HandlerRegistry,
    /// Processing time of the batch
    pub now: DateTime<Utc>,
    pub effects: Effects,
}

impl<'a> ProcessContext<'a> {
    pub fn new(
        graph: &'a GraphModel,
        sequencer: &'a Sequencer,
        handlers: &'a HandlerRegistry,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            graph,
            sequencer,
            handlers,
            now,
            effects: Effects::default(),
        }
    }

    pub fn emit(&mut self, item: DataItem) {
        self.effects.items.push(item);
    }
}

// ============================================================================
// SHARED STATE
// ============================================================================

/// Snapshots of one node visible to bindings and queries
#[derive(Debug, Clone, Default)]
pub struct NodeSnapshot {
    pub entity: Option<Arc<SystemEntity>>,
    pub parameter: Option<Arc<ParameterData>>,
    pub alarm: Option<Arc<AlarmParameterData>>,
    pub event: Option<Arc<EventData>>,
    /// Active (not completed) occurrences of an activity
    pub occurrences: BTreeMap<u64, Arc<ActivityOccurrenceData>>,
}

/// Identity, status and roll-up alarm common to every processor
#[derive(Debug, Clone)]
pub struct ProcessorCore {
    pub id: i32,
    pub path: EntityPath,
    pub entity_type: EntityType,
    status: Status,
    alarm_state: AlarmState,
    entity: Arc<SystemEntity>,
}

impl ProcessorCore {
    pub fn new(
        id: i32,
        path: EntityPath,
        entity_type: EntityType,
        alarm_state: AlarmState,
        sequencer: &Sequencer,
        now: DateTime<Utc>,
    ) -> Self {
        let entity = Arc::new(SystemEntity {
            internal_id: sequencer.next(DataKind::SystemEntity),
            external_id: id,
            path: path.clone(),
            entity_type,
            status: Status::Enabled,
            alarm_state,
            generation_time: now,
        });
        Self {
            id,
            path,
            entity_type,
            status: Status::Enabled,
            alarm_state,
            entity,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn alarm_state(&self) -> AlarmState {
        self.alarm_state
    }

    pub fn entity(&self) -> &Arc<SystemEntity> {
        &self.entity
    }

    /// Install a new entity snapshot if status or alarm changed
    pub fn update(&mut self, status: Status, alarm_state: AlarmState, ctx: &mut ProcessContext<'_>) -> bool {
        if status == self.status && alarm_state == self.alarm_state {
            return false;
        }
        self.status = status;
        self.alarm_state = alarm_state;
        self.entity = Arc::new(SystemEntity {
            internal_id: ctx.sequencer.next(DataKind::SystemEntity),
            external_id: self.id,
            path: self.path.clone(),
            entity_type: self.entity_type,
            status,
            alarm_state,
            generation_time: ctx.now,
        });
        ctx.emit(DataItem::SystemEntity(self.entity.clone()));
        true
    }
}

// ============================================================================
// PROCESSOR
// ============================================================================

/// Closed set of processor kinds
#[derive(Debug)]
pub enum Processor {
    Parameter(ParameterProcessor),
    Event(EventProcessor),
    Activity(ActivityProcessor),
    Container(ContainerProcessor),
}

impl Processor {
    pub fn core(&self) -> &ProcessorCore {
        match self {
            Processor::Parameter(p) => p.core(),
            Processor::Event(p) => p.core(),
            Processor::Activity(p) => p.core(),
            Processor::Container(p) => p.core(),
        }
    }

    /// Apply new external data addressed to this entity
    pub fn process(&mut self, op: &Operation, ctx: &mut ProcessContext<'_>) -> Result<()> {
        if let Operation::SetStatus { status, .. } = op {
            return self.set_status(*status, ctx);
        }
        match (self, op) {
            (Processor::Parameter(p), Operation::ParameterSample(sample)) => p.process(sample, ctx),
            (Processor::Event(p), Operation::EventOccurrence { occurrence, internal }) => {
                p.process(occurrence, *internal, ctx)
            }
            (Processor::Activity(p), op) => p.process(op, ctx),
            (processor, op) => Err(ProcessingError::Config(format!(
                "Operation '{}' cannot be applied to {:?} {}",
                op.description(),
                processor.core().entity_type,
                processor.core().path
            ))),
        }
    }

    /// Re-evaluate after a dependency changed
    pub fn evaluate(&mut self, ctx: &mut ProcessContext<'_>) -> Result<()> {
        match self {
            Processor::Parameter(p) => p.evaluate(ctx),
            Processor::Event(p) => p.evaluate(ctx),
            Processor::Activity(p) => p.evaluate(ctx),
            Processor::Container(p) => p.evaluate(ctx),
        }
    }

    fn set_status(&mut self, status: Status, ctx: &mut ProcessContext<'_>) -> Result<()> {
        match self {
            Processor::Parameter(p) => p.set_status(status, ctx),
            Processor::Event(p) => p.set_status(status, ctx),
            Processor::Activity(p) => p.set_status(status, ctx),
            Processor::Container(p) => p.set_status(status, ctx),
        }
    }

    pub fn published(&self) -> NodeSnapshot {
        match self {
            Processor::Parameter(p) => p.published(),
            Processor::Event(p) => p.published(),
            Processor::Activity(p) => p.published(),
            Processor::Container(p) => p.published(),
        }
    }
}
