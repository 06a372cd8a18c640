// src/processors/container.rs - Roll-up of child entities
use super::{NodeSnapshot, ProcessContext, ProcessorCore};
use crate::data::{AlarmState, Status};
use crate::error::Result;

#[derive(Debug)]
pub struct ContainerProcessor {
    core: ProcessorCore,
    children: Vec<i32>,
    /// Status set on the container itself, before roll-up
    own_status: Status,
}

impl ContainerProcessor {
    pub fn new(core: ProcessorCore, children: Vec<i32>) -> Self {
        Self {
            core,
            children,
            own_status: Status::Enabled,
        }
    }

    pub fn core(&self) -> &ProcessorCore {
        &self.core
    }

    pub fn children(&self) -> &[i32] {
        &self.children
    }

    /// Alarm: worst alarm of the children that are not disabled.
    /// Status: worst of the container's own status and its children's.
    pub fn evaluate(&mut self, ctx: &mut ProcessContext<'_>) -> Result<()> {
        let mut alarm: Option<AlarmState> = None;
        let mut status = self.own_status;
        for child in &self.children {
            let entity = match ctx.graph.node(*child).and_then(|n| n.snapshot().entity) {
                Some(e) => e,
                None => continue,
            };
            status = status.max(entity.status);
            if entity.status != Status::Disabled {
                alarm = Some(alarm.map_or(entity.alarm_state, |a| a.worst(entity.alarm_state)));
            }
        }
        self.core
            .update(status, alarm.unwrap_or(AlarmState::Unknown), ctx);
        Ok(())
    }

    pub fn set_status(&mut self, status: Status, ctx: &mut ProcessContext<'_>) -> Result<()> {
        self.own_status = status;
        self.evaluate(ctx)
    }

    pub fn published(&self) -> NodeSnapshot {
        NodeSnapshot {
            entity: Some(self.core.entity().clone()),
            ..Default::default()
        }
    }
}
