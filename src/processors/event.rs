// src/processors/event.rs - Occurrence and condition driven events
use super::{NodeSnapshot, ProcessContext, ProcessorCore};
use crate::data::{DataItem, EventData, Status};
use crate::definition::{EventDefinition, Expression};
use crate::error::Result;
use crate::input::EventOccurrence;
use crate::sequencer::DataKind;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct EventProcessor {
    core: ProcessorCore,
    definition: EventDefinition,
    state: Option<Arc<EventData>>,
    last_raised: Option<DateTime<Utc>>,
    /// Last value of the condition, for edge detection
    condition_state: bool,
}

impl EventProcessor {
    pub fn new(core: ProcessorCore, definition: EventDefinition) -> Self {
        Self {
            core,
            definition,
            state: None,
            last_raised: None,
            condition_state: false,
        }
    }

    pub fn core(&self) -> &ProcessorCore {
        &self.core
    }

    pub fn is_condition_driven(&self) -> bool {
        self.definition.condition.is_some()
    }

    pub fn process(
        &mut self,
        occurrence: &EventOccurrence,
        internal: bool,
        ctx: &mut ProcessContext<'_>,
    ) -> Result<()> {
        if self.core.status() == Status::Disabled {
            debug!("Event {} disabled, occurrence dropped", self.core.path);
            return Ok(());
        }
        if self.is_condition_driven() && !internal {
            debug!(
                "Event {} is condition driven, external occurrence dropped",
                self.core.path
            );
            return Ok(());
        }
        self.raise(occurrence, ctx);
        Ok(())
    }

    pub fn evaluate(&mut self, ctx: &mut ProcessContext<'_>) -> Result<()> {
        if self.core.status() == Status::Disabled {
            debug!("Event {} disabled, evaluation skipped", self.core.path);
            return Ok(());
        }
        let condition = match &self.definition.condition {
            Some(c) => c,
            None => return Ok(()),
        };
        let result = match condition.evaluate_bool(ctx.graph) {
            Ok(r) => r,
            Err(e) => {
                warn!("Condition of event {} cannot be evaluated: {}", self.core.path, e);
                return Ok(());
            }
        };
        if result && !self.condition_state {
            let occurrence = EventOccurrence::new(self.core.id).at(ctx.now);
            // An inhibited edge is not consumed: the next evaluation that
            // still finds the condition true raises again.
            self.condition_state = self.raise(&occurrence, ctx);
        } else {
            self.condition_state = result;
        }
        Ok(())
    }

    pub fn set_status(&mut self, status: Status, ctx: &mut ProcessContext<'_>) -> Result<()> {
        let alarm = self.core.alarm_state();
        self.core.update(status, alarm, ctx);
        Ok(())
    }

    pub fn published(&self) -> NodeSnapshot {
        NodeSnapshot {
            entity: Some(self.core.entity().clone()),
            event: self.state.clone(),
            ..Default::default()
        }
    }

    /// Raise one occurrence unless inhibited; returns true if raised
    fn raise(&mut self, occurrence: &EventOccurrence, ctx: &mut ProcessContext<'_>) -> bool {
        let generation_time = occurrence.generation_time.unwrap_or(ctx.now);
        let inhibition = Duration::milliseconds(self.definition.inhibition_period_ms as i64);
        if let Some(last) = self.last_raised {
            if self.definition.inhibition_period_ms > 0 && generation_time - last < inhibition {
                debug!(
                    "Event {} inhibited: {} ms since last occurrence, period {} ms",
                    self.core.path,
                    (generation_time - last).num_milliseconds(),
                    self.definition.inhibition_period_ms
                );
                return false;
            }
        }

        let data = Arc::new(EventData {
            internal_id: ctx.sequencer.next(DataKind::Event),
            external_id: self.core.id,
            path: self.core.path.clone(),
            generation_time,
            reception_time: occurrence.reception_time.unwrap_or(ctx.now),
            qualifier: occurrence.qualifier.clone(),
            event_type: self.definition.event_type.clone(),
            severity: self.definition.severity,
            route: occurrence.route.clone(),
            source: occurrence.source.clone(),
            report: occurrence.report.clone(),
            raw_data_container_id: occurrence.container_id,
        });
        info!(
            "Event {} raised (severity {:?}, qualifier {:?})",
            self.core.path, data.severity, data.qualifier
        );
        self.last_raised = Some(generation_time);
        self.state = Some(data.clone());
        ctx.emit(DataItem::Event(data));
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::data::DataItem;
    use crate::input::{EventOccurrence, ParameterSample};
    use crate::operation::Operation;
    use crate::task::tests::{environment, run, t0};
    use crate::task::TaskOutcome;
    use chrono::Duration;

    const DEFINITION: &str = r#"
parameters:
  - id: 1
    path: SAT.TCS.TEMP
events:
  - id: 100
    path: SAT.TCS.OVERHEAT
    condition:
      op: compare
      cmp: gt
      left: { op: ref, path: SAT.TCS.TEMP }
      right: { op: const, value: 5 }
  - id: 101
    path: SAT.TCS.HEATER_ON
    inhibition_period_ms: 1000
"#;

    fn raised(outcome: &TaskOutcome, id: i32) -> usize {
        outcome
            .effects
            .items
            .iter()
            .filter_map(DataItem::as_event)
            .filter(|e| e.external_id == id)
            .count()
    }

    #[test]
    fn test_condition_raises_on_rising_edge_only() {
        let (env, clock) = environment(DEFINITION);
        let mut pattern = Vec::new();
        for (i, value) in [1.0, 6.0, 7.0, 2.0, 8.0].into_iter().enumerate() {
            let time = t0() + Duration::seconds(i as i64);
            clock.set(time);
            let outcome = run(
                &env,
                vec![Operation::ParameterSample(ParameterSample::new(1, value, time))],
            );
            pattern.push(raised(&outcome, 100));
        }
        assert_eq!(pattern, vec![0, 1, 0, 0, 1]);
    }

    #[test]
    fn test_condition_driven_event_ignores_external_occurrences() {
        let (env, _) = environment(DEFINITION);
        let outcome = run(
            &env,
            vec![Operation::EventOccurrence {
                occurrence: EventOccurrence::new(100).at(t0()),
                internal: false,
            }],
        );
        assert!(outcome.failures.is_empty());
        assert_eq!(raised(&outcome, 100), 0);

        let outcome = run(
            &env,
            vec![Operation::EventOccurrence {
                occurrence: EventOccurrence::new(100).at(t0()),
                internal: true,
            }],
        );
        assert_eq!(raised(&outcome, 100), 1);
    }

    #[test]
    fn test_inhibition_period_drops_close_occurrences() {
        let (env, _) = environment(DEFINITION);
        let occurrence = |ms: i64| Operation::EventOccurrence {
            occurrence: EventOccurrence::new(101).at(t0() + Duration::milliseconds(ms)),
            internal: false,
        };
        let outcome = run(&env, vec![occurrence(0), occurrence(400), occurrence(1000)]);
        let times: Vec<_> = outcome
            .effects
            .items
            .iter()
            .filter_map(DataItem::as_event)
            .map(|e| e.generation_time)
            .collect();
        assert_eq!(times, vec![t0(), t0() + Duration::seconds(1)]);
    }
}
