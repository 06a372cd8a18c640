// src/processors/parameter.rs - Validity, calibration and checks of one parameter
use super::{NodeSnapshot, ProcessContext, ProcessorCore};
use crate::data::{AlarmParameterData, AlarmState, DataItem, ParameterData, Status, Validity};
use crate::definition::{
    calibrate, CheckState, Expression, ParameterDefinition, TriggerCondition,
};
use crate::error::Result;
use crate::input::{EventOccurrence, ParameterSample};
use crate::operation::Operation;
use crate::sequencer::DataKind;
use crate::value::Value;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Origin of the raw value of one processing cycle
struct RawInput {
    value: Option<Value>,
    generation_time: DateTime<Utc>,
    reception_time: DateTime<Utc>,
    route: Option<String>,
    container_id: Option<u64>,
    new_sample: bool,
}

#[derive(Debug)]
pub struct ParameterProcessor {
    core: ProcessorCore,
    definition: ParameterDefinition,
    checks: Vec<CheckState>,
    state: Option<Arc<ParameterData>>,
    last_alarm: Option<Arc<AlarmParameterData>>,
    last_nominal: Option<(Value, DateTime<Utc>)>,
}

impl ParameterProcessor {
    pub fn new(core: ProcessorCore, definition: ParameterDefinition) -> Self {
        let checks = definition.checks.iter().map(|_| CheckState::default()).collect();
        Self {
            core,
            definition,
            checks,
            state: None,
            last_alarm: None,
            last_nominal: None,
        }
    }

    pub fn core(&self) -> &ProcessorCore {
        &self.core
    }

    pub fn definition(&self) -> &ParameterDefinition {
        &self.definition
    }

    pub fn state(&self) -> Option<&Arc<ParameterData>> {
        self.state.as_ref()
    }

    pub fn process(&mut self, sample: &ParameterSample, ctx: &mut ProcessContext<'_>) -> Result<()> {
        if self.definition.is_synthetic() {
            warn!(
                "Sample for synthetic parameter {} rejected, value is computed",
                self.core.path
            );
            return Ok(());
        }
        if self.core.status() == Status::Disabled {
            debug!("Parameter {} disabled, sample dropped", self.core.path);
            return Ok(());
        }
        if let Some(previous) = &self.state {
            if sample.generation_time < previous.generation_time {
                warn!(
                    "Sample for {} generated at {} is older than current value ({}), discarded",
                    self.core.path, sample.generation_time, previous.generation_time
                );
                return Ok(());
            }
        }
        self.compute(
            RawInput {
                value: Some(sample.value.clone()),
                generation_time: sample.generation_time,
                reception_time: sample.reception_time,
                route: sample.route.clone(),
                container_id: sample.container_id,
                new_sample: true,
            },
            ctx,
        );
        Ok(())
    }

    pub fn evaluate(&mut self, ctx: &mut ProcessContext<'_>) -> Result<()> {
        if self.core.status() == Status::Disabled {
            return Ok(());
        }
        let input = if let Some(expression) = &self.definition.expression {
            let value = match expression.evaluate(ctx.graph) {
                Ok(v) => Some(v),
                Err(e) => {
                    debug!("Expression of synthetic parameter {} failed: {}", self.core.path, e);
                    None
                }
            };
            RawInput {
                value,
                generation_time: ctx.now,
                reception_time: ctx.now,
                route: None,
                container_id: None,
                new_sample: false,
            }
        } else {
            match &self.state {
                // Nothing to re-evaluate before the first sample
                None => return Ok(()),
                Some(prev) => RawInput {
                    value: prev.source_value.clone(),
                    generation_time: prev.generation_time,
                    reception_time: prev.reception_time,
                    route: prev.route.clone(),
                    container_id: prev.raw_data_container_id,
                    new_sample: false,
                },
            }
        };
        self.compute(input, ctx);
        Ok(())
    }

    pub fn set_status(&mut self, status: Status, ctx: &mut ProcessContext<'_>) -> Result<()> {
        let previous = self.core.status();
        if previous == status {
            return Ok(());
        }
        let alarm = self.core.alarm_state();
        self.core.update(status, alarm, ctx);
        match status {
            Status::Disabled => {
                // Keep the values, flag them as not maintained any more
                if let Some(prev) = &self.state {
                    let mut data = (**prev).clone();
                    data.internal_id = ctx.sequencer.next(DataKind::Parameter);
                    data.validity = Validity::Disabled;
                    let data = Arc::new(data);
                    self.state = Some(data.clone());
                    ctx.emit(DataItem::Parameter(data));
                }
                Ok(())
            }
            _ => self.evaluate(ctx),
        }
    }

    pub fn published(&self) -> NodeSnapshot {
        NodeSnapshot {
            entity: Some(self.core.entity().clone()),
            parameter: self.state.clone(),
            alarm: self.last_alarm.clone(),
            ..Default::default()
        }
    }

    fn compute(&mut self, input: RawInput, ctx: &mut ProcessContext<'_>) {
        let path = self.core.path.clone();

        let mut validity = match &self.definition.validity {
            None => Validity::Valid,
            Some(expr) => match expr.evaluate_bool(ctx.graph) {
                Ok(true) => Validity::Valid,
                Ok(false) => Validity::Invalid,
                Err(e) => {
                    debug!("Validity of {} cannot be evaluated: {}", path, e);
                    Validity::Error
                }
            },
        };

        let source_value = match input.value.as_ref().map(|v| v.convert(self.definition.raw_type)) {
            Some(Ok(v)) => Some(v),
            Some(Err(e)) => {
                warn!("Raw value of {} has wrong type: {}", path, e);
                validity = Validity::Invalid;
                input.value.clone()
            }
            None => {
                if validity == Validity::Valid {
                    validity = Validity::Unknown;
                }
                None
            }
        };

        let mut eng_value = None;
        let mut alarm_state = AlarmState::NotChecked;
        if validity == Validity::Valid {
            if let Some(raw) = &source_value {
                let calibrated = calibrate(&self.definition.calibrations, raw, ctx.graph)
                    .and_then(|v| v.convert(self.definition.eng_type));
                match calibrated {
                    Ok(eng) => {
                        alarm_state = self.run_checks(raw, &eng, input.generation_time, input.new_sample, ctx);
                        eng_value = Some(eng);
                    }
                    Err(e) => {
                        warn!("Calibration of {} failed: {}", path, e);
                        validity = Validity::Invalid;
                        alarm_state = AlarmState::Unknown;
                    }
                }
            }
        }
        if self.core.status() == Status::Ignored {
            alarm_state = AlarmState::Ignored;
        }

        let previous = self.state.clone();
        let changed = match &previous {
            None => true,
            Some(p) => {
                p.source_value != source_value
                    || p.eng_value != eng_value
                    || p.validity != validity
                    || p.alarm_state != alarm_state
            }
        };
        if !input.new_sample && !changed {
            trace!("Re-evaluation of {} produced no change", path);
            return;
        }

        let data = Arc::new(ParameterData {
            internal_id: ctx.sequencer.next(DataKind::Parameter),
            external_id: self.core.id,
            path: path.clone(),
            generation_time: input.generation_time,
            reception_time: input.reception_time,
            source_value,
            eng_value: eng_value.clone(),
            validity,
            alarm_state,
            route: input.route,
            raw_data_container_id: input.container_id,
        });
        self.state = Some(data.clone());
        ctx.emit(DataItem::Parameter(data.clone()));

        let previous_alarm = previous
            .as_ref()
            .map(|p| p.alarm_state)
            .unwrap_or(AlarmState::Unknown);
        if previous_alarm != alarm_state && (previous_alarm.is_alarm() || alarm_state.is_alarm()) {
            let alarm = Arc::new(AlarmParameterData {
                internal_id: ctx.sequencer.next(DataKind::Alarm),
                external_id: self.core.id,
                path: path.clone(),
                generation_time: data.generation_time,
                reception_time: data.reception_time,
                current_alarm_state: alarm_state,
                previous_alarm_state: previous_alarm,
                current_value: eng_value.clone(),
                last_nominal_value: self.last_nominal.as_ref().map(|(v, _)| v.clone()),
                last_nominal_value_time: self.last_nominal.as_ref().map(|(_, t)| *t),
            });
            self.last_alarm = Some(alarm.clone());
            ctx.emit(DataItem::Alarm(alarm));
        }
        if alarm_state.is_nominal() {
            if let Some(v) = &eng_value {
                self.last_nominal = Some((v.clone(), data.generation_time));
            }
        }

        let status = self.core.status();
        self.core.update(status, alarm_state, ctx);
        self.fire_triggers(previous.as_deref(), &data, input.new_sample, ctx);
    }

    fn run_checks(
        &mut self,
        raw: &Value,
        eng: &Value,
        generation_time: DateTime<Utc>,
        new_sample: bool,
        ctx: &ProcessContext<'_>,
    ) -> AlarmState {
        if self.definition.checks.is_empty() {
            return AlarmState::NotChecked;
        }
        let mut worst = AlarmState::Nominal;
        for (def, state) in self.definition.checks.iter().zip(self.checks.iter_mut()) {
            let value = if def.raw_value_checked { raw } else { eng };
            let result = state.evaluate(def, value, generation_time, new_sample, ctx.graph);
            trace!("Check {} of {}: {:?}", def.name, self.core.path, result);
            worst = worst.worst(result);
        }
        worst
    }

    fn fire_triggers(
        &self,
        previous: Option<&ParameterData>,
        current: &ParameterData,
        new_sample: bool,
        ctx: &mut ProcessContext<'_>,
    ) {
        let previous_alarm = previous.map(|p| p.alarm_state).unwrap_or(AlarmState::Unknown);
        for trigger in &self.definition.triggers {
            let fire = match trigger.condition {
                TriggerCondition::OnNewSample => new_sample,
                TriggerCondition::OnAlarmRaised => {
                    current.alarm_state.is_alarm() && current.alarm_state != previous_alarm
                }
                TriggerCondition::OnBackToNominal => {
                    previous_alarm.is_alarm() && current.alarm_state.is_nominal()
                }
                TriggerCondition::OnValueChange => {
                    previous.map_or(false, |p| p.eng_value != current.eng_value)
                }
            };
            if fire {
                debug!(
                    "Parameter {} raises event {} on {:?}",
                    current.path, trigger.event, trigger.condition
                );
                let mut occurrence = EventOccurrence::new(trigger.event)
                    .with_source(current.path.as_str())
                    .with_qualifier(format!("{:?}", trigger.condition));
                occurrence.generation_time = Some(current.generation_time);
                occurrence.reception_time = Some(ctx.now);
                occurrence.report = current.eng_value.clone();
                occurrence.route = current.route.clone();
                ctx.effects.follow_ups.push(Operation::EventOccurrence {
                    occurrence,
                    internal: true,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::tests::{environment, run, sample, t0};
    use crate::task::TaskOutcome;
    use chrono::Duration;

    const DEFINITION: &str = r#"
parameters:
  - id: 1
    path: SAT.AOCS.MODE
    raw_type: int
    eng_type: string
    calibrations:
      - type: enum
        points: [{ raw: 1, value: SAFE }, { raw: 2, value: NOMINAL }]
  - id: 2
    path: SAT.AOCS.RATE
"#;

    fn only_parameter(outcome: &TaskOutcome, id: i32) -> Arc<ParameterData> {
        let mut found = outcome
            .effects
            .items
            .iter()
            .filter_map(DataItem::as_parameter)
            .filter(|p| p.external_id == id);
        let data = found.next().cloned().unwrap();
        assert!(found.next().is_none());
        data
    }

    #[test]
    fn test_whole_float_converts_to_int_raw_type() {
        let (env, _) = environment(DEFINITION);
        let mode = only_parameter(&run(&env, vec![sample(1, 2.0)]), 1);
        assert_eq!(mode.source_value, Some(Value::Int(2)));
        assert_eq!(mode.eng_value, Some(Value::String("NOMINAL".into())));
        assert_eq!(mode.validity, Validity::Valid);
    }

    #[test]
    fn test_fractional_sample_for_int_parameter_is_invalid() {
        let (env, _) = environment(DEFINITION);
        let outcome = run(&env, vec![sample(1, 1.7), sample(2, 0.5)]);
        assert!(outcome.failures.is_empty());

        let mode = only_parameter(&outcome, 1);
        assert_eq!(mode.validity, Validity::Invalid);
        assert_eq!(mode.source_value, Some(Value::Float(1.7)));
        assert_eq!(mode.eng_value, None);

        let rate = only_parameter(&outcome, 2);
        assert_eq!(rate.validity, Validity::Valid);
        assert_eq!(rate.eng_value, Some(Value::Float(0.5)));
    }

    #[test]
    fn test_calibration_failure_marks_sample_invalid() {
        let (env, _) = environment(DEFINITION);
        let mode = only_parameter(&run(&env, vec![sample(1, 7i64)]), 1);
        assert_eq!(mode.validity, Validity::Invalid);
        assert_eq!(mode.alarm_state, AlarmState::Unknown);
        assert_eq!(mode.eng_value, None);
        assert_eq!(mode.source_value, Some(Value::Int(7)));
    }

    #[test]
    fn test_older_sample_discarded() {
        let (env, _) = environment(DEFINITION);
        let later = t0() + Duration::seconds(10);
        run(
            &env,
            vec![Operation::ParameterSample(ParameterSample::new(2, 1.0, later))],
        );
        let outcome = run(&env, vec![sample(2, 2.0)]);
        assert!(outcome.effects.items.is_empty());
        let current = env.graph.node(2).and_then(|n| n.snapshot().parameter).unwrap();
        assert_eq!(current.eng_value, Some(Value::Float(1.0)));
        assert_eq!(current.generation_time, later);
    }
}
