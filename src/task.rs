// src/task.rs - One prepared processing batch
use crate::clock::Clock;
use crate::error::{ProcessingError, Result};
use crate::graph::GraphModel;
use crate::handler::HandlerRegistry;
use crate::operation::Operation;
use crate::processors::{Effects, ProcessContext};
use crate::sequencer::Sequencer;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{error, trace};

/// Shared state every batch executes against
pub struct ProcessingEnvironment {
    pub graph: Arc<GraphModel>,
    pub sequencer: Arc<Sequencer>,
    pub handlers: Arc<HandlerRegistry>,
    pub clock: Arc<dyn Clock>,
}

/// Result of one batch
#[derive(Debug, Default)]
pub struct TaskOutcome {
    pub effects: Effects,
    /// Description and error of every operation or evaluation that failed
    pub failures: Vec<(String, ProcessingError)>,
    pub operations: usize,
}

/// Operations expanded into the ordered set of entities they affect
#[derive(Debug)]
pub struct ProcessingTask {
    operations: Vec<Operation>,
    order: Vec<i32>,
    ids: BTreeSet<i32>,
}

impl ProcessingTask {
    /// Expand `operations` through the dependency closure of their targets
    pub fn prepare(graph: &GraphModel, operations: Vec<Operation>) -> Result<Self> {
        let order = graph.closure(operations.iter().map(|op| op.target()))?;
        let ids = order.iter().copied().collect();
        Ok(Self {
            operations,
            order,
            ids,
        })
    }

    /// Ids written by the batch, to be held in the working set
    pub fn ids(&self) -> &BTreeSet<i32> {
        &self.ids
    }

    pub fn order(&self) -> &[i32] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Run the batch in topological order.
    ///
    /// Entities targeted by operations process them in submission order,
    /// the rest of the closure is re-evaluated. A failure is logged and the
    /// batch continues with the next operation.
    pub fn execute(&self, env: &ProcessingEnvironment) -> TaskOutcome {
        let mut ctx = ProcessContext::new(&env.graph, &env.sequencer, &env.handlers, env.clock.now());
        let mut failures = Vec::new();

        let mut by_target: HashMap<i32, Vec<&Operation>> = HashMap::new();
        for op in &self.operations {
            by_target.entry(op.target()).or_default().push(op);
        }

        for id in &self.order {
            let node = match env.graph.node(*id) {
                Some(n) => n,
                None => continue,
            };
            let mut processor = node.processor();
            match by_target.get(id) {
                Some(ops) => {
                    for op in ops {
                        trace!("Executing {}", op.description());
                        if let Err(e) = processor.process(op, &mut ctx) {
                            error!("Operation {} failed: {}", op.description(), e);
                            failures.push((op.description(), e));
                        }
                    }
                }
                None => {
                    if let Err(e) = processor.evaluate(&mut ctx) {
                        error!("Re-evaluation of {} failed: {}", node.path, e);
                        failures.push((format!("re-evaluation of {}", node.path), e));
                    }
                }
            }
            node.publish(processor.published());
        }

        TaskOutcome {
            effects: ctx.effects,
            failures,
            operations: self.operations.len(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::data::{AlarmState, DataItem, ParameterData, Status, Validity};
    use crate::definition::ProcessingDefinition;
    use crate::input::ParameterSample;
    use crate::path::EntityPath;
    use crate::value::Value;
    use chrono::{DateTime, TimeZone, Utc};

    pub(crate) fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
    }

    /// Environment over `yaml` with a manual clock set to [`t0`] and no
    /// activity handler
    pub(crate) fn environment(yaml: &str) -> (ProcessingEnvironment, Arc<ManualClock>) {
        let definition = ProcessingDefinition::from_yaml(yaml).unwrap();
        let sequencer = Arc::new(Sequencer::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let graph = GraphModel::build(&definition, &sequencer, t0()).unwrap();
        let env = ProcessingEnvironment {
            graph: Arc::new(graph),
            sequencer,
            handlers: Arc::new(HandlerRegistry::new()),
            clock: clock.clone(),
        };
        (env, clock)
    }

    pub(crate) fn run(env: &ProcessingEnvironment, operations: Vec<Operation>) -> TaskOutcome {
        ProcessingTask::prepare(&env.graph, operations).unwrap().execute(env)
    }

    pub(crate) fn sample(id: i32, value: impl Into<Value>) -> Operation {
        Operation::ParameterSample(ParameterSample::new(id, value, t0()))
    }

    fn parameters_of(outcome: &TaskOutcome, id: i32) -> Vec<Arc<ParameterData>> {
        outcome
            .effects
            .items
            .iter()
            .filter_map(DataItem::as_parameter)
            .filter(|p| p.external_id == id)
            .cloned()
            .collect()
    }

    const EPS: &str = r#"
parameters:
  - id: 1
    path: SAT.EPS.BAT.VOLTAGE
    checks:
      - { name: RANGE, type: limit, low: 24.0, high: 32.0 }
  - id: 2
    path: SAT.EPS.BAT.CURRENT
    checks:
      - { name: RANGE, type: limit, low: 0.0, high: 5.0 }
  - id: 3
    path: SAT.EPS.POWER
    expression:
      op: mul
      left: { op: ref, path: SAT.EPS.BAT.VOLTAGE }
      right: { op: ref, path: SAT.EPS.BAT.CURRENT }
events:
  - id: 100
    path: SAT.OBC.RESET
"#;

    #[test]
    fn test_failed_operation_does_not_stop_the_batch() {
        let (env, _) = environment(EPS);
        // A parameter sample cannot be applied to an event
        let outcome = run(&env, vec![sample(1, 28.0), sample(100, 1.0), sample(2, 2.0)]);

        assert_eq!(outcome.operations, 3);
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].0.contains("100"));
        assert!(matches!(outcome.failures[0].1, ProcessingError::Config(_)));

        assert_eq!(parameters_of(&outcome, 1)[0].eng_value, Some(Value::Float(28.0)));
        assert_eq!(parameters_of(&outcome, 2)[0].eng_value, Some(Value::Float(2.0)));
        // Dependents of the surviving operations are still evaluated
        assert_eq!(parameters_of(&outcome, 3)[0].eng_value, Some(Value::Float(56.0)));
    }

    #[test]
    fn test_synthetic_parameter_follows_its_dependencies() {
        let (env, _) = environment(EPS);
        run(&env, vec![sample(1, 28.0), sample(2, 2.0)]);

        let outcome = run(&env, vec![sample(2, 3.0)]);
        let power = parameters_of(&outcome, 3);
        assert_eq!(power.len(), 1);
        assert_eq!(power[0].eng_value, Some(Value::Float(84.0)));
        assert_eq!(power[0].validity, Validity::Valid);

        // Injected values are refused, the computed one stays
        let outcome = run(&env, vec![sample(3, 1000.0)]);
        assert!(outcome.failures.is_empty());
        assert!(parameters_of(&outcome, 3).is_empty());
        let current = env.graph.node(3).and_then(|n| n.snapshot().parameter).unwrap();
        assert_eq!(current.eng_value, Some(Value::Float(84.0)));
    }

    #[test]
    fn test_container_rolls_up_worst_child() {
        let (env, _) = environment(EPS);
        let battery = env.graph.node_by_path(&EntityPath::new("SAT.EPS.BAT")).unwrap();
        let rolled_up = || battery.snapshot().entity.unwrap();

        run(&env, vec![sample(1, 28.0), sample(2, 2.0)]);
        assert_eq!(rolled_up().alarm_state, AlarmState::Nominal);

        let outcome = run(&env, vec![sample(1, 20.0)]);
        let voltage = parameters_of(&outcome, 1)[0].alarm_state;
        assert!(voltage.is_alarm());
        assert_eq!(rolled_up().alarm_state, voltage);
        assert_eq!(rolled_up().status, Status::Enabled);
        // The roll-up reaches the root container too
        let root = env.graph.root().unwrap().snapshot().entity.unwrap();
        assert_eq!(root.alarm_state, voltage);

        // Disabled children no longer count for the alarm, but do for status
        run(
            &env,
            vec![Operation::SetStatus {
                id: 1,
                status: Status::Disabled,
            }],
        );
        assert_eq!(rolled_up().alarm_state, AlarmState::Nominal);
        assert_eq!(rolled_up().status, Status::Disabled);
    }

    #[test]
    fn test_prepare_holds_the_dependency_closure() {
        let (env, _) = environment(EPS);
        let task = ProcessingTask::prepare(&env.graph, vec![sample(2, 1.0)]).unwrap();
        let battery = env.graph.id_of(&EntityPath::new("SAT.EPS.BAT")).unwrap();
        assert!(task.ids().contains(&2));
        assert!(task.ids().contains(&3));
        assert!(task.ids().contains(&battery));
        assert!(!task.ids().contains(&1));
        assert_eq!(task.order()[0], 2);
        assert!(ProcessingTask::prepare(&env.graph, vec![sample(42, 1.0)]).is_err());
    }
}
