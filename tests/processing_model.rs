use chrono::{Duration, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tmtc::*;

const DEFINITION: &str = r#"
parameters:
  - id: 1
    path: SAT.EPS.MODE
    raw_type: int
    eng_type: string
    calibrations:
      - type: enum
        points: [{ raw: 1, value: LOW }, { raw: 2, value: HIGH }]
    checks:
      - name: KNOWN_MODE
        type: expected
        values: [LOW, HIGH]
  - id: 2
    path: SAT.EPS.VOLTAGE
    checks:
      - name: RANGE
        type: limit
        low: 24.0
        high: 32.0
    triggers:
      - { event: 100, condition: ON_ALARM_RAISED }
events:
  - id: 100
    path: SAT.EPS.UNDERVOLTAGE
    severity: ALARM
  - id: 101
    path: SAT.OBC.RESET
    inhibition_period_ms: 1000
activities:
  - id: 1000
    path: SAT.EPS.SWITCH
    activity_type: TC
    default_route: GROUND
    arguments:
      - name: STATE
        raw_type: int
        eng_type: string
        decalibration:
          type: inverted_enum
          points: [{ raw: 0, value: "OFF" }, { raw: 1, value: "ON" }]
      - name: DELAY
        raw_type: int
        default_value: 0
"#;

#[derive(Default)]
struct GroundStation {
    invocations: Mutex<Vec<ActivityInvocation>>,
    aborts: Mutex<Vec<(i32, u64)>>,
}

impl ActivityHandler for GroundStation {
    fn name(&self) -> String {
        "ground".to_string()
    }

    fn supported_routes(&self) -> Vec<String> {
        vec!["GROUND".to_string()]
    }

    fn supported_activity_types(&self) -> Vec<String> {
        vec!["TC".to_string()]
    }

    fn execute_activity(&self, invocation: &ActivityInvocation) -> Result<()> {
        self.invocations.lock().push(invocation.clone());
        Ok(())
    }

    fn abort_activity(&self, activity_id: i32, occurrence_id: u64) -> Result<()> {
        self.aborts.lock().push((activity_id, occurrence_id));
        Ok(())
    }
}

#[derive(Default)]
struct Collector {
    items: Mutex<Vec<DataItem>>,
}

#[async_trait::async_trait]
impl Subscriber<DataItem> for Collector {
    async fn on_items(&self, items: &[DataItem]) {
        self.items.lock().extend_from_slice(items);
    }
}

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
}

fn model_with(handler: Option<Arc<GroundStation>>) -> Arc<ProcessingModel> {
    let definition = ProcessingDefinition::from_yaml(DEFINITION).unwrap();
    let mut builder = ProcessingModel::builder(definition).clock(Arc::new(ManualClock::new(t0())));
    if let Some(handler) = handler {
        builder = builder.handler(handler);
    }
    builder.build().unwrap()
}

async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    condition()
}

fn parameters(result: &BatchResult) -> Vec<Arc<ParameterData>> {
    result.items.iter().filter_map(|i| i.as_parameter().cloned()).collect()
}

fn events(result: &BatchResult) -> Vec<Arc<EventData>> {
    result.items.iter().filter_map(|i| i.as_event().cloned()).collect()
}

fn progress(occurrence_id: u64, name: &str, next: ActivityOccurrenceState) -> ActivityProgress {
    ActivityProgress::new(
        1000,
        occurrence_id,
        name,
        t0(),
        ActivityOccurrenceState::Release,
        ActivityReportState::Ok,
        next,
    )
}

#[tokio::test]
async fn test_enumeration_calibration_is_nominal() {
    let model = model_with(None);
    let result = model
        .inject_parameters(vec![ParameterSample::new(1, 1i64, t0())])
        .await
        .unwrap();

    assert!(result.failures.is_empty());
    let mode = &parameters(&result)[0];
    assert_eq!(mode.eng_value, Some(Value::String("LOW".into())));
    assert_eq!(mode.validity, Validity::Valid);
    assert_eq!(mode.alarm_state, AlarmState::Nominal);

    let result = model
        .inject_parameters(vec![ParameterSample::new(1, 2i64, t0() + Duration::seconds(1))])
        .await
        .unwrap();
    assert_eq!(parameters(&result)[0].eng_value, Some(Value::String("HIGH".into())));
    model.shutdown().await;
}

#[tokio::test]
async fn test_older_sample_is_discarded() {
    let model = model_with(None);
    model
        .inject_parameters(vec![ParameterSample::new(2, 28.0, t0())])
        .await
        .unwrap();
    let result = model
        .inject_parameters(vec![ParameterSample::new(2, 29.0, t0() - Duration::seconds(5))])
        .await
        .unwrap();
    assert!(parameters(&result).is_empty());

    let current = model.get(&DataItemFilter::all().with_path("SAT.EPS.VOLTAGE").with_kind(DataKind::Parameter));
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].as_parameter().unwrap().eng_value, Some(Value::Float(28.0)));
    model.shutdown().await;
}

#[tokio::test]
async fn test_alarm_trigger_raises_event() {
    let model = model_with(None);
    let result = model
        .inject_parameters(vec![ParameterSample::new(2, 20.0, t0())])
        .await
        .unwrap();
    assert!(parameters(&result)[0].alarm_state.is_alarm());

    let raised = eventually(|| {
        !model
            .get(&DataItemFilter::all().with_path("SAT.EPS.UNDERVOLTAGE").with_kind(DataKind::Event))
            .is_empty()
    })
    .await;
    assert!(raised);

    let event = model.get(&DataItemFilter::all().with_kind(DataKind::Event));
    assert_eq!(event[0].as_event().unwrap().source.as_deref(), Some("SAT.EPS.VOLTAGE"));
    model.shutdown().await;
}

#[tokio::test]
async fn test_event_inhibition_period() {
    let model = model_with(None);
    let first = model.raise_events(vec![EventOccurrence::new(101).at(t0())]).await.unwrap();
    let inhibited = model
        .raise_events(vec![EventOccurrence::new(101).at(t0() + Duration::milliseconds(999))])
        .await
        .unwrap();
    let raised = model
        .raise_events(vec![EventOccurrence::new(101).at(t0() + Duration::milliseconds(1000))])
        .await
        .unwrap();

    assert_eq!(events(&first).len(), 1);
    assert!(events(&inhibited).is_empty());
    assert_eq!(events(&raised).len(), 1);
    model.shutdown().await;
}

#[tokio::test]
async fn test_unknown_or_mistyped_targets_are_rejected() {
    let model = model_with(None);
    assert!(matches!(
        model.inject_parameters(vec![ParameterSample::new(99, 1.0, t0())]).await,
        Err(ProcessingError::UnknownId(99))
    ));
    assert!(model.raise_events(vec![EventOccurrence::new(1)]).await.is_err());
    model.shutdown().await;
}

#[tokio::test]
async fn test_start_activity_forwards_decalibrated_arguments() {
    let handler = Arc::new(GroundStation::default());
    let model = model_with(Some(handler.clone()));

    let request = ActivityRequest::new(1000, "operator").with_argument(ActivityArgument::eng("STATE", "ON"));
    let occurrence_id = model.start_activity(request).await.unwrap();

    let invocations = handler.invocations.lock().clone();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].occurrence_id, occurrence_id);
    assert_eq!(invocations[0].route, "GROUND");
    assert_eq!(invocations[0].arguments.get("STATE"), Some(&Value::Int(1)));
    assert_eq!(invocations[0].arguments.get("DELAY"), Some(&Value::Int(0)));

    let active = model.get_active_activity_occurrences();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].current_state(), ActivityOccurrenceState::Release);
    model.shutdown().await;
}

#[tokio::test]
async fn test_invalid_activity_requests_fail_synchronously() {
    let handler = Arc::new(GroundStation::default());
    let model = model_with(Some(handler.clone()));

    let missing = ActivityRequest::new(1000, "operator");
    assert!(matches!(model.start_activity(missing).await, Err(ProcessingError::Activity(_))));

    let unknown = ActivityRequest::new(1000, "operator")
        .with_argument(ActivityArgument::eng("STATE", "ON"))
        .with_argument(ActivityArgument::raw("POWER", 3i64));
    assert!(model.start_activity(unknown).await.is_err());

    let bad_value = ActivityRequest::new(1000, "operator").with_argument(ActivityArgument::eng("STATE", "MAYBE"));
    assert!(model.start_activity(bad_value).await.is_err());

    let no_handler = ActivityRequest::new(1000, "operator")
        .with_argument(ActivityArgument::raw("STATE", 1i64))
        .with_route("RELAY");
    assert!(model.start_activity(no_handler).await.is_err());

    assert!(handler.invocations.lock().is_empty());
    assert!(model.get_active_activity_occurrences().is_empty());
    model.shutdown().await;
}

#[tokio::test]
async fn test_no_report_after_completion() {
    let handler = Arc::new(GroundStation::default());
    let model = model_with(Some(handler));
    let collector = Arc::new(Collector::default());
    model.subscribe(collector.clone(), DataItemFilter::all().with_kind(DataKind::ActivityOccurrence));

    let request = ActivityRequest::new(1000, "operator").with_argument(ActivityArgument::raw("STATE", 0i64));
    let occurrence_id = model.start_activity(request).await.unwrap();

    model
        .report_activity_progress(progress(occurrence_id, "Uplinked", ActivityOccurrenceState::Execution))
        .await
        .unwrap();
    model
        .report_activity_progress(progress(occurrence_id, "Executed", ActivityOccurrenceState::Verification))
        .await
        .unwrap();
    model
        .report_activity_progress(progress(occurrence_id, "Late", ActivityOccurrenceState::Execution))
        .await
        .unwrap();

    // A purge on the same activity runs after the queued reports
    let barrier = model.purge_activities(vec![(1000, occurrence_id)]).await.unwrap();
    assert!(barrier.items.iter().all(|i| i.as_activity_occurrence().is_none()));
    assert!(model.get_active_activity_occurrences().is_empty());

    let completed = || {
        collector
            .items
            .lock()
            .iter()
            .filter_map(|i| i.as_activity_occurrence())
            .any(|o| o.is_completed())
    };
    assert!(eventually(completed).await);

    let snapshots: Vec<_> = collector
        .items
        .lock()
        .iter()
        .filter_map(|i| i.as_activity_occurrence().cloned())
        .collect();
    let last = snapshots.last().unwrap();
    assert!(last.is_completed());
    assert_eq!(snapshots.iter().filter(|o| o.is_completed()).count(), 1);
    assert!(last.progress_reports.iter().all(|r| r.name != "Late"));
    assert_eq!(
        last.progress_reports.last().map(|r| r.name.as_str()),
        Some(tmtc::data::VERIFICATION_REPORT_NAME)
    );

    // Reports only ever move forward
    let states: Vec<_> = last.progress_reports.iter().map(|r| r.state_transition).collect();
    assert!(states.windows(2).all(|w| w[0] <= w[1]));
    model.shutdown().await;
}

#[tokio::test]
async fn test_try_report_progress_respects_queue_capacity() {
    let handler = Arc::new(GroundStation::default());
    let definition = ProcessingDefinition::from_yaml(DEFINITION).unwrap();
    let model = ProcessingModel::builder(definition)
        .clock(Arc::new(ManualClock::new(t0())))
        .engine(EngineConfig {
            queue_capacity: 1,
            ..Default::default()
        })
        .handler(handler)
        .build()
        .unwrap();
    let request = ActivityRequest::new(1000, "operator").with_argument(ActivityArgument::raw("STATE", 0i64));
    let occurrence_id = model.start_activity(request).await.unwrap();

    model
        .try_report_activity_progress(progress(occurrence_id, "Uplinked", ActivityOccurrenceState::Execution))
        .unwrap();
    // Nothing has drained the single slot yet
    let refused =
        model.try_report_activity_progress(progress(occurrence_id, "Executed", ActivityOccurrenceState::Verification));
    assert!(matches!(refused, Err(ProcessingError::QueueFull)));

    let mut mistyped = progress(occurrence_id, "Executed", ActivityOccurrenceState::Verification);
    mistyped.activity_id = 2;
    assert!(model.try_report_activity_progress(mistyped).is_err());

    let state = || {
        model
            .get_active_activity_occurrences()
            .first()
            .map(|o| o.current_state())
    };
    assert!(eventually(|| state() == Some(ActivityOccurrenceState::Execution)).await);

    model
        .report_activity_progress(progress(occurrence_id, "Executed", ActivityOccurrenceState::Verification))
        .await
        .unwrap();
    assert!(eventually(|| model.get_active_activity_occurrences().is_empty()).await);
    assert_eq!(model.stats().batches_rejected, 1);
    model.shutdown().await;
}

const OVERFLOW_DEFINITION: &str = r#"
parameters:
  - id: 1
    path: SAT.OBC.COUNTER
    raw_type: int
    eng_type: int
    calibrations:
      - type: expression
        expression:
          op: div
          left: { op: input }
          right: { op: const, value: -1 }
  - id: 2
    path: SAT.OBC.UPTIME
"#;

#[tokio::test]
async fn test_calibration_overflow_keeps_sibling_samples() {
    let definition = ProcessingDefinition::from_yaml(OVERFLOW_DEFINITION).unwrap();
    let model = ProcessingModel::builder(definition)
        .clock(Arc::new(ManualClock::new(t0())))
        .build()
        .unwrap();

    let result = model
        .inject_parameters(vec![
            ParameterSample::new(1, i64::MIN, t0()),
            ParameterSample::new(2, 12.5, t0()),
        ])
        .await
        .unwrap();
    assert!(result.failures.is_empty());
    let delivered = parameters(&result);
    let counter = delivered.iter().find(|p| p.external_id == 1).unwrap();
    assert_eq!(counter.validity, Validity::Invalid);
    assert_eq!(counter.alarm_state, AlarmState::Unknown);
    assert_eq!(counter.eng_value, None);
    let uptime = delivered.iter().find(|p| p.external_id == 2).unwrap();
    assert_eq!(uptime.validity, Validity::Valid);
    assert_eq!(uptime.eng_value, Some(Value::Float(12.5)));

    // The model keeps processing afterwards
    let result = model
        .inject_parameters(vec![ParameterSample::new(1, 42i64, t0() + Duration::seconds(1))])
        .await
        .unwrap();
    let counter = &parameters(&result)[0];
    assert_eq!(counter.validity, Validity::Valid);
    assert_eq!(counter.eng_value, Some(Value::Int(-42)));
    model.shutdown().await;
}

#[tokio::test]
async fn test_purge_twice_is_a_no_op() {
    let handler = Arc::new(GroundStation::default());
    let model = model_with(Some(handler));
    let request = ActivityRequest::new(1000, "operator").with_argument(ActivityArgument::raw("STATE", 1i64));
    let occurrence_id = model.start_activity(request).await.unwrap();

    let first = model.purge_activities(vec![(1000, occurrence_id)]).await.unwrap();
    let second = model.purge_activities(vec![(1000, occurrence_id)]).await.unwrap();

    assert!(first.failures.is_empty() && second.failures.is_empty());
    let purged: Vec<_> = first.items.iter().filter_map(|i| i.as_activity_occurrence()).collect();
    assert_eq!(purged.len(), 1);
    assert!(purged[0].is_completed());
    assert!(second.items.iter().all(|i| i.as_activity_occurrence().is_none()));
    assert!(model.get_active_activity_occurrences().is_empty());
    model.shutdown().await;
}

#[tokio::test]
async fn test_abort_is_forwarded_to_route_handler() {
    let handler = Arc::new(GroundStation::default());
    let model = model_with(Some(handler.clone()));
    let request = ActivityRequest::new(1000, "operator").with_argument(ActivityArgument::raw("STATE", 1i64));
    let occurrence_id = model.start_activity(request).await.unwrap();

    model.abort_activity(1000, occurrence_id).unwrap();
    assert_eq!(*handler.aborts.lock(), vec![(1000, occurrence_id)]);
    // Unchanged until the handler reports
    assert_eq!(model.get_active_activity_occurrences().len(), 1);
    assert!(model.abort_activity(1000, occurrence_id + 100).is_err());
    model.shutdown().await;
}

#[tokio::test]
async fn test_disable_propagates_to_descendants() {
    let model = model_with(None);
    model
        .inject_parameters(vec![ParameterSample::new(2, 28.0, t0())])
        .await
        .unwrap();

    let result = model.disable(&EntityPath::new("SAT.EPS")).await.unwrap();
    let disabled: Vec<_> = result
        .items
        .iter()
        .filter_map(|i| i.as_system_entity())
        .filter(|e| e.status == Status::Disabled)
        .map(|e| e.path.to_string())
        .collect();
    assert!(disabled.contains(&"SAT.EPS".to_string()));
    assert!(disabled.contains(&"SAT.EPS.VOLTAGE".to_string()));
    assert_eq!(parameters(&result)[0].validity, Validity::Disabled);
    assert_eq!(parameters(&result)[0].eng_value, Some(Value::Float(28.0)));

    let dropped = model
        .inject_parameters(vec![ParameterSample::new(2, 30.0, t0() + Duration::seconds(1))])
        .await
        .unwrap();
    assert!(parameters(&dropped).is_empty());

    model.enable(&EntityPath::new("SAT.EPS")).await.unwrap();
    assert_eq!(model.get_by_path(&EntityPath::new("SAT.EPS.VOLTAGE")).unwrap().status, Status::Enabled);
    assert_eq!(model.get_by_path(&EntityPath::new("SAT.OBC.RESET")).unwrap().status, Status::Enabled);
    model.shutdown().await;
}

#[tokio::test]
async fn test_structure_queries() {
    let model = model_with(None);
    let root = model.get_root().unwrap();
    assert_eq!(root.path, EntityPath::new("SAT"));

    let mut children: Vec<String> = model
        .get_contained_entities(&EntityPath::new("SAT.EPS"))
        .unwrap()
        .iter()
        .map(|e| e.path.to_string())
        .collect();
    children.sort();
    assert_eq!(children, vec!["SAT.EPS.MODE", "SAT.EPS.SWITCH", "SAT.EPS.UNDERVOLTAGE", "SAT.EPS.VOLTAGE"]);

    assert_eq!(model.get_external_id_of(&EntityPath::new("SAT.EPS.VOLTAGE")).unwrap(), 2);
    assert_eq!(model.get_path_of(1000).unwrap(), EntityPath::new("SAT.EPS.SWITCH"));
    assert!(matches!(
        model.get_descriptor_of(&EntityPath::new("SAT.EPS.SWITCH")).unwrap(),
        definition::EntityDescriptor::Activity(_)
    ));

    let mut visited = Vec::new();
    model.visit(|entity| visited.push(entity.path.clone()));
    assert_eq!(visited.len(), model.get(&DataItemFilter::all().with_kind(DataKind::SystemEntity)).len());
    assert_eq!(visited[0], EntityPath::new("SAT"));
    model.shutdown().await;
}

#[tokio::test]
async fn test_subscription_receives_initial_state_then_updates() {
    let model = model_with(None);
    model
        .inject_parameters(vec![ParameterSample::new(2, 28.0, t0())])
        .await
        .unwrap();

    let collector = Arc::new(Collector::default());
    let subscriber: Arc<dyn Subscriber<DataItem>> = collector.clone();
    model.subscribe(
        subscriber.clone(),
        DataItemFilter::all().with_path("SAT.EPS.VOLTAGE").with_kind(DataKind::Parameter),
    );
    model
        .inject_parameters(vec![ParameterSample::new(2, 29.0, t0() + Duration::seconds(1))])
        .await
        .unwrap();

    assert!(eventually(|| collector.items.lock().len() >= 2).await);
    let values: Vec<_> = collector
        .items
        .lock()
        .iter()
        .filter_map(|i| i.as_parameter().and_then(|p| p.eng_value.clone()))
        .collect();
    assert_eq!(values, vec![Value::Float(28.0), Value::Float(29.0)]);

    assert!(model.unsubscribe(&subscriber));
    model.shutdown().await;
}

#[tokio::test]
async fn test_sequencer_snapshot_resumes_ids() {
    let model = model_with(None);
    let first = model
        .inject_parameters(vec![ParameterSample::new(2, 28.0, t0())])
        .await
        .unwrap();
    let saved = model.sequencer_snapshot();
    model.shutdown().await;

    let resumed = ProcessingModel::builder(ProcessingDefinition::from_yaml(DEFINITION).unwrap())
        .initial_sequences(saved)
        .build()
        .unwrap();
    let second = resumed
        .inject_parameters(vec![ParameterSample::new(2, 28.0, t0())])
        .await
        .unwrap();
    assert!(parameters(&second)[0].internal_id > parameters(&first)[0].internal_id);
    resumed.shutdown().await;
}
