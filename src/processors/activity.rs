// src/processors/activity.rs - Activity occurrences and their life-cycle
use super::{NodeSnapshot, ProcessContext, ProcessorCore, TimeoutToken, TimerCommand};
use crate::data::{
    ActivityOccurrenceData, ActivityOccurrenceReport, ActivityOccurrenceState as State,
    ActivityReportState, DataItem, Status, CREATION_REPORT_NAME, FORWARDING_REPORT_NAME,
    PURGE_REPORT_NAME, VERIFICATION_REPORT_NAME,
};
use crate::definition::{ActivityDefinition, Expression, ScopedResolver};
use crate::error::{ProcessingError, Result};
use crate::handler::ActivityInvocation;
use crate::input::ActivityProgress;
use crate::operation::Operation;
use crate::sequencer::DataKind;
use crate::value::Value;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

// ============================================================================
// ACTIVITY
// ============================================================================

#[derive(Debug)]
pub struct ActivityProcessor {
    core: ProcessorCore,
    definition: ActivityDefinition,
    occurrences: BTreeMap<u64, OccurrenceProcessor>,
}

impl ActivityProcessor {
    pub fn new(core: ProcessorCore, definition: ActivityDefinition) -> Self {
        Self {
            core,
            definition,
            occurrences: BTreeMap::new(),
        }
    }

    pub fn core(&self) -> &ProcessorCore {
        &self.core
    }

    pub fn definition(&self) -> &ActivityDefinition {
        &self.definition
    }

    pub fn process(&mut self, op: &Operation, ctx: &mut ProcessContext<'_>) -> Result<()> {
        match op {
            Operation::ActivityInvoke(invocation) => self.invoke(invocation, ctx),
            Operation::ActivityCreate {
                invocation,
                progress,
            } => self.create(invocation, progress.as_ref(), ctx),
            Operation::ActivityProgress(progress) => {
                match self.occurrences.get_mut(&progress.occurrence_id) {
                    Some(occ) => occ.progress(progress, &self.definition, ctx),
                    None => warn!(
                        "Progress for unknown occurrence {} of activity {} dropped",
                        progress.occurrence_id, self.core.path
                    ),
                }
                self.remove_completed();
                Ok(())
            }
            Operation::ActivityTimeout { occurrence_id, .. } => {
                if let Some(occ) = self.occurrences.get_mut(occurrence_id) {
                    occ.evaluate(&self.definition, ctx);
                }
                self.remove_completed();
                Ok(())
            }
            Operation::ActivityPurge { occurrence_id, .. } => {
                match self.occurrences.get_mut(occurrence_id) {
                    Some(occ) => occ.purge(ctx),
                    None => debug!(
                        "Purge of occurrence {} of activity {}: not active, nothing to do",
                        occurrence_id, self.core.path
                    ),
                }
                self.remove_completed();
                Ok(())
            }
            other => Err(ProcessingError::Activity(format!(
                "Operation '{}' not supported by activity {}",
                other.description(),
                self.core.path
            ))),
        }
    }

    /// Re-check every occurrence waiting for verification
    pub fn evaluate(&mut self, ctx: &mut ProcessContext<'_>) -> Result<()> {
        for occ in self.occurrences.values_mut() {
            if occ.current_state() == State::Verification {
                occ.evaluate(&self.definition, ctx);
            }
        }
        self.remove_completed();
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
            occurrences: self
                .occurrences
                .iter()
                .map(|(id, occ)| (*id, occ.data.clone()))
                .collect(),
            ..Default::default()
        }
    }

    fn invoke(&mut self, invocation: &ActivityInvocation, ctx: &mut ProcessContext<'_>) -> Result<()> {
        if self.core.status() == Status::Disabled {
            return Err(ProcessingError::Activity(format!(
                "Activity {} is disabled",
                self.core.path
            )));
        }
        let mut occ = OccurrenceProcessor::new(invocation, &self.definition);
        occ.report(
            CREATION_REPORT_NAME,
            invocation.generation_time,
            None,
            State::Creation,
            ActivityReportState::Ok,
            None,
            State::Release,
            ctx,
        );

        let forwarded = ctx.handlers.forward(invocation);
        let (status, next) = match &forwarded {
            Ok(()) => (ActivityReportState::Ok, State::Release),
            Err(e) => {
                error!(
                    "Occurrence {} of activity {} cannot be forwarded on route {}: {}",
                    invocation.occurrence_id, self.core.path, invocation.route, e
                );
                (ActivityReportState::Fatal, State::Completion)
            }
        };
        occ.report(
            FORWARDING_REPORT_NAME,
            ctx.now,
            None,
            State::Release,
            status,
            None,
            next,
            ctx,
        );
        info!(
            "Occurrence {} of activity {} released on route {} ({:?})",
            invocation.occurrence_id, self.core.path, invocation.route, status
        );
        if !occ.is_completed() {
            self.occurrences.insert(invocation.occurrence_id, occ);
        }
        Ok(())
    }

    fn create(
        &mut self,
        invocation: &ActivityInvocation,
        progress: Option<&ActivityProgress>,
        ctx: &mut ProcessContext<'_>,
    ) -> Result<()> {
        let mut occ = OccurrenceProcessor::new(invocation, &self.definition);
        occ.report(
            CREATION_REPORT_NAME,
            invocation.generation_time,
            None,
            State::Creation,
            ActivityReportState::Ok,
            None,
            State::Release,
            ctx,
        );
        if let Some(progress) = progress {
            occ.progress(progress, &self.definition, ctx);
        }
        if !occ.is_completed() {
            self.occurrences.insert(invocation.occurrence_id, occ);
        }
        Ok(())
    }

    fn remove_completed(&mut self) {
        self.occurrences.retain(|id, occ| {
            let keep = !occ.is_completed();
            if !keep {
                trace!("Occurrence {} completed, removed from active set", id);
            }
            keep
        });
    }
}

// ============================================================================
// OCCURRENCE
// ============================================================================

/// Life-cycle of one occurrence
#[derive(Debug)]
struct OccurrenceProcessor {
    data: Arc<ActivityOccurrenceData>,
    token: TimeoutToken,
    /// Phase and deadline of the armed timeout
    timeout: Option<(State, DateTime<Utc>)>,
}

impl OccurrenceProcessor {
    fn new(invocation: &ActivityInvocation, definition: &ActivityDefinition) -> Self {
        let data = ActivityOccurrenceData {
            internal_id: invocation.occurrence_id,
            generation_time: invocation.generation_time,
            external_id: invocation.activity_id,
            name: invocation.path.last_element().to_string(),
            path: invocation.path.clone(),
            activity_type: definition.activity_type.clone(),
            arguments: invocation.arguments.clone(),
            properties: invocation.properties.clone(),
            progress_reports: Vec::new(),
            route: invocation.route.clone(),
            source: invocation.source.clone(),
        };
        Self {
            data: Arc::new(data),
            token: TimeoutToken {
                activity_id: invocation.activity_id,
                occurrence_id: invocation.occurrence_id,
            },
            timeout: None,
        }
    }

    fn current_state(&self) -> State {
        self.data.current_state()
    }

    fn is_completed(&self) -> bool {
        self.data.is_completed()
    }

    fn progress(&mut self, progress: &ActivityProgress, definition: &ActivityDefinition, ctx: &mut ProcessContext<'_>) {
        let id = self.data.internal_id;
        if self.is_completed() {
            warn!(
                "Progress '{}' for completed occurrence {} of activity {} dropped",
                progress.name, id, self.data.path
            );
            return;
        }
        if progress.next_state == State::Completion {
            error!(
                "Progress '{}' for occurrence {} of activity {} requests COMPLETION, only states up to VERIFICATION can be reported",
                progress.name, id, self.data.path
            );
            return;
        }

        let previous = self.current_state();
        // A FATAL report ends the tracking of the occurrence
        let next = if progress.status == ActivityReportState::Fatal {
            State::Completion
        } else {
            progress.next_state
        };
        self.report(
            &progress.name,
            progress.generation_time,
            progress.execution_time,
            progress.state,
            progress.status,
            progress.result.clone(),
            next,
            ctx,
        );

        let current = self.current_state();
        if previous != current {
            match current {
                State::Transmission => {
                    if definition.transmission_timeout_secs > 0 {
                        self.start_timeout(State::Transmission, definition.transmission_timeout_secs, ctx);
                    }
                }
                State::Scheduling => self.stop_timeout(State::Transmission, ctx),
                State::Execution => {
                    self.stop_timeout(State::Transmission, ctx);
                    if definition.execution_timeout_secs > 0 {
                        self.start_timeout(State::Execution, definition.execution_timeout_secs, ctx);
                    }
                }
                State::Verification => {
                    self.stop_timeout(State::Execution, ctx);
                    self.enter_verification(definition, ctx);
                }
                _ => {}
            }
        }
        self.verify_timeout(ctx);
    }

    fn enter_verification(&mut self, definition: &ActivityDefinition, ctx: &mut ProcessContext<'_>) {
        let expression = match &definition.verification {
            Some(e) => e,
            None => {
                self.verification_report(ActivityReportState::Ok, State::Completion, ctx);
                return;
            }
        };
        if definition.verification_timeout_secs > 0 {
            self.start_timeout(State::Verification, definition.verification_timeout_secs, ctx);
        }
        let arguments = self.data.arguments.clone();
        let scoped = ScopedResolver::new(ctx.graph).with_arguments(&arguments);
        match expression.evaluate_bool(&scoped) {
            Ok(true) => {
                info!("Verification of occurrence {} of activity {} completed", self.data.internal_id, self.data.path);
                self.verification_report(ActivityReportState::Ok, State::Completion, ctx);
            }
            Ok(false) if definition.verification_timeout_secs == 0 => {
                warn!("Verification of occurrence {} of activity {} failed", self.data.internal_id, self.data.path);
                self.verification_report(ActivityReportState::Fail, State::Completion, ctx);
            }
            Ok(false) => {
                self.verification_report(ActivityReportState::Pending, State::Verification, ctx);
            }
            Err(e) => {
                error!(
                    "Verification expression of activity {} failed for occurrence {}: {}",
                    self.data.path, self.data.internal_id, e
                );
                self.verification_report(ActivityReportState::Error, State::Completion, ctx);
            }
        }
    }

    /// Timer or dependency driven re-check
    fn evaluate(&mut self, definition: &ActivityDefinition, ctx: &mut ProcessContext<'_>) {
        let expired = self.verify_timeout(ctx);
        if self.current_state() != State::Verification {
            return;
        }
        let expression = match &definition.verification {
            Some(e) => e,
            None => return,
        };
        let arguments = self.data.arguments.clone();
        let scoped = ScopedResolver::new(ctx.graph).with_arguments(&arguments);
        match expression.evaluate_bool(&scoped) {
            Ok(true) => {
                info!("Verification of occurrence {} of activity {} completed", self.data.internal_id, self.data.path);
                self.verification_report(ActivityReportState::Ok, State::Completion, ctx);
            }
            Ok(false) if expired => {
                warn!("Verification of occurrence {} of activity {} failed", self.data.internal_id, self.data.path);
                self.verification_report(ActivityReportState::Fail, State::Completion, ctx);
            }
            Ok(false) => {}
            Err(e) => {
                error!(
                    "Verification expression of activity {} failed for occurrence {}: {}",
                    self.data.path, self.data.internal_id, e
                );
                self.verification_report(ActivityReportState::Error, State::Completion, ctx);
            }
        }
    }

    fn purge(&mut self, ctx: &mut ProcessContext<'_>) {
        if self.is_completed() {
            debug!("Occurrence {} already completed, purge ignored", self.data.internal_id);
            return;
        }
        self.abort_timeout(ctx);
        let current = self.current_state();
        self.report(
            PURGE_REPORT_NAME,
            ctx.now,
            None,
            current,
            ActivityReportState::Ok,
            None,
            State::Completion,
            ctx,
        );
    }

    fn verification_report(&mut self, status: ActivityReportState, next: State, ctx: &mut ProcessContext<'_>) {
        self.report(
            VERIFICATION_REPORT_NAME,
            ctx.now,
            None,
            State::Verification,
            status,
            None,
            next,
            ctx,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &mut self,
        name: &str,
        generation_time: DateTime<Utc>,
        execution_time: Option<DateTime<Utc>>,
        state: State,
        status: ActivityReportState,
        result: Option<Value>,
        next: State,
        ctx: &mut ProcessContext<'_>,
    ) {
        let report = ActivityOccurrenceReport {
            internal_id: ctx.sequencer.next(DataKind::ActivityReport),
            generation_time,
            name: name.to_string(),
            state,
            execution_time,
            status,
            state_transition: next,
            result,
        };
        debug!(
            "Occurrence {} of {}: report '{}' {:?} -> {:?}",
            self.data.internal_id, self.data.path, name, status, next
        );
        Arc::make_mut(&mut self.data).progress_reports.push(report);
        ctx.emit(DataItem::ActivityOccurrence(self.data.clone()));
        if next == State::Completion {
            self.abort_timeout(ctx);
        }
    }

    fn start_timeout(&mut self, state: State, secs: u64, ctx: &mut ProcessContext<'_>) {
        self.abort_timeout(ctx);
        let deadline = match i64::try_from(secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|timeout| ctx.now.checked_add_signed(timeout))
        {
            Some(deadline) => deadline,
            None => {
                warn!(
                    "Timeout of {} s for {:?} of occurrence {} out of range, not armed",
                    secs, state, self.data.internal_id
                );
                return;
            }
        };
        trace!(
            "Timeout for {:?} of occurrence {} armed at {}",
            state, self.data.internal_id, deadline
        );
        self.timeout = Some((state, deadline));
        ctx.effects.timers.push(TimerCommand::Arm {
            deadline,
            token: self.token,
        });
    }

    fn stop_timeout(&mut self, state: State, ctx: &mut ProcessContext<'_>) {
        if matches!(self.timeout, Some((s, _)) if s == state) {
            self.abort_timeout(ctx);
        }
    }

    fn abort_timeout(&mut self, ctx: &mut ProcessContext<'_>) {
        if self.timeout.take().is_some() {
            ctx.effects.timers.push(TimerCommand::Cancel(self.token));
        }
    }

    /// Emit a TIMEOUT report if the armed timeout of the current phase has
    /// expired; returns true if it did
    fn verify_timeout(&mut self, ctx: &mut ProcessContext<'_>) -> bool {
        if self.is_completed() {
            self.abort_timeout(ctx);
            return false;
        }
        let current = self.current_state();
        match self.timeout {
            Some((state, deadline)) if state == current && ctx.now >= deadline => {
                self.report(
                    &format!("{} Timeout", state.label()),
                    ctx.now,
                    None,
                    current,
                    ActivityReportState::Timeout,
                    None,
                    current,
                    ctx,
                );
                self.abort_timeout(ctx);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::task::tests::{environment, run, sample, t0};
    use crate::task::{ProcessingEnvironment, TaskOutcome};

    const DEFINITION: &str = r#"
parameters:
  - id: 1
    path: SAT.PWR.STATE
activities:
  - id: 1000
    path: SAT.PWR.SWITCH_ON
    activity_type: TC
    verification:
      op: compare
      cmp: gt
      left: { op: ref, path: SAT.PWR.STATE }
      right: { op: const, value: 0 }
  - id: 1001
    path: SAT.PWR.CHECK_BUS
    activity_type: TC
    verification: { op: arg, name: BUS }
  - id: 1002
    path: SAT.PWR.CYCLE
    activity_type: TC
    execution_timeout_secs: 30
    verification_timeout_secs: 60
    verification:
      op: compare
      cmp: gt
      left: { op: ref, path: SAT.PWR.STATE }
      right: { op: const, value: 0 }
"#;

    fn create(env: &ProcessingEnvironment, activity_id: i32, occurrence_id: u64) -> TaskOutcome {
        let invocation = ActivityInvocation {
            occurrence_id,
            activity_id,
            path: env.graph.path_of(activity_id).unwrap(),
            activity_type: "TC".into(),
            route: "GROUND".into(),
            source: "test".into(),
            arguments: BTreeMap::new(),
            properties: BTreeMap::new(),
            generation_time: t0(),
        };
        run(
            env,
            vec![Operation::ActivityCreate {
                invocation,
                progress: None,
            }],
        )
    }

    fn report(
        env: &ProcessingEnvironment,
        activity_id: i32,
        occurrence_id: u64,
        status: ActivityReportState,
        next: State,
    ) -> TaskOutcome {
        let now = env.clock.now();
        let progress = ActivityProgress::new(activity_id, occurrence_id, "Step", now, State::Release, status, next);
        run(env, vec![Operation::ActivityProgress(progress)])
    }

    fn timeout(env: &ProcessingEnvironment, activity_id: i32, occurrence_id: u64) -> TaskOutcome {
        run(
            env,
            vec![Operation::ActivityTimeout {
                activity_id,
                occurrence_id,
            }],
        )
    }

    fn last_occurrence(outcome: &TaskOutcome) -> Arc<ActivityOccurrenceData> {
        outcome
            .effects
            .items
            .iter()
            .rev()
            .find_map(DataItem::as_activity_occurrence)
            .cloned()
            .unwrap()
    }

    fn last_report(outcome: &TaskOutcome) -> ActivityOccurrenceReport {
        last_occurrence(outcome).progress_reports.last().cloned().unwrap()
    }

    fn is_active(env: &ProcessingEnvironment, activity_id: i32, occurrence_id: u64) -> bool {
        env.graph
            .node(activity_id)
            .map(|n| n.snapshot().occurrences.contains_key(&occurrence_id))
            .unwrap_or(false)
    }

    fn token(activity_id: i32, occurrence_id: u64) -> TimeoutToken {
        TimeoutToken {
            activity_id,
            occurrence_id,
        }
    }

    #[test]
    fn test_verification_ok_completes() {
        let (env, _) = environment(DEFINITION);
        run(&env, vec![sample(1, 1.0)]);
        create(&env, 1000, 1);
        report(&env, 1000, 1, ActivityReportState::Ok, State::Execution);

        let outcome = report(&env, 1000, 1, ActivityReportState::Ok, State::Verification);
        let verification = last_report(&outcome);
        assert_eq!(verification.name, VERIFICATION_REPORT_NAME);
        assert_eq!(verification.status, ActivityReportState::Ok);
        assert_eq!(verification.state_transition, State::Completion);
        assert_eq!(last_occurrence(&outcome).aggregate_status(), ActivityReportState::Ok);
        assert!(!is_active(&env, 1000, 1));
    }

    #[test]
    fn test_false_verification_without_timeout_fails() {
        let (env, _) = environment(DEFINITION);
        run(&env, vec![sample(1, 0.0)]);
        create(&env, 1000, 1);

        let outcome = report(&env, 1000, 1, ActivityReportState::Ok, State::Verification);
        let verification = last_report(&outcome);
        assert_eq!(verification.status, ActivityReportState::Fail);
        assert_eq!(verification.state_transition, State::Completion);
        assert!(outcome.effects.timers.is_empty());
        assert!(!is_active(&env, 1000, 1));
    }

    #[test]
    fn test_verification_expression_error_completes() {
        let (env, _) = environment(DEFINITION);
        create(&env, 1001, 1);

        let outcome = report(&env, 1001, 1, ActivityReportState::Ok, State::Verification);
        let verification = last_report(&outcome);
        assert_eq!(verification.status, ActivityReportState::Error);
        assert_eq!(verification.state_transition, State::Completion);
        assert!(outcome.failures.is_empty());
        assert!(!is_active(&env, 1001, 1));
    }

    #[test]
    fn test_fatal_report_forces_completion() {
        let (env, _) = environment(DEFINITION);
        create(&env, 1002, 1);
        let outcome = report(&env, 1002, 1, ActivityReportState::Ok, State::Execution);
        assert!(matches!(outcome.effects.timers[..], [TimerCommand::Arm { .. }]));

        let outcome = report(&env, 1002, 1, ActivityReportState::Fatal, State::Execution);
        let fatal = last_report(&outcome);
        assert_eq!(fatal.status, ActivityReportState::Fatal);
        assert_eq!(fatal.state_transition, State::Completion);
        assert_eq!(outcome.effects.timers, vec![TimerCommand::Cancel(token(1002, 1))]);
        assert!(!is_active(&env, 1002, 1));

        // Nothing is applied once completed
        let outcome = report(&env, 1002, 1, ActivityReportState::Ok, State::Verification);
        assert!(outcome.effects.items.is_empty());
    }

    #[test]
    fn test_completion_cannot_be_reported() {
        let (env, _) = environment(DEFINITION);
        create(&env, 1000, 1);
        let outcome = report(&env, 1000, 1, ActivityReportState::Ok, State::Completion);
        assert!(outcome.effects.items.is_empty());
        assert!(is_active(&env, 1000, 1));
    }

    #[test]
    fn test_execution_timeout_reported_when_timer_expires() {
        let (env, clock) = environment(DEFINITION);
        create(&env, 1002, 1);
        let outcome = report(&env, 1002, 1, ActivityReportState::Ok, State::Execution);
        assert_eq!(
            outcome.effects.timers,
            vec![TimerCommand::Arm {
                deadline: t0() + Duration::seconds(30),
                token: token(1002, 1),
            }]
        );

        clock.set(t0() + Duration::seconds(31));
        let outcome = timeout(&env, 1002, 1);
        let expired = last_report(&outcome);
        assert_eq!(expired.name, "Execution Timeout");
        assert_eq!(expired.status, ActivityReportState::Timeout);
        assert_eq!(expired.state_transition, State::Execution);
        assert!(is_active(&env, 1002, 1));
        assert_eq!(last_occurrence(&outcome).aggregate_status(), ActivityReportState::Timeout);
    }

    #[test]
    fn test_leaving_phase_cancels_its_timer() {
        let (env, clock) = environment(DEFINITION);
        run(&env, vec![sample(1, 0.0)]);
        create(&env, 1002, 1);
        report(&env, 1002, 1, ActivityReportState::Ok, State::Execution);

        clock.set(t0() + Duration::seconds(10));
        let outcome = report(&env, 1002, 1, ActivityReportState::Ok, State::Verification);
        assert_eq!(
            outcome.effects.timers,
            vec![
                TimerCommand::Cancel(token(1002, 1)),
                TimerCommand::Arm {
                    deadline: t0() + Duration::seconds(70),
                    token: token(1002, 1),
                },
            ]
        );
        assert_eq!(last_report(&outcome).status, ActivityReportState::Pending);

        // A stale execution expiry finds nothing to report
        clock.set(t0() + Duration::seconds(40));
        let outcome = timeout(&env, 1002, 1);
        assert!(outcome.effects.items.is_empty());
    }

    #[test]
    fn test_verification_timeout_then_fail() {
        let (env, clock) = environment(DEFINITION);
        run(&env, vec![sample(1, 0.0)]);
        create(&env, 1002, 1);
        report(&env, 1002, 1, ActivityReportState::Ok, State::Verification);

        clock.set(t0() + Duration::seconds(61));
        let outcome = timeout(&env, 1002, 1);
        let reports = &last_occurrence(&outcome).progress_reports;
        let tail: Vec<_> = reports[reports.len() - 2..]
            .iter()
            .map(|r| (r.name.as_str(), r.status, r.state_transition))
            .collect();
        assert_eq!(
            tail,
            vec![
                ("Verification Timeout", ActivityReportState::Timeout, State::Verification),
                (VERIFICATION_REPORT_NAME, ActivityReportState::Fail, State::Completion),
            ]
        );
        assert!(!is_active(&env, 1002, 1));
    }

    #[test]
    fn test_pending_verification_completes_on_dependency_change() {
        let (env, _) = environment(DEFINITION);
        run(&env, vec![sample(1, 0.0)]);
        create(&env, 1002, 1);
        report(&env, 1002, 1, ActivityReportState::Ok, State::Verification);
        assert!(is_active(&env, 1002, 1));

        let outcome = run(&env, vec![sample(1, 1.0)]);
        let verification = last_report(&outcome);
        assert_eq!(verification.status, ActivityReportState::Ok);
        assert_eq!(verification.state_transition, State::Completion);
        assert_eq!(outcome.effects.timers, vec![TimerCommand::Cancel(token(1002, 1))]);
        assert!(!is_active(&env, 1002, 1));
    }
}
