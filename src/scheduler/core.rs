// src/scheduler/core.rs - Scheduled tasks, triggers and resource arbitration
//
// The core is synchronous and time is always passed in. It never calls the
// processing model: starting and aborting activities leave as
// `SchedulerAction`s, and every state transition leaves as a
// `ScheduledActivityData` snapshot. The owner (the scheduler service) drains
// both after each call.

use super::types::{
    ConflictStrategy, CreationConflictStrategy, ScheduledActivityData, SchedulingRequest, SchedulingState, Trigger,
};
use crate::config::SchedulerConfig;
use crate::data::{ActivityOccurrenceData, ActivityReportState};
use crate::error::{ProcessingError, Result};
use crate::filter::ScheduledActivityDataFilter;
use crate::input::ActivityRequest;
use crate::path::EntityPath;
use crate::sequencer::{DataKind, Sequencer};
use crate::subscription::Filter;
use crate::timer::TimerQueue;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Work the scheduler needs from the activity layer
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerAction {
    Start { task_id: u64, request: ActivityRequest },
    Abort { activity_id: i32, occurrence_id: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SchedulerTimer {
    /// Trigger time of an absolute, now or delayed relative task
    Release(u64),
    /// Latest invocation time of a waiting task
    Latest(u64),
}

#[derive(Debug, Clone)]
struct ScheduledTask {
    request: SchedulingRequest,
    data: ScheduledActivityData,
    resources_acquired: bool,
    /// Start issued, occurrence id not known yet
    starting: bool,
    last_event_fire: Option<DateTime<Utc>>,
}

impl ScheduledTask {
    fn state(&self) -> SchedulingState {
        self.data.state
    }

    fn is_event_based(&self) -> bool {
        self.request.trigger.is_event_based()
    }
}

#[derive(Clone)]
pub struct SchedulerCore {
    tasks: BTreeMap<u64, ScheduledTask>,
    /// Resource to holding task
    held: HashMap<String, u64>,
    timers: TimerQueue<SchedulerTimer>,
    /// Activity occurrence to task
    occurrences: HashMap<u64, u64>,
    /// Task to activity id, while a start action is unanswered
    pending_starts: HashMap<u64, i32>,
    enabled: bool,
    run_past: bool,
    next_id: u64,
    sequencer: Arc<Sequencer>,
    actions: Vec<SchedulerAction>,
    updates: Vec<ScheduledActivityData>,
}

impl SchedulerCore {
    pub fn new(config: &SchedulerConfig, sequencer: Arc<Sequencer>) -> Self {
        Self {
            tasks: BTreeMap::new(),
            held: HashMap::new(),
            timers: TimerQueue::new(),
            occurrences: HashMap::new(),
            pending_starts: HashMap::new(),
            enabled: config.enabled_at_startup,
            run_past: config.run_past_scheduled_activities,
            next_id: 1,
            sequencer,
            actions: Vec::new(),
            updates: Vec::new(),
        }
    }

    // ========================================================================
    // OUTPUTS
    // ========================================================================

    pub fn take_actions(&mut self) -> Vec<SchedulerAction> {
        std::mem::take(&mut self.actions)
    }

    pub fn take_updates(&mut self) -> Vec<ScheduledActivityData> {
        std::mem::take(&mut self.updates)
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.timers.next_deadline()
    }

    /// Snapshot of every task still in the schedule, by start time then id
    pub fn current(&self) -> Vec<ScheduledActivityData> {
        let mut all: Vec<ScheduledActivityData> = self.tasks.values().map(|t| t.data.clone()).collect();
        all.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        all
    }

    pub fn get(&self, id: u64) -> Option<&ScheduledActivityData> {
        self.tasks.get(&id).map(|t| &t.data)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            info!("Scheduler {}", if enabled { "enabled" } else { "disabled" });
        }
        self.enabled = enabled;
    }

    /// True while a start action for `task_id` is still wanted
    pub fn should_start(&self, task_id: u64) -> bool {
        self.tasks
            .get(&task_id)
            .map_or(false, |t| t.starting && t.state() == SchedulingState::Running)
    }

    /// Forget a start action that will not be executed
    pub fn discard_start(&mut self, task_id: u64) {
        self.pending_starts.remove(&task_id);
    }

    // ========================================================================
    // SCHEDULE MUTATIONS
    // ========================================================================

    /// Add one request. Returns `None` when SKIP_NEW drops it.
    pub fn schedule(
        &mut self,
        request: SchedulingRequest,
        strategy: CreationConflictStrategy,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledActivityData>> {
        self.atomically(|core| core.schedule_task(request, strategy, None, now))
    }

    /// Add several requests; any error leaves the schedule unmodified
    pub fn schedule_all(
        &mut self,
        requests: Vec<SchedulingRequest>,
        strategy: CreationConflictStrategy,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledActivityData>> {
        let conflicts = self.conflicts_of(&requests, now, None);
        if !conflicts.is_empty() && strategy == CreationConflictStrategy::Abort {
            return Err(ProcessingError::Scheduling(format!(
                "Conflict detected with scheduled tasks {:?}",
                conflicts
            )));
        }
        let external_ids: HashSet<&str> = requests.iter().map(|r| r.external_id.as_str()).collect();
        if external_ids.len() != requests.len() {
            return Err(ProcessingError::Scheduling(
                "One supplied external id is duplicated in the request".into(),
            ));
        }
        self.atomically(|core| {
            let mut scheduled = Vec::new();
            for request in requests {
                if let Some(data) = core.schedule_task(request, strategy, None, now)? {
                    scheduled.push(data);
                }
            }
            Ok(scheduled)
        })
    }

    /// Replace the request of a SCHEDULED task, keeping its id
    pub fn update(
        &mut self,
        id: u64,
        request: SchedulingRequest,
        strategy: CreationConflictStrategy,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledActivityData>> {
        let task = self
            .tasks
            .get(&id)
            .ok_or_else(|| ProcessingError::Scheduling(format!("Task {} not found, cannot update", id)))?;
        if task.state() != SchedulingState::Scheduled {
            return Err(ProcessingError::Scheduling(format!(
                "Task {} is {:?}, only scheduled tasks can be updated",
                id,
                task.state()
            )));
        }
        let conflicts = self.conflicts_of(std::slice::from_ref(&request), now, Some(id));
        if !conflicts.is_empty() && strategy == CreationConflictStrategy::Abort {
            return Err(ProcessingError::Scheduling(format!(
                "Conflict detected with scheduled tasks {:?}",
                conflicts
            )));
        }
        self.atomically(|core| {
            core.abort_task(id, now, true);
            core.schedule_task(request, strategy, Some(id), now)
        })
    }

    /// Take a task out of the schedule. A running task is aborted.
    pub fn remove(&mut self, id: u64, now: DateTime<Utc>) -> Result<()> {
        if !self.tasks.contains_key(&id) {
            return Err(ProcessingError::Scheduling(format!("Task {} not found, cannot remove", id)));
        }
        self.abort_task(id, now, true);
        Ok(())
    }

    /// Remove every task matching `filter`; returns how many were removed
    pub fn remove_by_filter(&mut self, filter: &ScheduledActivityDataFilter, now: DateTime<Utc>) -> usize {
        let ids: Vec<u64> = self
            .tasks
            .iter()
            .filter(|(_, t)| filter.matches(&t.data))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.abort_task(*id, now, true);
        }
        ids.len()
    }

    /// Same transition as `remove`: ABORTED when running, REMOVED otherwise
    pub fn abort(&mut self, id: u64, now: DateTime<Utc>) -> Result<()> {
        if !self.tasks.contains_key(&id) {
            return Err(ProcessingError::Scheduling(format!("Task {} not found, cannot abort", id)));
        }
        self.abort_task(id, now, true);
        Ok(())
    }

    /// Replace the schedule of `source` between `start` and `end`.
    ///
    /// Fails if a task of `source` in the period has already left the
    /// SCHEDULED state.
    pub fn load(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        requests: Vec<SchedulingRequest>,
        source: &str,
        strategy: CreationConflictStrategy,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledActivityData>> {
        let in_period: Vec<u64> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.data.start_time >= start && t.data.start_time <= end)
            .map(|(id, _)| *id)
            .collect();
        let own: Vec<u64> = in_period
            .iter()
            .copied()
            .filter(|id| self.tasks.get(id).map_or(false, |t| t.data.source == source))
            .collect();
        if let Some(started) = own
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .find(|t| t.state() != SchedulingState::Scheduled)
        {
            return Err(ProcessingError::Scheduling(format!(
                "Task {} already in state {:?}, cannot replace the schedule period",
                started.data.id,
                started.state()
            )));
        }
        let conflicts: Vec<u64> = self
            .conflicts_of(&requests, now, None)
            .into_iter()
            .filter(|id| self.tasks.get(id).map_or(false, |t| t.data.source != source))
            .collect();
        if !conflicts.is_empty() && strategy == CreationConflictStrategy::Abort {
            return Err(ProcessingError::Scheduling(format!(
                "Conflict detected with scheduled tasks {:?}",
                conflicts
            )));
        }
        info!(
            "Loading {} requests from '{}' in [{}, {}], replacing {} tasks",
            requests.len(),
            source,
            start,
            end,
            own.len()
        );
        self.atomically(|core| {
            for id in &own {
                core.abort_task(*id, now, true);
            }
            let mut scheduled = Vec::new();
            for request in requests {
                if let Some(data) = core.schedule_task(request, strategy, None, now)? {
                    scheduled.push(data);
                }
            }
            Ok(scheduled)
        })
    }

    /// Re-install the latest persisted snapshots after a restart
    pub fn restore(&mut self, items: Vec<ScheduledActivityData>, now: DateTime<Utc>) {
        let mut latest: BTreeMap<u64, ScheduledActivityData> = BTreeMap::new();
        for item in items {
            match latest.get(&item.id) {
                Some(existing) if existing.sequence >= item.sequence => {}
                _ => {
                    latest.insert(item.id, item);
                }
            }
        }
        if let Some(max) = latest.keys().max() {
            self.next_id = self.next_id.max(max + 1);
        }

        // Relative tasks after the tasks they wait for
        let (mut pending, others): (Vec<_>, Vec<_>) = latest
            .into_values()
            .partition(|d| matches!(d.trigger, Trigger::Relative { .. }));
        for item in others {
            self.restore_item(item, now);
        }
        let mut stalled = 0;
        while !pending.is_empty() && stalled <= pending.len() {
            let item = pending.remove(0);
            let waits_on_pending = match &item.trigger {
                Trigger::Relative { predecessors, .. } => {
                    pending.iter().any(|p| predecessors.contains(&p.external_id))
                }
                _ => false,
            };
            if waits_on_pending {
                pending.push(item);
                stalled += 1;
            } else {
                self.restore_item(item, now);
                stalled = 0;
            }
        }
        if !pending.is_empty() {
            warn!("Cycle between restored relative-time tasks");
            for item in pending {
                self.restore_item(item, now);
            }
        }
    }

    fn restore_item(&mut self, item: ScheduledActivityData, now: DateTime<Utc>) {
        match item.state {
            SchedulingState::Scheduled if self.is_to_be_restored(&item, now) => {
                info!("Restoring scheduled task {} ({})", item.id, item.external_id);
                let id = item.id;
                let request = SchedulingRequest {
                    request: item.request.clone(),
                    resources: item.resources.clone(),
                    source: item.source.clone(),
                    external_id: item.external_id.clone(),
                    trigger: item.trigger.clone(),
                    latest_invocation_time: item.latest_invocation_time,
                    conflict_strategy: item.conflict_strategy,
                    expected_duration_ms: item.duration_ms,
                };
                self.tasks.insert(
                    id,
                    ScheduledTask {
                        request,
                        data: item,
                        resources_acquired: false,
                        starting: false,
                        last_event_fire: None,
                    },
                );
                self.arm_trigger(id, now);
            }
            SchedulingState::Scheduled | SchedulingState::Waiting | SchedulingState::Running => {
                warn!(
                    "Scheduled task {} ({}) restored in state {:?}, marked ABORTED",
                    item.id, item.external_id, item.state
                );
                let mut data = item;
                data.state = SchedulingState::Aborted;
                self.emit_data(data, now);
            }
            _ => {}
        }
    }

    fn is_to_be_restored(&self, item: &ScheduledActivityData, now: DateTime<Utc>) -> bool {
        match &item.trigger {
            Trigger::EventBased { .. } => true,
            _ if self.run_past => true,
            Trigger::Absolute { time } => *time >= now,
            // They were meant to start at once, too late now
            Trigger::Now => false,
            Trigger::Relative { predecessors, .. } => predecessors.iter().all(|p| {
                self.find_by_external_id(p)
                    .map_or(false, |id| self.tasks[&id].state() == SchedulingState::Scheduled)
            }),
        }
    }

    // ========================================================================
    // EXTERNAL STIMULI
    // ========================================================================

    /// Process due timers
    pub fn poll(&mut self, now: DateTime<Utc>) {
        for timer in self.timers.pop_due(now) {
            match timer {
                SchedulerTimer::Release(id) => self.run_task(id, now),
                SchedulerTimer::Latest(id) => {
                    if self.tasks.get(&id).map_or(false, |t| t.state() == SchedulingState::Waiting) {
                        info!("Task {} not started before its latest invocation time", id);
                        self.terminate(id, SchedulingState::Ignored, now);
                    }
                }
            }
        }
    }

    /// An event occurred; standing event-based tasks spawn an immediate task
    pub fn on_event(&mut self, event: &EntityPath, now: DateTime<Utc>) {
        if !self.enabled {
            return;
        }
        let mut spawned = Vec::new();
        for task in self.tasks.values_mut() {
            let protection_ms = match &task.request.trigger {
                Trigger::EventBased {
                    event: path,
                    protection_ms,
                    enabled: true,
                } if path == event => *protection_ms,
                _ => continue,
            };
            if task.state() != SchedulingState::Scheduled {
                continue;
            }
            if task.request.latest_invocation_time.map_or(false, |l| l <= now) {
                continue;
            }
            let protected = task
                .last_event_fire
                .map_or(false, |last| last + Duration::milliseconds(protection_ms as i64) >= now);
            if protected {
                debug!("Event {} inside protection window of task {}", event, task.data.id);
                continue;
            }
            task.last_event_fire = Some(now);
            let mut child = task.request.clone();
            child.external_id = format!("{}-{}", task.request.external_id, now.format("%Y%m%dT%H%M%S%.3f"));
            child.trigger = Trigger::Now;
            spawned.push(child);
        }
        for child in spawned {
            let external_id = child.external_id.clone();
            if let Err(e) = self.schedule(child, CreationConflictStrategy::AddAnyway, now) {
                error!("Cannot schedule event-triggered task {}: {}", external_id, e);
            }
        }
    }

    /// Progress of an activity occurrence started by the scheduler
    pub fn on_activity_update(&mut self, occurrence: &ActivityOccurrenceData, now: DateTime<Utc>) {
        let id = match self.occurrences.get(&occurrence.internal_id) {
            Some(id) => *id,
            None => return,
        };
        if occurrence.is_completed() {
            let state = if occurrence.aggregate_status() == ActivityReportState::Ok {
                SchedulingState::FinishedNominal
            } else {
                SchedulingState::FinishedFail
            };
            self.terminate(id, state, now);
        } else if let Some(task) = self.tasks.get_mut(&id) {
            let elapsed = (now - task.data.start_time).num_milliseconds().max(0) as u64;
            let duration = elapsed.max(task.request.expected_duration_ms);
            if duration != task.data.duration_ms {
                task.data.duration_ms = duration;
                self.emit(id, now);
            }
        }
    }

    /// Outcome of a start action
    pub fn on_start_result(&mut self, task_id: u64, result: Result<u64>, now: DateTime<Utc>) {
        let still_wanted = self.should_start(task_id);
        let activity_id = self.pending_starts.remove(&task_id);
        match result {
            Ok(occurrence_id) if still_wanted => {
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.starting = false;
                    task.data.activity_occurrence = Some(occurrence_id);
                }
                self.occurrences.insert(occurrence_id, task_id);
                info!("Task {} started activity occurrence {}", task_id, occurrence_id);
                self.emit(task_id, now);
            }
            Ok(occurrence_id) => {
                // Aborted while starting
                warn!("Task {} left RUNNING while starting, aborting occurrence {}", task_id, occurrence_id);
                if let Some(activity_id) = activity_id {
                    self.actions.push(SchedulerAction::Abort {
                        activity_id,
                        occurrence_id,
                    });
                }
            }
            Err(e) => {
                error!("Task {} failed to start its activity: {}", task_id, e);
                if still_wanted {
                    self.terminate(task_id, SchedulingState::FinishedFail, now);
                }
            }
        }
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    /// Run `f`; on error restore the state as it was before
    fn atomically<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let backup = self.clone();
        match f(self) {
            Ok(value) => Ok(value),
            Err(e) => {
                *self = backup;
                Err(e)
            }
        }
    }

    fn schedule_task(
        &mut self,
        request: SchedulingRequest,
        strategy: CreationConflictStrategy,
        original_id: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledActivityData>> {
        if self.find_by_external_id(&request.external_id).is_some() {
            return Err(ProcessingError::Scheduling(format!(
                "External id '{}' is already assigned to a scheduled task",
                request.external_id
            )));
        }
        if let Trigger::Relative { predecessors, .. } = &request.trigger {
            if predecessors.contains(&request.external_id) {
                return Err(ProcessingError::Scheduling(format!(
                    "Task '{}' cannot follow itself",
                    request.external_id
                )));
            }
        }

        let conflicts = self.conflicts_of(std::slice::from_ref(&request), now, None);
        if !conflicts.is_empty() {
            match strategy {
                CreationConflictStrategy::Abort => {
                    return Err(ProcessingError::Scheduling(format!(
                        "Request '{}' conflicts with scheduled tasks {:?}",
                        request.external_id, conflicts
                    )))
                }
                CreationConflictStrategy::SkipNew => {
                    info!("Request '{}' skipped, conflicts with {:?}", request.external_id, conflicts);
                    return Ok(None);
                }
                CreationConflictStrategy::RemovePrevious => {
                    for id in conflicts {
                        self.abort_task(id, now, false);
                    }
                }
                CreationConflictStrategy::AddAnyway => {}
            }
        }

        let id = match original_id {
            Some(id) => id,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                id
            }
        };
        let (start_time, duration_ms) = self.time_window(&request, now);
        let data = ScheduledActivityData {
            id,
            sequence: 0,
            generation_time: now,
            request: request.request.clone(),
            activity_occurrence: None,
            resources: request.resources.clone(),
            source: request.source.clone(),
            external_id: request.external_id.clone(),
            trigger: request.trigger.clone(),
            latest_invocation_time: request.latest_invocation_time,
            start_time,
            duration_ms,
            conflict_strategy: request.conflict_strategy,
            state: SchedulingState::Scheduled,
        };
        info!(
            "Task {} ({}) scheduled for activity {} at {}",
            id, request.external_id, request.request.id, start_time
        );
        self.tasks.insert(
            id,
            ScheduledTask {
                request,
                data,
                resources_acquired: false,
                starting: false,
                last_event_fire: None,
            },
        );
        let snapshot = self.emit(id, now);
        self.arm_trigger(id, now);
        self.update_relative_start_times(now);
        self.reevaluate(now);
        Ok(snapshot)
    }

    /// Planned start and duration of a request
    fn time_window(&self, request: &SchedulingRequest, now: DateTime<Utc>) -> (DateTime<Utc>, u64) {
        let start = match &request.trigger {
            Trigger::Now | Trigger::EventBased { .. } => now,
            Trigger::Absolute { time } => *time,
            Trigger::Relative {
                predecessors,
                delay_secs,
            } => self.predecessors_end(predecessors, now) + Duration::seconds(*delay_secs as i64),
        };
        (start, request.expected_duration_ms)
    }

    /// Latest end among predecessors still in the schedule, not before now
    fn predecessors_end(&self, predecessors: &BTreeSet<String>, now: DateTime<Utc>) -> DateTime<Utc> {
        predecessors
            .iter()
            .filter_map(|p| self.find_by_external_id(p))
            .filter_map(|id| self.tasks.get(&id))
            .map(|t| t.data.end_time())
            .fold(now, |latest, end| latest.max(end))
    }

    fn find_by_external_id(&self, external_id: &str) -> Option<u64> {
        self.tasks
            .iter()
            .find(|(_, t)| t.data.external_id == external_id)
            .map(|(id, _)| *id)
    }

    /// Tasks whose window and resources overlap one of the requests.
    /// Event-based tasks and requests never conflict.
    fn conflicts_of(&self, requests: &[SchedulingRequest], now: DateTime<Utc>, exclude: Option<u64>) -> Vec<u64> {
        let mut found = BTreeSet::new();
        for request in requests.iter().filter(|r| !r.trigger.is_event_based()) {
            let (start, duration_ms) = self.time_window(request, now);
            let end = start + Duration::milliseconds(duration_ms as i64);
            for (id, task) in &self.tasks {
                if Some(*id) == exclude || task.is_event_based() {
                    continue;
                }
                if !task.data.resources.is_disjoint(&request.resources) && task.data.overlaps_with(start, end) {
                    found.insert(*id);
                }
            }
        }
        found.into_iter().collect()
    }

    fn arm_trigger(&mut self, id: u64, now: DateTime<Utc>) {
        let trigger = match self.tasks.get(&id) {
            Some(task) if task.state() == SchedulingState::Scheduled => task.request.trigger.clone(),
            _ => return,
        };
        self.timers.cancel(&SchedulerTimer::Release(id));
        match trigger {
            Trigger::Now => self.timers.schedule(now, SchedulerTimer::Release(id)),
            Trigger::Absolute { time } => self.timers.schedule(time, SchedulerTimer::Release(id)),
            Trigger::Relative {
                predecessors,
                delay_secs,
            } => {
                if predecessors.iter().all(|p| self.find_by_external_id(p).is_none()) {
                    let release = now + Duration::seconds(delay_secs as i64);
                    self.timers.schedule(release, SchedulerTimer::Release(id));
                    let moved = match self.tasks.get_mut(&id) {
                        Some(task) if task.data.start_time != release => {
                            task.data.start_time = release;
                            true
                        }
                        _ => false,
                    };
                    if moved {
                        self.emit(id, now);
                    }
                }
            }
            Trigger::EventBased { .. } => {}
        }
    }

    /// Relative tasks whose predecessors changed get a new planned start
    fn update_relative_start_times(&mut self, now: DateTime<Utc>) {
        for _ in 0..=self.tasks.len() {
            let mut changed = Vec::new();
            for (id, task) in &self.tasks {
                if task.state() != SchedulingState::Scheduled {
                    continue;
                }
                if let Trigger::Relative { .. } = task.request.trigger {
                    let (start, _) = self.time_window(&task.request, now);
                    if start != task.data.start_time && !self.timers.contains(&SchedulerTimer::Release(*id)) {
                        changed.push((*id, start));
                    }
                }
            }
            if changed.is_empty() {
                return;
            }
            for (id, start) in changed {
                if let Some(task) = self.tasks.get_mut(&id) {
                    task.data.start_time = start;
                }
                self.emit(id, now);
            }
        }
    }

    /// The trigger of a task fired
    fn run_task(&mut self, id: u64, now: DateTime<Utc>) {
        let strategy = match self.tasks.get(&id) {
            Some(task) if matches!(task.state(), SchedulingState::Scheduled | SchedulingState::Waiting) => {
                task.request.conflict_strategy
            }
            _ => return,
        };
        if self.try_acquire(id) {
            self.start_or_disable(id, now);
            return;
        }
        match strategy {
            ConflictStrategy::Wait => self.wait_or_ignore(id, now),
            ConflictStrategy::DoNotStartAndForget => {
                info!("Task {} resources busy, not started", id);
                self.terminate(id, SchedulingState::Ignored, now);
            }
            ConflictStrategy::AbortOtherAndStart => {
                for holder in self.holders_for(id) {
                    info!("Task {} aborts task {} to take its resources", id, holder);
                    self.abort_task(holder, now, false);
                }
                if self.try_acquire(id) {
                    self.start_or_disable(id, now);
                } else {
                    self.wait_or_ignore(id, now);
                }
                self.reevaluate(now);
            }
        }
    }

    fn holders_for(&self, id: u64) -> Vec<u64> {
        let mut holders: Vec<u64> = match self.tasks.get(&id) {
            Some(task) => task
                .request
                .resources
                .iter()
                .filter_map(|r| self.held.get(r).copied())
                .filter(|h| *h != id)
                .collect(),
            None => Vec::new(),
        };
        holders.sort_unstable();
        holders.dedup();
        holders
    }

    fn try_acquire(&mut self, id: u64) -> bool {
        let resources = match self.tasks.get(&id) {
            Some(task) if task.resources_acquired => return true,
            Some(task) => task.request.resources.clone(),
            None => return false,
        };
        if resources.iter().any(|r| self.held.get(r).map_or(false, |h| *h != id)) {
            return false;
        }
        for resource in resources {
            self.held.insert(resource, id);
        }
        if let Some(task) = self.tasks.get_mut(&id) {
            task.resources_acquired = true;
        }
        true
    }

    fn release(&mut self, id: u64) {
        if let Some(task) = self.tasks.get_mut(&id) {
            if task.resources_acquired {
                task.resources_acquired = false;
                self.held.retain(|_, holder| *holder != id);
            }
        }
    }

    fn start_or_disable(&mut self, id: u64, now: DateTime<Utc>) {
        if !self.enabled {
            info!("Scheduler disabled, task {} not started", id);
            self.terminate(id, SchedulingState::Disabled, now);
            return;
        }
        self.timers.cancel(&SchedulerTimer::Latest(id));
        let request = match self.tasks.get_mut(&id) {
            Some(task) => {
                task.data.state = SchedulingState::Running;
                task.data.start_time = now;
                task.starting = true;
                task.request.request.clone()
            }
            None => return,
        };
        info!("Task {} RUNNING, starting activity {}", id, request.id);
        self.pending_starts.insert(id, request.id);
        self.emit(id, now);
        self.actions.push(SchedulerAction::Start { task_id: id, request });
    }

    fn wait_or_ignore(&mut self, id: u64, now: DateTime<Utc>) {
        let (latest, state) = match self.tasks.get(&id) {
            Some(task) => (task.request.latest_invocation_time, task.state()),
            None => return,
        };
        if latest.map_or(false, |l| l <= now) {
            info!("Task {} resources busy at its last possible invocation", id);
            self.terminate(id, SchedulingState::Ignored, now);
            return;
        }
        if state != SchedulingState::Waiting {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.data.state = SchedulingState::Waiting;
            }
            info!("Task {} WAITING for resources", id);
            self.emit(id, now);
        }
        if let Some(latest) = latest {
            self.timers.schedule(latest, SchedulerTimer::Latest(id));
        }
    }

    /// Running tasks become ABORTED (their activity is aborted), scheduled
    /// and waiting ones REMOVED
    fn abort_task(&mut self, id: u64, now: DateTime<Utc>, reevaluate: bool) {
        let (state, occurrence, activity_id) = match self.tasks.get(&id) {
            Some(task) => (task.state(), task.data.activity_occurrence, task.request.request.id),
            None => return,
        };
        let target = if state == SchedulingState::Running {
            if let Some(occurrence_id) = occurrence {
                self.actions.push(SchedulerAction::Abort {
                    activity_id,
                    occurrence_id,
                });
            }
            SchedulingState::Aborted
        } else {
            SchedulingState::Removed
        };
        self.finish(id, target, now);
        if reevaluate {
            self.reevaluate(now);
        }
    }

    fn terminate(&mut self, id: u64, state: SchedulingState, now: DateTime<Utc>) {
        self.finish(id, state, now);
        self.reevaluate(now);
    }

    /// Final transition: release everything the task holds and emit it
    fn finish(&mut self, id: u64, state: SchedulingState, now: DateTime<Utc>) {
        self.release(id);
        self.timers.cancel(&SchedulerTimer::Release(id));
        self.timers.cancel(&SchedulerTimer::Latest(id));
        let mut task = match self.tasks.remove(&id) {
            Some(task) => task,
            None => return,
        };
        if let Some(occurrence) = task.data.activity_occurrence {
            self.occurrences.remove(&occurrence);
        }
        if task.data.state == SchedulingState::Running {
            task.data.duration_ms = (now - task.data.start_time).num_milliseconds().max(0) as u64;
        }
        info!("Task {} ({}) {:?}", id, task.data.external_id, state);
        task.data.state = state;
        self.emit_data(task.data, now);
    }

    /// Retry waiting tasks and release relative tasks whose predecessors
    /// have all left the schedule
    fn reevaluate(&mut self, now: DateTime<Utc>) {
        let waiting: Vec<u64> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.state() == SchedulingState::Waiting)
            .map(|(id, _)| *id)
            .collect();
        for id in waiting {
            if self.tasks.contains_key(&id) && self.try_acquire(id) {
                self.start_or_disable(id, now);
            }
        }
        let relative: Vec<u64> = self
            .tasks
            .iter()
            .filter(|(id, t)| {
                t.state() == SchedulingState::Scheduled
                    && matches!(t.request.trigger, Trigger::Relative { .. })
                    && !self.timers.contains(&SchedulerTimer::Release(**id))
            })
            .map(|(id, _)| *id)
            .collect();
        for id in relative {
            self.arm_trigger(id, now);
        }
        self.update_relative_start_times(now);
    }

    fn emit(&mut self, id: u64, now: DateTime<Utc>) -> Option<ScheduledActivityData> {
        let sequence = self.sequencer.next(DataKind::ScheduledActivity);
        let task = self.tasks.get_mut(&id)?;
        task.data.sequence = sequence;
        task.data.generation_time = now;
        let data = task.data.clone();
        self.updates.push(data.clone());
        Some(data)
    }

    fn emit_data(&mut self, mut data: ScheduledActivityData, now: DateTime<Utc>) {
        data.sequence = self.sequencer.next(DataKind::ScheduledActivity);
        data.generation_time = now;
        self.updates.push(data);
    }
}
