// src/filter.rs - Filters over data items and scheduled activities
//
// An empty criterion matches everything; a filter matches an item when
// every non-empty criterion does.

use crate::data::{AlarmState, DataItem, Validity};
use crate::path::EntityPath;
use crate::scheduler::{ScheduledActivityData, SchedulingState};
use crate::sequencer::DataKind;
use crate::subscription::{Filter, Sequenced};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

impl Sequenced for DataItem {
    type Key = (DataKind, i64);

    fn stream_key(&self) -> Self::Key {
        DataItem::stream_key(self)
    }

    fn sequence(&self) -> u64 {
        DataItem::sequence(self)
    }
}

impl Sequenced for ScheduledActivityData {
    type Key = u64;

    fn stream_key(&self) -> u64 {
        self.id
    }

    fn sequence(&self) -> u64 {
        self.sequence
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataItemFilter {
    /// Matches the path itself and everything below it
    pub paths: Vec<EntityPath>,
    pub kinds: BTreeSet<DataKind>,
    pub alarm_states: BTreeSet<AlarmState>,
    pub routes: BTreeSet<String>,
    pub validity: BTreeSet<Validity>,
    pub external_ids: BTreeSet<i32>,
}

impl DataItemFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_path(mut self, path: impl Into<EntityPath>) -> Self {
        self.paths.push(path.into());
        self
    }

    pub fn with_kind(mut self, kind: DataKind) -> Self {
        self.kinds.insert(kind);
        self
    }

    pub fn with_alarm_state(mut self, state: AlarmState) -> Self {
        self.alarm_states.insert(state);
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.routes.insert(route.into());
        self
    }

    pub fn with_validity(mut self, validity: Validity) -> Self {
        self.validity.insert(validity);
        self
    }

    pub fn with_external_id(mut self, id: i32) -> Self {
        self.external_ids.insert(id);
        self
    }

    pub fn matches_path(&self, path: &EntityPath) -> bool {
        self.paths.is_empty() || self.paths.iter().any(|p| path == p || path.is_descendant_of(p))
    }
}

fn alarm_state_of(item: &DataItem) -> Option<AlarmState> {
    match item {
        DataItem::Parameter(d) => Some(d.alarm_state),
        DataItem::Alarm(d) => Some(d.current_alarm_state),
        DataItem::SystemEntity(d) => Some(d.alarm_state),
        DataItem::Event(_) | DataItem::ActivityOccurrence(_) => None,
    }
}

fn validity_of(item: &DataItem) -> Option<Validity> {
    item.as_parameter().map(|p| p.validity)
}

impl Filter<DataItem> for DataItemFilter {
    fn matches(&self, item: &DataItem) -> bool {
        if !self.matches_path(item.path()) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&item.kind()) {
            return false;
        }
        if !self.external_ids.is_empty() && !self.external_ids.contains(&item.external_id()) {
            return false;
        }
        if !self.alarm_states.is_empty()
            && !alarm_state_of(item).map_or(false, |s| self.alarm_states.contains(&s))
        {
            return false;
        }
        if !self.routes.is_empty() && !item.route().map_or(false, |r| self.routes.contains(r)) {
            return false;
        }
        if !self.validity.is_empty() && !validity_of(item).map_or(false, |v| self.validity.contains(&v)) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduledActivityDataFilter {
    pub sources: BTreeSet<String>,
    pub states: BTreeSet<SchedulingState>,
    /// Matches tasks declaring at least one of the resources
    pub resources: BTreeSet<String>,
    pub external_ids: BTreeSet<String>,
}

impl ScheduledActivityDataFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.sources.insert(source.into());
        self
    }

    pub fn with_state(mut self, state: SchedulingState) -> Self {
        self.states.insert(state);
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resources.insert(resource.into());
        self
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_ids.insert(external_id.into());
        self
    }
}

impl Filter<ScheduledActivityData> for ScheduledActivityDataFilter {
    fn matches(&self, item: &ScheduledActivityData) -> bool {
        (self.sources.is_empty() || self.sources.contains(&item.source))
            && (self.states.is_empty() || self.states.contains(&item.state))
            && (self.resources.is_empty() || !self.resources.is_disjoint(&item.resources))
            && (self.external_ids.is_empty() || self.external_ids.contains(&item.external_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{EntityType, ParameterData, Status, SystemEntity};
    use crate::input::ActivityRequest;
    use crate::scheduler::{ConflictStrategy, Trigger};
    use crate::value::Value;
    use chrono::Utc;
    use std::sync::Arc;

    fn parameter(path: &str, alarm: AlarmState, validity: Validity) -> DataItem {
        DataItem::Parameter(Arc::new(ParameterData {
            internal_id: 1,
            external_id: 10,
            path: EntityPath::new(path),
            generation_time: Utc::now(),
            reception_time: Utc::now(),
            source_value: Some(Value::Int(1)),
            eng_value: Some(Value::Int(1)),
            validity,
            alarm_state: alarm,
            route: Some("TM".into()),
            raw_data_container_id: None,
        }))
    }

    #[test]
    fn data_item_filter_criteria() {
        let item = parameter("SAT.AOCS.GYRO", AlarmState::Warning, Validity::Valid);

        assert!(DataItemFilter::all().matches(&item));
        assert!(DataItemFilter::all().with_path("SAT.AOCS").matches(&item));
        assert!(DataItemFilter::all().with_path("SAT.AOCS.GYRO").matches(&item));
        assert!(!DataItemFilter::all().with_path("SAT.POWER").matches(&item));
        assert!(!DataItemFilter::all().with_path("SAT.AOC").matches(&item));
        assert!(DataItemFilter::all().with_alarm_state(AlarmState::Warning).matches(&item));
        assert!(!DataItemFilter::all().with_alarm_state(AlarmState::Alarm).matches(&item));
        assert!(DataItemFilter::all().with_route("TM").matches(&item));
        assert!(!DataItemFilter::all().with_validity(Validity::Invalid).matches(&item));
        assert!(!DataItemFilter::all().with_kind(DataKind::Event).matches(&item));
        assert!(DataItemFilter::all().with_external_id(10).matches(&item));
    }

    #[test]
    fn system_entities_have_no_route_or_validity() {
        let item = DataItem::SystemEntity(Arc::new(SystemEntity {
            internal_id: 1,
            external_id: 3,
            path: EntityPath::new("SAT"),
            entity_type: EntityType::Container,
            status: Status::Enabled,
            alarm_state: AlarmState::Nominal,
            generation_time: Utc::now(),
        }));
        assert!(DataItemFilter::all().with_alarm_state(AlarmState::Nominal).matches(&item));
        assert!(!DataItemFilter::all().with_route("TM").matches(&item));
        assert!(!DataItemFilter::all().with_validity(Validity::Valid).matches(&item));
    }

    #[test]
    fn scheduled_filter_matches_any_resource() {
        let data = ScheduledActivityData {
            id: 1,
            sequence: 1,
            generation_time: Utc::now(),
            request: ActivityRequest::new(100, "planner"),
            activity_occurrence: None,
            resources: ["ANTENNA".to_string(), "POWER".to_string()].into_iter().collect(),
            source: "planner".into(),
            external_id: "A".into(),
            trigger: Trigger::Now,
            latest_invocation_time: None,
            start_time: Utc::now(),
            duration_ms: 0,
            conflict_strategy: ConflictStrategy::Wait,
            state: SchedulingState::Scheduled,
        };
        assert!(ScheduledActivityDataFilter::all().with_resource("POWER").matches(&data));
        assert!(!ScheduledActivityDataFilter::all().with_resource("RF").matches(&data));
        assert!(ScheduledActivityDataFilter::all()
            .with_state(SchedulingState::Scheduled)
            .with_source("planner")
            .matches(&data));
        assert!(!ScheduledActivityDataFilter::all().with_source("ops").matches(&data));
    }
}
