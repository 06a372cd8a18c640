// src/data.rs - Immutable snapshots produced by the processing model
//
// Every snapshot is built by exactly one processor, stamped with an id from
// the sequencer and never mutated afterwards. Snapshots cross thread
// boundaries inside `Arc`s wrapped by `DataItem`.

use crate::path::EntityPath;
use crate::sequencer::DataKind;
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// ============================================================================
// ENUMERATIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Parameter,
    Event,
    Activity,
    Container,
}

/// Administrative status of a system entity.
///
/// Ordered from best to worst, so the worst of a set is its maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Enabled,
    Ignored,
    Disabled,
}

/// Alarm state of a parameter, or roll-up alarm state of any entity.
///
/// Ordered from worst to best, so the worst of a set is its minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmState {
    Alarm,
    Error,
    Warning,
    Violated,
    Unknown,
    NotApplicable,
    NotChecked,
    Ignored,
    Nominal,
}

impl AlarmState {
    pub fn worst(self, other: AlarmState) -> AlarmState {
        self.min(other)
    }

    /// States that signal an operator-relevant anomaly
    pub fn is_alarm(&self) -> bool {
        matches!(self, AlarmState::Alarm | AlarmState::Error | AlarmState::Warning)
    }

    pub fn is_nominal(&self) -> bool {
        matches!(self, AlarmState::Nominal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Validity {
    Valid,
    Invalid,
    Disabled,
    Error,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Alarm,
    Error,
    Warning,
    #[default]
    Info,
    None,
}

/// Life-cycle phase of an activity occurrence, in forward order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityOccurrenceState {
    Creation,
    Release,
    Transmission,
    Scheduling,
    Execution,
    Verification,
    Completion,
}

impl ActivityOccurrenceState {
    pub fn label(&self) -> &'static str {
        match self {
            ActivityOccurrenceState::Creation => "Creation",
            ActivityOccurrenceState::Release => "Release",
            ActivityOccurrenceState::Transmission => "Transmission",
            ActivityOccurrenceState::Scheduling => "Scheduling",
            ActivityOccurrenceState::Execution => "Execution",
            ActivityOccurrenceState::Verification => "Verification",
            ActivityOccurrenceState::Completion => "Completion",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityReportState {
    Ok,
    Pending,
    Expected,
    Timeout,
    Fail,
    Fatal,
    Error,
    Unknown,
}

impl ActivityReportState {
    /// Severity of a failed report, 0 for anything that is not a failure
    pub fn failure_rank(self) -> u8 {
        match self {
            ActivityReportState::Fatal => 4,
            ActivityReportState::Error => 3,
            ActivityReportState::Fail => 2,
            ActivityReportState::Timeout => 1,
            _ => 0,
        }
    }
}

// ============================================================================
// SNAPSHOTS
// ============================================================================

/// One node of the monitored system tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEntity {
    pub internal_id: u64,
    pub external_id: i32,
    pub path: EntityPath,
    pub entity_type: EntityType,
    pub status: Status,
    pub alarm_state: AlarmState,
    pub generation_time: DateTime<Utc>,
}

impl SystemEntity {
    pub fn name(&self) -> &str {
        self.path.last_element()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterData {
    pub internal_id: u64,
    pub external_id: i32,
    pub path: EntityPath,
    pub generation_time: DateTime<Utc>,
    pub reception_time: DateTime<Utc>,
    pub source_value: Option<Value>,
    pub eng_value: Option<Value>,
    pub validity: Validity,
    pub alarm_state: AlarmState,
    pub route: Option<String>,
    pub raw_data_container_id: Option<u64>,
}

/// Produced when a parameter enters, leaves or changes an alarm condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmParameterData {
    pub internal_id: u64,
    pub external_id: i32,
    pub path: EntityPath,
    pub generation_time: DateTime<Utc>,
    pub reception_time: DateTime<Utc>,
    pub current_alarm_state: AlarmState,
    pub previous_alarm_state: AlarmState,
    pub current_value: Option<Value>,
    pub last_nominal_value: Option<Value>,
    pub last_nominal_value_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub internal_id: u64,
    pub external_id: i32,
    pub path: EntityPath,
    pub generation_time: DateTime<Utc>,
    pub reception_time: DateTime<Utc>,
    pub qualifier: Option<String>,
    pub event_type: String,
    pub severity: Severity,
    pub route: Option<String>,
    pub source: Option<String>,
    pub report: Option<Value>,
    pub raw_data_container_id: Option<u64>,
}

pub const CREATION_REPORT_NAME: &str = "Creation";
pub const FORWARDING_REPORT_NAME: &str = "Forwarding to Activity Handler";
pub const VERIFICATION_REPORT_NAME: &str = "Verification";
pub const PURGE_REPORT_NAME: &str = "Purged";

/// One immutable life-cycle event of an activity occurrence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityOccurrenceReport {
    pub internal_id: u64,
    pub generation_time: DateTime<Utc>,
    pub name: String,
    /// Phase the report refers to
    pub state: ActivityOccurrenceState,
    pub execution_time: Option<DateTime<Utc>>,
    pub status: ActivityReportState,
    /// Phase after this report
    pub state_transition: ActivityOccurrenceState,
    pub result: Option<Value>,
}

/// One invocation of an activity with its append-only report list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityOccurrenceData {
    pub internal_id: u64,
    pub generation_time: DateTime<Utc>,
    pub external_id: i32,
    pub name: String,
    pub path: EntityPath,
    pub activity_type: String,
    pub arguments: BTreeMap<String, Value>,
    pub properties: BTreeMap<String, String>,
    pub progress_reports: Vec<ActivityOccurrenceReport>,
    pub route: String,
    pub source: String,
}

impl ActivityOccurrenceData {
    /// Phase reached after the most recent report
    pub fn current_state(&self) -> ActivityOccurrenceState {
        self.progress_reports
            .last()
            .map(|r| r.state_transition)
            .unwrap_or(ActivityOccurrenceState::Creation)
    }

    pub fn execution_time(&self) -> Option<DateTime<Utc>> {
        self.progress_reports.iter().rev().find_map(|r| r.execution_time)
    }

    pub fn result(&self) -> Option<&Value> {
        self.progress_reports.iter().rev().find_map(|r| r.result.as_ref())
    }

    pub fn is_completed(&self) -> bool {
        self.current_state() == ActivityOccurrenceState::Completion
    }

    /// Overall outcome: the worst failure reported so far, otherwise the
    /// status of the last report.
    pub fn aggregate_status(&self) -> ActivityReportState {
        self.progress_reports
            .iter()
            .map(|r| r.status)
            .filter(|s| s.failure_rank() > 0)
            .max_by_key(|s| s.failure_rank())
            .or_else(|| self.progress_reports.last().map(|r| r.status))
            .unwrap_or(ActivityReportState::Unknown)
    }

    /// Sequence of this snapshot: the id of its most recent report
    pub fn sequence(&self) -> u64 {
        self.progress_reports
            .last()
            .map(|r| r.internal_id)
            .unwrap_or(0)
    }
}

// ============================================================================
// DATA ITEM
// ============================================================================

/// Any snapshot produced by a processing batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum DataItem {
    Parameter(Arc<ParameterData>),
    Alarm(Arc<AlarmParameterData>),
    Event(Arc<EventData>),
    ActivityOccurrence(Arc<ActivityOccurrenceData>),
    SystemEntity(Arc<SystemEntity>),
}

impl DataItem {
    pub fn kind(&self) -> DataKind {
        match self {
            DataItem::Parameter(_) => DataKind::Parameter,
            DataItem::Alarm(_) => DataKind::Alarm,
            DataItem::Event(_) => DataKind::Event,
            DataItem::ActivityOccurrence(_) => DataKind::ActivityOccurrence,
            DataItem::SystemEntity(_) => DataKind::SystemEntity,
        }
    }

    /// Monotonic sequence of the snapshot within its kind
    pub fn sequence(&self) -> u64 {
        match self {
            DataItem::Parameter(d) => d.internal_id,
            DataItem::Alarm(d) => d.internal_id,
            DataItem::Event(d) => d.internal_id,
            DataItem::ActivityOccurrence(d) => d.sequence(),
            DataItem::SystemEntity(d) => d.internal_id,
        }
    }

    /// Key of the stream the snapshot belongs to: the entity, or the
    /// occurrence for activity snapshots
    pub fn stream_key(&self) -> (DataKind, i64) {
        match self {
            DataItem::ActivityOccurrence(d) => (DataKind::ActivityOccurrence, d.internal_id as i64),
            other => (other.kind(), other.external_id() as i64),
        }
    }

    pub fn external_id(&self) -> i32 {
        match self {
            DataItem::Parameter(d) => d.external_id,
            DataItem::Alarm(d) => d.external_id,
            DataItem::Event(d) => d.external_id,
            DataItem::ActivityOccurrence(d) => d.external_id,
            DataItem::SystemEntity(d) => d.external_id,
        }
    }

    pub fn path(&self) -> &EntityPath {
        match self {
            DataItem::Parameter(d) => &d.path,
            DataItem::Alarm(d) => &d.path,
            DataItem::Event(d) => &d.path,
            DataItem::ActivityOccurrence(d) => &d.path,
            DataItem::SystemEntity(d) => &d.path,
        }
    }

    pub fn generation_time(&self) -> DateTime<Utc> {
        match self {
            DataItem::Parameter(d) => d.generation_time,
            DataItem::Alarm(d) => d.generation_time,
            DataItem::Event(d) => d.generation_time,
            DataItem::ActivityOccurrence(d) => d
                .progress_reports
                .last()
                .map(|r| r.generation_time)
                .unwrap_or(d.generation_time),
            DataItem::SystemEntity(d) => d.generation_time,
        }
    }

    pub fn route(&self) -> Option<&str> {
        match self {
            DataItem::Parameter(d) => d.route.as_deref(),
            DataItem::Event(d) => d.route.as_deref(),
            DataItem::ActivityOccurrence(d) => Some(d.route.as_str()),
            _ => None,
        }
    }

    pub fn as_parameter(&self) -> Option<&Arc<ParameterData>> {
        match self {
            DataItem::Parameter(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_event(&self) -> Option<&Arc<EventData>> {
        match self {
            DataItem::Event(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_activity_occurrence(&self) -> Option<&Arc<ActivityOccurrenceData>> {
        match self {
            DataItem::ActivityOccurrence(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_system_entity(&self) -> Option<&Arc<SystemEntity>> {
        match self {
            DataItem::SystemEntity(d) => Some(d),
            _ => None,
        }
    }
}
