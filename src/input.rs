// src/input.rs - Inputs accepted by the processing model
//
// Producers outside the core (decoders, drivers, operators, the scheduler)
// hand these values to the model; the model wraps them into operations.

use crate::data::{ActivityOccurrenceState, ActivityReportState};
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// New raw value for a parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSample {
    pub id: i32,
    pub generation_time: DateTime<Utc>,
    pub reception_time: DateTime<Utc>,
    pub value: Value,
    #[serde(default)]
    pub container_id: Option<u64>,
    #[serde(default)]
    pub route: Option<String>,
}

impl ParameterSample {
    pub fn new(id: i32, value: impl Into<Value>, time: DateTime<Utc>) -> Self {
        Self {
            id,
            generation_time: time,
            reception_time: time,
            value: value.into(),
            container_id: None,
            route: None,
        }
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_reception_time(mut self, time: DateTime<Utc>) -> Self {
        self.reception_time = time;
        self
    }
}

/// Occurrence of an event, injected from outside or raised by a trigger
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventOccurrence {
    pub id: i32,
    #[serde(default)]
    pub generation_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reception_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub container_id: Option<u64>,
    #[serde(default)]
    pub qualifier: Option<String>,
    #[serde(default)]
    pub report: Option<Value>,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

impl EventOccurrence {
    pub fn new(id: i32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.generation_time = Some(time);
        self.reception_time = Some(time);
        self
    }

    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = Some(qualifier.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_report(mut self, report: impl Into<Value>) -> Self {
        self.report = Some(report.into());
        self
    }
}

/// Argument of an activity request.
///
/// An engineering value is decalibrated to raw before it reaches the
/// handler; a raw value is only converted to the declared raw type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityArgument {
    pub name: String,
    pub value: Value,
    #[serde(default)]
    pub engineering: bool,
}

impl ActivityArgument {
    pub fn raw(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            engineering: false,
        }
    }

    pub fn eng(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            engineering: true,
        }
    }
}

/// Request to invoke an activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRequest {
    pub id: i32,
    #[serde(default)]
    pub arguments: Vec<ActivityArgument>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Route to forward the occurrence on; the activity's default route
    /// is used when empty
    #[serde(default)]
    pub route: Option<String>,
    pub source: String,
}

impl ActivityRequest {
    pub fn new(id: i32, source: impl Into<String>) -> Self {
        Self {
            id,
            arguments: Vec::new(),
            properties: BTreeMap::new(),
            route: None,
            source: source.into(),
        }
    }

    pub fn with_argument(mut self, argument: ActivityArgument) -> Self {
        self.arguments.push(argument);
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Progress of one activity occurrence, reported by its handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityProgress {
    pub activity_id: i32,
    pub occurrence_id: u64,
    pub name: String,
    pub generation_time: DateTime<Utc>,
    pub state: ActivityOccurrenceState,
    #[serde(default)]
    pub execution_time: Option<DateTime<Utc>>,
    pub status: ActivityReportState,
    pub next_state: ActivityOccurrenceState,
    #[serde(default)]
    pub result: Option<Value>,
}

impl ActivityProgress {
    pub fn new(
        activity_id: i32,
        occurrence_id: u64,
        name: impl Into<String>,
        generation_time: DateTime<Utc>,
        state: ActivityOccurrenceState,
        status: ActivityReportState,
        next_state: ActivityOccurrenceState,
    ) -> Self {
        Self {
            activity_id,
            occurrence_id,
            name: name.into(),
            generation_time,
            state,
            execution_time: None,
            status,
            next_state,
            result: None,
        }
    }

    pub fn with_result(mut self, result: impl Into<Value>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn with_execution_time(mut self, time: DateTime<Utc>) -> Self {
        self.execution_time = Some(time);
        self
    }
}
