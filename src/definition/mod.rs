// src/definition/mod.rs - Static processing definition
//
// The definition describes every parameter, event and activity of the
// monitored system. Containers are not declared: they are derived from the
// path prefixes of the declared entities when the graph is built.

use crate::data::Severity;
use crate::error::{ProcessingError, Result};
use crate::path::EntityPath;
use crate::value::{Value, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

pub mod calibration;
pub mod check;
pub mod expression;

pub use calibration::{calibrate, CalibrationDefinition, CalibrationKind, EnumPoint, XyPoint};
pub use check::{CheckDefinition, CheckKind, CheckSeverity, CheckState};
pub use expression::{
    BindingResolver, Comparison, Expression, ExpressionDefinition, RefField, ScopedResolver,
};

// ============================================================================
// PROCESSING DEFINITION
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingDefinition {
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,
    #[serde(default)]
    pub events: Vec<EventDefinition>,
    #[serde(default)]
    pub activities: Vec<ActivityDefinition>,
}

impl ProcessingDefinition {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let def: ProcessingDefinition = serde_yaml::from_str(yaml)?;
        def.validate()?;
        Ok(def)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Append the entities of `other`
    pub fn merge(&mut self, other: ProcessingDefinition) {
        self.parameters.extend(other.parameters);
        self.events.extend(other.events);
        self.activities.extend(other.activities);
    }

    /// Check identities and cross references.
    ///
    /// Dependency cycles are detected later, when the graph is built.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        let mut paths = HashSet::new();
        let identities = self
            .parameters
            .iter()
            .map(|p| (p.id, &p.path))
            .chain(self.events.iter().map(|e| (e.id, &e.path)))
            .chain(self.activities.iter().map(|a| (a.id, &a.path)));

        for (id, path) in identities {
            if id <= 0 {
                return Err(ProcessingError::Config(format!(
                    "Entity {} must have a positive id, got {}",
                    path, id
                )));
            }
            if !path.is_valid() {
                return Err(ProcessingError::Config(format!("Invalid entity path '{}'", path)));
            }
            if !ids.insert(id) {
                return Err(ProcessingError::Config(format!("Duplicate entity id {}", id)));
            }
            if !paths.insert(path.clone()) {
                return Err(ProcessingError::Config(format!("Duplicate entity path {}", path)));
            }
        }

        let event_ids: HashSet<i32> = self.events.iter().map(|e| e.id).collect();
        for param in &self.parameters {
            for trigger in &param.triggers {
                if !event_ids.contains(&trigger.event) {
                    return Err(ProcessingError::Config(format!(
                        "Parameter {} triggers unknown event {}",
                        param.path, trigger.event
                    )));
                }
            }
        }

        for activity in &self.activities {
            let mut names = HashSet::new();
            for arg in &activity.arguments {
                if !names.insert(arg.name.as_str()) {
                    return Err(ProcessingError::Config(format!(
                        "Activity {} declares argument '{}' twice",
                        activity.path, arg.name
                    )));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// PARAMETERS
// ============================================================================

fn default_value_type() -> ValueType {
    ValueType::Float
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerCondition {
    OnNewSample,
    OnAlarmRaised,
    OnBackToNominal,
    OnValueChange,
}

/// Event raised by a parameter when `condition` holds after processing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterTrigger {
    pub event: i32,
    pub condition: TriggerCondition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub id: i32,
    pub path: EntityPath,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_value_type")]
    pub raw_type: ValueType,
    #[serde(default = "default_value_type")]
    pub eng_type: ValueType,
    #[serde(default)]
    pub unit: Option<String>,
    /// Synthetic parameters are computed from this expression and reject
    /// injected samples
    #[serde(default)]
    pub expression: Option<ExpressionDefinition>,
    #[serde(default)]
    pub validity: Option<ExpressionDefinition>,
    #[serde(default)]
    pub calibrations: Vec<CalibrationDefinition>,
    #[serde(default)]
    pub checks: Vec<CheckDefinition>,
    #[serde(default)]
    pub triggers: Vec<ParameterTrigger>,
}

impl ParameterDefinition {
    pub fn new(id: i32, path: impl Into<EntityPath>) -> Self {
        Self {
            id,
            path: path.into(),
            description: String::new(),
            raw_type: ValueType::Float,
            eng_type: ValueType::Float,
            unit: None,
            expression: None,
            validity: None,
            calibrations: Vec::new(),
            checks: Vec::new(),
            triggers: Vec::new(),
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.expression.is_some()
    }

    /// Every expression of the definition, for dependency extraction
    pub fn expressions(&self) -> Vec<&ExpressionDefinition> {
        let mut out: Vec<&ExpressionDefinition> = Vec::new();
        out.extend(self.expression.iter());
        out.extend(self.validity.iter());
        for cal in &self.calibrations {
            out.extend(cal.applicability.iter());
            if let CalibrationKind::Expression { expression } = &cal.kind {
                out.push(expression);
            }
        }
        for check in &self.checks {
            out.extend(check.applicability.iter());
            if let CheckKind::Expression { expression } = &check.kind {
                out.push(expression);
            }
        }
        out
    }
}

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDefinition {
    pub id: i32,
    pub path: EntityPath,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub event_type: String,
    /// Condition mode: raised on each false to true transition. Without a
    /// condition the event is raised by occurrences.
    #[serde(default)]
    pub condition: Option<ExpressionDefinition>,
    #[serde(default)]
    pub inhibition_period_ms: u64,
}

impl EventDefinition {
    pub fn new(id: i32, path: impl Into<EntityPath>) -> Self {
        Self {
            id,
            path: path.into(),
            description: String::new(),
            severity: Severity::Info,
            event_type: String::new(),
            condition: None,
            inhibition_period_ms: 0,
        }
    }
}

// ============================================================================
// ACTIVITIES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentDefinition {
    pub name: String,
    #[serde(default = "default_value_type")]
    pub raw_type: ValueType,
    #[serde(default = "default_value_type")]
    pub eng_type: ValueType,
    /// Value used when the request omits the argument
    #[serde(default)]
    pub default_value: Option<Value>,
    /// A fixed argument always takes its default value
    #[serde(default)]
    pub fixed: bool,
    #[serde(default)]
    pub decalibration: Option<CalibrationDefinition>,
}

impl ArgumentDefinition {
    pub fn new(name: impl Into<String>, raw_type: ValueType) -> Self {
        Self {
            name: name.into(),
            raw_type,
            eng_type: raw_type,
            default_value: None,
            fixed: false,
            decalibration: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityDefinition {
    pub id: i32,
    pub path: EntityPath,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub activity_type: String,
    #[serde(default)]
    pub default_route: Option<String>,
    #[serde(default)]
    pub arguments: Vec<ArgumentDefinition>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub transmission_timeout_secs: u64,
    #[serde(default)]
    pub execution_timeout_secs: u64,
    #[serde(default)]
    pub verification_timeout_secs: u64,
    #[serde(default)]
    pub verification: Option<ExpressionDefinition>,
    #[serde(default)]
    pub expected_duration_ms: u64,
}

impl ActivityDefinition {
    pub fn new(id: i32, path: impl Into<EntityPath>, activity_type: impl Into<String>) -> Self {
        Self {
            id,
            path: path.into(),
            description: String::new(),
            activity_type: activity_type.into(),
            default_route: None,
            arguments: Vec::new(),
            properties: BTreeMap::new(),
            transmission_timeout_secs: 0,
            execution_timeout_secs: 0,
            verification_timeout_secs: 0,
            verification: None,
            expected_duration_ms: 0,
        }
    }

    pub fn argument(&self, name: &str) -> Option<&ArgumentDefinition> {
        self.arguments.iter().find(|a| a.name == name)
    }
}

/// Serialisable description of one entity, as returned by descriptor queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityDescriptor {
    Parameter(ParameterDefinition),
    Event(EventDefinition),
    Activity(ActivityDefinition),
    Container { id: i32, path: EntityPath, children: Vec<EntityPath> },
}

impl EntityDescriptor {
    pub fn path(&self) -> &EntityPath {
        match self {
            EntityDescriptor::Parameter(d) => &d.path,
            EntityDescriptor::Event(d) => &d.path,
            EntityDescriptor::Activity(d) => &d.path,
            EntityDescriptor::Container { path, .. } => path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFINITION: &str = r#"
parameters:
  - id: 1
    path: SC.EPS.MODE
    raw_type: int
    eng_type: string
    calibrations:
      - type: enum
        points:
          - { raw: 1, value: LOW }
          - { raw: 2, value: HIGH }
    triggers:
      - { event: 100, condition: ON_VALUE_CHANGE }
  - id: 2
    path: SC.EPS.VOLTAGE
    checks:
      - name: RANGE
        type: limit
        low: 24.0
        high: 32.0
        num_violations: 2
events:
  - id: 100
    path: SC.EPS.MODE_CHANGED
    severity: WARNING
    inhibition_period_ms: 500
activities:
  - id: 1000
    path: SC.EPS.SWITCH
    activity_type: TC
    default_route: GROUND
    arguments:
      - name: STATE
        raw_type: int
        eng_type: string
        decalibration:
          type: inverted_enum
          points: [{ raw: 0, value: "OFF" }, { raw: 1, value: "ON" }]
    execution_timeout_secs: 30
"#;

    #[test]
    fn test_parse_definition() {
        let def = ProcessingDefinition::from_yaml(DEFINITION).unwrap();
        assert_eq!(def.parameters.len(), 2);
        assert_eq!(def.parameters[0].calibrations.len(), 1);
        assert_eq!(def.parameters[1].checks[0].num_violations, 2);
        assert_eq!(def.events[0].severity, Severity::Warning);
        assert_eq!(def.activities[0].argument("STATE").map(|a| a.raw_type), Some(ValueType::Int));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut def = ProcessingDefinition::from_yaml(DEFINITION).unwrap();
        def.events.push(EventDefinition::new(2, "SC.EPS.OTHER"));
        assert!(matches!(def.validate(), Err(ProcessingError::Config(_))));
    }

    #[test]
    fn test_unknown_trigger_event_rejected() {
        let mut def = ProcessingDefinition::default();
        let mut p = ParameterDefinition::new(1, "SC.P");
        p.triggers.push(ParameterTrigger {
            event: 9,
            condition: TriggerCondition::OnNewSample,
        });
        def.parameters.push(p);
        assert!(def.validate().is_err());
    }
}
