// src/definition/check.rs - Parameter checks with violation/clearance hysteresis
use super::expression::{BindingResolver, Expression, ExpressionDefinition, ScopedResolver};
use crate::data::AlarmState;
use crate::error::{ProcessingError, Result};
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckSeverity {
    Warning,
    #[default]
    Alarm,
}

impl From<CheckSeverity> for AlarmState {
    fn from(s: CheckSeverity) -> Self {
        match s {
            CheckSeverity::Warning => AlarmState::Warning,
            CheckSeverity::Alarm => AlarmState::Alarm,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckKind {
    /// Violated outside `[low, high]`
    Limit {
        #[serde(default)]
        low: Option<f64>,
        #[serde(default)]
        high: Option<f64>,
    },
    /// Violated when the value is none of `values`
    Expected { values: Vec<Value> },
    /// Limit check on the difference with the previous value
    Delta {
        #[serde(default)]
        low: Option<f64>,
        #[serde(default)]
        high: Option<f64>,
        #[serde(default)]
        absolute: bool,
    },
    /// Violated when the expression evaluates to true
    Expression { expression: ExpressionDefinition },
}

fn default_one() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckDefinition {
    pub name: String,
    #[serde(flatten)]
    pub kind: CheckKind,
    #[serde(default)]
    pub severity: CheckSeverity,
    /// Consecutive violations before the severity is reported
    #[serde(default = "default_one")]
    pub num_violations: u32,
    /// Consecutive clearances before a raised check returns to nominal
    #[serde(default = "default_one")]
    pub num_clearances: u32,
    #[serde(default)]
    pub applicability: Option<ExpressionDefinition>,
    /// Check the source value instead of the engineering value
    #[serde(default)]
    pub raw_value_checked: bool,
}

impl CheckDefinition {
    pub fn new(name: impl Into<String>, kind: CheckKind) -> Self {
        Self {
            name: name.into(),
            kind,
            severity: CheckSeverity::Alarm,
            num_violations: 1,
            num_clearances: 1,
            applicability: None,
            raw_value_checked: false,
        }
    }
}

/// Running state of one check of one parameter
#[derive(Debug, Clone)]
pub struct CheckState {
    violations: u32,
    clearances: u32,
    last_result: AlarmState,
    last_time: Option<DateTime<Utc>>,
    previous_value: Option<Value>,
}

impl Default for CheckState {
    fn default() -> Self {
        Self {
            violations: 0,
            clearances: 0,
            last_result: AlarmState::NotChecked,
            last_time: None,
            previous_value: None,
        }
    }
}

impl CheckState {
    pub fn last_result(&self) -> AlarmState {
        self.last_result
    }

    /// Run `def` against `value`.
    ///
    /// `new_sample` is false for re-evaluations triggered by a dependency,
    /// which must not count as a further violation or clearance.
    pub fn evaluate(
        &mut self,
        def: &CheckDefinition,
        value: &Value,
        generation_time: DateTime<Utc>,
        new_sample: bool,
        ctx: &dyn BindingResolver,
    ) -> AlarmState {
        let scoped = ScopedResolver::new(ctx).with_input(Some(value.clone()));
        if let Some(cond) = &def.applicability {
            match cond.evaluate_bool(&scoped) {
                Ok(true) => {}
                Ok(false) => return self.settle(AlarmState::NotApplicable, generation_time),
                Err(e) => {
                    debug!("Applicability of check {} failed: {}", def.name, e);
                    return self.settle(AlarmState::Error, generation_time);
                }
            }
        }

        if matches!(def.kind, CheckKind::Delta { .. }) && self.last_time == Some(generation_time) {
            return self.last_result;
        }

        let violated = match self.is_violated(def, value, &scoped) {
            Ok(Some(v)) => v,
            Ok(None) => return self.settle(AlarmState::Nominal, generation_time),
            Err(e) => {
                debug!("Check {} failed: {}", def.name, e);
                return self.settle(AlarmState::Error, generation_time);
            }
        };

        let result = if violated {
            self.clearances = 0;
            if new_sample || self.violations == 0 {
                self.violations += 1;
            }
            if self.violations >= def.num_violations {
                def.severity.into()
            } else {
                AlarmState::Violated
            }
        } else if self.last_result.is_alarm() {
            if new_sample || self.clearances == 0 {
                self.clearances += 1;
            }
            if self.clearances >= def.num_clearances {
                self.violations = 0;
                self.clearances = 0;
                AlarmState::Nominal
            } else {
                self.last_result
            }
        } else {
            self.violations = 0;
            self.clearances = 0;
            AlarmState::Nominal
        };
        self.settle(result, generation_time)
    }

    fn settle(&mut self, result: AlarmState, generation_time: DateTime<Utc>) -> AlarmState {
        self.last_result = result;
        self.last_time = Some(generation_time);
        result
    }

    /// `None` when the check cannot say yet (first value of a delta check)
    fn is_violated(
        &mut self,
        def: &CheckDefinition,
        value: &Value,
        ctx: &dyn BindingResolver,
    ) -> Result<Option<bool>> {
        match &def.kind {
            CheckKind::Limit { low, high } => {
                let v = as_number(value)?;
                Ok(Some(outside(v, *low, *high)))
            }
            CheckKind::Expected { values } => Ok(Some(!values.iter().any(|e| e.loosely_equals(value)))),
            CheckKind::Delta { low, high, absolute } => {
                let current = as_number(value)?;
                let previous = self.previous_value.replace(value.clone());
                match previous {
                    None => Ok(None),
                    Some(prev) => {
                        let mut delta = current - as_number(&prev)?;
                        if *absolute {
                            delta = delta.abs();
                        }
                        Ok(Some(outside(delta, *low, *high)))
                    }
                }
            }
            CheckKind::Expression { expression } => expression.evaluate_bool(ctx).map(Some),
        }
    }
}

fn outside(v: f64, low: Option<f64>, high: Option<f64>) -> bool {
    low.map_or(false, |l| v < l) || high.map_or(false, |h| v > h)
}

fn as_number(value: &Value) -> Result<f64> {
    if !value.is_numeric() {
        return Err(ProcessingError::Check(format!("{} is not numeric", value)));
    }
    value
        .as_float()
        .ok_or_else(|| ProcessingError::Check(format!("{} is not numeric", value)))
}
