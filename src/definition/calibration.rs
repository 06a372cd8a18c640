// src/definition/calibration.rs - Raw to engineering value conversion
use super::expression::{BindingResolver, Expression, ExpressionDefinition, ScopedResolver};
use crate::error::{ProcessingError, Result};
use crate::value::Value;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumPoint {
    pub raw: i64,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct XyPoint {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CalibrationKind {
    /// Integer to text lookup table
    #[serde(rename = "enum")]
    Enumeration {
        points: Vec<EnumPoint>,
        #[serde(default)]
        default: Option<String>,
    },
    /// `c0 + c1*x + c2*x^2 + ...`
    Polynomial { coefficients: Vec<f64> },
    /// Piecewise linear interpolation, extrapolated past both ends
    Xy { points: Vec<XyPoint> },
    Expression { expression: ExpressionDefinition },
    /// Text to integer lookup, used to decalibrate activity arguments
    InvertedEnum {
        points: Vec<EnumPoint>,
        #[serde(default)]
        default: Option<i64>,
    },
}

/// Calibration with an optional applicability condition.
///
/// In YAML the kind's fields sit next to `applicability`:
///
/// ```yaml
/// type: enum
/// points: [{ raw: 1, value: LOW }, { raw: 2, value: HIGH }]
/// default: UNKNOWN
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationDefinition {
    #[serde(flatten)]
    pub kind: CalibrationKind,
    #[serde(default)]
    pub applicability: Option<ExpressionDefinition>,
}

impl CalibrationDefinition {
    pub fn new(kind: CalibrationKind) -> Self {
        Self {
            kind,
            applicability: None,
        }
    }

    /// Whether this calibration applies to `input` in the current state
    pub fn is_applicable(&self, input: &Value, ctx: &dyn BindingResolver) -> Result<bool> {
        match &self.applicability {
            None => Ok(true),
            Some(cond) => {
                let scoped = ScopedResolver::new(ctx).with_input(Some(input.clone()));
                cond.evaluate_bool(&scoped)
            }
        }
    }

    pub fn apply(&self, input: &Value, ctx: &dyn BindingResolver) -> Result<Value> {
        match &self.kind {
            CalibrationKind::Enumeration { points, default } => {
                let raw = input.as_int().ok_or_else(|| {
                    ProcessingError::Calibration(format!("{} is not an enumeration key", input))
                })?;
                points
                    .iter()
                    .find(|p| p.raw == raw)
                    .map(|p| p.value.clone())
                    .or_else(|| default.clone())
                    .map(Value::String)
                    .ok_or_else(|| ProcessingError::Calibration(format!("no enumeration entry for {}", raw)))
            }
            CalibrationKind::Polynomial { coefficients } => {
                let x = numeric(input)?;
                let y = coefficients
                    .iter()
                    .rev()
                    .fold(0.0, |acc, c| acc * x + c);
                Ok(Value::Float(y))
            }
            CalibrationKind::Xy { points } => interpolate(points, numeric(input)?).map(Value::Float),
            CalibrationKind::Expression { expression } => {
                let scoped = ScopedResolver::new(ctx).with_input(Some(input.clone()));
                expression.evaluate(&scoped)
            }
            CalibrationKind::InvertedEnum { points, default } => {
                let key = match input {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                points
                    .iter()
                    .find(|p| p.value == key)
                    .map(|p| p.raw)
                    .or(*default)
                    .map(Value::Int)
                    .ok_or_else(|| ProcessingError::Calibration(format!("no raw value for '{}'", key)))
            }
        }
    }
}

/// Apply the first applicable calibration of the list to `input`.
///
/// With no applicable calibration the input is returned unchanged.
pub fn calibrate(
    calibrations: &[CalibrationDefinition],
    input: &Value,
    ctx: &dyn BindingResolver,
) -> Result<Value> {
    for calibration in calibrations {
        if calibration.is_applicable(input, ctx)? {
            return calibration.apply(input, ctx);
        }
    }
    Ok(input.clone())
}

fn numeric(input: &Value) -> Result<f64> {
    input
        .as_float()
        .filter(|_| input.is_numeric() || matches!(input, Value::Bool(_)))
        .ok_or_else(|| ProcessingError::Calibration(format!("{} is not numeric", input)))
}

fn interpolate(points: &[XyPoint], x: f64) -> Result<f64> {
    if points.len() < 2 {
        return Err(ProcessingError::Calibration(
            "xy calibration needs at least two points".into(),
        ));
    }
    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.x.total_cmp(&b.x));

    let idx = sorted
        .windows(2)
        .position(|w| x <= w[1].x)
        .unwrap_or(sorted.len() - 2);
    let (a, b) = (sorted[idx], sorted[idx + 1]);
    if b.x == a.x {
        return Ok(a.y);
    }
    Ok(a.y + (x - a.x) * (b.y - a.y) / (b.x - a.x))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{EventData, ParameterData};
    use crate::definition::expression::Comparison;
    use crate::path::EntityPath;
    use std::sync::Arc;

    struct Empty;

    impl BindingResolver for Empty {
        fn parameter(&self, _path: &EntityPath) -> Option<Arc<ParameterData>> {
            None
        }
        fn event(&self, _path: &EntityPath) -> Option<Arc<EventData>> {
            None
        }
    }

    #[test]
    fn test_enumeration_table() {
        let yaml = r#"
type: enum
points:
  - { raw: 1, value: LOW }
  - { raw: 2, value: HIGH }
"#;
        let cal: CalibrationDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cal.apply(&Value::Int(1), &Empty).unwrap(), Value::String("LOW".into()));
        assert_eq!(cal.apply(&Value::Int(2), &Empty).unwrap(), Value::String("HIGH".into()));
        assert!(cal.apply(&Value::Int(3), &Empty).is_err());
    }

    #[test]
    fn test_polynomial_and_xy() {
        let poly = CalibrationDefinition::new(CalibrationKind::Polynomial {
            coefficients: vec![1.0, 2.0, 0.5],
        });
        assert_eq!(poly.apply(&Value::Int(2), &Empty).unwrap(), Value::Float(7.0));

        let xy = CalibrationDefinition::new(CalibrationKind::Xy {
            points: vec![XyPoint { x: 10.0, y: 100.0 }, XyPoint { x: 0.0, y: 0.0 }],
        });
        assert_eq!(xy.apply(&Value::Float(2.5), &Empty).unwrap(), Value::Float(25.0));
        // extrapolated past the last point
        assert_eq!(xy.apply(&Value::Int(20), &Empty).unwrap(), Value::Float(200.0));
    }

    #[test]
    fn test_first_applicable_calibration_wins() {
        let mut negative = CalibrationDefinition::new(CalibrationKind::Polynomial {
            coefficients: vec![0.0, -1.0],
        });
        negative.applicability = Some(ExpressionDefinition::compare(
            Comparison::Lt,
            ExpressionDefinition::Input,
            ExpressionDefinition::constant(0),
        ));
        let identity = CalibrationDefinition::new(CalibrationKind::Polynomial {
            coefficients: vec![0.0, 1.0],
        });
        let list = vec![negative, identity];

        assert_eq!(calibrate(&list, &Value::Int(-4), &Empty).unwrap(), Value::Float(4.0));
        assert_eq!(calibrate(&list, &Value::Int(4), &Empty).unwrap(), Value::Float(4.0));
        assert_eq!(calibrate(&[], &Value::Int(4), &Empty).unwrap(), Value::Int(4));
    }

    #[test]
    fn test_inverted_enumeration() {
        let cal = CalibrationDefinition::new(CalibrationKind::InvertedEnum {
            points: vec![EnumPoint { raw: 0, value: "OFF".into() }, EnumPoint { raw: 1, value: "ON".into() }],
            default: None,
        });
        assert_eq!(cal.apply(&Value::String("ON".into()), &Empty).unwrap(), Value::Int(1));
        assert!(cal.apply(&Value::String("MAYBE".into()), &Empty).is_err());
    }
}
