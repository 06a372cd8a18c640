// src/value.rs - Typed values carried by samples, snapshots and definitions
use crate::error::{ProcessingError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Value carried by parameter samples, calibrated values, event reports
/// and activity arguments.
///
/// Values are written untagged so definitions stay readable in YAML:
/// `1` is an integer, `1.5` a float, `true` a boolean and `"LOW"` a string.
///
/// # Examples
///
/// ```rust
/// use tmtc::Value;
///
/// let raw = Value::Int(42);
/// assert_eq!(raw.as_float(), Some(42.0));
/// assert_eq!(Value::Bool(true).as_int(), Some(1));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean value
    Bool(bool),
    /// Integer value (64-bit)
    Int(i64),
    /// Floating-point value (64-bit)
    Float(f64),
    /// Character string
    String(String),
}

/// Value type used by definitions to declare raw and engineering types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Bool,
    Int,
    Float,
    String,
}

impl Value {
    /// Convert to boolean if possible
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::Float(f) => Some(*f != 0.0 && !f.is_nan()),
            Value::String(s) => match s.to_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Some(true),
                "false" | "no" | "off" | "0" => Some(false),
                _ => None,
            },
        }
    }

    /// Convert to integer if possible. Floats convert only when they hold
    /// a whole number within the `i64` range.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(if *b { 1 } else { 0 }),
            Value::Float(f) => {
                // i64::MAX as f64 rounds up to 2^63, which is out of range
                if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 {
                    Some(*f as i64)
                } else {
                    None
                }
            }
            Value::String(s) => s.parse().ok(),
        }
    }

    /// Convert to float if possible
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s.parse().ok(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// Get the type name of this value
    pub fn type_name(&self) -> &'static str {
        self.value_type().name()
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::String(_) => ValueType::String,
        }
    }

    /// Convert this value into the requested type.
    ///
    /// Used to sanitize calibrated values and activity arguments against the
    /// types declared in the processing definition.
    pub fn convert(&self, target: ValueType) -> Result<Value> {
        if self.value_type() == target {
            return Ok(self.clone());
        }
        let converted = match target {
            ValueType::Bool => self.as_bool().map(Value::Bool),
            ValueType::Int => self.as_int().map(Value::Int),
            ValueType::Float => self.as_float().map(Value::Float),
            ValueType::String => Some(Value::String(self.to_string())),
        };
        converted.ok_or(ProcessingError::TypeMismatch {
            expected: target.name(),
            actual: self.type_name(),
        })
    }

    /// Compare two values.
    ///
    /// Numeric values compare across integer and float representations,
    /// booleans and strings only compare with their own kind. Returns `None`
    /// when the values are not comparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (a, b) if a.is_numeric() && b.is_numeric() => {
                a.as_float()?.partial_cmp(&b.as_float()?)
            }
            _ => None,
        }
    }

    /// Equality used by expected-value checks: `1` and `1.0` are the same value
    pub fn loosely_equals(&self, other: &Value) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }
}

impl ValueType {
    pub fn name(&self) -> &'static str {
        match self {
            ValueType::Bool => "bool",
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::String => "string",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::Bool(true).as_int(), Some(1));
        assert_eq!(Value::Int(0).as_bool(), Some(false));
        assert_eq!(Value::Float(42.0).as_int(), Some(42));
        assert_eq!(Value::String("3.5".into()).as_float(), Some(3.5));
        assert_eq!(Value::Float(f64::NAN).as_int(), None);
    }

    #[test]
    fn test_convert_to_declared_type() {
        assert_eq!(Value::Int(3).convert(ValueType::Float).unwrap(), Value::Float(3.0));
        assert_eq!(
            Value::Int(3).convert(ValueType::String).unwrap(),
            Value::String("3".into())
        );
        assert!(Value::String("LOW".into()).convert(ValueType::Int).is_err());
    }

    #[test]
    fn test_fractional_float_is_not_an_int() {
        assert_eq!(Value::Float(-3.0).as_int(), Some(-3));
        assert_eq!(Value::Float(1.7).as_int(), None);
        assert_eq!(Value::Float(9.3e18).as_int(), None);
        assert_eq!(Value::Float(f64::INFINITY).as_int(), None);
        assert!(matches!(
            Value::Float(1.7).convert(ValueType::Int),
            Err(ProcessingError::TypeMismatch { expected: "int", actual: "float" })
        ));
    }

    #[test]
    fn test_numeric_comparison_across_types() {
        assert_eq!(Value::Int(2).compare(&Value::Float(2.5)), Some(Ordering::Less));
        assert!(Value::Int(1).loosely_equals(&Value::Float(1.0)));
        assert_eq!(Value::Bool(true).compare(&Value::Int(1)), None);
    }

    #[test]
    fn test_untagged_yaml_values() {
        let values: Vec<Value> = serde_yaml::from_str("[1, 2.5, true, LOW]").unwrap();
        assert_eq!(
            values,
            vec![
                Value::Int(1),
                Value::Float(2.5),
                Value::Bool(true),
                Value::String("LOW".into())
            ]
        );
    }
}
