// src/definition/expression.rs - Expressions used by calibrations, checks,
// conditions and verifications
use crate::data::{EventData, ParameterData};
use crate::error::{ProcessingError, Result};
use crate::path::EntityPath;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Read-only view over the published state of the graph.
///
/// Resolvers only ever hand out complete snapshots; an entity that is being
/// rebuilt in the same batch is seen with its previous snapshot until the
/// new one is installed.
pub trait BindingResolver {
    fn parameter(&self, path: &EntityPath) -> Option<Arc<ParameterData>>;

    fn event(&self, path: &EntityPath) -> Option<Arc<EventData>>;

    /// Argument of the activity occurrence being verified
    fn argument(&self, _name: &str) -> Option<Value> {
        None
    }

    /// Value under test: the raw value for calibrations, the engineering
    /// value for checks
    fn input(&self) -> Option<Value> {
        None
    }
}

/// Resolver adding an input value and activity arguments on top of another
pub struct ScopedResolver<'a> {
    inner: &'a dyn BindingResolver,
    input: Option<Value>,
    arguments: Option<&'a BTreeMap<String, Value>>,
}

impl<'a> ScopedResolver<'a> {
    pub fn new(inner: &'a dyn BindingResolver) -> Self {
        Self {
            inner,
            input: None,
            arguments: None,
        }
    }

    pub fn with_input(mut self, input: Option<Value>) -> Self {
        self.input = input;
        self
    }

    pub fn with_arguments(mut self, arguments: &'a BTreeMap<String, Value>) -> Self {
        self.arguments = Some(arguments);
        self
    }
}

impl BindingResolver for ScopedResolver<'_> {
    fn parameter(&self, path: &EntityPath) -> Option<Arc<ParameterData>> {
        self.inner.parameter(path)
    }

    fn event(&self, path: &EntityPath) -> Option<Arc<EventData>> {
        self.inner.event(path)
    }

    fn argument(&self, name: &str) -> Option<Value> {
        match self.arguments {
            Some(args) => args.get(name).cloned(),
            None => self.inner.argument(name),
        }
    }

    fn input(&self) -> Option<Value> {
        self.input.clone().or_else(|| self.inner.input())
    }
}

/// Pluggable expression capability.
///
/// `references` lists the entities read by the expression; the graph model
/// turns them into dependency edges.
pub trait Expression: Send + Sync + fmt::Debug {
    fn evaluate(&self, ctx: &dyn BindingResolver) -> Result<Value>;

    fn references(&self) -> BTreeSet<EntityPath>;

    /// Evaluate and coerce the result to a boolean
    fn evaluate_bool(&self, ctx: &dyn BindingResolver) -> Result<bool> {
        let value = self.evaluate(ctx)?;
        value
            .as_bool()
            .ok_or_else(|| ProcessingError::Expression(format!("{} is not a boolean", value)))
    }
}

/// Field of a referenced entity read by [`ExpressionDefinition::Ref`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefField {
    /// Engineering value of a parameter
    #[default]
    Value,
    /// Source (raw) value of a parameter
    Raw,
    Validity,
    AlarmState,
    /// Qualifier of the last occurrence of an event
    Qualifier,
    /// Report payload of the last occurrence of an event
    Report,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Small expression language usable from YAML definitions.
///
/// ```yaml
/// op: compare
/// cmp: gt
/// left: { op: ref, path: SC.EPS.BAT.VOLTAGE }
/// right: { op: const, value: 26.5 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ExpressionDefinition {
    Const {
        value: Value,
    },
    Ref {
        path: EntityPath,
        #[serde(default)]
        field: RefField,
    },
    Arg {
        name: String,
    },
    Input,
    Add {
        left: Box<ExpressionDefinition>,
        right: Box<ExpressionDefinition>,
    },
    Sub {
        left: Box<ExpressionDefinition>,
        right: Box<ExpressionDefinition>,
    },
    Mul {
        left: Box<ExpressionDefinition>,
        right: Box<ExpressionDefinition>,
    },
    Div {
        left: Box<ExpressionDefinition>,
        right: Box<ExpressionDefinition>,
    },
    Neg {
        operand: Box<ExpressionDefinition>,
    },
    Compare {
        cmp: Comparison,
        left: Box<ExpressionDefinition>,
        right: Box<ExpressionDefinition>,
    },
    And {
        operands: Vec<ExpressionDefinition>,
    },
    Or {
        operands: Vec<ExpressionDefinition>,
    },
    Not {
        operand: Box<ExpressionDefinition>,
    },
}

impl ExpressionDefinition {
    pub fn constant(value: impl Into<Value>) -> Self {
        ExpressionDefinition::Const {
            value: value.into(),
        }
    }

    pub fn reference(path: impl Into<EntityPath>) -> Self {
        ExpressionDefinition::Ref {
            path: path.into(),
            field: RefField::Value,
        }
    }

    pub fn compare(cmp: Comparison, left: ExpressionDefinition, right: ExpressionDefinition) -> Self {
        ExpressionDefinition::Compare {
            cmp,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn collect_references(&self, out: &mut BTreeSet<EntityPath>) {
        match self {
            ExpressionDefinition::Ref { path, .. } => {
                out.insert(path.clone());
            }
            ExpressionDefinition::Const { .. }
            | ExpressionDefinition::Arg { .. }
            | ExpressionDefinition::Input => {}
            ExpressionDefinition::Add { left, right }
            | ExpressionDefinition::Sub { left, right }
            | ExpressionDefinition::Mul { left, right }
            | ExpressionDefinition::Div { left, right }
            | ExpressionDefinition::Compare { left, right, .. } => {
                left.collect_references(out);
                right.collect_references(out);
            }
            ExpressionDefinition::Neg { operand } | ExpressionDefinition::Not { operand } => {
                operand.collect_references(out)
            }
            ExpressionDefinition::And { operands } | ExpressionDefinition::Or { operands } => {
                for op in operands {
                    op.collect_references(out);
                }
            }
        }
    }
}

impl Expression for ExpressionDefinition {
    fn evaluate(&self, ctx: &dyn BindingResolver) -> Result<Value> {
        match self {
            ExpressionDefinition::Const { value } => Ok(value.clone()),
            ExpressionDefinition::Ref { path, field } => resolve_reference(ctx, path, *field),
            ExpressionDefinition::Arg { name } => ctx
                .argument(name)
                .ok_or_else(|| ProcessingError::Expression(format!("no argument '{}'", name))),
            ExpressionDefinition::Input => ctx
                .input()
                .ok_or_else(|| ProcessingError::Expression("no input value in scope".into())),
            ExpressionDefinition::Add { left, right } => {
                arithmetic(left.evaluate(ctx)?, right.evaluate(ctx)?, '+')
            }
            ExpressionDefinition::Sub { left, right } => {
                arithmetic(left.evaluate(ctx)?, right.evaluate(ctx)?, '-')
            }
            ExpressionDefinition::Mul { left, right } => {
                arithmetic(left.evaluate(ctx)?, right.evaluate(ctx)?, '*')
            }
            ExpressionDefinition::Div { left, right } => {
                arithmetic(left.evaluate(ctx)?, right.evaluate(ctx)?, '/')
            }
            ExpressionDefinition::Neg { operand } => match operand.evaluate(ctx)? {
                Value::Int(i) => i
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| ProcessingError::Expression(format!("overflow in -{}", i))),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(ProcessingError::Expression(format!("cannot negate {}", other))),
            },
            ExpressionDefinition::Compare { cmp, left, right } => {
                let l = left.evaluate(ctx)?;
                let r = right.evaluate(ctx)?;
                let result = match cmp {
                    Comparison::Eq => l.loosely_equals(&r),
                    Comparison::Ne => !l.loosely_equals(&r),
                    _ => {
                        let ord = l.compare(&r).ok_or_else(|| {
                            ProcessingError::Expression(format!("cannot compare {} with {}", l, r))
                        })?;
                        match cmp {
                            Comparison::Lt => ord == Ordering::Less,
                            Comparison::Le => ord != Ordering::Greater,
                            Comparison::Gt => ord == Ordering::Greater,
                            _ => ord != Ordering::Less,
                        }
                    }
                };
                Ok(Value::Bool(result))
            }
            ExpressionDefinition::And { operands } => {
                for op in operands {
                    if !op.evaluate_bool(ctx)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            ExpressionDefinition::Or { operands } => {
                for op in operands {
                    if op.evaluate_bool(ctx)? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            ExpressionDefinition::Not { operand } => Ok(Value::Bool(!operand.evaluate_bool(ctx)?)),
        }
    }

    fn references(&self) -> BTreeSet<EntityPath> {
        let mut out = BTreeSet::new();
        self.collect_references(&mut out);
        out
    }
}

fn resolve_reference(ctx: &dyn BindingResolver, path: &EntityPath, field: RefField) -> Result<Value> {
    let missing = || ProcessingError::Expression(format!("no {:?} available for {}", field, path));
    match field {
        RefField::Value | RefField::Raw | RefField::Validity | RefField::AlarmState => {
            let data = ctx.parameter(path).ok_or_else(missing)?;
            match field {
                RefField::Value => data.eng_value.clone().ok_or_else(missing),
                RefField::Raw => data.source_value.clone().ok_or_else(missing),
                RefField::Validity => label(&data.validity),
                _ => label(&data.alarm_state),
            }
        }
        RefField::Qualifier => {
            let data = ctx.event(path).ok_or_else(missing)?;
            data.qualifier.clone().map(Value::String).ok_or_else(missing)
        }
        RefField::Report => {
            let data = ctx.event(path).ok_or_else(missing)?;
            data.report.clone().ok_or_else(missing)
        }
    }
}

/// Serialized name of an enum value, e.g. `"VALID"` or `"NOMINAL"`
fn label<T: Serialize>(value: &T) -> Result<Value> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(Value::String(s)),
        other => Err(ProcessingError::Expression(format!("unexpected label {}", other))),
    }
}

fn arithmetic(left: Value, right: Value, op: char) -> Result<Value> {
    if let (Value::Int(a), Value::Int(b)) = (&left, &right) {
        let result = match op {
            '+' => a.checked_add(*b),
            '-' => a.checked_sub(*b),
            '*' => a.checked_mul(*b),
            _ => {
                if *b == 0 {
                    return Err(ProcessingError::Expression("division by zero".into()));
                }
                // i64::MIN / -1 overflows both the remainder and the quotient
                match a.checked_rem(*b) {
                    Some(0) => a.checked_div(*b),
                    Some(_) => return Ok(Value::Float(*a as f64 / *b as f64)),
                    None => None,
                }
            }
        };
        return result
            .map(Value::Int)
            .ok_or_else(|| ProcessingError::Expression(format!("overflow in {} {} {}", a, op, b)));
    }

    let (a, b) = match (left.as_float(), right.as_float()) {
        (Some(a), Some(b)) if left.is_numeric() && right.is_numeric() => (a, b),
        _ => {
            return Err(ProcessingError::Expression(format!(
                "cannot apply '{}' to {} and {}",
                op, left, right
            )))
        }
    };
    let result = match op {
        '+' => a + b,
        '-' => a - b,
        '*' => a * b,
        _ => {
            if b == 0.0 {
                return Err(ProcessingError::Expression("division by zero".into()));
            }
            a / b
        }
    };
    Ok(Value::Float(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{AlarmState, Validity};
    use chrono::Utc;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MapResolver {
        parameters: HashMap<EntityPath, Arc<ParameterData>>,
    }

    impl MapResolver {
        fn with(mut self, path: &str, value: Value) -> Self {
            let path = EntityPath::new(path);
            self.parameters.insert(
                path.clone(),
                Arc::new(ParameterData {
                    internal_id: 1,
                    external_id: 1,
                    path,
                    generation_time: Utc::now(),
                    reception_time: Utc::now(),
                    source_value: Some(value.clone()),
                    eng_value: Some(value),
                    validity: Validity::Valid,
                    alarm_state: AlarmState::Nominal,
                    route: None,
                    raw_data_container_id: None,
                }),
            );
            self
        }
    }

    impl BindingResolver for MapResolver {
        fn parameter(&self, path: &EntityPath) -> Option<Arc<ParameterData>> {
            self.parameters.get(path).cloned()
        }

        fn event(&self, _path: &EntityPath) -> Option<Arc<EventData>> {
            None
        }
    }

    #[test]
    fn test_yaml_expression_evaluates() {
        let yaml = r#"
op: compare
cmp: gt
left:
  op: add
  left: { op: ref, path: SC.A }
  right: { op: ref, path: SC.B }
right: { op: const, value: 10 }
"#;
        let expr: ExpressionDefinition = serde_yaml::from_str(yaml).unwrap();
        let ctx = MapResolver::default()
            .with("SC.A", Value::Int(6))
            .with("SC.B", Value::Float(4.5));
        assert_eq!(expr.evaluate(&ctx).unwrap(), Value::Bool(true));
        assert_eq!(
            expr.references().into_iter().collect::<Vec<_>>(),
            vec![EntityPath::new("SC.A"), EntityPath::new("SC.B")]
        );
    }

    #[test]
    fn test_missing_reference_is_an_error() {
        let expr = ExpressionDefinition::reference("SC.MISSING");
        assert!(matches!(
            expr.evaluate(&MapResolver::default()),
            Err(ProcessingError::Expression(_))
        ));
    }

    #[test]
    fn test_scoped_input_and_validity_label() {
        let ctx = MapResolver::default().with("SC.A", Value::Int(1));
        let scoped = ScopedResolver::new(&ctx).with_input(Some(Value::Int(3)));
        let expr = ExpressionDefinition::compare(
            Comparison::Eq,
            ExpressionDefinition::Input,
            ExpressionDefinition::constant(3),
        );
        assert!(expr.evaluate_bool(&scoped).unwrap());

        let validity = ExpressionDefinition::Ref {
            path: EntityPath::new("SC.A"),
            field: RefField::Validity,
        };
        assert_eq!(validity.evaluate(&ctx).unwrap(), Value::String("VALID".into()));
    }

    #[test]
    fn test_integer_division() {
        let ctx = MapResolver::default();
        let div = |a: i64, b: i64| ExpressionDefinition::Div {
            left: Box::new(ExpressionDefinition::constant(a)),
            right: Box::new(ExpressionDefinition::constant(b)),
        };
        assert_eq!(div(6, 3).evaluate(&ctx).unwrap(), Value::Int(2));
        assert_eq!(div(7, 2).evaluate(&ctx).unwrap(), Value::Float(3.5));
        assert!(div(1, 0).evaluate(&ctx).is_err());
    }

    #[test]
    fn test_integer_overflow_is_an_error() {
        let ctx = MapResolver::default();
        let div = ExpressionDefinition::Div {
            left: Box::new(ExpressionDefinition::constant(i64::MIN)),
            right: Box::new(ExpressionDefinition::constant(-1i64)),
        };
        assert!(matches!(div.evaluate(&ctx), Err(ProcessingError::Expression(_))));

        let neg = ExpressionDefinition::Neg {
            operand: Box::new(ExpressionDefinition::constant(i64::MIN)),
        };
        assert!(matches!(neg.evaluate(&ctx), Err(ProcessingError::Expression(_))));

        let neg = ExpressionDefinition::Neg {
            operand: Box::new(ExpressionDefinition::constant(5i64)),
        };
        assert_eq!(neg.evaluate(&ctx).unwrap(), Value::Int(-5));
    }
}
