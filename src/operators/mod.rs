//! Operator registry.
//!
//! Every `$`-prefixed expression operator is an [`Operator`] looked up by
//! name when an expression is parsed. Operators receive their arguments
//! already evaluated, left to right. Short-circuiting forms (`$cond`,
//! `$ifNull`, `$switch`) and binding forms (`$let`, `$map`, `$filter`,
//! `$reduce`, `$function`) are handled by the expression parser instead.

mod array;
mod compare;
mod convert;
mod date;
mod env;
mod math;
mod stats;
mod string;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::context::EvalContext;
use crate::error::{Error, Result};
use crate::value::Value;

pub use date::format_date_with;
pub use stats::{std_dev, StdDev};

/// How an operator's JSON argument maps onto positional arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgShape {
    /// `{ $op: expr }` or `{ $op: [a, b, ..] }` with `min..=max` arguments.
    Positional { min: usize, max: Option<usize> },
    /// `{ $op: { name: expr, .. } }`, mapped onto the declared order. An
    /// array is read positionally; any other value is the first argument.
    /// The object form must name every `required` option; the positional
    /// forms need at least as many arguments.
    Named {
        names: &'static [&'static str],
        required: &'static [&'static str],
    },
}

impl ArgShape {
    pub const fn exact(n: usize) -> Self {
        ArgShape::Positional {
            min: n,
            max: Some(n),
        }
    }

    pub const fn range(min: usize, max: usize) -> Self {
        ArgShape::Positional {
            min,
            max: Some(max),
        }
    }

    pub const fn at_least(min: usize) -> Self {
        ArgShape::Positional { min, max: None }
    }

    /// Check an argument count, naming the operator in the error.
    pub fn check(&self, name: &str, count: usize) -> Result<()> {
        let (min, max) = match self {
            ArgShape::Positional { min, max } => (*min, *max),
            ArgShape::Named { names, required } => (required.len(), Some(names.len())),
        };
        if count < min || max.is_some_and(|m| count > m) {
            let expected = match max {
                Some(m) if m == min => format!("{min}"),
                Some(m) => format!("{min} to {m}"),
                None => format!("at least {min}"),
            };
            return Err(Error::argument(
                name,
                format!("expected {expected} argument(s), got {count}"),
            ));
        }
        Ok(())
    }
}

/// A named pure function over evaluated arguments.
pub trait Operator: Send + Sync {
    fn name(&self) -> &'static str;

    fn shape(&self) -> ArgShape;

    fn evaluate(&self, args: &[Value], ctx: &EvalContext<'_>) -> Result<Value>;
}

impl fmt::Debug for dyn Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Operator implemented by a plain function pointer.
pub struct FnOperator {
    name: &'static str,
    shape: ArgShape,
    func: fn(&[Value], &EvalContext<'_>) -> Result<Value>,
}

impl FnOperator {
    pub const fn new(
        name: &'static str,
        shape: ArgShape,
        func: fn(&[Value], &EvalContext<'_>) -> Result<Value>,
    ) -> Self {
        Self { name, shape, func }
    }
}

impl Operator for FnOperator {
    fn name(&self) -> &'static str {
        self.name
    }

    fn shape(&self) -> ArgShape {
        self.shape
    }

    fn evaluate(&self, args: &[Value], ctx: &EvalContext<'_>) -> Result<Value> {
        (self.func)(args, ctx)
    }
}

/// Mapping from operator name to implementation.
#[derive(Clone, Default)]
pub struct Registry {
    operators: HashMap<String, Arc<dyn Operator>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in operator.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        math::register(&mut registry);
        stats::register(&mut registry);
        compare::register(&mut registry);
        string::register(&mut registry);
        array::register(&mut registry);
        date::register(&mut registry);
        convert::register(&mut registry);
        env::register(&mut registry);
        registry
    }

    /// Register an operator, replacing any previous one of the same name.
    pub fn register(&mut self, op: Arc<dyn Operator>) {
        debug_assert!(op.name().starts_with('$'));
        self.operators.insert(op.name().to_string(), op);
    }

    pub(crate) fn add(&mut self, name: &'static str, shape: ArgShape, func: fn(&[Value], &EvalContext<'_>) -> Result<Value>) {
        self.register(Arc::new(FnOperator::new(name, shape, func)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Operator>> {
        self.operators.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operators.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operators.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("operators", &self.operators.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Shared argument helpers
// ---------------------------------------------------------------------------

/// Arguments of a list operator: a single array argument is spread,
/// otherwise the arguments themselves form the list.
pub(crate) fn spread(args: &[Value]) -> Vec<&Value> {
    match args {
        [Value::Array(items)] => items.iter().collect(),
        _ => args.iter().collect(),
    }
}

pub(crate) fn string_arg<'v>(op: &str, value: &'v Value) -> Result<&'v str> {
    value
        .as_str()
        .ok_or_else(|| Error::argument(op, format!("expected a string, got {}", value.type_name())))
}

pub(crate) fn int_arg(op: &str, value: &Value) -> Result<i64> {
    value
        .as_i64()
        .ok_or_else(|| Error::argument(op, format!("expected an integer, got {}", value.type_name())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Runtime;

    #[test]
    fn builtins_are_registered() {
        let registry = Registry::with_builtins();
        for name in ["$acos", "$asinh", "$cos", "$ln", "$stdDevSamp", "$dateToString", "$env", "$add"] {
            assert!(registry.contains(name), "missing {name}");
        }
        assert!(!registry.contains("$nope"));
    }

    #[test]
    fn custom_operator_can_be_registered() {
        fn double(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
            Ok(Value::number(args[0].to_number().unwrap_or(f64::NAN) * 2.0))
        }
        let mut registry = Registry::new();
        registry.add("$double", ArgShape::exact(1), double);
        let op = registry.get("$double").unwrap();
        let runtime = Runtime::default();
        let root = Value::Null;
        let ctx = EvalContext::new(&runtime, &root);
        assert_eq!(op.evaluate(&[Value::from(4)], &ctx).unwrap(), Value::from(8));
    }

    #[test]
    fn shape_check_reports_counts() {
        assert!(ArgShape::exact(1).check("$acos", 1).is_ok());
        let err = ArgShape::exact(1).check("$acos", 2).unwrap_err();
        assert!(err.to_string().contains("expected 1 argument(s), got 2"));
        assert!(ArgShape::at_least(1).check("$add", 0).is_err());
        assert!(ArgShape::range(2, 3).check("$slice", 3).is_ok());
    }
}
