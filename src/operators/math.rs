//! Arithmetic and trigonometric operators.
//!
//! Math operators never fail on bad input: anything that does not coerce to
//! a number, or lies outside the function's domain, yields NaN.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use super::{ArgShape, Operator, Registry};
use crate::context::EvalContext;
use crate::error::Result;
use crate::value::Value;

const NAN: Value = Value::Float(f64::NAN);

const UNARY: &[(&str, fn(f64) -> f64)] = &[
    ("$acos", f64::acos),
    ("$acosh", f64::acosh),
    ("$asin", f64::asin),
    ("$asinh", f64::asinh),
    ("$atan", f64::atan),
    ("$atanh", f64::atanh),
    ("$cos", f64::cos),
    ("$cosh", f64::cosh),
    ("$sin", f64::sin),
    ("$sinh", f64::sinh),
    ("$tan", f64::tan),
    ("$tanh", f64::tanh),
    ("$ln", f64::ln),
    ("$log10", f64::log10),
    ("$exp", f64::exp),
    ("$sqrt", f64::sqrt),
    ("$degreesToRadians", f64::to_radians),
    ("$radiansToDegrees", f64::to_degrees),
];

pub(super) fn register(registry: &mut Registry) {
    for (name, func) in UNARY {
        registry.register(Arc::new(UnaryMath { name: *name, func: *func }));
    }
    registry.add("$abs", ArgShape::exact(1), abs);
    registry.add("$ceil", ArgShape::exact(1), ceil);
    registry.add("$floor", ArgShape::exact(1), floor);
    registry.add("$round", ArgShape::range(1, 2), round);
    registry.add("$trunc", ArgShape::range(1, 2), trunc);
    registry.add("$add", ArgShape::at_least(0), add);
    registry.add("$subtract", ArgShape::exact(2), subtract);
    registry.add("$multiply", ArgShape::at_least(0), multiply);
    registry.add("$divide", ArgShape::exact(2), divide);
    registry.add("$mod", ArgShape::exact(2), modulo);
    registry.add("$pow", ArgShape::exact(2), pow);
    registry.add("$log", ArgShape::exact(2), log);
    registry.add("$atan2", ArgShape::exact(2), atan2);
}

/// One-argument float function; failed coercion or domain errors give NaN.
struct UnaryMath {
    name: &'static str,
    func: fn(f64) -> f64,
}

impl Operator for UnaryMath {
    fn name(&self) -> &'static str {
        self.name
    }

    fn shape(&self) -> ArgShape {
        ArgShape::exact(1)
    }

    fn evaluate(&self, args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
        Ok(args[0]
            .to_number()
            .map_or(NAN, |n| Value::Float((self.func)(n))))
    }
}

fn num(v: &Value) -> Option<f64> {
    v.to_number()
}

fn both(args: &[Value]) -> Option<(f64, f64)> {
    Some((num(&args[0])?, num(&args[1])?))
}

fn abs(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    Ok(match &args[0] {
        Value::Int(i) => i.checked_abs().map_or(Value::Float((*i as f64).abs()), Value::Int),
        other => other.to_number().map_or(NAN, |n| Value::Float(n.abs())),
    })
}

fn ceil(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    Ok(match &args[0] {
        Value::Int(i) => Value::Int(*i),
        other => other.to_number().map_or(NAN, |n| Value::Float(n.ceil())),
    })
}

fn floor(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    Ok(match &args[0] {
        Value::Int(i) => Value::Int(*i),
        other => other.to_number().map_or(NAN, |n| Value::Float(n.floor())),
    })
}

fn places(args: &[Value]) -> Option<i32> {
    match args.get(1) {
        None => Some(0),
        Some(v) => v.as_i64().and_then(|p| i32::try_from(p).ok()),
    }
}

/// Round half to even at `places` decimal digits.
fn round(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    let (Some(n), Some(p)) = (num(&args[0]), places(args)) else {
        return Ok(NAN);
    };
    if let (Value::Int(i), true) = (&args[0], p >= 0) {
        return Ok(Value::Int(*i));
    }
    let factor = 10f64.powi(p);
    let rounded = (n * factor).round_ties_even() / factor;
    Ok(Value::Float(rounded))
}

fn trunc(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    let (Some(n), Some(p)) = (num(&args[0]), places(args)) else {
        return Ok(NAN);
    };
    if let (Value::Int(i), true) = (&args[0], p >= 0) {
        return Ok(Value::Int(*i));
    }
    let factor = 10f64.powi(p);
    Ok(Value::Float((n * factor).trunc() / factor))
}

/// `$add`: integers stay integral until they overflow; a date plus a
/// number of milliseconds yields a date.
fn add(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    let mut int_sum: Option<i64> = Some(0);
    let mut sum = 0.0_f64;
    let mut date = None;
    for arg in args {
        match arg {
            Value::Date(dt) if date.is_none() => date = Some(*dt),
            Value::Int(i) => {
                int_sum = int_sum.and_then(|s| s.checked_add(*i));
                sum += *i as f64;
            }
            other => match other.to_number() {
                Some(n) => {
                    int_sum = None;
                    sum += n;
                }
                None => return Ok(NAN),
            },
        }
    }
    if let Some(dt) = date {
        return Ok(shift_date(&dt, sum as i64));
    }
    Ok(int_sum.map_or(Value::Float(sum), Value::Int))
}

/// Offset a date by milliseconds. Results outside the representable range
/// are NaN.
fn shift_date(dt: &DateTime<Utc>, ms: i64) -> Value {
    TimeDelta::try_milliseconds(ms)
        .and_then(|delta| dt.checked_add_signed(delta))
        .map_or(NAN, Value::Date)
}

fn subtract(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    Ok(match (&args[0], &args[1]) {
        (Value::Date(a), Value::Date(b)) => Value::Int((*a - *b).num_milliseconds()),
        (Value::Date(a), other) => match other.to_number() {
            Some(ms) => shift_date(a, (ms as i64).saturating_neg()),
            None => NAN,
        },
        (Value::Int(a), Value::Int(b)) => a
            .checked_sub(*b)
            .map_or(Value::Float(*a as f64 - *b as f64), Value::Int),
        _ => both(args).map_or(NAN, |(a, b)| Value::Float(a - b)),
    })
}

fn multiply(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    let mut int_product: Option<i64> = Some(1);
    let mut product = 1.0_f64;
    for arg in args {
        match arg {
            Value::Int(i) => {
                int_product = int_product.and_then(|p| p.checked_mul(*i));
                product *= *i as f64;
            }
            other => match other.to_number() {
                Some(n) => {
                    int_product = None;
                    product *= n;
                }
                None => return Ok(NAN),
            },
        }
    }
    Ok(int_product.map_or(Value::Float(product), Value::Int))
}

/// IEEE division: `x / 0` is infinite, `0 / 0` is NaN.
fn divide(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    Ok(both(args).map_or(NAN, |(a, b)| Value::number(a / b)))
}

fn modulo(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    if let (Value::Int(a), Value::Int(b)) = (&args[0], &args[1]) {
        if *b != 0 {
            // `i64::MIN % -1` overflows; its remainder is zero.
            return Ok(Value::Int(a.checked_rem(*b).unwrap_or(0)));
        }
    }
    Ok(both(args).map_or(NAN, |(a, b)| Value::Float(a % b)))
}

fn pow(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    if let (Value::Int(base), Value::Int(exp)) = (&args[0], &args[1]) {
        if let Some(r) = u32::try_from(*exp).ok().and_then(|e| base.checked_pow(e)) {
            return Ok(Value::Int(r));
        }
    }
    Ok(both(args).map_or(NAN, |(a, b)| Value::Float(a.powf(b))))
}

fn log(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    Ok(both(args).map_or(NAN, |(n, base)| Value::Float(n.log(base))))
}

fn atan2(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    Ok(both(args).map_or(NAN, |(y, x)| Value::Float(y.atan2(x))))
}
