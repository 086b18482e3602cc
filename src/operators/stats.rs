//! Statistical operators over a list of values.
//!
//! `$stdDevSamp`, `$stdDevPop`, `$sum` and `$avg` propagate failure: a
//! single element that does not coerce to a number makes the whole result
//! NaN. `$min` and `$max` compare any values and skip nulls.

use super::{spread, ArgShape, Registry};
use crate::context::EvalContext;
use crate::error::Result;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdDev {
    Population,
    /// Bessel-corrected (N - 1 denominator).
    Sample,
}

/// Standard deviation of `values`. A sample of fewer than two values, or an
/// empty population, has no deviation and yields NaN.
pub fn std_dev(values: &[f64], kind: StdDev) -> f64 {
    let n = values.len();
    let denominator = match kind {
        StdDev::Population => n as f64,
        StdDev::Sample => n.saturating_sub(1) as f64,
    };
    if denominator == 0.0 {
        return f64::NAN;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let squares: f64 = values.iter().map(|x| (x - mean).powi(2)).sum();
    (squares / denominator).sqrt()
}

pub(super) fn register(registry: &mut Registry) {
    registry.add("$stdDevSamp", ArgShape::at_least(1), std_dev_samp);
    registry.add("$stdDevPop", ArgShape::at_least(1), std_dev_pop);
    registry.add("$sum", ArgShape::at_least(1), sum);
    registry.add("$avg", ArgShape::at_least(1), avg);
    registry.add("$min", ArgShape::at_least(1), min);
    registry.add("$max", ArgShape::at_least(1), max);
}

/// Every element as a number, or `None` if any fails coercion.
fn numbers(args: &[Value]) -> Option<Vec<f64>> {
    spread(args).into_iter().map(Value::to_number).collect()
}

fn std_dev_samp(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    Ok(Value::Float(
        numbers(args).map_or(f64::NAN, |xs| std_dev(&xs, StdDev::Sample)),
    ))
}

fn std_dev_pop(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    Ok(Value::Float(
        numbers(args).map_or(f64::NAN, |xs| std_dev(&xs, StdDev::Population)),
    ))
}

fn sum(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    let items = spread(args);
    if items.iter().all(|v| matches!(v, Value::Int(_))) {
        let total = items
            .iter()
            .filter_map(|v| v.as_i64())
            .try_fold(0_i64, |acc, i| acc.checked_add(i));
        if let Some(total) = total {
            return Ok(Value::Int(total));
        }
    }
    Ok(Value::Float(
        numbers(args).map_or(f64::NAN, |xs| xs.iter().sum()),
    ))
}

fn avg(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    Ok(Value::Float(numbers(args).map_or(f64::NAN, |xs| {
        if xs.is_empty() {
            f64::NAN
        } else {
            xs.iter().sum::<f64>() / xs.len() as f64
        }
    })))
}

fn extremum(args: &[Value], pick_greater: bool) -> Value {
    spread(args)
        .into_iter()
        .filter(|v| !v.is_nullish())
        .fold(None::<&Value>, |best, v| match best {
            Some(b) if (v > b) != pick_greater || v == b => Some(b),
            _ => Some(v),
        })
        .cloned()
        .unwrap_or(Value::Null)
}

fn min(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    Ok(extremum(args, false))
}

fn max(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    Ok(extremum(args, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_std_dev_uses_bessel_correction() {
        assert_eq!(std_dev(&[1.0, 2.0, 3.0, 4.0, 5.0], StdDev::Sample), 1.5811388300841898);
        assert_eq!(std_dev(&[1.0, 2.0, 3.0, 4.0, 5.0], StdDev::Population), 2f64.sqrt());
    }

    #[test]
    fn degenerate_samples_are_nan() {
        assert!(std_dev(&[], StdDev::Sample).is_nan());
        assert!(std_dev(&[4.0], StdDev::Sample).is_nan());
        assert_eq!(std_dev(&[4.0], StdDev::Population), 0.0);
    }
}
