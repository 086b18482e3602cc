use super::{int_arg, ArgShape, Registry};
use crate::context::EvalContext;
use crate::error::{Error, Result};
use crate::value::Value;

pub(super) fn register(registry: &mut Registry) {
    registry.add("$size", ArgShape::exact(1), size);
    registry.add("$arrayElemAt", ArgShape::exact(2), array_elem_at);
    registry.add("$concatArrays", ArgShape::at_least(0), concat_arrays);
    registry.add("$in", ArgShape::exact(2), is_in);
    registry.add("$slice", ArgShape::range(2, 3), slice);
    registry.add("$isArray", ArgShape::exact(1), |a, _| Ok(Value::Bool(matches!(a[0], Value::Array(_)))));
    registry.add("$reverseArray", ArgShape::exact(1), reverse_array);
}

fn array<'v>(op: &str, value: &'v Value) -> Result<&'v Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| Error::argument(op, format!("expected an array, got {}", value.type_name())))
}

fn size(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    Ok(Value::from(array("$size", &args[0])?.len()))
}

/// Negative indexes count from the end; out of range is missing.
fn array_elem_at(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    if args[0].is_nullish() {
        return Ok(Value::Null);
    }
    let items = array("$arrayElemAt", &args[0])?;
    let idx = int_arg("$arrayElemAt", &args[1])?;
    let idx = if idx < 0 { items.len() as i64 + idx } else { idx };
    Ok(usize::try_from(idx)
        .ok()
        .and_then(|i| items.get(i))
        .cloned()
        .unwrap_or(Value::Missing))
}

fn concat_arrays(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    let mut out = Vec::new();
    for arg in args {
        if arg.is_nullish() {
            return Ok(Value::Null);
        }
        out.extend(array("$concatArrays", arg)?.iter().cloned());
    }
    Ok(Value::Array(out))
}

fn is_in(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    let items = array("$in", &args[1])?;
    Ok(Value::Bool(items.contains(&args[0])))
}

/// `[array, n]` takes the first (or last, when negative) `n` elements;
/// `[array, position, n]` starts at `position`.
fn slice(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    if args[0].is_nullish() {
        return Ok(Value::Null);
    }
    let items = array("$slice", &args[0])?;
    let len = items.len() as i64;
    let (start, count) = match args {
        [_, n] => {
            let n = int_arg("$slice", n)?;
            if n >= 0 { (0, n) } else { ((len + n).max(0), n.saturating_neg()) }
        }
        [_, position, n] => {
            let position = int_arg("$slice", position)?;
            let n = int_arg("$slice", n)?;
            if n <= 0 {
                return Err(Error::argument("$slice", "count must be positive"));
            }
            let start = if position < 0 { (len + position).max(0) } else { position.min(len) };
            (start, n)
        }
        _ => return Err(Error::argument("$slice", "expected 2 or 3 arguments")),
    };
    Ok(Value::Array(
        items
            .iter()
            .skip(start as usize)
            .take(count as usize)
            .cloned()
            .collect(),
    ))
}

fn reverse_array(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    if args[0].is_nullish() {
        return Ok(Value::Null);
    }
    let mut items = array("$reverseArray", &args[0])?.clone();
    items.reverse();
    Ok(Value::Array(items))
}
