use std::cmp::Ordering;

use super::{ArgShape, Registry};
use crate::context::EvalContext;
use crate::error::Result;
use crate::value::Value;

pub(super) fn register(registry: &mut Registry) {
    registry.add("$eq", ArgShape::exact(2), |a, _| Ok(Value::Bool(a[0] == a[1])));
    registry.add("$ne", ArgShape::exact(2), |a, _| Ok(Value::Bool(a[0] != a[1])));
    registry.add("$gt", ArgShape::exact(2), |a, _| Ok(Value::Bool(a[0] > a[1])));
    registry.add("$gte", ArgShape::exact(2), |a, _| Ok(Value::Bool(a[0] >= a[1])));
    registry.add("$lt", ArgShape::exact(2), |a, _| Ok(Value::Bool(a[0] < a[1])));
    registry.add("$lte", ArgShape::exact(2), |a, _| Ok(Value::Bool(a[0] <= a[1])));
    registry.add("$cmp", ArgShape::exact(2), cmp);
    registry.add("$and", ArgShape::at_least(0), and);
    registry.add("$or", ArgShape::at_least(0), or);
    registry.add("$not", ArgShape::exact(1), |a, _| Ok(Value::Bool(!a[0].is_truthy())));
}

fn cmp(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    Ok(Value::Int(match args[0].cmp(&args[1]) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }))
}

fn and(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    Ok(Value::Bool(args.iter().all(Value::is_truthy)))
}

fn or(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    Ok(Value::Bool(args.iter().any(Value::is_truthy)))
}
