use super::{ArgShape, Registry};
use crate::context::EvalContext;
use crate::error::{Error, Result};
use crate::value::Value;

pub(super) fn register(registry: &mut Registry) {
    registry.add("$type", ArgShape::exact(1), |a, _| Ok(Value::from(a[0].type_name())));
    registry.add("$toString", ArgShape::exact(1), to_string);
    registry.add("$toInt", ArgShape::exact(1), to_int);
    registry.add("$toLong", ArgShape::exact(1), to_int);
    registry.add("$toDouble", ArgShape::exact(1), to_double);
    registry.add("$toBool", ArgShape::exact(1), to_bool);
    registry.add("$toDate", ArgShape::exact(1), to_date);
}

fn to_string(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    match &args[0] {
        v if v.is_nullish() => Ok(Value::Null),
        Value::Array(_) | Value::Object(_) => Err(Error::argument(
            "$toString",
            format!("cannot convert {} to string", args[0].type_name()),
        )),
        v => Ok(Value::String(v.to_string())),
    }
}

/// Truncates toward zero. Non-numeric strings are an error; NaN stays NaN.
fn to_int(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    match &args[0] {
        v if v.is_nullish() => Ok(Value::Null),
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Float(f) if f.is_nan() => Ok(Value::Float(f64::NAN)),
        Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
        Value::Date(dt) => Ok(Value::Int(dt.timestamp_millis())),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| Error::argument("$toInt", format!("cannot parse '{s}' as an integer"))),
        v => Err(Error::argument(
            "$toInt",
            format!("cannot convert {} to int", v.type_name()),
        )),
    }
}

fn to_double(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    match &args[0] {
        v if v.is_nullish() => Ok(Value::Null),
        Value::Bool(b) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
        Value::Date(dt) => Ok(Value::Float(dt.timestamp_millis() as f64)),
        v => v.to_number().map(Value::Float).ok_or_else(|| {
            Error::argument("$toDouble", format!("cannot convert {v} to double"))
        }),
    }
}

fn to_bool(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    match &args[0] {
        v if v.is_nullish() => Ok(Value::Null),
        Value::String(_) => Ok(Value::Bool(true)),
        v => Ok(Value::Bool(v.is_truthy())),
    }
}

fn to_date(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    let v = &args[0];
    if v.is_nullish() {
        return Ok(Value::Null);
    }
    v.to_date()
        .map(Value::Date)
        .ok_or_else(|| Error::argument("$toDate", format!("cannot convert {} to date", v.type_name())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Runtime;

    fn call(f: fn(&[Value], &EvalContext<'_>) -> Result<Value>, v: Value) -> Result<Value> {
        let runtime = Runtime::default();
        let root = Value::Null;
        f(&[v], &EvalContext::new(&runtime, &root))
    }

    #[test]
    fn int_conversion_truncates() {
        assert_eq!(call(to_int, Value::from(-2.7)).unwrap(), Value::Int(-2));
        assert_eq!(call(to_int, Value::from(" 42 ")).unwrap(), Value::Int(42));
        assert!(call(to_int, Value::from("4x")).is_err());
        assert!(call(to_int, Value::Float(f64::NAN)).unwrap().is_nan());
    }

    #[test]
    fn nullish_converts_to_null() {
        for f in [to_string, to_int, to_double, to_bool, to_date] {
            assert_eq!(call(f, Value::Missing).unwrap(), Value::Null);
        }
    }

    #[test]
    fn dates_round_trip_through_strings() {
        let d = call(to_date, Value::from("2021-11-09T23:15:00Z")).unwrap();
        assert!(matches!(d, Value::Date(_)));
        assert_eq!(
            call(to_string, d).unwrap(),
            Value::from("2021-11-09T23:15:00.000Z")
        );
    }
}
