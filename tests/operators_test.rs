use std::sync::Arc;

use cortex_pipeline::context::EvalContext;
use cortex_pipeline::operators::{ArgShape, FnOperator};
use cortex_pipeline::{Engine, EngineConfig, MemoryEnvironment, Registry, Value};
use serde_json::{json, Value as JsonValue};

fn eval(expr: JsonValue) -> Value {
    Engine::new().evaluate(&expr, &Value::Null).unwrap()
}

fn float(expr: JsonValue) -> f64 {
    eval(expr).as_f64().unwrap()
}

// ---------------------------------------------------------------------------
// Math
// ---------------------------------------------------------------------------

#[test]
fn trigonometric_and_log_values() {
    assert_eq!(float(json!({"$acos": 0.5})), 1.0471975511965979);
    assert_eq!(float(json!({"$asinh": 0.5})), 0.48121182505960347);
    assert_eq!(float(json!({"$cos": 10})), -0.8390715290764524);
    assert_eq!(float(json!({"$ln": 10})), 2.302585092994046);
}

#[test]
fn sample_standard_deviation() {
    assert_eq!(float(json!({"$stdDevSamp": [1, 2, 3, 4, 5]})), 1.5811388300841898);
    assert_eq!(float(json!({"$stdDevSamp": [[1, 2, 3, 4, 5]]})), 1.5811388300841898);
    assert!(eval(json!({"$stdDevSamp": [1, "two", 3]})).is_nan());
}

#[test]
fn unary_math_on_non_numbers_is_nan_natively_and_null_when_scripted() {
    let engine = Engine::new();
    let ops = ["$acos", "$asin", "$asinh", "$atan", "$cos", "$cosh", "$sin", "$tan", "$ln", "$log10", "$sqrt", "$exp"];
    for op in ops {
        for input in [json!("abc"), json!({"$literal": {"a": 1}}), json!(true), json!(null)] {
            let expr = json!({ op: input });
            let native = engine.evaluate(&expr, &Value::Null).unwrap();
            assert!(native.is_nan(), "{op} of {input} should be NaN, got {native:?}");
            let scripted = engine.evaluate_scripted(&expr, &Value::Null).unwrap();
            assert_eq!(serde_json::to_value(&scripted).unwrap(), json!({"result": null}));
        }
    }
}

#[test]
fn out_of_domain_inputs_are_nan() {
    assert!(eval(json!({"$acos": 2})).is_nan());
    assert!(eval(json!({"$ln": -1})).is_nan());
    assert!(eval(json!({"$sqrt": -4})).is_nan());
}

#[test]
fn arithmetic() {
    assert_eq!(eval(json!({"$add": [1, 2, 3]})), Value::from(6));
    assert_eq!(eval(json!({"$subtract": [10, 4]})), Value::from(6));
    assert_eq!(eval(json!({"$multiply": [2, 2.5]})), Value::from(5));
    assert_eq!(eval(json!({"$divide": [1, 4]})), Value::from(0.25));
    assert_eq!(eval(json!({"$abs": -3})), Value::from(3));
    assert_eq!(eval(json!({"$pow": [2, 10]})), Value::from(1024));
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

#[test]
fn date_to_string_converts_timezone_before_formatting() {
    let utc = eval(json!({"$dateToString": {"format": "%d/%m/%G", "date": "2021-11-09T23:15:00.000Z"}}));
    assert_eq!(utc, Value::from("09/11/2021"));
    let seoul = eval(json!({"$dateToString": {
        "format": "%d/%m/%G", "date": "2021-11-09T23:15:00.000Z", "timezone": "Asia/Seoul"
    }}));
    assert_eq!(seoul, Value::from("10/11/2021"));
}

#[test]
fn iso_week_year_follows_local_time_at_year_end() {
    // Sunday 2021-01-03 in Seoul, still Saturday 2021-01-02 in UTC: both
    // belong to ISO week 53 of 2020.
    let expr = |tz: &str| json!({"$dateToString": {"format": "%G-W%V", "date": "2021-01-02T20:00:00Z", "timezone": tz}});
    assert_eq!(eval(expr("UTC")), Value::from("2020-W53"));
    assert_eq!(eval(expr("Asia/Seoul")), Value::from("2020-W53"));
    // Monday 2021-01-04 in Seoul starts ISO week 1.
    let monday = json!({"$dateToString": {"format": "%G-W%V", "date": "2021-01-03T20:00:00Z", "timezone": "Asia/Seoul"}});
    assert_eq!(eval(monday), Value::from("2021-W01"));
}

#[test]
fn default_timezone_comes_from_config() {
    let engine = Engine::builder()
        .config(EngineConfig {
            default_timezone: "Asia/Seoul".into(),
            ..EngineConfig::default()
        })
        .build()
        .unwrap();
    let out = engine
        .evaluate(&json!({"$dayOfMonth": "$d"}), &Value::from(json!({"d": "2021-11-09T23:15:00Z"})))
        .unwrap();
    assert_eq!(out, Value::from(10));
}

#[test]
fn date_to_string_on_null() {
    assert_eq!(eval(json!({"$dateToString": {"date": null}})), Value::Null);
    assert_eq!(eval(json!({"$dateToString": {"date": "$nope", "onNull": "n/a"}})), Value::from("n/a"));
}

// ---------------------------------------------------------------------------
// Environment and registry
// ---------------------------------------------------------------------------

#[test]
fn env_returns_exported_bindings_verbatim() {
    let exported = json!({"limits": [1, 2, {"deep": true}], "name": "c_study"});
    let env = MemoryEnvironment::new().with("c_config", Value::from(exported.clone()));
    let engine = Engine::builder().environment(Arc::new(env)).build().unwrap();
    let out = engine.evaluate(&json!({"$env": "c_config"}), &Value::Null).unwrap();
    assert_eq!(out.to_json(), exported);
}

#[test]
fn custom_operators_can_be_registered() {
    fn triple(args: &[Value], _: &EvalContext<'_>) -> cortex_pipeline::Result<Value> {
        Ok(Value::number(args[0].to_number().unwrap_or(f64::NAN) * 3.0))
    }
    let mut registry = Registry::with_builtins();
    registry.register(Arc::new(FnOperator::new("$triple", ArgShape::exact(1), triple)));
    let engine = Engine::builder().registry(registry).build().unwrap();
    assert_eq!(engine.evaluate(&json!({"$triple": "$n"}), &Value::from(json!({"n": 4}))).unwrap(), Value::from(12));
}

#[test]
fn structural_errors_are_distinguishable_from_nan() {
    let engine = Engine::new();
    let err = engine.evaluate(&json!({"$acos": [1, 2]}), &Value::Null).unwrap_err();
    assert_eq!(err.code(), "cortex.invalidArgument.operator");
    let err = engine.evaluate(&json!({"$arccos": 1}), &Value::Null).unwrap_err();
    assert_eq!(err.code(), "cortex.invalidArgument.unknownOperator");
}

#[test]
fn strings_arrays_and_conditionals() {
    assert_eq!(eval(json!({"$concat": ["a", "-", "b"]})), Value::from("a-b"));
    assert_eq!(eval(json!({"$toUpper": "abc"})), Value::from("ABC"));
    assert_eq!(eval(json!({"$size": [[1, 2, 3]]})), Value::from(3));
    assert_eq!(eval(json!({"$arrayElemAt": [[1, 2, 3], -1]})), Value::from(3));
    assert_eq!(eval(json!({"$cond": [{"$gt": [2, 1]}, "yes", "no"]})), Value::from("yes"));
    assert_eq!(eval(json!({"$ifNull": [null, "fallback"]})), Value::from("fallback"));
    assert_eq!(eval(json!({"$type": 1.5})), Value::from("double"));
}

#[test]
fn named_form_without_a_required_option_fails_to_parse() {
    let err = Engine::new()
        .evaluate(&json!({"$dateToString": {"format": "%Y"}}), &Value::Null)
        .unwrap_err();
    assert_eq!(err.code(), "cortex.invalidArgument.operator");
}

// ---------------------------------------------------------------------------
// Extreme inputs
// ---------------------------------------------------------------------------

#[test]
fn integer_remainder_overflow_is_zero() {
    assert_eq!(eval(json!({"$mod": [i64::MIN, -1]})), Value::from(0));
    assert!(eval(json!({"$mod": [5, 0]})).is_nan());
}

#[test]
fn date_arithmetic_out_of_range_is_nan() {
    let date = json!({"$toDate": "2021-11-09T23:15:00Z"});
    assert!(eval(json!({"$add": [date.clone(), 1e18]})).is_nan());
    assert!(eval(json!({"$add": [date.clone(), -1e18]})).is_nan());
    assert!(eval(json!({"$subtract": [date.clone(), 9e18]})).is_nan());
    assert!(eval(json!({"$subtract": [date.clone(), -1e18]})).is_nan());
    assert!(eval(json!({"$subtract": [date, i64::MIN]})).is_nan());
}

#[test]
fn local_time_past_the_last_date_is_a_typed_error() {
    let engine = Engine::new();
    let expr = json!({"$dateToString": {"format": "%Y", "date": 8210266876799999_i64, "timezone": "+05:00"}});
    let err = engine.evaluate(&expr, &Value::Null).unwrap_err();
    assert_eq!(err.code(), "cortex.invalidArgument.operator");
    let err = engine
        .evaluate(&json!({"$year": {"date": 8210266876799999_i64, "timezone": "+05:00"}}), &Value::Null)
        .unwrap_err();
    assert_eq!(err.code(), "cortex.invalidArgument.operator");
}

#[test]
fn slice_with_extreme_counts() {
    assert_eq!(eval(json!({"$slice": [[1, 2, 3], i64::MIN]})), Value::from(json!([1, 2, 3])));
    assert_eq!(eval(json!({"$slice": [[1, 2, 3], i64::MAX]})), Value::from(json!([1, 2, 3])));
    assert_eq!(eval(json!({"$slice": [[1, 2, 3], i64::MIN, 2]})), Value::from(json!([1, 2])));
}
