use regex::RegexBuilder;

use super::{int_arg, string_arg, ArgShape, Registry};
use crate::context::EvalContext;
use crate::error::{Error, Result};
use crate::value::Value;

pub(super) fn register(registry: &mut Registry) {
    registry.add("$concat", ArgShape::at_least(0), concat);
    registry.add("$toLower", ArgShape::exact(1), to_lower);
    registry.add("$toUpper", ArgShape::exact(1), to_upper);
    registry.add("$substr", ArgShape::exact(3), substr);
    registry.add("$substrCP", ArgShape::exact(3), substr);
    registry.add("$split", ArgShape::exact(2), split);
    registry.add("$strLenCP", ArgShape::exact(1), str_len);
    registry.add(
        "$trim",
        ArgShape::Named {
            names: &["input", "chars"],
            required: &["input"],
        },
        trim,
    );
    registry.add(
        "$regexMatch",
        ArgShape::Named {
            names: &["input", "regex", "options"],
            required: &["input", "regex"],
        },
        regex_match,
    );
}

/// Null if any argument is null or missing.
fn concat(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    let mut out = String::new();
    for arg in args {
        if arg.is_nullish() {
            return Ok(Value::Null);
        }
        out.push_str(string_arg("$concat", arg)?);
    }
    Ok(Value::String(out))
}

fn text(value: &Value) -> String {
    if value.is_nullish() {
        String::new()
    } else {
        value.to_string()
    }
}

fn to_lower(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    Ok(Value::String(text(&args[0]).to_lowercase()))
}

fn to_upper(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    Ok(Value::String(text(&args[0]).to_uppercase()))
}

/// `[string, start, length]` in code points; a negative length runs to the end.
fn substr(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    let s = text(&args[0]);
    let start = int_arg("$substr", &args[1])?;
    let len = int_arg("$substr", &args[2])?;
    if start < 0 {
        return Ok(Value::String(String::new()));
    }
    let chars = s.chars().skip(start as usize);
    let out: String = if len < 0 {
        chars.collect()
    } else {
        chars.take(len as usize).collect()
    };
    Ok(Value::String(out))
}

fn split(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    if args[0].is_nullish() {
        return Ok(Value::Null);
    }
    let s = string_arg("$split", &args[0])?;
    let delimiter = string_arg("$split", &args[1])?;
    if delimiter.is_empty() {
        return Err(Error::argument("$split", "delimiter must not be empty"));
    }
    Ok(Value::Array(
        s.split(delimiter).map(Value::from).collect(),
    ))
}

fn str_len(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    let s = string_arg("$strLenCP", &args[0])?;
    Ok(Value::from(s.chars().count()))
}

fn trim(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    if args[0].is_nullish() {
        return Ok(Value::Null);
    }
    let s = string_arg("$trim", &args[0])?;
    let trimmed = match args.get(1).filter(|v| !v.is_nullish()) {
        Some(chars) => {
            let chars: Vec<char> = string_arg("$trim", chars)?.chars().collect();
            s.trim_matches(|c| chars.contains(&c))
        }
        None => s.trim(),
    };
    Ok(Value::from(trimmed))
}

fn regex_match(args: &[Value], _: &EvalContext<'_>) -> Result<Value> {
    if args[0].is_nullish() {
        return Ok(Value::Bool(false));
    }
    let input = string_arg("$regexMatch", &args[0])?;
    let pattern = string_arg("$regexMatch", &args[1])?;
    let options = match args.get(2).filter(|v| !v.is_nullish()) {
        Some(v) => string_arg("$regexMatch", v)?,
        None => "",
    };
    let re = RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .ignore_whitespace(options.contains('x'))
        .build()
        .map_err(|e| Error::argument("$regexMatch", e.to_string()))?;
    Ok(Value::Bool(re.is_match(input)))
}
