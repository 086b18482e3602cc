//! Expression parsing and evaluation.
//!
//! Expressions are parsed once from JSON into an [`Expression`] tree and then
//! evaluated per document. Operator names are resolved against a
//! [`Registry`] at parse time, so an unknown operator fails the pipeline
//! before any document is read.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Value as JsonValue};

use crate::context::{EvalContext, Scope};
use crate::document::{Document, FieldPath};
use crate::error::{Error, Result};
use crate::operators::{ArgShape, Operator, Registry};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Expression tree
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub enum Expression {
    Literal(Value),
    /// `$$name` optionally followed by a path, e.g. `$$ROOT.email`.
    Variable {
        name: String,
        path: Option<FieldPath>,
    },
    /// `$a.b`, resolved against the current document.
    Field(FieldPath),
    Operator {
        op: Arc<dyn Operator>,
        args: Vec<Expression>,
    },
    Object(Vec<(String, Expression)>),
    Array(Vec<Expression>),
    Cond {
        condition: Box<Expression>,
        then: Box<Expression>,
        otherwise: Box<Expression>,
    },
    IfNull(Vec<Expression>),
    Switch {
        branches: Vec<(Expression, Expression)>,
        default: Option<Box<Expression>>,
    },
    Let {
        vars: Vec<(String, Expression)>,
        body: Box<Expression>,
    },
    Map {
        input: Box<Expression>,
        alias: String,
        body: Box<Expression>,
    },
    Filter {
        input: Box<Expression>,
        alias: String,
        cond: Box<Expression>,
        limit: Option<Box<Expression>>,
    },
    Reduce {
        input: Box<Expression>,
        initial: Box<Expression>,
        body: Box<Expression>,
    },
    Function {
        lang: String,
        body: String,
        args: Vec<Expression>,
    },
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Literal(v) => write!(f, "Literal({v:?})"),
            Expression::Variable { name, path } => match path {
                Some(p) => write!(f, "$${name}.{p}"),
                None => write!(f, "$${name}"),
            },
            Expression::Field(path) => write!(f, "${path}"),
            Expression::Operator { op, args } => f.debug_tuple(op.name()).field(args).finish(),
            Expression::Object(fields) => f.debug_map().entries(fields.iter().map(|(k, v)| (k, v))).finish(),
            Expression::Array(items) => f.debug_list().entries(items).finish(),
            Expression::Cond { .. } => f.write_str("$cond"),
            Expression::IfNull(_) => f.write_str("$ifNull"),
            Expression::Switch { .. } => f.write_str("$switch"),
            Expression::Let { .. } => f.write_str("$let"),
            Expression::Map { .. } => f.write_str("$map"),
            Expression::Filter { .. } => f.write_str("$filter"),
            Expression::Reduce { .. } => f.write_str("$reduce"),
            Expression::Function { lang, .. } => write!(f, "$function({lang})"),
        }
    }
}

/// True when `value` is an object with a `$`-prefixed key.
pub fn is_operator_object(value: &JsonValue) -> bool {
    value
        .as_object()
        .is_some_and(|m| m.keys().any(|k| k.starts_with('$')))
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Turns JSON expressions into [`Expression`] trees.
#[derive(Debug, Clone, Copy)]
pub struct Parser<'r> {
    registry: &'r Registry,
    max_depth: usize,
}

impl<'r> Parser<'r> {
    pub fn new(registry: &'r Registry, max_depth: usize) -> Self {
        Self {
            registry,
            max_depth,
        }
    }

    pub fn registry(&self) -> &'r Registry {
        self.registry
    }

    pub fn parse(&self, json: &JsonValue) -> Result<Expression> {
        self.parse_at(json, 0)
    }

    fn parse_at(&self, json: &JsonValue, depth: usize) -> Result<Expression> {
        if depth > self.max_depth {
            return Err(Error::InvalidPipeline(format!(
                "expression nesting exceeds {} levels",
                self.max_depth
            )));
        }
        match json {
            JsonValue::String(s) if s.starts_with("$$") => parse_variable(&s[2..]),
            JsonValue::String(s) if s.starts_with('$') => Ok(Expression::Field(FieldPath::parse(&s[1..])?)),
            JsonValue::Array(items) => Ok(Expression::Array(
                items
                    .iter()
                    .map(|item| self.parse_at(item, depth + 1))
                    .collect::<Result<_>>()?,
            )),
            JsonValue::Object(map) if is_operator_object(json) => {
                if map.len() != 1 {
                    let keys: Vec<&str> = map.keys().map(String::as_str).collect();
                    return Err(Error::InvalidPipeline(format!(
                        "an operator expression must have exactly one key, got {keys:?}"
                    )));
                }
                let Some((name, arg)) = map.iter().next() else {
                    return Err(Error::InvalidPipeline("empty operator expression".into()));
                };
                self.parse_operator(name, arg, depth + 1)
            }
            JsonValue::Object(map) => Ok(Expression::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), self.parse_at(v, depth + 1)?)))
                    .collect::<Result<_>>()?,
            )),
            other => Ok(Expression::Literal(Value::from_json(other))),
        }
    }

    fn parse_operator(&self, name: &str, arg: &JsonValue, depth: usize) -> Result<Expression> {
        let sub = |v: &JsonValue| self.parse_at(v, depth);
        match name {
            "$literal" => Ok(Expression::Literal(Value::from_json(arg))),
            "$cond" => {
                let (condition, then, otherwise) = match arg {
                    JsonValue::Array(items) if items.len() == 3 => (&items[0], &items[1], &items[2]),
                    JsonValue::Object(m) => (
                        required(name, m, "if")?,
                        required(name, m, "then")?,
                        required(name, m, "else")?,
                    ),
                    _ => return Err(Error::argument(name, "expected [if, then, else] or {if, then, else}")),
                };
                Ok(Expression::Cond {
                    condition: Box::new(sub(condition)?),
                    then: Box::new(sub(then)?),
                    otherwise: Box::new(sub(otherwise)?),
                })
            }
            "$ifNull" => {
                let items = arg
                    .as_array()
                    .filter(|items| items.len() >= 2)
                    .ok_or_else(|| Error::argument(name, "expected an array of at least 2 expressions"))?;
                Ok(Expression::IfNull(items.iter().map(sub).collect::<Result<_>>()?))
            }
            "$switch" => {
                let m = object(name, arg)?;
                let branches = required(name, m, "branches")?
                    .as_array()
                    .ok_or_else(|| Error::argument(name, "branches must be an array"))?
                    .iter()
                    .map(|b| {
                        let b = object(name, b)?;
                        Ok((sub(required(name, b, "case")?)?, sub(required(name, b, "then")?)?))
                    })
                    .collect::<Result<_>>()?;
                let default = m.get("default").map(sub).transpose()?.map(Box::new);
                Ok(Expression::Switch { branches, default })
            }
            "$let" => {
                let m = object(name, arg)?;
                let vars = object(name, required(name, m, "vars")?)?
                    .iter()
                    .map(|(k, v)| Ok((variable_name(name, k)?, sub(v)?)))
                    .collect::<Result<_>>()?;
                Ok(Expression::Let {
                    vars,
                    body: Box::new(sub(required(name, m, "in")?)?),
                })
            }
            "$map" => {
                let m = object(name, arg)?;
                Ok(Expression::Map {
                    input: Box::new(sub(required(name, m, "input")?)?),
                    alias: alias(name, m)?,
                    body: Box::new(sub(required(name, m, "in")?)?),
                })
            }
            "$filter" => {
                let m = object(name, arg)?;
                Ok(Expression::Filter {
                    input: Box::new(sub(required(name, m, "input")?)?),
                    alias: alias(name, m)?,
                    cond: Box::new(sub(required(name, m, "cond")?)?),
                    limit: m.get("limit").map(sub).transpose()?.map(Box::new),
                })
            }
            "$reduce" => {
                let m = object(name, arg)?;
                Ok(Expression::Reduce {
                    input: Box::new(sub(required(name, m, "input")?)?),
                    initial: Box::new(sub(required(name, m, "initialValue")?)?),
                    body: Box::new(sub(required(name, m, "in")?)?),
                })
            }
            "$function" => {
                let m = object(name, arg)?;
                let body = required(name, m, "body")?
                    .as_str()
                    .ok_or_else(|| Error::argument(name, "body must be a string"))?;
                let lang = m.get("lang").and_then(JsonValue::as_str).unwrap_or("js");
                let args = match m.get("args") {
                    Some(JsonValue::Array(items)) => items.iter().map(sub).collect::<Result<_>>()?,
                    Some(_) => return Err(Error::argument(name, "args must be an array")),
                    None => Vec::new(),
                };
                Ok(Expression::Function {
                    lang: lang.to_string(),
                    body: body.to_string(),
                    args,
                })
            }
            _ => {
                let op = self
                    .registry
                    .get(name)
                    .ok_or_else(|| Error::UnknownOperator(name.to_string()))?;
                let args = self.parse_args(&op, arg, depth)?;
                Ok(Expression::Operator { op, args })
            }
        }
    }

    fn parse_args(&self, op: &Arc<dyn Operator>, arg: &JsonValue, depth: usize) -> Result<Vec<Expression>> {
        let shape = op.shape();
        if let (ArgShape::Named { names, required }, JsonValue::Object(m)) = (shape, arg)
            && !is_operator_object(arg)
        {
            if let Some(unknown) = m.keys().find(|k| !names.contains(&k.as_str())) {
                return Err(Error::argument(op.name(), format!("unknown option '{unknown}'")));
            }
            if let Some(missing) = required.iter().find(|n| !m.contains_key(**n)) {
                return Err(Error::argument(op.name(), format!("missing required option '{missing}'")));
            }
            return names
                .iter()
                .map(|n| match m.get(*n) {
                    Some(v) => self.parse_at(v, depth),
                    None => Ok(Expression::Literal(Value::Missing)),
                })
                .collect();
        }
        let args: Vec<Expression> = match arg {
            JsonValue::Array(items) => items
                .iter()
                .map(|v| self.parse_at(v, depth))
                .collect::<Result<_>>()?,
            other => vec![self.parse_at(other, depth)?],
        };
        shape.check(op.name(), args.len())?;
        Ok(args)
    }
}

fn parse_variable(spec: &str) -> Result<Expression> {
    let split = spec.find(['.', '[']).unwrap_or(spec.len());
    let (name, rest) = spec.split_at(split);
    if name.is_empty() {
        return Err(Error::InvalidPath(format!("empty variable name in '$${spec}'")));
    }
    let path = match rest.strip_prefix('.') {
        Some(p) => Some(FieldPath::parse(p)?),
        None if rest.is_empty() => None,
        None => Some(FieldPath::parse(rest)?),
    };
    Ok(Expression::Variable {
        name: name.to_string(),
        path,
    })
}

fn object<'j>(op: &str, value: &'j JsonValue) -> Result<&'j Map<String, JsonValue>> {
    value
        .as_object()
        .ok_or_else(|| Error::argument(op, "expected an object"))
}

fn required<'j>(op: &str, m: &'j Map<String, JsonValue>, key: &str) -> Result<&'j JsonValue> {
    m.get(key)
        .ok_or_else(|| Error::argument(op, format!("missing required field '{key}'")))
}

fn variable_name(op: &str, name: &str) -> Result<String> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_' || !c.is_ascii())
        && name.chars().all(|c| c.is_alphanumeric() || c == '_');
    if !valid {
        return Err(Error::argument(op, format!("invalid variable name '{name}'")));
    }
    Ok(name.to_string())
}

fn alias(op: &str, m: &Map<String, JsonValue>) -> Result<String> {
    match m.get("as") {
        Some(JsonValue::String(s)) => variable_name(op, s),
        Some(_) => Err(Error::argument(op, "'as' must be a string")),
        None => Ok("this".to_string()),
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

impl Expression {
    pub fn literal(value: impl Into<Value>) -> Self {
        Expression::Literal(value.into())
    }

    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<Value> {
        match self {
            Expression::Literal(v) => Ok(v.clone()),
            Expression::Variable { name, path } => {
                let value = ctx.variable(name)?;
                Ok(match path {
                    Some(p) => value.resolve(p),
                    None => value,
                })
            }
            Expression::Field(path) => Ok(ctx.current().resolve(path)),
            Expression::Operator { op, args } => {
                let args = args
                    .iter()
                    .map(|a| a.evaluate(ctx))
                    .collect::<Result<Vec<_>>>()?;
                op.evaluate(&args, ctx)
            }
            Expression::Object(fields) => {
                let mut doc = Document::new();
                for (name, expr) in fields {
                    doc.insert(name.clone(), expr.evaluate(ctx)?);
                }
                Ok(Value::Object(doc))
            }
            Expression::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|e| e.evaluate(ctx).map(null_if_absent))
                    .collect::<Result<_>>()?,
            )),
            Expression::Cond {
                condition,
                then,
                otherwise,
            } => {
                if condition.evaluate(ctx)?.is_truthy() {
                    then.evaluate(ctx)
                } else {
                    otherwise.evaluate(ctx)
                }
            }
            Expression::IfNull(items) => {
                let Some((last, candidates)) = items.split_last() else {
                    return Ok(Value::Null);
                };
                for expr in candidates {
                    let v = expr.evaluate(ctx)?;
                    if !v.is_nullish() {
                        return Ok(v);
                    }
                }
                last.evaluate(ctx)
            }
            Expression::Switch { branches, default } => {
                for (case, then) in branches {
                    if case.evaluate(ctx)?.is_truthy() {
                        return then.evaluate(ctx);
                    }
                }
                match default {
                    Some(d) => d.evaluate(ctx),
                    None => Err(Error::argument("$switch", "no branch matched and no default was given")),
                }
            }
            Expression::Let { vars, body } => {
                let mut bindings = IndexMap::with_capacity(vars.len());
                for (name, expr) in vars {
                    bindings.insert(name.clone(), expr.evaluate(ctx)?);
                }
                let scope = Scope::child(ctx.scope(), bindings);
                body.evaluate(&ctx.with_scope(&scope))
            }
            Expression::Map { input, alias, body } => {
                let Some(items) = array_input("$map", input, ctx)? else {
                    return Ok(Value::Null);
                };
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    let scope = Scope::child(ctx.scope(), IndexMap::from([(alias.clone(), item)]));
                    out.push(null_if_absent(body.evaluate(&ctx.with_scope(&scope))?));
                }
                Ok(Value::Array(out))
            }
            Expression::Filter {
                input,
                alias,
                cond,
                limit,
            } => {
                let Some(items) = array_input("$filter", input, ctx)? else {
                    return Ok(Value::Null);
                };
                let limit = match limit {
                    Some(l) => {
                        let l = l.evaluate(ctx)?;
                        let n = l
                            .as_i64()
                            .filter(|n| *n > 0)
                            .ok_or_else(|| Error::argument("$filter", "limit must be a positive integer"))?;
                        Some(n as usize)
                    }
                    None => None,
                };
                let mut out = Vec::new();
                for item in items {
                    if limit.is_some_and(|l| out.len() >= l) {
                        break;
                    }
                    let scope = Scope::child(ctx.scope(), IndexMap::from([(alias.clone(), item)]));
                    if cond.evaluate(&ctx.with_scope(&scope))?.is_truthy() {
                        if let Some(item) = scope.get(alias) {
                            out.push(item.clone());
                        }
                    }
                }
                Ok(Value::Array(out))
            }
            Expression::Reduce {
                input,
                initial,
                body,
            } => {
                let Some(items) = array_input("$reduce", input, ctx)? else {
                    return Ok(Value::Null);
                };
                let mut acc = initial.evaluate(ctx)?;
                for item in items {
                    let scope = Scope::child(
                        ctx.scope(),
                        IndexMap::from([("value".to_string(), acc), ("this".to_string(), item)]),
                    );
                    acc = body.evaluate(&ctx.with_scope(&scope))?;
                }
                Ok(acc)
            }
            Expression::Function { lang, body, args } => {
                let host = ctx
                    .runtime
                    .script_host
                    .as_ref()
                    .ok_or(Error::ScriptUnavailable)?;
                let args = args
                    .iter()
                    .map(|a| a.evaluate(ctx))
                    .collect::<Result<Vec<_>>>()?;
                host.call(lang, body, &args)
            }
        }
    }
}

fn null_if_absent(v: Value) -> Value {
    if v.is_absent() { Value::Null } else { v }
}

/// Evaluate an array-valued input. Null or missing yields `None`.
fn array_input(op: &str, input: &Expression, ctx: &EvalContext<'_>) -> Result<Option<Vec<Value>>> {
    match input.evaluate(ctx)? {
        v if v.is_nullish() => Ok(None),
        Value::Array(items) => Ok(Some(items)),
        other => Err(Error::argument(op, format!("input must be an array, got {}", other.type_name()))),
    }
}
