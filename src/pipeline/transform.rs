//! `$transform`: a stateful per-document hook.
//!
//! ```json
//! {"$transform": {
//!     "vars":  {"total": 0},
//!     "each":  {"set": {"total": {"$add": ["$$total", "$n"]}}, "in": "$$ROOT"},
//!     "after": {"in": {"total": "$$total"}}
//! }}
//! ```
//!
//! `vars` are evaluated once and visible as `$$name` in every phase. `set`
//! assignments run in order, each seeing the ones before it. A phase whose
//! `in` evaluates to `$$REMOVE` (or a missing value) emits nothing. `each`
//! may also be a bare expression, which is its `in`.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{Map, Value as JsonValue};
use tracing::trace;

use super::StageAt;
use crate::context::{EvalContext, Runtime, Scope};
use crate::cursor::{BoxCursor, Producer};
use crate::error::{Error, Result};
use crate::expression::{Expression, Parser};
use crate::value::Value;

#[derive(Debug, Clone, Default)]
struct Phase {
    set: Vec<(String, Expression)>,
    emit: Option<Expression>,
}

impl Phase {
    fn parse(name: &str, body: &JsonValue, parser: &Parser<'_>) -> Result<Self> {
        match body.as_object() {
            Some(obj) if is_phase(obj) => {
                let set = match obj.get("set") {
                    Some(set) => bindings(name, set, parser)?,
                    None => Vec::new(),
                };
                let emit = obj.get("in").map(|e| parser.parse(e)).transpose()?;
                Ok(Self { set, emit })
            }
            _ => Ok(Self {
                set: Vec::new(),
                emit: Some(parser.parse(body)?),
            }),
        }
    }

    /// Apply the `set` assignments to the variables held by `scope`, in
    /// place and in order.
    fn update(&self, scope: &mut Scope<'_>, ctx: &EvalContext<'_>) -> Result<()> {
        for (name, expr) in &self.set {
            let value = expr.evaluate(&ctx.with_scope(scope))?;
            scope.set(name, value);
        }
        Ok(())
    }
}

fn is_phase(obj: &Map<String, JsonValue>) -> bool {
    !obj.is_empty() && obj.keys().all(|k| k == "set" || k == "in")
}

fn bindings(phase: &str, value: &JsonValue, parser: &Parser<'_>) -> Result<Vec<(String, Expression)>> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline(format!("$transform {phase} must be an object")))?;
    obj.iter()
        .map(|(name, expr)| {
            if name.is_empty() || !name.starts_with(|c: char| c.is_ascii_lowercase() || c == '_') {
                return Err(Error::InvalidPipeline(format!(
                    "$transform variable names must start with a lowercase letter: '{name}'"
                )));
            }
            Ok((name.clone(), parser.parse(expr)?))
        })
        .collect()
}

#[derive(Debug, Clone)]
pub(crate) struct TransformSpec {
    vars: Vec<(String, Expression)>,
    each: Phase,
    after: Option<Phase>,
}

impl TransformSpec {
    pub fn parse(body: &JsonValue, parser: &Parser<'_>) -> Result<Self> {
        let obj = body
            .as_object()
            .ok_or_else(|| Error::InvalidPipeline("$transform must be an object".into()))?;
        for key in obj.keys() {
            if !matches!(key.as_str(), "vars" | "each" | "after") {
                return Err(Error::InvalidPipeline(format!("unknown $transform option '{key}'")));
            }
        }
        let vars = match obj.get("vars") {
            Some(v) => bindings("vars", v, parser)?,
            None => Vec::new(),
        };
        let each = match obj.get("each") {
            Some(e) => Phase::parse("each", e, parser)?,
            None => Phase::default(),
        };
        let after = obj.get("after").map(|a| Phase::parse("after", a, parser)).transpose()?;
        Ok(Self { vars, each, after })
    }
}

pub(crate) struct TransformStage {
    upstream: BoxCursor,
    spec: Arc<TransformSpec>,
    runtime: Arc<Runtime>,
    at: StageAt,
    vars: Option<IndexMap<String, Value>>,
    position: usize,
    finished: bool,
}

impl TransformStage {
    pub fn new(upstream: BoxCursor, spec: Arc<TransformSpec>, runtime: Arc<Runtime>, at: StageAt) -> Self {
        Self {
            upstream,
            spec,
            runtime,
            at,
            vars: None,
            position: 0,
            finished: false,
        }
    }

    fn init_vars(&self) -> Result<IndexMap<String, Value>> {
        let root = Value::Null;
        let ctx = EvalContext::new(&self.runtime, &root);
        let mut scope = Scope::new(IndexMap::new());
        for (name, expr) in &self.spec.vars {
            let value = expr.evaluate(&ctx.with_scope(&scope))?;
            scope.set(name, value);
        }
        Ok(scope.into_bindings())
    }

    /// Run one phase against `doc` and return what it emits, if anything.
    fn step(&mut self, phase: &Phase, doc: &Value) -> Result<Option<Value>> {
        let vars = match self.vars.take() {
            Some(vars) => vars,
            None => self.init_vars()?,
        };
        let mut scope = Scope::new(vars);
        let ctx = EvalContext::new(&self.runtime, doc).at_position(self.position);
        let emitted = phase.update(&mut scope, &ctx).and_then(|()| match &phase.emit {
            Some(expr) => expr.evaluate(&ctx.with_scope(&scope)),
            None => Ok(doc.clone()),
        });
        self.vars = Some(scope.into_bindings());
        let emitted = emitted?;
        Ok((!emitted.is_absent()).then_some(emitted))
    }
}

#[async_trait]
impl Producer for TransformStage {
    async fn produce(&mut self) -> Result<Option<Value>> {
        let spec = Arc::clone(&self.spec);
        while !self.finished {
            match self.upstream.next().await? {
                Some(doc) => {
                    let emitted = self.step(&spec.each, &doc).map_err(|e| self.at.wrap(e))?;
                    self.position += 1;
                    if emitted.is_some() {
                        return Ok(emitted);
                    }
                }
                None => {
                    self.finished = true;
                    let Some(after) = &spec.after else {
                        break;
                    };
                    trace!(documents = self.position, "running $transform after phase");
                    if after.emit.is_none() {
                        break;
                    }
                    return self.step(after, &Value::Null).map_err(|e| self.at.wrap(e));
                }
            }
        }
        Ok(None)
    }

    fn release(&mut self) {
        self.finished = true;
        self.upstream.close();
    }
}
