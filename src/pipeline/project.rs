use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::StageAt;
use crate::context::{EvalContext, Runtime};
use crate::cursor::{BoxCursor, Producer};
use crate::document::{Document, FieldPath};
use crate::error::{Error, Result};
use crate::expression::{Expression, Parser};
use crate::value::Value;

#[derive(Debug, Clone)]
enum ProjectField {
    Include,
    Exclude,
    Compute(Expression),
}

/// A `$project` spec. Inclusion mode builds a new document with exactly the
/// listed keys in the order given (plus `_id` unless excluded); exclusion mode
/// copies the input without the listed keys.
#[derive(Debug, Clone)]
pub(crate) struct Projection {
    fields: Vec<(FieldPath, ProjectField)>,
    inclusion: bool,
    exclude_id: bool,
}

impl Projection {
    pub fn parse(body: &JsonValue, parser: &Parser<'_>) -> Result<Self> {
        let obj = body
            .as_object()
            .ok_or_else(|| Error::InvalidPipeline("$project must be an object".into()))?;
        if obj.is_empty() {
            return Err(Error::InvalidPipeline("$project requires at least one field".into()));
        }
        let mut fields = Vec::with_capacity(obj.len());
        for (field, spec) in obj {
            let pf = match spec {
                JsonValue::Bool(true) => ProjectField::Include,
                JsonValue::Bool(false) => ProjectField::Exclude,
                JsonValue::Number(n) if n.as_f64() == Some(0.0) => ProjectField::Exclude,
                JsonValue::Number(_) => ProjectField::Include,
                _ => ProjectField::Compute(parser.parse(spec)?),
            };
            fields.push((FieldPath::parse(field)?, pf));
        }

        let is_id = |p: &FieldPath| p.to_string() == "_id";
        let inclusion = fields
            .iter()
            .any(|(p, f)| matches!(f, ProjectField::Compute(_)) || (!is_id(p) && matches!(f, ProjectField::Include)));
        let excludes_other = fields
            .iter()
            .any(|(p, f)| !is_id(p) && matches!(f, ProjectField::Exclude));
        if inclusion && excludes_other {
            return Err(Error::InvalidPipeline(
                "$project cannot mix inclusion and exclusion of fields other than _id".into(),
            ));
        }
        let exclude_id = fields
            .iter()
            .any(|(p, f)| is_id(p) && matches!(f, ProjectField::Exclude));

        Ok(Self {
            fields,
            inclusion,
            exclude_id,
        })
    }

    pub fn apply(&self, doc: &Value, ctx: &EvalContext<'_>) -> Result<Value> {
        if !self.inclusion {
            let mut out = doc.as_object().cloned().unwrap_or_default();
            for (path, _) in &self.fields {
                out.remove_path(path);
            }
            return Ok(Value::Object(out));
        }

        let mut out = Document::new();
        let mentions_id = self.fields.iter().any(|(p, _)| p.to_string() == "_id");
        if !self.exclude_id && !mentions_id {
            if let Some(id) = doc.as_object().and_then(|d| d.get("_id")) {
                out.insert("_id", id.clone());
            }
        }
        for (path, field) in &self.fields {
            match field {
                ProjectField::Include => {
                    if let Some(source) = doc.as_object() {
                        source.include_into(path, &mut out);
                    }
                }
                ProjectField::Compute(expr) => out.set(path, expr.evaluate(ctx)?),
                ProjectField::Exclude => {}
            }
        }
        Ok(Value::Object(out))
    }
}

pub(crate) struct ProjectStage {
    upstream: BoxCursor,
    spec: Arc<Projection>,
    runtime: Arc<Runtime>,
    at: StageAt,
    position: usize,
}

impl ProjectStage {
    pub fn new(upstream: BoxCursor, spec: Arc<Projection>, runtime: Arc<Runtime>, at: StageAt) -> Self {
        Self {
            upstream,
            spec,
            runtime,
            at,
            position: 0,
        }
    }
}

#[async_trait]
impl Producer for ProjectStage {
    async fn produce(&mut self) -> Result<Option<Value>> {
        let Some(doc) = self.upstream.next().await? else {
            return Ok(None);
        };
        let position = self.position;
        self.position += 1;
        let ctx = EvalContext::new(&self.runtime, &doc).at_position(position);
        self.spec.apply(&doc, &ctx).map(Some).map_err(|e| self.at.wrap(e))
    }

    fn release(&mut self) {
        self.upstream.close();
    }
}
