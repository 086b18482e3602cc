//! `$addFields` (alias `$set`) and the field-level `$expand` operator.
//!
//! Every field is computed against the input document, then merged into a
//! copy of it. A field whose value is `{"$expand": spec}` resolves the
//! relationship stored under that field through the configured
//! [`Expander`](crate::source::Expander):
//!
//! - a reference expands to the related document merged over the stored
//!   reference object;
//! - a list expands to `{"object": "list", "data": [...], "hasMore": bool}`.
//!
//! `spec` is `true`, a list of paths to keep, or
//! `{"pipeline": [...], "paths": [...], "limit": n}`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::debug;

use super::{Pipeline, Services, StageAt};
use crate::config::EngineConfig;
use crate::context::EvalContext;
use crate::cursor::{ArrayCursor, BoxCursor, CursorExt, Producer};
use crate::document::{Document, FieldPath};
use crate::error::{Error, Result};
use crate::expression::{Expression, Parser};
use crate::source::{select_paths, Expansion};
use crate::value::Value;

/// Documents returned for a list expansion when no `limit` is given.
pub const DEFAULT_EXPAND_LIMIT: usize = 100;

#[derive(Debug, Clone, Default)]
pub(crate) struct ExpandSpec {
    pipeline: Option<Pipeline>,
    paths: Option<Vec<FieldPath>>,
    limit: Option<usize>,
}

impl ExpandSpec {
    fn parse(body: &JsonValue, parser: &Parser<'_>, config: &EngineConfig) -> Result<Self> {
        match body {
            JsonValue::Bool(true) => Ok(Self::default()),
            JsonValue::Array(_) => Ok(Self {
                paths: Some(parse_paths(body)?),
                ..Self::default()
            }),
            JsonValue::Object(obj) => {
                let mut spec = Self::default();
                for (key, value) in obj {
                    match key.as_str() {
                        "pipeline" => spec.pipeline = Some(Pipeline::parse(value, parser, config)?),
                        "paths" => spec.paths = Some(parse_paths(value)?),
                        "limit" => {
                            let limit = value.as_u64().filter(|n| *n > 0).ok_or_else(|| {
                                Error::InvalidPipeline("$expand limit must be a positive integer".into())
                            })?;
                            spec.limit = Some(limit as usize);
                        }
                        other => {
                            return Err(Error::InvalidPipeline(format!("unknown $expand option '{other}'")));
                        }
                    }
                }
                Ok(spec)
            }
            _ => Err(Error::InvalidPipeline(
                "$expand takes true, a list of paths, or an options object".into(),
            )),
        }
    }
}

fn parse_paths(value: &JsonValue) -> Result<Vec<FieldPath>> {
    value
        .as_array()
        .ok_or_else(|| Error::InvalidPipeline("$expand paths must be an array of strings".into()))?
        .iter()
        .map(|p| {
            p.as_str()
                .ok_or_else(|| Error::InvalidPipeline("$expand paths must be an array of strings".into()))
                .and_then(FieldPath::parse)
        })
        .collect()
}

#[derive(Debug, Clone)]
enum FieldSpec {
    Value(Expression),
    Expand(ExpandSpec),
}

#[derive(Debug, Clone)]
pub(crate) struct AddFieldsSpec {
    fields: Vec<(FieldPath, FieldSpec)>,
}

impl AddFieldsSpec {
    pub fn parse(body: &JsonValue, parser: &Parser<'_>, config: &EngineConfig) -> Result<Self> {
        let obj = body
            .as_object()
            .ok_or_else(|| Error::InvalidPipeline("$addFields must be an object".into()))?;
        if obj.is_empty() {
            return Err(Error::InvalidPipeline("$addFields requires at least one field".into()));
        }
        let mut fields = Vec::with_capacity(obj.len());
        for (name, spec) in obj {
            if name.starts_with('$') {
                return Err(Error::InvalidPipeline(format!("invalid field name '{name}'")));
            }
            let field = match spec.as_object().and_then(|o| o.get("$expand").filter(|_| o.len() == 1)) {
                Some(expand) => FieldSpec::Expand(ExpandSpec::parse(expand, parser, config)?),
                None => FieldSpec::Value(parser.parse(spec)?),
            };
            fields.push((FieldPath::parse(name)?, field));
        }
        Ok(Self { fields })
    }
}

/// Resolve `path` of `owner` through the configured expander.
async fn expand(services: &Services, owner: &Value, path: &FieldPath, spec: &ExpandSpec) -> Result<Value> {
    let expander = services
        .expander
        .as_ref()
        .ok_or_else(|| Error::Source("no expander is configured for $expand".into()))?;
    match expander.expand(owner, path).await? {
        Expansion::Reference(None) => Ok(owner.resolve(path)),
        Expansion::Reference(Some(related)) => {
            let related = match &spec.pipeline {
                Some(pipeline) => {
                    let input = ArrayCursor::new(vec![related]).boxed();
                    let mut cursor = pipeline.run(Some(input), services).await?;
                    let first = cursor.next().await?;
                    cursor.close();
                    match first {
                        Some(doc) => doc,
                        None => return Ok(owner.resolve(path)),
                    }
                }
                None => related,
            };
            let related = match &spec.paths {
                Some(paths) => select_paths(related, paths),
                None => related,
            };
            let mut merged = owner.resolve(path).as_object().cloned().unwrap_or_default();
            if let Value::Object(fields) = related {
                for (k, v) in fields {
                    merged.insert(k, v);
                }
            }
            Ok(Value::Object(merged))
        }
        Expansion::List(cursor) => {
            let mut cursor = match &spec.pipeline {
                Some(pipeline) => pipeline.run(Some(cursor), services).await?,
                None => cursor,
            };
            let limit = spec.limit.unwrap_or(DEFAULT_EXPAND_LIMIT);
            let mut data = Vec::new();
            while data.len() < limit {
                match cursor.next().await? {
                    Some(doc) => data.push(match &spec.paths {
                        Some(paths) => select_paths(doc, paths),
                        None => doc,
                    }),
                    None => break,
                }
            }
            let has_more = cursor.has_more().await?;
            cursor.close();
            debug!(field = %path, returned = data.len(), has_more, "expanded list");

            let mut list = Document::new();
            list.insert("object", Value::from("list"));
            list.insert("data", Value::Array(data));
            list.insert("hasMore", Value::Bool(has_more));
            Ok(Value::Object(list))
        }
    }
}

pub(crate) struct AddFieldsStage {
    upstream: BoxCursor,
    spec: Arc<AddFieldsSpec>,
    services: Services,
    at: StageAt,
    position: usize,
}

impl AddFieldsStage {
    pub fn new(upstream: BoxCursor, spec: Arc<AddFieldsSpec>, services: Services, at: StageAt) -> Self {
        Self {
            upstream,
            spec,
            services,
            at,
            position: 0,
        }
    }
}

async fn add_fields(spec: &AddFieldsSpec, services: &Services, doc: Value, position: usize) -> Result<Value> {
    let mut computed = Vec::with_capacity(spec.fields.len());
    for (path, field) in &spec.fields {
        let value = match field {
            FieldSpec::Value(expr) => {
                let ctx = EvalContext::new(&services.runtime, &doc).at_position(position);
                expr.evaluate(&ctx)?
            }
            FieldSpec::Expand(expand_spec) => expand(services, &doc, path, expand_spec).await?,
        };
        computed.push(value);
    }
    let mut out = match doc {
        Value::Object(d) => d,
        _ => Document::new(),
    };
    for ((path, _), value) in spec.fields.iter().zip(computed) {
        out.set(path, value);
    }
    Ok(Value::Object(out))
}

#[async_trait]
impl Producer for AddFieldsStage {
    async fn produce(&mut self) -> Result<Option<Value>> {
        let Some(doc) = self.upstream.next().await? else {
            return Ok(None);
        };
        let position = self.position;
        self.position += 1;
        let at = self.at;
        add_fields(&self.spec, &self.services, doc, position)
            .await
            .map(Some)
            .map_err(|e| at.wrap(e))
    }

    fn release(&mut self) {
        self.upstream.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Runtime;
    use crate::operators::Registry;
    use crate::source::MemorySource;
    use crate::cursor::Staged;
    use serde_json::json;

    fn source() -> Arc<MemorySource> {
        let source = MemorySource::new()
            .with_collection(
                "c_patient",
                vec![
                    Value::from(json!({"_id": "p1", "c_name": "Ann", "c_doctor": {"_id": "d1", "object": "c_doctor"}})),
                    Value::from(json!({"_id": "p2", "c_name": "Bo", "c_doctor": {"_id": "d1", "object": "c_doctor"}})),
                    Value::from(json!({"_id": "p3", "c_name": "Cy", "c_doctor": {"_id": "d2", "object": "c_doctor"}})),
                ],
            )
            .with_collection(
                "c_doctor",
                vec![
                    Value::from(json!({"_id": "d1", "c_name": "Dr. A", "c_rank": 2})),
                    Value::from(json!({"_id": "d2", "c_name": "Dr. B", "c_rank": 1})),
                ],
            )
            .with_reference("c_doctor", "c_doctor")
            .with_list("c_patients", "c_patient", "c_doctor")
            .unwrap();
        Arc::new(source)
    }

    async fn add(spec: JsonValue, input: JsonValue, with_expander: bool) -> Result<Vec<Value>> {
        let registry = Registry::with_builtins();
        let config = EngineConfig::default();
        let spec = AddFieldsSpec::parse(&spec, &Parser::new(&registry, 64), &config)?;
        let mut services = Services::new(Runtime::default());
        if with_expander {
            services.expander = Some(source());
        }
        let docs = input.as_array().unwrap().iter().map(Value::from_json).collect();
        let at = StageAt {
            index: 0,
            name: "$addFields",
        };
        let stage = AddFieldsStage::new(ArrayCursor::new(docs).boxed(), Arc::new(spec), services, at);
        Staged::new(stage).to_array().await
    }

    fn docs(v: JsonValue) -> Vec<Value> {
        v.as_array().unwrap().iter().map(Value::from_json).collect()
    }

    #[tokio::test]
    async fn merges_computed_fields() {
        let out = add(
            json!({"b": {"$add": ["$a", 1]}, "a": 10, "gone": "$$REMOVE", "n.x": "$a"}),
            json!([{"a": 1, "gone": true}]),
            false,
        )
        .await
        .unwrap();
        // Every field sees the input document.
        assert_eq!(out, docs(json!([{"a": 10, "b": 2, "n": {"x": 1}}])));
    }

    #[tokio::test]
    async fn expands_references_in_owner_order() {
        let out = add(
            json!({"c_doctor": {"$expand": ["c_name"]}}),
            json!([
                {"_id": "p3", "c_doctor": {"_id": "d2", "object": "c_doctor"}},
                {"_id": "p1", "c_doctor": {"_id": "d1", "object": "c_doctor"}}
            ]),
            true,
        )
        .await
        .unwrap();
        assert_eq!(
            out,
            docs(json!([
                {"_id": "p3", "c_doctor": {"_id": "d2", "object": "c_doctor", "c_name": "Dr. B"}},
                {"_id": "p1", "c_doctor": {"_id": "d1", "object": "c_doctor", "c_name": "Dr. A"}}
            ]))
        );
    }

    #[tokio::test]
    async fn expands_lists_with_limit_and_pipeline() {
        let out = add(
            json!({"c_patients": {"$expand": {
                "pipeline": [{"$project": {"c_name": 1}}],
                "limit": 1
            }}}),
            json!([{"_id": "d1"}]),
            true,
        )
        .await
        .unwrap();
        assert_eq!(
            out,
            docs(json!([{"_id": "d1", "c_patients": {
                "object": "list",
                "data": [{"_id": "p1", "c_name": "Ann"}],
                "hasMore": true
            }}]))
        );
    }

    #[tokio::test]
    async fn expand_without_expander_is_a_source_error() {
        let err = add(json!({"c_doctor": {"$expand": true}}), json!([{"c_doctor": {"_id": "d1"}}]), false)
            .await
            .unwrap_err();
        assert_eq!(err.stage_index(), Some(0));
        assert!(matches!(err, Error::Stage { ref source, .. } if matches!(**source, Error::Source(_))));
    }

    #[test]
    fn parse_errors() {
        let registry = Registry::with_builtins();
        let parser = Parser::new(&registry, 64);
        let config = EngineConfig::default();
        assert!(AddFieldsSpec::parse(&json!({}), &parser, &config).is_err());
        assert!(AddFieldsSpec::parse(&json!({"a": {"$expand": 5}}), &parser, &config).is_err());
        assert!(AddFieldsSpec::parse(&json!({"a": {"$expand": {"limit": 0}}}), &parser, &config).is_err());
        assert!(AddFieldsSpec::parse(&json!({"a": {"$expand": {"pipeline": [{"$bogus": 1}]}}}), &parser, &config).is_err());
    }
}
