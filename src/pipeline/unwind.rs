use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::cursor::{BoxCursor, Producer};
use crate::document::FieldPath;
use crate::error::{Error, Result};
use crate::value::Value;

/// `$unwind` options. The string form `"$path"` is shorthand for
/// `{path: "$path"}`.
#[derive(Debug, Clone)]
pub(crate) struct UnwindSpec {
    path: FieldPath,
    include_index: Option<FieldPath>,
    preserve: bool,
}

impl UnwindSpec {
    pub fn parse(body: &JsonValue) -> Result<Self> {
        let (path, include_index, preserve) = match body {
            JsonValue::String(path) => (path.as_str(), None, false),
            JsonValue::Object(obj) => {
                let path = obj
                    .get("path")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| Error::InvalidPipeline("$unwind requires a 'path' string".into()))?;
                let include_index = match obj.get("includeArrayIndex") {
                    None | Some(JsonValue::Null) => None,
                    Some(JsonValue::String(name)) if !name.is_empty() && !name.starts_with('$') => {
                        Some(FieldPath::parse(name)?)
                    }
                    Some(_) => {
                        return Err(Error::InvalidPipeline(
                            "includeArrayIndex must be a field name".into(),
                        ));
                    }
                };
                let preserve = match obj.get("preserveNullAndEmptyArrays") {
                    None => false,
                    Some(v) => v.as_bool().ok_or_else(|| {
                        Error::InvalidPipeline("preserveNullAndEmptyArrays must be a boolean".into())
                    })?,
                };
                for key in obj.keys() {
                    if !matches!(key.as_str(), "path" | "includeArrayIndex" | "preserveNullAndEmptyArrays") {
                        return Err(Error::InvalidPipeline(format!("unknown $unwind option '{key}'")));
                    }
                }
                (path, include_index, preserve)
            }
            _ => return Err(Error::InvalidPipeline("$unwind must be a path string or an object".into())),
        };
        let field = path
            .strip_prefix('$')
            .filter(|p| !p.starts_with('$'))
            .ok_or_else(|| Error::InvalidPipeline(format!("$unwind path must start with '$': {path}")))?;
        Ok(Self {
            path: FieldPath::parse(field)?,
            include_index,
            preserve,
        })
    }

    /// Expand one document. Each output keeps the unwound field, holding
    /// the element rather than the array. The path is followed through
    /// objects only; an array met before its last segment counts as
    /// missing.
    fn unwind(&self, doc: Value) -> Vec<Value> {
        let Value::Object(source) = doc else {
            return Vec::new();
        };
        let items = match source.lookup(&self.path) {
            Some(Value::Array(items)) if !items.is_empty() => Some(items.clone()),
            _ => None,
        };
        match items {
            Some(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| {
                    let mut out = source.clone();
                    out.set(&self.path, item);
                    if let Some(index) = &self.include_index {
                        out.set(index, Value::from(i));
                    }
                    Value::Object(out)
                })
                .collect(),
            _ if self.preserve => {
                let mut out = source;
                if let Some(index) = &self.include_index {
                    out.set(index, Value::from(0usize));
                }
                vec![Value::Object(out)]
            }
            _ => Vec::new(),
        }
    }
}

pub(crate) struct UnwindStage {
    upstream: BoxCursor,
    spec: Arc<UnwindSpec>,
    pending: VecDeque<Value>,
}

impl UnwindStage {
    pub fn new(upstream: BoxCursor, spec: Arc<UnwindSpec>) -> Self {
        Self {
            upstream,
            spec,
            pending: VecDeque::new(),
        }
    }
}

#[async_trait]
impl Producer for UnwindStage {
    async fn produce(&mut self) -> Result<Option<Value>> {
        loop {
            if let Some(doc) = self.pending.pop_front() {
                return Ok(Some(doc));
            }
            match self.upstream.next().await? {
                Some(doc) => self.pending.extend(self.spec.unwind(doc)),
                None => return Ok(None),
            }
        }
    }

    fn release(&mut self) {
        self.pending.clear();
        self.upstream.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unwind(spec: JsonValue, doc: JsonValue) -> Vec<Value> {
        UnwindSpec::parse(&spec).unwrap().unwind(Value::from(doc))
    }

    #[test]
    fn emits_one_document_per_element() {
        let out = unwind(json!("$tags"), json!({"_id": 1, "tags": ["a", "b"]}));
        assert_eq!(
            out,
            vec![
                Value::from(json!({"_id": 1, "tags": "a"})),
                Value::from(json!({"_id": 1, "tags": "b"})),
            ]
        );
    }

    #[test]
    fn unwound_field_is_kept() {
        let out = unwind(json!({"path": "$c_year"}), json!({"c_year": [2019, 2020]}));
        assert_eq!(out.len(), 2);
        for (doc, year) in out.iter().zip([2019, 2020]) {
            assert_eq!(doc.as_object().unwrap().get("c_year"), Some(&Value::from(year)));
        }
    }

    #[test]
    fn preserve_keeps_empty_missing_and_scalar() {
        let spec = json!({"path": "$a", "includeArrayIndex": "i", "preserveNullAndEmptyArrays": true});
        assert_eq!(unwind(spec.clone(), json!({"a": []})), vec![Value::from(json!({"a": [], "i": 0}))]);
        assert_eq!(unwind(spec.clone(), json!({"b": 1})), vec![Value::from(json!({"b": 1, "i": 0}))]);
        assert_eq!(unwind(spec, json!({"a": null})), vec![Value::from(json!({"a": null, "i": 0}))]);
    }

    #[test]
    fn without_preserve_non_arrays_are_dropped() {
        assert!(unwind(json!("$a"), json!({"a": []})).is_empty());
        assert!(unwind(json!("$a"), json!({"a": 5})).is_empty());
        assert!(unwind(json!("$a"), json!({})).is_empty());
    }

    #[test]
    fn nested_paths() {
        let out = unwind(json!({"path": "$foo.bar", "includeArrayIndex": "idx"}), json!({"foo": {"bar": [1, 2]}}));
        assert_eq!(
            out,
            vec![
                Value::from(json!({"foo": {"bar": 1}, "idx": 0})),
                Value::from(json!({"foo": {"bar": 2}, "idx": 1})),
            ]
        );
    }

    #[test]
    fn paths_through_arrays_are_not_unwound() {
        let doc = json!({"_id": 1, "items": [{"tags": ["a", "b"]}, {"tags": ["c"]}]});
        assert!(unwind(json!("$items.tags"), doc.clone()).is_empty());
        let preserve = json!({"path": "$items.tags", "preserveNullAndEmptyArrays": true});
        assert_eq!(unwind(preserve, doc.clone()), vec![Value::from(doc)]);
    }

    #[test]
    fn parse_errors() {
        assert!(UnwindSpec::parse(&json!("tags")).is_err());
        assert!(UnwindSpec::parse(&json!("$$ROOT")).is_err());
        assert!(UnwindSpec::parse(&json!({"path": "$a", "bogus": 1})).is_err());
        assert!(UnwindSpec::parse(&json!({"path": "$a", "preserveNullAndEmptyArrays": "yes"})).is_err());
        assert!(UnwindSpec::parse(&json!(3)).is_err());
    }
}
