//! Storage-facing seams.
//!
//! A [`DataSource`] turns a [`QueryDescriptor`] from a `$cursor` stage into
//! a cursor; an [`Expander`] resolves reference and list relationships for
//! `$expand`. Authorization is the storage layer's concern: documents
//! arriving here are already visible to the caller.
//!
//! [`MemorySource`] implements both over in-memory collections.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::cursor::{ArrayCursor, BoxCursor, CursorExt};
use crate::document::{Document, FieldPath};
use crate::error::{Error, Result};
use crate::query::{compare_by, matches_value, parse_query, parse_sort};
use crate::value::Value;

/// A query against one object collection.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueryDescriptor {
    pub object: String,
    #[serde(rename = "where")]
    pub filter: Option<JsonValue>,
    pub sort: Option<JsonValue>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    /// Fields to keep; `_id` is always kept.
    pub paths: Option<Vec<String>>,
}

impl QueryDescriptor {
    pub fn new(object: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            ..Default::default()
        }
    }

    pub fn from_json(value: &JsonValue) -> Result<Self> {
        let query: Self = serde_json::from_value(value.clone())?;
        if query.object.is_empty() {
            return Err(Error::InvalidPipeline("$cursor requires an 'object'".into()));
        }
        Ok(query)
    }
}

#[async_trait]
pub trait DataSource: Send + Sync {
    async fn query(&self, query: &QueryDescriptor) -> Result<BoxCursor>;
}

/// The related documents behind one field of an owner document.
pub enum Expansion {
    /// The referenced document, or `None` for a dangling reference.
    Reference(Option<Value>),
    /// Related documents in their stored order.
    List(BoxCursor),
}

#[async_trait]
pub trait Expander: Send + Sync {
    async fn expand(&self, owner: &Value, field: &FieldPath) -> Result<Expansion>;
}

/// Keep only `paths` (and `_id`) of an object document.
pub fn select_paths(doc: Value, paths: &[FieldPath]) -> Value {
    let Value::Object(source) = doc else {
        return doc;
    };
    let mut out = Document::new();
    if let Some(id) = source.get("_id") {
        out.insert("_id", id.clone());
    }
    for path in paths {
        let v = source.resolve(path);
        if !v.is_absent() {
            out.set(path, v);
        }
    }
    Value::Object(out)
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Relation {
    /// The owner field holds `{_id}` (or a bare id) of a document in `object`.
    Reference { object: String },
    /// Documents in `object` whose `foreign_field` equals the owner's `_id`.
    List {
        object: String,
        foreign_field: FieldPath,
    },
}

/// In-memory collections with reference and list relationships.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    collections: HashMap<String, Vec<Value>>,
    relations: HashMap<String, Relation>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, object: &str, docs: Vec<Value>) -> Self {
        self.collections.insert(object.to_string(), docs);
        self
    }

    /// Declare `field` as a reference into `object`.
    pub fn with_reference(mut self, field: &str, object: &str) -> Self {
        self.relations.insert(
            field.to_string(),
            Relation::Reference {
                object: object.to_string(),
            },
        );
        self
    }

    /// Declare `field` as the list of `object` documents whose
    /// `foreign_field` points back at the owner.
    pub fn with_list(mut self, field: &str, object: &str, foreign_field: &str) -> Result<Self> {
        self.relations.insert(
            field.to_string(),
            Relation::List {
                object: object.to_string(),
                foreign_field: FieldPath::parse(foreign_field)?,
            },
        );
        Ok(self)
    }

    fn collection(&self, object: &str) -> Result<&[Value]> {
        self.collections
            .get(object)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::Source(format!("unknown object '{object}'")))
    }

    /// Run a query synchronously.
    pub fn find(&self, query: &QueryDescriptor) -> Result<Vec<Value>> {
        let docs = self.collection(&query.object)?;
        let filter = match &query.filter {
            Some(f) => parse_query(f)?,
            None => crate::query::Query::All,
        };
        let mut matched: Vec<Value> = docs
            .iter()
            .filter(|d| matches_value(&filter, d))
            .cloned()
            .collect();
        if let Some(sort) = &query.sort {
            let fields = parse_sort(sort)?;
            matched.sort_by(|a, b| compare_by(a, b, &fields));
        }
        let skip = query.skip.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        let paths = query
            .paths
            .as_ref()
            .map(|p| p.iter().map(|s| FieldPath::parse(s)).collect::<Result<Vec<_>>>())
            .transpose()?;
        let out: Vec<Value> = matched
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|d| match &paths {
                Some(p) => select_paths(d, p),
                None => d,
            })
            .collect();
        debug!(object = %query.object, returned = out.len(), "memory source query");
        Ok(out)
    }
}

#[async_trait]
impl DataSource for MemorySource {
    async fn query(&self, query: &QueryDescriptor) -> Result<BoxCursor> {
        Ok(ArrayCursor::new(self.find(query)?).boxed())
    }
}

#[async_trait]
impl Expander for MemorySource {
    async fn expand(&self, owner: &Value, field: &FieldPath) -> Result<Expansion> {
        let name = field.to_string();
        let relation = self
            .relations
            .get(&name)
            .ok_or_else(|| Error::Source(format!("'{name}' is not an expandable property")))?;
        match relation {
            Relation::Reference { object } => {
                let id = match owner.resolve(field) {
                    Value::Object(r) => r.get("_id").cloned().unwrap_or(Value::Missing),
                    other => other,
                };
                if id.is_nullish() {
                    return Ok(Expansion::Reference(None));
                }
                let found = self
                    .collection(object)?
                    .iter()
                    .find(|d| d.as_object().and_then(|o| o.get("_id")) == Some(&id))
                    .cloned();
                Ok(Expansion::Reference(found))
            }
            Relation::List {
                object,
                foreign_field,
            } => {
                let id = owner
                    .as_object()
                    .and_then(|o| o.get("_id"))
                    .cloned()
                    .unwrap_or(Value::Missing);
                let related: Vec<Value> = self
                    .collection(object)?
                    .iter()
                    .filter(|d| {
                        let v = d.resolve(foreign_field);
                        !id.is_absent() && (v == id || v.as_object().and_then(|o| o.get("_id")) == Some(&id))
                    })
                    .cloned()
                    .collect();
                Ok(Expansion::List(ArrayCursor::new(related).boxed()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::Cursor;
    use serde_json::json;

    fn source() -> MemorySource {
        MemorySource::new()
            .with_collection(
                "c_patient",
                vec![
                    Value::from(json!({"_id": "p1", "c_name": "Ann", "c_age": 40, "c_doctor": {"_id": "d1", "object": "c_doctor"}})),
                    Value::from(json!({"_id": "p2", "c_name": "Bo", "c_age": 20, "c_doctor": {"_id": "d2", "object": "c_doctor"}})),
                    Value::from(json!({"_id": "p3", "c_name": "Cy", "c_age": 30})),
                ],
            )
            .with_collection(
                "c_doctor",
                vec![
                    Value::from(json!({"_id": "d1", "c_name": "Dr. A"})),
                    Value::from(json!({"_id": "d2", "c_name": "Dr. B"})),
                ],
            )
            .with_reference("c_doctor", "c_doctor")
            .with_list("c_patients", "c_patient", "c_doctor")
            .unwrap()
    }

    #[test]
    fn descriptor_from_json() {
        let q = QueryDescriptor::from_json(&json!({"object": "c_patient", "where": {"c_age": {"$gt": 1}}, "limit": 2})).unwrap();
        assert_eq!(q.object, "c_patient");
        assert_eq!(q.limit, Some(2));
        assert!(QueryDescriptor::from_json(&json!({"limit": 2})).is_err());
    }

    #[test]
    fn find_filters_sorts_and_pages() {
        let q = QueryDescriptor {
            filter: Some(json!({"c_age": {"$gte": 25}})),
            sort: Some(json!({"c_age": 1})),
            paths: Some(vec!["c_name".into()]),
            ..QueryDescriptor::new("c_patient")
        };
        let docs = source().find(&q).unwrap();
        assert_eq!(
            docs,
            vec![
                Value::from(json!({"_id": "p3", "c_name": "Cy"})),
                Value::from(json!({"_id": "p1", "c_name": "Ann"})),
            ]
        );
    }

    #[test]
    fn unknown_object_is_a_source_error() {
        let err = source().find(&QueryDescriptor::new("c_nope")).unwrap_err();
        assert!(matches!(err, Error::Source(_)));
    }

    #[tokio::test]
    async fn expands_references_and_lists() {
        let src = source();
        let owner = Value::from(json!({"_id": "p1", "c_doctor": {"_id": "d1"}}));
        match src.expand(&owner, &FieldPath::parse("c_doctor").unwrap()).await.unwrap() {
            Expansion::Reference(Some(doc)) => assert_eq!(doc.as_object().unwrap().get("c_name"), Some(&Value::from("Dr. A"))),
            _ => panic!("expected a reference"),
        }

        let doctor = Value::from(json!({"_id": "d1"}));
        match src.expand(&doctor, &FieldPath::parse("c_patients").unwrap()).await.unwrap() {
            Expansion::List(mut cursor) => {
                let first = cursor.next().await.unwrap().unwrap();
                assert_eq!(first.as_object().unwrap().get("_id"), Some(&Value::from("p1")));
                assert!(!cursor.has_more().await.unwrap());
            }
            _ => panic!("expected a list"),
        }
    }
}
