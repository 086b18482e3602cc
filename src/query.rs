use std::cmp::Ordering;

use regex::{Regex, RegexBuilder};
use serde_json::Value as JsonValue;

use crate::document::FieldPath;
use crate::error::{Error, Result};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Sort
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Parse a sort spec: an object of field to `1` (asc) or `-1` (desc).
pub fn parse_sort(spec: &JsonValue) -> Result<Vec<(FieldPath, SortOrder)>> {
    let obj = spec
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("sort must be an object".into()))?;
    let mut fields = Vec::with_capacity(obj.len());
    for (field, dir) in obj {
        let order = match dir.as_i64() {
            Some(1) => SortOrder::Asc,
            Some(-1) => SortOrder::Desc,
            _ => {
                return Err(Error::InvalidPipeline(
                    "sort direction must be 1 (asc) or -1 (desc)".into(),
                ));
            }
        };
        fields.push((FieldPath::parse(field)?, order));
    }
    Ok(fields)
}

/// Compare two documents by a parsed sort spec. Missing fields sort first.
pub fn compare_by(a: &Value, b: &Value, fields: &[(FieldPath, SortOrder)]) -> Ordering {
    for (path, order) in fields {
        let cmp = a.resolve(path).cmp(&b.resolve(path));
        let cmp = match order {
            SortOrder::Asc => cmp,
            SortOrder::Desc => cmp.reverse(),
        };
        if cmp != Ordering::Equal {
            return cmp;
        }
    }
    Ordering::Equal
}

// ---------------------------------------------------------------------------
// Query AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum QueryOp {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(Regex),
}

#[derive(Debug, Clone)]
pub enum Query {
    Field { field: FieldPath, op: QueryOp },
    And(Vec<Query>),
    Or(Vec<Query>),
    All,
}

// ---------------------------------------------------------------------------
// Parsing: JSON -> Query AST
// ---------------------------------------------------------------------------

pub fn parse_query(query: &JsonValue) -> Result<Query> {
    let obj = query
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("query must be a JSON object".into()))?;

    let mut conditions: Vec<Query> = Vec::new();

    for (key, value) in obj {
        match key.as_str() {
            "$and" | "$or" => {
                let arr = value
                    .as_array()
                    .ok_or_else(|| Error::InvalidPipeline(format!("{key} must be an array")))?;
                let subs = arr.iter().map(parse_query).collect::<Result<Vec<_>>>()?;
                conditions.push(if key == "$and" {
                    Query::And(subs)
                } else {
                    Query::Or(subs)
                });
            }
            other if other.starts_with('$') => {
                return Err(Error::InvalidPipeline(format!("unknown query operator: {other}")));
            }
            field => {
                let field = FieldPath::parse(field)?;
                match value.as_object() {
                    Some(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                        let options = ops.get("$options").and_then(JsonValue::as_str).unwrap_or("");
                        for (op_key, op_val) in ops {
                            if op_key == "$options" {
                                continue;
                            }
                            conditions.push(Query::Field {
                                field: field.clone(),
                                op: parse_op(op_key, op_val, options)?,
                            });
                        }
                    }
                    // Shorthand for $eq, including plain object equality.
                    _ => conditions.push(Query::Field {
                        field,
                        op: QueryOp::Eq(Value::from_json(value)),
                    }),
                }
            }
        }
    }

    Ok(match conditions.len() {
        0 => Query::All,
        1 => conditions.remove(0),
        _ => Query::And(conditions),
    })
}

fn parse_op(op_key: &str, op_val: &JsonValue, options: &str) -> Result<QueryOp> {
    let list = |v: &JsonValue| -> Result<Vec<Value>> {
        v.as_array()
            .map(|arr| arr.iter().map(Value::from_json).collect())
            .ok_or_else(|| Error::InvalidPipeline(format!("{op_key} must be an array")))
    };
    match op_key {
        "$eq" => Ok(QueryOp::Eq(Value::from_json(op_val))),
        "$ne" => Ok(QueryOp::Ne(Value::from_json(op_val))),
        "$gt" => Ok(QueryOp::Gt(Value::from_json(op_val))),
        "$gte" => Ok(QueryOp::Gte(Value::from_json(op_val))),
        "$lt" => Ok(QueryOp::Lt(Value::from_json(op_val))),
        "$lte" => Ok(QueryOp::Lte(Value::from_json(op_val))),
        "$in" => Ok(QueryOp::In(list(op_val)?)),
        "$nin" => Ok(QueryOp::Nin(list(op_val)?)),
        "$exists" => {
            let b = op_val
                .as_bool()
                .ok_or_else(|| Error::InvalidPipeline("$exists must be a boolean".into()))?;
            Ok(QueryOp::Exists(b))
        }
        "$regex" => {
            let pattern = op_val
                .as_str()
                .ok_or_else(|| Error::InvalidPipeline("$regex must be a string".into()))?;
            let re = RegexBuilder::new(pattern)
                .case_insensitive(options.contains('i'))
                .multi_line(options.contains('m'))
                .build()
                .map_err(|e| Error::InvalidPipeline(format!("invalid $regex: {e}")))?;
            Ok(QueryOp::Regex(re))
        }
        _ => Err(Error::InvalidPipeline(format!("unknown query operator: {op_key}"))),
    }
}

// ---------------------------------------------------------------------------
// Filter: evaluate a query against a single document
// ---------------------------------------------------------------------------

/// True when `doc` satisfies `query`. Equality-style operators also match
/// when the field holds an array containing a matching element.
pub fn matches_value(query: &Query, doc: &Value) -> bool {
    match query {
        Query::All => true,
        Query::Field { field, op } => {
            let val = doc.resolve(field);
            match op {
                QueryOp::Exists(expected) => !val.is_absent() == *expected,
                QueryOp::Ne(v) => !any_element(&val, |x| x == v),
                QueryOp::Nin(vals) => !any_element(&val, |x| vals.contains(x)),
                _ if val.is_absent() => matches!(op, QueryOp::Eq(Value::Null) | QueryOp::In(_))
                    && matches_op(op, &Value::Null),
                _ => any_element(&val, |x| matches_op(op, x)),
            }
        }
        Query::And(subs) => subs.iter().all(|s| matches_value(s, doc)),
        Query::Or(subs) => subs.iter().any(|s| matches_value(s, doc)),
    }
}

fn any_element(val: &Value, pred: impl Fn(&Value) -> bool) -> bool {
    pred(val) || val.as_array().is_some_and(|items| items.iter().any(&pred))
}

fn matches_op(op: &QueryOp, v: &Value) -> bool {
    // Range operators only compare values of the same kind.
    let comparable = |other: &Value| same_kind(v, other);
    match op {
        QueryOp::Eq(x) => v == x,
        QueryOp::Ne(x) => v != x,
        QueryOp::Gt(x) => comparable(x) && v > x,
        QueryOp::Gte(x) => comparable(x) && v >= x,
        QueryOp::Lt(x) => comparable(x) && v < x,
        QueryOp::Lte(x) => comparable(x) && v <= x,
        QueryOp::In(vals) => vals.contains(v),
        QueryOp::Nin(vals) => !vals.contains(v),
        QueryOp::Exists(expected) => !v.is_absent() == *expected,
        QueryOp::Regex(re) => v.as_str().is_some_and(|s| re.is_match(s)),
    }
}

fn same_kind(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (a, b) if a.is_number() && b.is_number() => true,
        _ => std::mem::discriminant(a) == std::mem::discriminant(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matches(q: JsonValue, doc: JsonValue) -> bool {
        matches_value(&parse_query(&q).unwrap(), &Value::from(doc))
    }

    #[test]
    fn parse_simple_eq() {
        assert!(matches(json!({"name": "Alice"}), json!({"name": "Alice"})));
        assert!(!matches(json!({"name": "Alice"}), json!({"name": "Bob"})));
    }

    #[test]
    fn parse_range() {
        let q = json!({"age": {"$gte": 18, "$lt": 65}});
        assert!(matches(q.clone(), json!({"age": 30})));
        assert!(!matches(q.clone(), json!({"age": 10})));
        assert!(!matches(q.clone(), json!({"age": 70})));
        assert!(!matches(q, json!({"age": "30"})));
    }

    #[test]
    fn parse_or() {
        let q = json!({"$or": [{"status": "active"}, {"priority": {"$gte": 5}}]});
        assert!(matches(q.clone(), json!({"status": "active", "priority": 1})));
        assert!(matches(q.clone(), json!({"status": "closed", "priority": 10})));
        assert!(!matches(q, json!({"status": "closed", "priority": 1})));
    }

    #[test]
    fn arrays_match_any_element() {
        assert!(matches(json!({"tags": "b"}), json!({"tags": ["a", "b"]})));
        assert!(matches(json!({"tags": {"$in": ["x", "a"]}}), json!({"tags": ["a"]})));
        assert!(!matches(json!({"tags": {"$nin": ["a"]}}), json!({"tags": ["a"]})));
        assert!(!matches(json!({"tags": {"$ne": "a"}}), json!({"tags": ["a", "b"]})));
    }

    #[test]
    fn exists_and_null() {
        assert!(matches(json!({"x": {"$exists": false}}), json!({"y": 1})));
        assert!(matches(json!({"x": null}), json!({"y": 1})));
        assert!(!matches(json!({"x": {"$gt": 0}}), json!({"y": 1})));
    }

    #[test]
    fn regex_with_options() {
        let q = json!({"name": {"$regex": "^al", "$options": "i"}});
        assert!(matches(q.clone(), json!({"name": "Alice"})));
        assert!(!matches(q, json!({"name": "Bob"})));
    }

    #[test]
    fn nested_paths() {
        assert!(matches(json!({"a.b": 2}), json!({"a": {"b": 2}})));
    }

    #[test]
    fn unknown_operator_errors() {
        assert!(parse_query(&json!({"a": {"$near": 1}})).is_err());
        assert!(parse_query(&json!({"$where": "x"})).is_err());
    }

    #[test]
    fn sort_comparator() {
        let fields = parse_sort(&json!({"a": 1, "b": -1})).unwrap();
        let x = Value::from(json!({"a": 1, "b": 1}));
        let y = Value::from(json!({"a": 1, "b": 2}));
        assert_eq!(compare_by(&x, &y, &fields), Ordering::Greater);
        assert!(parse_sort(&json!({"a": 2})).is_err());
    }
}
