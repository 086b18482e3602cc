use std::fmt;

use indexmap::IndexMap;
use indexmap::map::{IntoIter, Iter, IterMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::value::Value;

/// An ordered mapping of field name to value. Insertion order is kept for
/// output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    fields: IndexMap<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.fields.get_mut(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Insert a field, keeping its position if it already exists. Absent
    /// values (`Missing`, `$$REMOVE`) delete the field instead.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if value.is_absent() {
            self.fields.shift_remove(&key);
        } else {
            self.fields.insert(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.shift_remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn iter(&self) -> Iter<'_, String, Value> {
        self.fields.iter()
    }

    pub fn iter_mut(&mut self) -> IterMut<'_, String, Value> {
        self.fields.iter_mut()
    }

    /// Resolve a path, returning `Value::Missing` when any segment is absent.
    /// A named segment applied to an array maps over its elements.
    pub fn resolve(&self, path: &FieldPath) -> Value {
        resolve_segments(&self.fields, path.segments())
    }

    /// Set a path, creating intermediate objects. Array indexes must be in
    /// bounds (or equal to the length, which appends).
    pub fn set(&mut self, path: &FieldPath, value: Value) {
        set_segments(&mut self.fields, path.segments(), value);
    }

    pub fn remove_path(&mut self, path: &FieldPath) {
        self.set(path, Value::Remove);
    }

    /// Look up a path through nested objects only. Unlike [`resolve`], a
    /// named segment never maps over an array.
    ///
    /// [`resolve`]: Document::resolve
    pub fn lookup(&self, path: &FieldPath) -> Option<&Value> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(&first.to_string())?;
        for segment in rest {
            current = match (current, segment) {
                (Value::Object(doc), _) => doc.fields.get(&segment.to_string())?,
                (Value::Array(items), Segment::Index(i)) => items.get(*i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Copy `path` from this document into `out`, keeping the source shape:
    /// an array along the path stays an array holding the projected
    /// sub-documents of its elements. Repeated calls merge into `out`.
    pub fn include_into(&self, path: &FieldPath, out: &mut Document) {
        include_segments(self, path.segments(), out);
    }
}

fn include_segments(source: &Document, segments: &[Segment], out: &mut Document) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    let key = first.to_string();
    let Some(child) = source.fields.get(&key) else {
        return;
    };
    let prior = out
        .fields
        .get_mut(&key)
        .map(|slot| std::mem::replace(slot, Value::Missing));
    if let Some(projected) = include_value(child, rest, prior) {
        out.fields.insert(key, projected);
    }
}

fn include_value(source: &Value, segments: &[Segment], prior: Option<Value>) -> Option<Value> {
    if segments.is_empty() {
        return Some(source.clone());
    }
    match source {
        Value::Object(doc) => {
            let mut target = match prior {
                Some(Value::Object(d)) => d,
                _ => Document::new(),
            };
            include_segments(doc, segments, &mut target);
            Some(Value::Object(target))
        }
        Value::Array(items) => {
            let mut prior = match prior {
                Some(Value::Array(v)) => v.into_iter(),
                _ => Vec::new().into_iter(),
            };
            Some(Value::Array(
                items
                    .iter()
                    .filter(|item| matches!(item, Value::Object(_) | Value::Array(_)))
                    .filter_map(|item| include_value(item, segments, prior.next()))
                    .collect(),
            ))
        }
        _ => prior,
    }
}

impl Value {
    /// Resolve a path below this value, as [`Document::resolve`] does.
    pub fn resolve(&self, path: &FieldPath) -> Value {
        resolve_value(self, path.segments())
    }
}

fn resolve_segments(fields: &IndexMap<String, Value>, segments: &[Segment]) -> Value {
    let Some((first, rest)) = segments.split_first() else {
        return Value::Missing;
    };
    let key = match first {
        Segment::Key(k) => k.as_str(),
        Segment::Index(i) => return fields.get(&i.to_string()).map_or(Value::Missing, |v| resolve_value(v, rest)),
    };
    match fields.get(key) {
        Some(v) => resolve_value(v, rest),
        None => Value::Missing,
    }
}

fn resolve_value(value: &Value, segments: &[Segment]) -> Value {
    let Some((first, rest)) = segments.split_first() else {
        return value.clone();
    };
    match (value, first) {
        (Value::Object(doc), _) => resolve_segments(&doc.fields, segments),
        (Value::Array(items), Segment::Index(i)) => {
            items.get(*i).map_or(Value::Missing, |v| resolve_value(v, rest))
        }
        (Value::Array(items), Segment::Key(k)) => match k.parse::<usize>() {
            Ok(i) => items.get(i).map_or(Value::Missing, |v| resolve_value(v, rest)),
            Err(_) => Value::Array(
                items
                    .iter()
                    .filter(|item| matches!(item, Value::Object(_)))
                    .map(|item| resolve_value(item, segments))
                    .filter(|v| !v.is_absent())
                    .collect(),
            ),
        },
        _ => Value::Missing,
    }
}

fn set_segments(fields: &mut IndexMap<String, Value>, segments: &[Segment], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    let key = first.to_string();
    if rest.is_empty() {
        if value.is_absent() {
            fields.shift_remove(&key);
        } else {
            fields.insert(key, value);
        }
        return;
    }
    if value.is_absent() && !fields.contains_key(&key) {
        return;
    }
    let child = fields.entry(key).or_insert_with(|| Value::Object(Document::new()));
    set_value(child, rest, value);
}

fn set_value(target: &mut Value, segments: &[Segment], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        *target = value;
        return;
    };
    if let Value::Array(items) = target {
        let index = match first {
            Segment::Index(i) => Some(*i),
            Segment::Key(k) => k.parse::<usize>().ok(),
        };
        if let Some(i) = index {
            if rest.is_empty() && value.is_absent() {
                if i < items.len() {
                    items[i] = Value::Null;
                }
            } else if i < items.len() {
                set_value(&mut items[i], rest, value);
            } else if i == items.len() && !value.is_absent() {
                let mut slot = Value::Missing;
                set_value(&mut slot, rest, value);
                items.push(slot);
            }
            return;
        }
    }
    if !matches!(target, Value::Object(_)) {
        if value.is_absent() {
            return;
        }
        *target = Value::Object(Document::new());
    }
    if let Value::Object(doc) = target {
        set_segments(&mut doc.fields, segments, value);
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut doc = Document::new();
        for (k, v) in iter {
            doc.insert(k, v);
        }
        doc
    }
}

impl IntoIterator for Document {
    type Item = (String, Value);
    type IntoIter = IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl<'a> IntoIterator for &'a Document {
    type Item = (&'a String, &'a Value);
    type IntoIter = Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        Value::Object(self.clone()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Object(doc) => Ok(doc),
            _ => Err(serde::de::Error::custom("document must be a JSON object")),
        }
    }
}

// ---------------------------------------------------------------------------
// Field paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Key(k) => f.write_str(k),
            Segment::Index(i) => write!(f, "{i}"),
        }
    }
}

/// A parsed dotted/bracketed path such as `foo.bar[0]['baz qux']`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<Segment>,
}

impl FieldPath {
    pub fn parse(path: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut chars = path.chars().peekable();
        let mut current = String::new();

        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    if current.is_empty() && !matches!(segments.last(), Some(Segment::Index(_)))
                    {
                        return Err(Error::InvalidPath(path.to_string()));
                    }
                    if !current.is_empty() {
                        segments.push(Segment::Key(std::mem::take(&mut current)));
                    }
                }
                '[' => {
                    if !current.is_empty() {
                        segments.push(Segment::Key(std::mem::take(&mut current)));
                    }
                    let mut inner = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == ']' {
                            closed = true;
                            break;
                        }
                        inner.push(c);
                    }
                    if !closed {
                        return Err(Error::InvalidPath(path.to_string()));
                    }
                    segments.push(parse_bracket(&inner, path)?);
                }
                _ => current.push(c),
            }
        }
        if !current.is_empty() {
            segments.push(Segment::Key(current));
        } else if path.ends_with('.') || segments.is_empty() {
            return Err(Error::InvalidPath(path.to_string()));
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The first segment as a field name.
    pub fn head(&self) -> String {
        self.segments
            .first()
            .map(|s| s.to_string())
            .unwrap_or_default()
    }
}

fn parse_bracket(inner: &str, path: &str) -> Result<Segment> {
    let inner = inner.trim();
    let quoted = inner.len() >= 2
        && ((inner.starts_with('\'') && inner.ends_with('\''))
            || (inner.starts_with('"') && inner.ends_with('"')));
    if quoted {
        return Ok(Segment::Key(inner[1..inner.len() - 1].to_string()));
    }
    inner
        .parse::<usize>()
        .map(Segment::Index)
        .map_err(|_| Error::InvalidPath(path.to_string()))
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{seg}")?;
        }
        Ok(())
    }
}
