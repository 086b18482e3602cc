//! The baseline stages: `$match`, `$sort`, `$skip`, `$limit` and `$count`.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::cursor::{BoxCursor, Producer};
use crate::document::{Document, FieldPath};
use crate::error::Result;
use crate::query::{compare_by, matches_value, Query, SortOrder};
use crate::value::Value;

pub(crate) struct MatchStage {
    upstream: BoxCursor,
    query: Arc<Query>,
}

impl MatchStage {
    pub fn new(upstream: BoxCursor, query: Arc<Query>) -> Self {
        Self { upstream, query }
    }
}

#[async_trait]
impl Producer for MatchStage {
    async fn produce(&mut self) -> Result<Option<Value>> {
        while let Some(doc) = self.upstream.next().await? {
            if matches_value(&self.query, &doc) {
                return Ok(Some(doc));
            }
        }
        Ok(None)
    }

    fn release(&mut self) {
        self.upstream.close();
    }
}

/// Buffers the whole input, then emits it in a stable sort order.
pub(crate) struct SortStage {
    upstream: BoxCursor,
    fields: Arc<Vec<(FieldPath, SortOrder)>>,
    sorted: Option<VecDeque<Value>>,
}

impl SortStage {
    pub fn new(upstream: BoxCursor, fields: Arc<Vec<(FieldPath, SortOrder)>>) -> Self {
        Self {
            upstream,
            fields,
            sorted: None,
        }
    }
}

#[async_trait]
impl Producer for SortStage {
    async fn produce(&mut self) -> Result<Option<Value>> {
        if self.sorted.is_none() {
            let mut docs = Vec::new();
            while let Some(doc) = self.upstream.next().await? {
                docs.push(doc);
            }
            docs.sort_by(|a, b| compare_by(a, b, &self.fields));
            self.sorted = Some(docs.into());
        }
        Ok(self.sorted.as_mut().and_then(VecDeque::pop_front))
    }

    fn release(&mut self) {
        self.sorted = Some(VecDeque::new());
        self.upstream.close();
    }
}

pub(crate) struct SkipStage {
    upstream: BoxCursor,
    remaining: usize,
}

impl SkipStage {
    pub fn new(upstream: BoxCursor, n: usize) -> Self {
        Self {
            upstream,
            remaining: n,
        }
    }
}

#[async_trait]
impl Producer for SkipStage {
    async fn produce(&mut self) -> Result<Option<Value>> {
        while self.remaining > 0 {
            if self.upstream.next().await?.is_none() {
                return Ok(None);
            }
            self.remaining -= 1;
        }
        self.upstream.next().await
    }

    fn release(&mut self) {
        self.upstream.close();
    }
}

/// Passes at most `n` documents and closes the upstream as soon as the
/// last one has been pulled.
pub(crate) struct LimitStage {
    upstream: BoxCursor,
    remaining: usize,
}

impl LimitStage {
    pub fn new(upstream: BoxCursor, n: usize) -> Self {
        Self {
            upstream,
            remaining: n,
        }
    }
}

#[async_trait]
impl Producer for LimitStage {
    async fn produce(&mut self) -> Result<Option<Value>> {
        if self.remaining == 0 {
            self.upstream.close();
            return Ok(None);
        }
        let doc = self.upstream.next().await?;
        self.remaining -= 1;
        if self.remaining == 0 {
            trace!("limit reached");
            self.upstream.close();
        }
        Ok(doc)
    }

    fn release(&mut self) {
        self.upstream.close();
    }
}

/// Emits a single `{field: n}` document, `n` being the input length.
pub(crate) struct CountStage {
    upstream: BoxCursor,
    field: String,
    done: bool,
}

impl CountStage {
    pub fn new(upstream: BoxCursor, field: String) -> Self {
        Self {
            upstream,
            field,
            done: false,
        }
    }
}

#[async_trait]
impl Producer for CountStage {
    async fn produce(&mut self) -> Result<Option<Value>> {
        if self.done {
            return Ok(None);
        }
        let mut n = 0usize;
        while self.upstream.next().await?.is_some() {
            n += 1;
        }
        self.done = true;
        let mut doc = Document::new();
        doc.insert(self.field.as_str(), Value::from(n));
        Ok(Some(Value::Object(doc)))
    }

    fn release(&mut self) {
        self.done = true;
        self.upstream.close();
    }
}
