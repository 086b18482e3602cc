//! Pull-based document cursors.
//!
//! Every source (an in-memory array, a synchronous iterator, an async
//! stream, or a pipeline stage) is read through the one [`Cursor`]
//! contract, so stages are written once and behave the same over all of
//! them. `has_more` may look ahead by at most one document.

use std::collections::VecDeque;
use std::future::Future;

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use tracing::trace;

use crate::error::Result;
use crate::value::Value;

#[async_trait]
pub trait Cursor: Send {
    /// The next document, or `None` once exhausted.
    async fn next(&mut self) -> Result<Option<Value>>;

    /// Whether a subsequent `next` would yield a document.
    async fn has_more(&mut self) -> Result<bool>;

    /// Release the cursor and anything it reads from. Calling `next` after
    /// `close` yields `None`. Idempotent.
    fn close(&mut self) {}
}

pub type BoxCursor = Box<dyn Cursor>;

#[async_trait]
impl<C: Cursor + ?Sized> Cursor for Box<C> {
    async fn next(&mut self) -> Result<Option<Value>> {
        (**self).next().await
    }

    async fn has_more(&mut self) -> Result<bool> {
        (**self).has_more().await
    }

    fn close(&mut self) {
        (**self).close()
    }
}

// ---------------------------------------------------------------------------
// Producers
// ---------------------------------------------------------------------------

/// A source of documents without look-ahead. Wrapped in [`Staged`] to get
/// the full [`Cursor`] contract.
#[async_trait]
pub trait Producer: Send {
    async fn produce(&mut self) -> Result<Option<Value>>;

    /// Release upstream resources.
    fn release(&mut self) {}
}

/// Adds a one-document peek slot to a [`Producer`].
pub struct Staged<P> {
    producer: P,
    peeked: Option<Value>,
    done: bool,
}

impl<P: Producer> Staged<P> {
    pub fn new(producer: P) -> Self {
        Self {
            producer,
            peeked: None,
            done: false,
        }
    }

    async fn pull(&mut self) -> Result<Option<Value>> {
        if self.done {
            return Ok(None);
        }
        match self.producer.produce().await? {
            Some(doc) => Ok(Some(doc)),
            None => {
                self.done = true;
                self.producer.release();
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl<P: Producer> Cursor for Staged<P> {
    async fn next(&mut self) -> Result<Option<Value>> {
        match self.peeked.take() {
            Some(doc) => Ok(Some(doc)),
            None => self.pull().await,
        }
    }

    async fn has_more(&mut self) -> Result<bool> {
        if self.peeked.is_none() {
            self.peeked = self.pull().await?;
        }
        Ok(self.peeked.is_some())
    }

    fn close(&mut self) {
        if !self.done {
            trace!("closing cursor before exhaustion");
        }
        self.done = true;
        self.peeked = None;
        self.producer.release();
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// A finite in-memory array.
#[derive(Debug, Default)]
pub struct ArrayCursor {
    items: VecDeque<Value>,
}

impl ArrayCursor {
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items: items.into(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.items.len()
    }
}

impl From<Vec<Value>> for ArrayCursor {
    fn from(items: Vec<Value>) -> Self {
        Self::new(items)
    }
}

#[async_trait]
impl Cursor for ArrayCursor {
    async fn next(&mut self) -> Result<Option<Value>> {
        Ok(self.items.pop_front())
    }

    async fn has_more(&mut self) -> Result<bool> {
        Ok(!self.items.is_empty())
    }

    fn close(&mut self) {
        self.items.clear();
    }
}

/// Adapter over a synchronous iterator.
pub struct IterSource<I> {
    iter: Option<I>,
}

#[async_trait]
impl<I> Producer for IterSource<I>
where
    I: Iterator<Item = Value> + Send,
{
    async fn produce(&mut self) -> Result<Option<Value>> {
        Ok(self.iter.as_mut().and_then(Iterator::next))
    }

    fn release(&mut self) {
        self.iter = None;
    }
}

pub type IterCursor<I> = Staged<IterSource<I>>;

/// Cursor over a synchronous iterator.
pub fn from_iter<I>(iter: I) -> IterCursor<I::IntoIter>
where
    I: IntoIterator<Item = Value>,
    I::IntoIter: Send,
{
    Staged::new(IterSource {
        iter: Some(iter.into_iter()),
    })
}

/// Adapter over an async stream of fallible documents.
pub struct StreamSource<S> {
    stream: Option<S>,
}

#[async_trait]
impl<S> Producer for StreamSource<S>
where
    S: Stream<Item = Result<Value>> + Send + Unpin,
{
    async fn produce(&mut self) -> Result<Option<Value>> {
        match self.stream.as_mut() {
            Some(stream) => stream.next().await.transpose(),
            None => Ok(None),
        }
    }

    fn release(&mut self) {
        self.stream = None;
    }
}

pub type StreamCursor<S> = Staged<StreamSource<S>>;

/// Cursor over an async stream whose items may fail.
pub fn from_stream<S>(stream: S) -> StreamCursor<S>
where
    S: Stream<Item = Result<Value>> + Send + Unpin,
{
    Staged::new(StreamSource {
        stream: Some(stream),
    })
}

/// Cursor over an infallible async stream.
pub fn from_values<S>(stream: S) -> StreamCursor<BoxStream<'static, Result<Value>>>
where
    S: Stream<Item = Value> + Send + 'static,
{
    from_stream(stream.map(Ok).boxed())
}

// ---------------------------------------------------------------------------
// Transform
// ---------------------------------------------------------------------------

/// Maps every document of a base cursor one-to-one. Exhaustion is reported
/// by the base cursor, so `has_more` is unchanged by the mapping.
pub struct TransformCursor<C, F> {
    base: C,
    func: F,
}

impl<C, F> TransformCursor<C, F> {
    pub fn new(base: C, func: F) -> Self {
        Self { base, func }
    }

    pub fn into_inner(self) -> C {
        self.base
    }
}

#[async_trait]
impl<C, F> Cursor for TransformCursor<C, F>
where
    C: Cursor,
    F: FnMut(Value) -> Result<Value> + Send,
{
    async fn next(&mut self) -> Result<Option<Value>> {
        match self.base.next().await? {
            Some(doc) => (self.func)(doc).map(Some),
            None => Ok(None),
        }
    }

    async fn has_more(&mut self) -> Result<bool> {
        self.base.has_more().await
    }

    fn close(&mut self) {
        self.base.close();
    }
}

// ---------------------------------------------------------------------------
// Consumers
// ---------------------------------------------------------------------------

pub trait CursorExt: Cursor + Sized {
    /// Drain every remaining document in order.
    fn to_array(&mut self) -> impl Future<Output = Result<Vec<Value>>> + Send {
        async move {
            let mut out = Vec::new();
            while let Some(doc) = self.next().await? {
                out.push(doc);
            }
            Ok(out)
        }
    }

    /// Call `f` for each remaining document. An error from `f` closes the
    /// cursor and is returned.
    fn for_each<F>(&mut self, mut f: F) -> impl Future<Output = Result<()>> + Send
    where
        F: FnMut(Value) -> Result<()> + Send,
    {
        async move {
            while let Some(doc) = self.next().await? {
                if let Err(e) = f(doc) {
                    self.close();
                    return Err(e);
                }
            }
            Ok(())
        }
    }

    /// Take at most `n` documents, then close the cursor.
    fn take(&mut self, n: usize) -> impl Future<Output = Result<Vec<Value>>> + Send {
        async move {
            let mut out = Vec::with_capacity(n.min(64));
            while out.len() < n {
                match self.next().await? {
                    Some(doc) => out.push(doc),
                    None => return Ok(out),
                }
            }
            self.close();
            Ok(out)
        }
    }

    fn transform<F>(self, func: F) -> TransformCursor<Self, F>
    where
        F: FnMut(Value) -> Result<Value> + Send,
    {
        TransformCursor::new(self, func)
    }

    fn boxed(self) -> BoxCursor
    where
        Self: 'static,
    {
        Box::new(self)
    }
}

impl<C: Cursor + Sized> CursorExt for C {}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn docs(n: i64) -> Vec<Value> {
        (0..n).map(Value::from).collect()
    }

    #[tokio::test]
    async fn array_cursor_drains_in_order() {
        let mut cursor = ArrayCursor::new(docs(3));
        assert!(cursor.has_more().await.unwrap());
        assert_eq!(cursor.to_array().await.unwrap(), docs(3));
        assert!(!cursor.has_more().await.unwrap());
        assert_eq!(cursor.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn has_more_peeks_without_consuming() {
        let mut cursor = from_iter(docs(2));
        assert!(cursor.has_more().await.unwrap());
        assert!(cursor.has_more().await.unwrap());
        assert_eq!(cursor.next().await.unwrap(), Some(Value::from(0)));
        assert_eq!(cursor.next().await.unwrap(), Some(Value::from(1)));
        assert!(!cursor.has_more().await.unwrap());
    }

    #[tokio::test]
    async fn stream_errors_propagate() {
        let items = vec![Ok(Value::from(1)), Err(crate::error::Error::Source("boom".into()))];
        let mut cursor = from_stream(stream::iter(items));
        assert_eq!(cursor.next().await.unwrap(), Some(Value::from(1)));
        assert!(cursor.next().await.is_err());
    }

    #[tokio::test]
    async fn transform_keeps_has_more() {
        let mut plain = from_values(stream::iter(docs(2)));
        let mut mapped = from_values(stream::iter(docs(2))).transform(|v| {
            Ok(Value::number(v.as_f64().unwrap_or(0.0) * 10.0))
        });
        for _ in 0..3 {
            assert_eq!(plain.has_more().await.unwrap(), mapped.has_more().await.unwrap());
            plain.next().await.unwrap();
            mapped.next().await.unwrap();
        }
    }

    #[tokio::test]
    async fn close_stops_iteration() {
        let mut cursor = from_iter(docs(5));
        assert_eq!(cursor.take(2).await.unwrap(), docs(2));
        assert_eq!(cursor.next().await.unwrap(), None);
        assert!(!cursor.has_more().await.unwrap());
    }
}
