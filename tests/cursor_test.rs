use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use cortex_pipeline::{BoxCursor, CursorExt, Error, Value, from_iter, from_stream, from_values};
use cortex_pipeline::{ArrayCursor, Cursor};
use futures::stream;
use serde_json::json;

fn docs(n: i64) -> Vec<Value> {
    (0..n).map(|i| Value::from(json!({"i": i}))).collect()
}

fn sources(n: i64) -> Vec<(&'static str, BoxCursor)> {
    vec![
        ("array", ArrayCursor::new(docs(n)).boxed()),
        ("iter", from_iter(docs(n)).boxed()),
        ("stream", from_values(stream::iter(docs(n))).boxed()),
    ]
}

#[tokio::test]
async fn every_source_reports_has_more_consistently() {
    for (name, mut cursor) in sources(2) {
        assert!(cursor.has_more().await.unwrap(), "{name}");
        assert!(cursor.next().await.unwrap().is_some(), "{name}");
        assert!(cursor.has_more().await.unwrap(), "{name}");
        assert!(cursor.next().await.unwrap().is_some(), "{name}");
        assert!(!cursor.has_more().await.unwrap(), "{name}");
        assert!(cursor.next().await.unwrap().is_none(), "{name}");
    }
}

#[tokio::test]
async fn transform_preserves_has_more_over_every_source() {
    for (name, cursor) in sources(3) {
        let mut mapped = cursor.transform(|mut doc| {
            if let Value::Object(d) = &mut doc {
                d.insert("seen", Value::Bool(true));
            }
            Ok(doc)
        });
        let mut count = 0;
        while mapped.has_more().await.unwrap() {
            let doc = mapped.next().await.unwrap().unwrap();
            assert_eq!(doc.as_object().unwrap().get("seen"), Some(&Value::Bool(true)), "{name}");
            count += 1;
        }
        assert_eq!(count, 3, "{name}");
        assert!(mapped.next().await.unwrap().is_none(), "{name}");
    }
}

#[tokio::test]
async fn for_each_error_closes_the_cursor() {
    for (name, mut cursor) in sources(5) {
        let mut seen = 0;
        let err = cursor
            .for_each(|_| {
                seen += 1;
                if seen == 2 { Err(Error::Source("stop".into())) } else { Ok(()) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "cortex.error.source", "{name}");
        assert_eq!(seen, 2, "{name}");
        assert!(cursor.next().await.unwrap().is_none(), "{name} should be closed");
    }
}

#[tokio::test]
async fn take_stops_early_and_closes() {
    for (name, mut cursor) in sources(10) {
        let first = cursor.take(3).await.unwrap();
        assert_eq!(first, docs(3), "{name}");
        assert!(!cursor.has_more().await.unwrap(), "{name}");
    }
}

#[tokio::test]
async fn take_more_than_available_returns_everything() {
    let mut cursor = from_iter(docs(2));
    assert_eq!(cursor.take(5).await.unwrap(), docs(2));
}

#[tokio::test]
async fn iterator_sources_are_pulled_lazily() {
    let pulled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pulled);
    let endless = (0..).map(move |i: i64| {
        counter.fetch_add(1, Ordering::SeqCst);
        Value::from(i)
    });
    let mut cursor = from_iter(endless);
    assert_eq!(cursor.take(4).await.unwrap().len(), 4);
    assert_eq!(pulled.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn stream_errors_surface_in_order() {
    let items = vec![Ok(Value::from(1)), Err(Error::Source("disk".into())), Ok(Value::from(3))];
    let mut cursor = from_stream(stream::iter(items));
    assert_eq!(cursor.next().await.unwrap(), Some(Value::from(1)));
    let err = cursor.next().await.unwrap_err();
    assert!(matches!(err, Error::Source(ref m) if m == "disk"));
}

#[tokio::test]
async fn close_is_idempotent() {
    let mut cursor = from_values(stream::iter(docs(3)));
    cursor.close();
    cursor.close();
    assert!(!cursor.has_more().await.unwrap());
    assert!(cursor.to_array().await.unwrap().is_empty());
}
