//! Integration test verifying that `#[instrument]` annotations produce
//! the expected spans on `MemorySubjectKeyStore` operations.

#![allow(clippy::expect_used)]

use std::sync::{Arc, Mutex};

use tokengate_storage::{
    SubjectId,
    keys::{MemorySubjectKeyStore, SubjectKeyStore},
    testutil::make_entry,
};
use tracing::Subscriber;
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

// ---------------------------------------------------------------------------
// Collecting layer: records span names as they are entered
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct SpanCollector {
    spans: Arc<Mutex<Vec<String>>>,
}

impl<S> tracing_subscriber::Layer<S> for SpanCollector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        _attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            self.spans.lock().expect("lock poisoned").push(span.name().to_owned());
        }
    }
}

fn collect() -> (Arc<Mutex<Vec<String>>>, tracing::subscriber::DefaultGuard) {
    let collector = SpanCollector::default();
    let spans = Arc::clone(&collector.spans);
    let subscriber = tracing_subscriber::registry().with(collector);
    (spans, tracing::subscriber::set_default(subscriber))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn register_key_creates_span() {
    let (spans, _guard) = collect();

    let store = MemorySubjectKeyStore::new();
    store.register_key(&make_entry(1, "1-a")).await.expect("register should succeed");

    let recorded = spans.lock().expect("lock poisoned");
    assert!(
        recorded.iter().any(|s| s == "register_key"),
        "expected a 'register_key' span, got: {recorded:?}"
    );
}

#[tokio::test]
async fn get_keys_creates_span() {
    let (spans, _guard) = collect();

    let store = MemorySubjectKeyStore::new();
    let _ = store.get_keys(SubjectId::from(1)).await;

    let recorded = spans.lock().expect("lock poisoned");
    assert!(recorded.iter().any(|s| s == "get_keys"), "expected a 'get_keys' span, got: {recorded:?}");
}

#[tokio::test]
async fn rotate_and_revoke_create_spans() {
    let (spans, _guard) = collect();

    let store = MemorySubjectKeyStore::new();
    store.rotate_key(&make_entry(1, "1-a")).await.expect("rotate should succeed");
    store.revoke_key(SubjectId::from(1), "1-a", Some("test")).await.expect("revoke should succeed");

    let recorded = spans.lock().expect("lock poisoned");
    assert!(recorded.iter().any(|s| s == "rotate_key"), "got: {recorded:?}");
    assert!(recorded.iter().any(|s| s == "revoke_key"), "got: {recorded:?}");
}
