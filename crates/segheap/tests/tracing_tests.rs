//! Integration tests for the tracing feature.
//!
//! A capturing layer records span and event names so the tests can check
//! what a collection reports.

#![cfg(feature = "tracing")]

use std::sync::{Arc, Mutex};

use segheap::tracing::GcPhase;
use segheap::{trace_nothing, GcInfo, HeapConfig, HeapIndex, ThreadState};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

static BLOB: GcInfo = GcInfo::new("Blob", trace_nothing);

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<String>>>);

impl Captured {
    fn names(&self) -> Vec<String> {
        self.0.lock().expect("capture lock").clone()
    }

    fn contains(&self, name: &str) -> bool {
        self.names().iter().any(|captured| captured == name)
    }
}

struct MessageVisitor(Option<String>);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for Captured {
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        self.0
            .lock()
            .expect("capture lock")
            .push(attrs.metadata().name().to_string());
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(None);
        event.record(&mut visitor);
        if let Some(message) = visitor.0 {
            self.0.lock().expect("capture lock").push(message);
        }
    }
}

fn capture<R>(f: impl FnOnce() -> R) -> (R, Captured) {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::registry().with(captured.clone());
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, captured)
}

#[test]
fn test_collection_emits_cycle_and_phase_spans() {
    let mut state = ThreadState::new(HeapConfig::default());
    let kept = state.allocate(HeapIndex::GENERAL, 64, &BLOB);
    state.allocate(HeapIndex::GENERAL, 64, &BLOB);

    let (metrics, captured) = capture(|| state.collect_garbage(&[kept.as_ptr() as usize]));
    assert_eq!(metrics.objects_finalized, 1);

    let names = captured.names();
    assert_eq!(names.iter().filter(|name| *name == "gc_cycle").count(), 1);
    assert_eq!(names.iter().filter(|name| *name == "gc_phase").count(), 3);
    assert!(captured.contains("mark_end"));
    assert!(captured.contains("sweep_start"));
    assert!(captured.contains("sweep_end"));
}

#[test]
fn test_page_traffic_is_reported() {
    let mut state = ThreadState::new(HeapConfig::default());

    let ((), captured) = capture(|| {
        state.allocate(HeapIndex::GENERAL, 64, &BLOB);
        state.allocate(HeapIndex::GENERAL, 100_000, &BLOB);
        state.collect_garbage(&[]);
        state.allocate(HeapIndex::GENERAL, 64, &BLOB);
    });

    assert!(captured.contains("page_allocated"));
    assert!(captured.contains("large_object_allocated"));
    assert!(captured.contains("large_object_released"));
    assert!(captured.contains("page_pooled"));
    assert!(captured.contains("page_reused_from_pool"));
}

#[test]
fn test_gc_phase_is_exported() {
    assert_ne!(GcPhase::Mark, GcPhase::Sweep);
    assert_eq!(GcPhase::Prepare, GcPhase::Prepare);
}
