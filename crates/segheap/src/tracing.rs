//! Heap tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! tracing spans for garbage collection cycles and their phases. Events for
//! page and large-object traffic are emitted directly at their call sites.

/// Span helpers used by the collector.
#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    /// Phases of a collection cycle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Flush allocation areas and empty the free lists.
        Prepare,
        /// Mark everything reachable from the roots.
        Mark,
        /// Reclaim unmarked objects.
        Sweep,
    }

    /// Stable identifier for a collection cycle, used to correlate its
    /// events. Starts at 1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Allocates the identifier of the next collection cycle.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering a whole collection cycle.
    pub fn trace_gc_cycle(gc_id: GcId) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_cycle", gc_id = gc_id.0).entered()
    }

    /// Span covering one phase of a cycle.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }
}

#[cfg(feature = "tracing")]
pub use internal::{GcId, GcPhase};
