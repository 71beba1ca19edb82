//! Type descriptors and the visitor interface used during marking.
//!
//! The heap knows nothing about the objects it stores beyond their size. Each
//! allocation names a static [`GcInfo`] that tells the collector how to find
//! the object's outgoing references and how to finalize it.

use std::fmt;
use std::ptr::NonNull;

use crate::header::HeaderRef;

/// Reports every outgoing reference of the object whose payload is given.
pub type TraceCallback = fn(&mut dyn Visitor, NonNull<u8>);

/// Called with the payload address and payload size of an object that is
/// about to be reclaimed. Must not allocate from the heap being swept.
pub type FinalizationCallback = fn(NonNull<u8>, usize);

// ============================================================================
// Visitor
// ============================================================================

/// Receives the results of pointer classification and tracing.
pub trait Visitor {
    /// Called when a candidate address resolved to the live object behind
    /// `header`. `trace` reports that object's references.
    fn mark(&mut self, header: HeaderRef<'_>, trace: TraceCallback);

    /// Called by trace callbacks for each outgoing reference. `address` may
    /// point anywhere inside the referenced object.
    fn visit_pointer(&mut self, address: usize);
}

// ============================================================================
// GcInfo
// ============================================================================

/// Static per-type information the collector needs.
pub struct GcInfo {
    type_name: &'static str,
    trace: TraceCallback,
    finalize: Option<FinalizationCallback>,
}

impl GcInfo {
    /// Descriptor for a type with no finalizer.
    #[must_use]
    pub const fn new(type_name: &'static str, trace: TraceCallback) -> Self {
        Self {
            type_name,
            trace,
            finalize: None,
        }
    }

    /// Descriptor for a type whose objects must be finalized before their
    /// memory is reused.
    #[must_use]
    pub const fn with_finalizer(
        type_name: &'static str,
        trace: TraceCallback,
        finalize: FinalizationCallback,
    ) -> Self {
        Self {
            type_name,
            trace,
            finalize: Some(finalize),
        }
    }

    /// Name used in diagnostics.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Reports the object's outgoing references.
    #[must_use]
    pub const fn trace(&self) -> TraceCallback {
        self.trace
    }

    /// Finalizer of the type, if any.
    #[must_use]
    pub const fn finalizer(&self) -> Option<FinalizationCallback> {
        self.finalize
    }

    /// Returns true if objects of this type need finalization.
    #[must_use]
    pub const fn has_finalizer(&self) -> bool {
        self.finalize.is_some()
    }
}

impl fmt::Debug for GcInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcInfo")
            .field("type_name", &self.type_name)
            .field("has_finalizer", &self.has_finalizer())
            .finish_non_exhaustive()
    }
}

/// Trace callback for objects without references.
pub fn trace_nothing(_visitor: &mut dyn Visitor, _payload: NonNull<u8>) {}

