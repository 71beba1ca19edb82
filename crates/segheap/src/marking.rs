//! Worklist-driven marking visitor.

use std::ptr::NonNull;

use crate::header::HeaderRef;
use crate::trace::{TraceCallback, Visitor};

/// A [`Visitor`] that marks objects and queues them for tracing.
///
/// Marking an object pushes its payload and trace callback onto the
/// worklist; trace callbacks report references through
/// [`Visitor::visit_pointer`], which only records the address. The owner of
/// the heap resolves pending addresses and runs queued trace callbacks until
/// both queues are empty (see
/// [`ThreadState::drain_marking`](crate::ThreadState::drain_marking)).
#[derive(Default)]
pub struct MarkingVisitor {
    /// Marked objects whose references have not been traced yet.
    ///
    /// NOTE: unbounded; a very deep object graph grows this without limit.
    worklist: Vec<(NonNull<u8>, TraceCallback)>,
    /// Candidate addresses reported by trace callbacks, not yet classified.
    pending: Vec<usize>,
    objects_marked: usize,
}

impl MarkingVisitor {
    /// Creates a visitor with empty queues.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            worklist: Vec::new(),
            pending: Vec::new(),
            objects_marked: 0,
        }
    }

    /// Objects newly marked by this visitor.
    #[must_use]
    pub const fn objects_marked(&self) -> usize {
        self.objects_marked
    }

    pub(crate) fn pop_pending(&mut self) -> Option<usize> {
        self.pending.pop()
    }

    pub(crate) fn pop_work(&mut self) -> Option<(NonNull<u8>, TraceCallback)> {
        self.worklist.pop()
    }

    /// Returns true when nothing is left to classify or trace.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.worklist.is_empty() && self.pending.is_empty()
    }
}

impl std::fmt::Debug for MarkingVisitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkingVisitor")
            .field("worklist", &self.worklist.len())
            .field("pending", &self.pending.len())
            .field("objects_marked", &self.objects_marked)
            .finish()
    }
}

impl Visitor for MarkingVisitor {
    fn mark(&mut self, header: HeaderRef<'_>, trace: TraceCallback) {
        if header.is_marked() {
            return;
        }
        header.mark();
        self.objects_marked += 1;
        self.worklist.push((header.payload(), trace));
    }

    fn visit_pointer(&mut self, address: usize) {
        self.pending.push(address);
    }
}
