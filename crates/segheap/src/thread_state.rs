//! Per-thread heap state and the collection state machine.
//!
//! A [`ThreadState`] owns every [`ThreadHeap`] of one thread together with the
//! thread's [`HeapContainsCache`]. Heap index 0 is the general, finalized
//! heap; typed heaps are added on demand. Collections move through
//! [`GcState`]: allocation is only allowed while idle, pointer classification
//! only while marking.

use std::cell::RefCell;
use std::ptr::NonNull;

use crate::config::HeapConfig;
use crate::contains_cache::{BasePageRef, CacheLookup, HeapContainsCache};
use crate::header::{HeaderKind, HeaderRef};
use crate::heap::Heap;
use crate::marking::MarkingVisitor;
use crate::metrics::{HeapStats, SweepMetrics};
use crate::thread_heap::ThreadHeap;
use crate::trace::{GcInfo, Visitor};
#[cfg(feature = "tracing")]
use crate::tracing::internal::{next_gc_id, trace_gc_cycle, trace_phase, GcPhase};

/// Index of a heap within a [`ThreadState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapIndex(usize);

impl HeapIndex {
    /// The general heap, whose objects carry their own [`GcInfo`].
    pub const GENERAL: Self = Self(0);

    /// Position of the heap within its thread.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Collection phase of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    /// The mutator runs; allocation is allowed and no object is marked.
    Idle,
    /// Heaps are consistent and objects are being marked.
    Marking,
    /// Unmarked objects are being reclaimed.
    Sweeping,
}

/// All heap state of one thread.
pub struct ThreadState {
    heaps: Vec<ThreadHeap>,
    contains_cache: HeapContainsCache,
    config: HeapConfig,
    gc_state: GcState,
    is_terminating: bool,
    last_sweep: SweepMetrics,
}

impl ThreadState {
    /// Creates a state holding only the general heap.
    #[must_use]
    pub fn new(config: HeapConfig) -> Self {
        Self {
            heaps: vec![ThreadHeap::new(HeaderKind::Finalized, config)],
            contains_cache: HeapContainsCache::new(),
            config,
            gc_state: GcState::Idle,
            is_terminating: false,
            last_sweep: SweepMetrics::new(),
        }
    }

    /// Configuration shared by every heap of the thread.
    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Current collection phase.
    #[must_use]
    pub const fn gc_state(&self) -> GcState {
        self.gc_state
    }

    /// Returns true once the thread started shutting down.
    #[must_use]
    pub const fn is_terminating(&self) -> bool {
        self.is_terminating
    }

    /// Marks the thread as shutting down. From here on conservative pointers
    /// into its heaps are ignored, so nothing it owns is kept alive by them.
    pub fn begin_termination(&mut self) {
        self.is_terminating = true;
    }

    fn assert_state(&self, expected: GcState, operation: &str) {
        assert_eq!(
            self.gc_state, expected,
            "{operation} requires the {expected:?} state"
        );
    }

    /// Adds a heap dedicated to objects described by `gc_info`. Its objects
    /// use the one-word header.
    ///
    /// # Panics
    ///
    /// Panics outside the idle state.
    pub fn add_typed_heap(&mut self, gc_info: &'static GcInfo) -> HeapIndex {
        self.assert_state(GcState::Idle, "adding a heap");
        self.heaps
            .push(ThreadHeap::new(HeaderKind::Plain(gc_info), self.config));
        HeapIndex(self.heaps.len() - 1)
    }

    /// # Panics
    ///
    /// Panics if `index` does not name a heap of this thread.
    #[must_use]
    pub fn heap(&self, index: HeapIndex) -> &ThreadHeap {
        &self.heaps[index.0]
    }

    /// Number of heaps, the general one included.
    #[must_use]
    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    /// Allocates a zeroed object in heap `heap` and returns its payload.
    ///
    /// # Panics
    ///
    /// Panics outside the idle state, and on the conditions listed at
    /// [`ThreadHeap::allocate`].
    pub fn allocate(
        &mut self,
        heap: HeapIndex,
        size: usize,
        gc_info: &'static GcInfo,
    ) -> NonNull<u8> {
        self.assert_state(GcState::Idle, "allocation");
        self.heaps[heap.0].allocate(&mut self.contains_cache, size, gc_info)
    }

    /// Finds the page containing `address`, consulting the contains cache
    /// first. Both hits and misses of the page scan are cached.
    pub fn heap_page_from_address(&mut self, address: usize) -> Option<BasePageRef> {
        match self.contains_cache.lookup(address) {
            CacheLookup::Page(page) => return Some(page),
            CacheLookup::NotInHeap => return None,
            CacheLookup::Miss => {}
        }
        let found = self.heaps.iter().enumerate().find_map(|(index, heap)| {
            heap.heap_page_from_address(address)
                .map(|page| BasePageRef {
                    heap: HeapIndex(index),
                    page,
                })
        });
        self.contains_cache.add_entry(address, found);
        found
    }

    /// Returns true if `address` lies in a page of one of this thread's heaps.
    pub fn contains(&mut self, address: usize) -> bool {
        self.heap_page_from_address(address).is_some()
    }

    /// Makes every heap consistent and enters the marking phase.
    ///
    /// # Panics
    ///
    /// Panics outside the idle state.
    pub fn prepare_for_gc(&mut self) {
        self.assert_state(GcState::Idle, "preparing for GC");
        for heap in &mut self.heaps {
            heap.make_consistent_for_gc();
        }
        self.gc_state = GcState::Marking;
    }

    /// Returns true if every heap is consistent for GC.
    #[must_use]
    pub fn is_consistent_for_gc(&self) -> bool {
        self.heaps.iter().all(ThreadHeap::is_consistent_for_gc)
    }

    /// Classifies `address` and, if it points into a live object, hands the
    /// object to `visitor`. Terminating threads ignore every pointer.
    ///
    /// # Panics
    ///
    /// Panics outside the marking phase.
    pub fn check_and_mark_pointer(&mut self, visitor: &mut dyn Visitor, address: usize) -> bool {
        self.assert_state(GcState::Marking, "pointer classification");
        if self.is_terminating {
            return false;
        }
        let Some(base) = self.heap_page_from_address(address) else {
            return false;
        };
        self.heaps[base.heap.0].check_and_mark_pointer(base.page, visitor, address)
    }

    /// Resolves `address` to the live object containing it.
    ///
    /// # Panics
    ///
    /// Panics outside the marking phase.
    pub fn find_header(&mut self, address: usize) -> Option<HeaderRef<'_>> {
        self.assert_state(GcState::Marking, "object lookup");
        let base = self.heap_page_from_address(address)?;
        self.heaps[base.heap.0].find_header(base.page, address)
    }

    /// Marks everything reachable from `roots` (addresses anywhere inside
    /// objects). Returns the number of objects newly marked.
    ///
    /// # Panics
    ///
    /// Panics outside the marking phase.
    pub fn trace_from_roots(&mut self, roots: &[usize]) -> usize {
        self.assert_state(GcState::Marking, "tracing");
        let mut visitor = MarkingVisitor::new();
        for &root in roots {
            visitor.visit_pointer(root);
        }
        self.drain_marking(&mut visitor);
        visitor.objects_marked()
    }

    /// Alternates between classifying pending addresses and running queued
    /// trace callbacks until `visitor` has nothing left.
    ///
    /// # Panics
    ///
    /// Panics outside the marking phase.
    pub fn drain_marking(&mut self, visitor: &mut MarkingVisitor) {
        self.assert_state(GcState::Marking, "tracing");
        loop {
            while let Some(address) = visitor.pop_pending() {
                self.check_and_mark_pointer(visitor, address);
            }
            let Some((payload, trace)) = visitor.pop_work() else {
                break;
            };
            trace(visitor, payload);
        }
        debug_assert!(visitor.is_drained());
    }

    /// Clears every mark bit without sweeping.
    ///
    /// # Panics
    ///
    /// Panics outside the marking phase.
    pub fn clear_marks(&self) {
        self.assert_state(GcState::Marking, "clearing marks");
        for heap in &self.heaps {
            heap.clear_marks();
        }
    }

    /// Sweeps every heap and returns to the idle state.
    ///
    /// # Panics
    ///
    /// Panics outside the marking phase.
    pub fn sweep(&mut self) -> SweepMetrics {
        self.assert_state(GcState::Marking, "sweeping");
        self.gc_state = GcState::Sweeping;
        let mut metrics = SweepMetrics::new();
        for heap in &mut self.heaps {
            metrics.merge(&heap.sweep(&mut self.contains_cache));
        }
        self.gc_state = GcState::Idle;
        self.last_sweep = metrics;
        metrics
    }

    /// Runs a full stop-the-world collection, treating `roots` as the only
    /// references into the heaps.
    pub fn collect_garbage(&mut self, roots: &[usize]) -> SweepMetrics {
        #[cfg(feature = "tracing")]
        let _gc_span = trace_gc_cycle(next_gc_id());

        {
            #[cfg(feature = "tracing")]
            let _phase = trace_phase(GcPhase::Prepare);
            self.prepare_for_gc();
        }
        {
            #[cfg(feature = "tracing")]
            let _phase = trace_phase(GcPhase::Mark);
            let _marked = self.trace_from_roots(roots);
            #[cfg(feature = "tracing")]
            tracing::debug!(objects_marked = _marked, "mark_end");
        }
        #[cfg(feature = "tracing")]
        let _phase = trace_phase(GcPhase::Sweep);
        self.sweep()
    }

    /// Metrics of the most recent sweep.
    #[must_use]
    pub const fn last_sweep_metrics(&self) -> &SweepMetrics {
        &self.last_sweep
    }

    /// Space accounting summed over all heaps.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats::new();
        for heap in &self.heaps {
            stats.add(heap.stats());
        }
        stats
    }

    /// The thread's address-to-page cache.
    #[must_use]
    pub const fn contains_cache(&self) -> &HeapContainsCache {
        &self.contains_cache
    }

    /// Tears the heaps down: finalizes every object, then releases all
    /// storage. Conservative pointers are ignored from here on. Returns the
    /// number of objects finalized.
    ///
    /// # Panics
    ///
    /// Panics outside the idle state.
    pub fn cleanup(&mut self) -> usize {
        self.assert_state(GcState::Idle, "thread cleanup");
        self.begin_termination();
        let finalized: usize = self.heaps.iter_mut().map(ThreadHeap::finalize_all).sum();
        for heap in &mut self.heaps {
            heap.delete_pages(&mut self.contains_cache);
        }
        finalized
    }
}

impl std::fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadState")
            .field("heaps", &self.heaps)
            .field("gc_state", &self.gc_state)
            .field("is_terminating", &self.is_terminating)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Thread-local attachment
// ============================================================================

thread_local! {
    /// State of the current thread while it is attached to the heap.
    static THREAD_STATE: RefCell<Option<ThreadState>> = const { RefCell::new(None) };
}

impl ThreadState {
    /// Attaches the current thread, creating its state with the process
    /// configuration.
    ///
    /// # Panics
    ///
    /// Panics if the heap is not initialized or the thread is already
    /// attached.
    pub fn attach() {
        THREAD_STATE.with(|slot| {
            let mut slot = slot.borrow_mut();
            assert!(slot.is_none(), "thread is already attached to the heap");
            let config = Heap::register_thread();
            *slot = Some(Self::new(config));
        });
        #[cfg(feature = "tracing")]
        tracing::debug!("thread_attached");
    }

    /// Finalizes and releases everything the current thread allocated, then
    /// detaches it. Returns the number of objects finalized.
    ///
    /// # Panics
    ///
    /// Panics if the thread is not attached.
    pub fn detach() -> usize {
        let mut state = THREAD_STATE
            .with(|slot| slot.borrow_mut().take())
            .unwrap_or_else(|| panic!("thread is not attached to the heap"));
        let finalized = state.cleanup();
        drop(state);
        Heap::unregister_thread();
        #[cfg(feature = "tracing")]
        tracing::debug!(finalized, "thread_detached");
        finalized
    }

    /// Returns true if the current thread is attached.
    #[must_use]
    pub fn is_attached() -> bool {
        THREAD_STATE.with(|slot| slot.borrow().is_some())
    }
}

/// Runs `f` with the current thread's state.
///
/// # Panics
///
/// Panics if the thread is not attached, or when called re-entrantly from
/// inside `f` (for example from a finalizer).
pub fn with_thread_state<F, R>(f: F) -> R
where
    F: FnOnce(&mut ThreadState) -> R,
{
    THREAD_STATE.with(|slot| {
        let mut slot = slot.borrow_mut();
        let state = slot
            .as_mut()
            .unwrap_or_else(|| panic!("thread is not attached to the heap"));
        f(state)
    })
}
