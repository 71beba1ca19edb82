//! A segregated-heap, mark-sweep garbage-collected allocator.
//!
//! `segheap` manages object storage in blink-page-aligned pages carved out
//! of raw virtual memory. Each page is bracketed by guard pages; objects are
//! bump allocated from areas taken off power-of-two segregated free lists;
//! oversized objects get a reservation of their own. A mark-sweep cycle
//! finalizes unmarked objects and rebuilds the free lists from the gaps
//! between survivors.
//!
//! # Layout
//!
//! - [`PageMemory`]: one guard-paged reservation with a committed payload.
//! - [`HeapPage`] / [`LargeHeapObject`]: storage tiled by object headers.
//! - [`ThreadHeap`]: pages, page pool, free lists and the allocation area
//!   for one header kind.
//! - [`ThreadState`]: all heaps of one thread, the address-to-page
//!   [`HeapContainsCache`] and the collection state machine.
//! - [`Heap`]: process-wide `init` / `shutdown`.
//!
//! # Example
//!
//! ```
//! use segheap::{trace_nothing, GcInfo, HeapConfig, HeapIndex, ThreadState};
//!
//! static BLOB: GcInfo = GcInfo::new("Blob", trace_nothing);
//!
//! let mut state = ThreadState::new(HeapConfig::default());
//! let kept = state.allocate(HeapIndex::GENERAL, 64, &BLOB);
//! let _dropped = state.allocate(HeapIndex::GENERAL, 64, &BLOB);
//!
//! let metrics = state.collect_garbage(&[kept.as_ptr() as usize]);
//! assert_eq!(metrics.objects_surviving, 1);
//! assert_eq!(metrics.objects_finalized, 1);
//! ```
//!
//! # Threading
//!
//! A [`ThreadState`] and everything it owns is used by one thread only and
//! takes no locks. Only the [`Heap`] lifecycle is shared across threads.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod arena;
pub mod bitmap;
pub mod config;
pub mod contains_cache;
pub mod free_list;
pub mod header;
mod heap;
mod marking;
pub mod metrics;
pub mod page;
pub mod page_memory;
mod scan;
pub mod thread_heap;
pub mod thread_state;
pub mod trace;
pub mod tracing;

pub use arena::{PageId, PageState};
pub use config::{FitPolicy, HeapConfig};
pub use contains_cache::{BasePageRef, CacheLookup, HeapContainsCache};
pub use header::{
    FinalizedHeapObjectHeader, HeaderKind, HeaderRef, HeapObjectHeader, ALLOCATION_GRANULARITY,
    FINALIZED_ZAP_VALUE,
};
pub use heap::Heap;
pub use marking::MarkingVisitor;
pub use metrics::{HeapStats, SweepMetrics};
pub use page::{HeapPage, LargeHeapObject, PageSweep};
pub use page_memory::{MemoryRegion, PageMemory, BLINK_PAGE_SIZE, BLINK_PAGE_SIZE_LOG2};
pub use scan::scan_region_conservatively;
pub use thread_heap::{PageRef, ThreadHeap, LARGE_OBJECT_THRESHOLD, MAX_HEAP_OBJECT_SIZE};
pub use thread_state::{with_thread_state, GcState, HeapIndex, ThreadState};
pub use trace::{trace_nothing, FinalizationCallback, GcInfo, TraceCallback, Visitor};
