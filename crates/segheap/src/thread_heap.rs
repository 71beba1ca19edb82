//! Per-thread, per-header-kind object heap.
//!
//! A [`ThreadHeap`] owns a list of normal pages, a pool of emptied pages and a
//! list of large objects. Small objects are bump allocated out of an
//! allocation area taken from the segregated free lists; when the free lists
//! cannot provide one, a page is taken from the pool or freshly mapped and its
//! whole payload becomes a free span.
//!
//! The heap is single threaded. Operations that can change the set of pages
//! take the owning thread's [`HeapContainsCache`] and flush it.

use std::alloc::{handle_alloc_error, Layout};
use std::io;
use std::ptr::{self, NonNull};
use std::time::Instant;

use crate::arena::{Arena, PageId, PageState};
use crate::config::HeapConfig;
use crate::contains_cache::HeapContainsCache;
use crate::free_list::FreeList;
use crate::header::{HeaderKind, HeaderRef, ALLOCATION_GRANULARITY};
use crate::metrics::{HeapStats, SweepMetrics};
use crate::page::{HeaderIter, HeapPage, LargeHeapObject, PageSweep};
use crate::page_memory::{blink_page_payload_size, PageMemory, BLINK_PAGE_SIZE};
use crate::trace::{GcInfo, Visitor};

/// Largest payload a single allocation may request.
pub const MAX_HEAP_OBJECT_SIZE: usize = 1 << 27;

/// Allocations whose span (header included) exceeds this go to a large object.
pub const LARGE_OBJECT_THRESHOLD: usize = BLINK_PAGE_SIZE / 2;

/// Handle of a normal page or a large object within one heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageRef {
    /// A normal page.
    Normal(PageId),
    /// A large object.
    Large(PageId),
}

/// Where an emptied page ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposal {
    Pooled,
    Released,
}

/// Object storage for one header kind on one thread.
pub struct ThreadHeap {
    kind: HeaderKind,
    config: HeapConfig,
    pages: Arena<HeapPage>,
    first_page: Option<PageId>,
    page_pool: Option<PageId>,
    pooled_pages: usize,
    large_objects: Arena<LargeHeapObject>,
    first_large_object: Option<PageId>,
    free_list: FreeList,
    current_allocation_point: Option<NonNull<u8>>,
    remaining_allocation_size: usize,
    object_starts_stale: bool,
    stats: HeapStats,
}

impl ThreadHeap {
    /// Creates a heap without pages.
    #[must_use]
    pub const fn new(kind: HeaderKind, config: HeapConfig) -> Self {
        Self {
            kind,
            config,
            pages: Arena::new(),
            first_page: None,
            page_pool: None,
            pooled_pages: 0,
            large_objects: Arena::new(),
            first_large_object: None,
            free_list: FreeList::new(config.fit_policy),
            current_allocation_point: None,
            remaining_allocation_size: 0,
            object_starts_stale: false,
            stats: HeapStats::new(),
        }
    }

    /// Header layout of this heap's objects.
    #[must_use]
    pub const fn kind(&self) -> HeaderKind {
        self.kind
    }

    /// Configuration the heap was created with.
    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------------

    /// Allocates a zeroed object with a `size`-byte payload described by
    /// `gc_info` and returns the payload address.
    ///
    /// Never fails: running out of address space aborts the process.
    ///
    /// # Panics
    ///
    /// Panics if `size` exceeds [`MAX_HEAP_OBJECT_SIZE`] or if this is a typed
    /// heap for a different `GcInfo`.
    pub fn allocate(
        &mut self,
        cache: &mut HeapContainsCache,
        size: usize,
        gc_info: &'static GcInfo,
    ) -> NonNull<u8> {
        assert!(
            self.kind.accepts(gc_info),
            "{} objects cannot be allocated in this typed heap",
            gc_info.type_name()
        );
        assert!(
            size <= MAX_HEAP_OBJECT_SIZE,
            "allocation of {size} bytes exceeds the {MAX_HEAP_OBJECT_SIZE}-byte limit"
        );

        let allocation_size = self.kind.allocation_size(size);
        if allocation_size > LARGE_OBJECT_THRESHOLD {
            return self.allocate_large_object(cache, allocation_size, gc_info);
        }

        self.ensure_current_allocation(cache, allocation_size);
        let Some(address) = self.current_allocation_point else {
            unreachable!("ensure_current_allocation left no allocation area");
        };
        self.remaining_allocation_size -= allocation_size;
        self.current_allocation_point = if self.remaining_allocation_size == 0 {
            None
        } else {
            // SAFETY: the area holds more than `allocation_size` bytes.
            Some(unsafe { address.add(allocation_size) })
        };
        self.object_starts_stale = true;
        self.stats.increase_object_space(allocation_size);

        // SAFETY: `address` starts `allocation_size` bytes of the area that
        // now belong to the new object.
        unsafe {
            let payload = self.kind.write_header(address, allocation_size, gc_info);
            ptr::write_bytes(
                payload.as_ptr(),
                0,
                allocation_size - self.kind.header_size(),
            );
            payload
        }
    }

    /// Makes sure at least `min_size` contiguous bytes are available at the
    /// current allocation point.
    ///
    /// A leftover allocation area that is too small goes back to the free
    /// lists. If the free lists cannot supply an area, a page is added to
    /// the heap and its payload is used instead.
    ///
    /// # Panics
    ///
    /// Panics if `min_size` cannot fit in a normal page.
    pub fn ensure_current_allocation(&mut self, cache: &mut HeapContainsCache, min_size: usize) {
        debug_assert_eq!(min_size % ALLOCATION_GRANULARITY, 0);
        if self.remaining_allocation_size >= min_size {
            return;
        }
        assert!(
            min_size <= LARGE_OBJECT_THRESHOLD,
            "{min_size} bytes do not fit in a normal page"
        );

        if let Some(point) = self.current_allocation_point.take() {
            // SAFETY: the area is unused page memory owned by this heap.
            unsafe {
                self.free_list
                    .add(point, self.remaining_allocation_size);
            }
        }
        self.remaining_allocation_size = 0;

        if self.allocate_from_free_list(min_size) {
            return;
        }
        self.add_page_to_heap(cache);
        let allocated = self.allocate_from_free_list(min_size);
        assert!(allocated, "a fresh page cannot satisfy {min_size} bytes");
    }

    fn allocate_from_free_list(&mut self, min_size: usize) -> bool {
        match self.free_list.allocate(min_size) {
            Some((address, size)) => {
                self.current_allocation_point = Some(address);
                self.remaining_allocation_size = size;
                true
            }
            None => false,
        }
    }

    /// Links a page into the heap, reusing a pooled page when one is
    /// available, and hands its payload to the free lists.
    fn add_page_to_heap(&mut self, cache: &mut HeapContainsCache) {
        cache.flush();
        let id = if let Some(id) = self.take_page_from_pool() {
            id
        } else {
            let payload_size = blink_page_payload_size();
            let storage = PageMemory::allocate(payload_size)
                .unwrap_or_else(|error| fatal_out_of_memory(BLINK_PAGE_SIZE, &error));
            #[cfg(feature = "tracing")]
            tracing::debug!(
                address = ?storage.writable_start(),
                payload_size,
                "page_allocated"
            );
            self.pages.insert(HeapPage::new(storage), PageState::Active)
        };
        self.pages.push_front(&mut self.first_page, id);

        let Some(page) = self.pages.get(id) else {
            unreachable!("page {id:?} vanished while being added");
        };
        let (payload, payload_size) = (page.payload(), page.payload_size());
        // SAFETY: the payload is committed and holds no objects.
        unsafe { self.free_list.add(payload, payload_size) };
        self.stats.increase_allocated_space(payload_size);
    }

    /// Pops pooled pages until one can be committed again. Pages that fail
    /// to commit are released.
    fn take_page_from_pool(&mut self) -> Option<PageId> {
        while let Some(id) = self.pages.pop_front(&mut self.page_pool) {
            self.pooled_pages -= 1;
            let Some(page) = self.pages.get_mut(id) else {
                continue;
            };
            match page.storage().commit() {
                Ok(()) => {
                    page.invalidate_object_start_bitmap();
                    self.pages.set_state(id, PageState::Active);
                    #[cfg(feature = "tracing")]
                    tracing::debug!(page = id.index(), "page_reused_from_pool");
                    return Some(id);
                }
                Err(_error) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(page = id.index(), error = %_error, "pooled_page_commit_failed");
                    self.pages.release(id);
                }
            }
        }
        None
    }

    /// Moves an emptied, already unlinked page to the pool, or releases it
    /// when the pool is full or its storage cannot be decommitted.
    fn pool_or_release_page(&mut self, id: PageId) -> Disposal {
        if self.pooled_pages < self.config.page_pool_limit
            && self
                .pages
                .get(id)
                .is_some_and(|page| page.storage().decommit().is_ok())
        {
            self.pages.set_state(id, PageState::Pooled);
            self.pages.push_front(&mut self.page_pool, id);
            self.pooled_pages += 1;
            #[cfg(feature = "tracing")]
            tracing::debug!(page = id.index(), pooled = self.pooled_pages, "page_pooled");
            return Disposal::Pooled;
        }

        self.pages.release(id);
        #[cfg(feature = "tracing")]
        tracing::debug!(page = id.index(), "page_released");
        Disposal::Released
    }

    fn allocate_large_object(
        &mut self,
        cache: &mut HeapContainsCache,
        allocation_size: usize,
        gc_info: &'static GcInfo,
    ) -> NonNull<u8> {
        cache.flush();
        let storage = PageMemory::allocate(allocation_size)
            .unwrap_or_else(|error| fatal_out_of_memory(allocation_size, &error));
        // SAFETY: freshly committed memory is zeroed and at least
        // `allocation_size` bytes long.
        let payload = unsafe {
            self.kind
                .write_header(storage.writable_start(), allocation_size, gc_info)
        };

        let object = LargeHeapObject::new(storage);
        self.stats.increase_allocated_space(object.payload_size());
        self.stats.increase_object_space(allocation_size);
        #[cfg(feature = "tracing")]
        tracing::debug!(
            size = allocation_size,
            reserved = object.reserved_size(),
            type_name = gc_info.type_name(),
            "large_object_allocated"
        );

        let id = self.large_objects.insert(object, PageState::Active);
        self.large_objects.push_front(&mut self.first_large_object, id);
        payload
    }

    // ------------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------------

    /// Returns true while a non-empty bump allocation area is outstanding.
    #[must_use]
    pub const fn owns_allocation_area(&self) -> bool {
        self.current_allocation_point.is_some() && self.remaining_allocation_size > 0
    }

    /// Returns the allocation area to the page tiling, empties the free
    /// lists and drops every object-start bitmap. Afterwards every byte of
    /// every page is covered by exactly one header.
    pub fn make_consistent_for_gc(&mut self) {
        if let Some(point) = self.current_allocation_point.take() {
            if self.remaining_allocation_size > 0 {
                // SAFETY: the area is unused page memory owned by this heap.
                unsafe { self.free_list.add(point, self.remaining_allocation_size) };
            }
        }
        self.remaining_allocation_size = 0;
        self.free_list.clear();
        self.invalidate_object_starts();
    }

    /// Between collections the free lists are empty and no allocation area
    /// is outstanding.
    #[must_use]
    pub fn is_consistent_for_gc(&self) -> bool {
        self.free_list.is_empty() && !self.owns_allocation_area()
    }

    fn invalidate_object_starts(&mut self) {
        let mut cursor = self.first_page;
        while let Some(id) = cursor {
            cursor = self.pages.next(id);
            if let Some(page) = self.pages.get_mut(id) {
                page.invalidate_object_start_bitmap();
            }
        }
        self.object_starts_stale = false;
    }

    /// Clears the mark bit of every object, large objects included.
    pub fn clear_marks(&self) {
        for id in self.pages.iter_list(self.first_page) {
            if let Some(page) = self.pages.get(id) {
                page.clear_marks(self.kind);
            }
        }
        for id in self.large_objects.iter_list(self.first_large_object) {
            if let Some(object) = self.large_objects.get(id) {
                let header = object.header(self.kind);
                if !header.is_free() {
                    header.unmark();
                }
            }
        }
    }

    /// Reclaims every unmarked object and unmarks the survivors.
    ///
    /// Gaps between survivors on a page are returned to the free lists. A
    /// page with no survivors is unlinked and pooled (or released once the
    /// pool is full); a page that is already a single free span is pooled
    /// without walking it. Large objects are never pooled: an unmarked large
    /// object releases its storage right away.
    ///
    /// # Panics
    ///
    /// Panics if the heap was not made consistent for GC first.
    pub fn sweep(&mut self, cache: &mut HeapContainsCache) -> SweepMetrics {
        assert!(
            self.is_consistent_for_gc(),
            "sweep requires a heap made consistent for GC"
        );
        let started = Instant::now();
        let mut metrics = SweepMetrics::new();
        let kind = self.kind;
        let zap = self.config.zap_finalized;
        let mut page_set_changed = false;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            pages = self.page_count(),
            large_objects = self.large_object_count(),
            object_space = self.stats.object_space,
            "sweep_start"
        );
        self.stats.clear();

        let mut previous = None;
        let mut cursor = self.first_page;
        while let Some(id) = cursor {
            cursor = self.pages.next(id);
            let Some(page) = self.pages.get_mut(id) else {
                unreachable!("stale page {id:?} in the page list");
            };
            // A page that is one free span has no objects to visit.
            let outcome = if page.is_empty(kind) {
                page.invalidate_object_start_bitmap();
                PageSweep::Empty
            } else {
                page.sweep(kind, zap, &mut self.free_list, &mut self.stats, &mut metrics)
            };
            match outcome {
                PageSweep::Live => previous = Some(id),
                PageSweep::Empty => {
                    self.pages.unlink(&mut self.first_page, previous, id);
                    page_set_changed = true;
                    match self.pool_or_release_page(id) {
                        Disposal::Pooled => metrics.pages_pooled += 1,
                        Disposal::Released => metrics.pages_released += 1,
                    }
                }
            }
        }

        let mut previous = None;
        let mut cursor = self.first_large_object;
        while let Some(id) = cursor {
            cursor = self.large_objects.next(id);
            let Some(object) = self.large_objects.get(id) else {
                unreachable!("stale large object {id:?} in the list");
            };
            let header = object.header(kind);
            if !header.is_free() && header.is_marked() {
                header.unmark();
                self.stats.increase_allocated_space(object.payload_size());
                self.stats.increase_object_space(header.size());
                metrics.large_objects_surviving += 1;
                previous = Some(id);
                continue;
            }
            if !header.is_free() {
                // SAFETY: live and unmarked, so never finalized before.
                unsafe { header.finalize(zap) };
            }
            self.large_objects
                .unlink(&mut self.first_large_object, previous, id);
            self.large_objects.release(id);
            page_set_changed = true;
            metrics.large_objects_released += 1;
            #[cfg(feature = "tracing")]
            tracing::debug!(object = id.index(), "large_object_released");
        }

        if page_set_changed {
            cache.flush();
        }
        self.object_starts_stale = false;
        metrics.duration = started.elapsed();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            finalized = metrics.objects_finalized,
            surviving = metrics.objects_surviving,
            pages_pooled = metrics.pages_pooled,
            pages_released = metrics.pages_released,
            large_objects_released = metrics.large_objects_released,
            "sweep_end"
        );
        metrics
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Finalizes every live object regardless of marks and turns it into a
    /// free span. Calling it again finalizes nothing. Returns the number of
    /// objects finalized.
    pub fn finalize_all(&mut self) -> usize {
        self.make_consistent_for_gc();
        let kind = self.kind;
        let zap = self.config.zap_finalized;
        let mut finalized = 0;

        let mut cursor = self.first_page;
        while let Some(id) = cursor {
            cursor = self.pages.next(id);
            if let Some(page) = self.pages.get_mut(id) {
                finalized += page.finalize_all(kind, zap);
            }
        }
        for id in self.large_objects.iter_list(self.first_large_object) {
            if let Some(object) = self.large_objects.get(id) {
                let header = object.header(kind);
                if !header.is_free() {
                    // SAFETY: the header is made free right after, so it is
                    // never finalized twice.
                    unsafe { header.finalize(zap) };
                    header.make_free();
                    finalized += 1;
                }
            }
        }
        self.stats.object_space = 0;
        finalized
    }

    /// Releases all storage: active pages, pooled pages and large objects.
    /// Live objects are not finalized; call [`finalize_all`](Self::finalize_all)
    /// first.
    pub fn delete_pages(&mut self, cache: &mut HeapContainsCache) {
        cache.flush();
        self.current_allocation_point = None;
        self.remaining_allocation_size = 0;
        self.free_list.clear();

        for head in [&mut self.first_page, &mut self.page_pool] {
            while let Some(id) = self.pages.pop_front(head) {
                self.pages.release(id);
            }
        }
        while let Some(id) = self.large_objects.pop_front(&mut self.first_large_object) {
            self.large_objects.release(id);
        }
        self.pooled_pages = 0;
        self.object_starts_stale = false;
        self.stats.clear();
    }

    // ------------------------------------------------------------------------
    // Pointer classification
    // ------------------------------------------------------------------------

    /// Finds the page or large object whose blink pages contain `address`
    /// by scanning the page lists.
    #[must_use]
    pub fn heap_page_from_address(&self, address: usize) -> Option<PageRef> {
        self.pages
            .iter_list(self.first_page)
            .find(|&id| self.pages.get(id).is_some_and(|page| page.contains(address)))
            .map(PageRef::Normal)
            .or_else(|| {
                self.large_objects
                    .iter_list(self.first_large_object)
                    .find(|&id| {
                        self.large_objects
                            .get(id)
                            .is_some_and(|object| object.contains(address))
                    })
                    .map(PageRef::Large)
            })
    }

    /// Resolves `address` inside `page` to the live object containing it.
    ///
    /// # Panics
    ///
    /// Panics if an allocation area is outstanding, since the area is not
    /// yet tiled by headers.
    pub fn find_header(&mut self, page: PageRef, address: usize) -> Option<HeaderRef<'_>> {
        self.prepare_object_lookup();
        let kind = self.kind;
        match page {
            PageRef::Normal(id) => self.pages.get_mut(id)?.find_header(kind, address),
            PageRef::Large(id) => self.large_objects.get(id)?.find_header(kind, address),
        }
    }

    fn prepare_object_lookup(&mut self) {
        assert!(
            self.current_allocation_point.is_none(),
            "object lookup while an allocation area is outstanding"
        );
        if self.object_starts_stale {
            self.invalidate_object_starts();
        }
    }

    /// Resolves `address` to the live object containing it, if any.
    pub fn find_header_for_address(&mut self, address: usize) -> Option<HeaderRef<'_>> {
        let page = self.heap_page_from_address(address)?;
        self.find_header(page, address)
    }

    /// If `address` points into a live object of `page`, hands the object
    /// and its trace callback to `visitor`. Returns true if it did.
    pub fn check_and_mark_pointer(
        &mut self,
        page: PageRef,
        visitor: &mut dyn Visitor,
        address: usize,
    ) -> bool {
        self.prepare_object_lookup();
        let kind = self.kind;
        match page {
            PageRef::Normal(id) => self
                .pages
                .get_mut(id)
                .is_some_and(|page| page.check_and_mark_pointer(kind, visitor, address)),
            PageRef::Large(id) => self
                .large_objects
                .get(id)
                .is_some_and(|object| object.check_and_mark_pointer(kind, visitor, address)),
        }
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Active pages, most recently added first.
    pub fn pages(&self) -> impl Iterator<Item = PageId> + '_ {
        self.pages.iter_list(self.first_page)
    }

    /// Pooled pages, most recently pooled first.
    pub fn pooled_pages(&self) -> impl Iterator<Item = PageId> + '_ {
        self.pages.iter_list(self.page_pool)
    }

    /// Large objects, most recently allocated first.
    pub fn large_objects(&self) -> impl Iterator<Item = PageId> + '_ {
        self.large_objects.iter_list(self.first_large_object)
    }

    /// Active page behind `id`.
    #[must_use]
    pub fn page(&self, id: PageId) -> Option<&HeapPage> {
        self.pages.get(id)
    }

    /// Large object behind `id`.
    #[must_use]
    pub fn large_object(&self, id: PageId) -> Option<&LargeHeapObject> {
        self.large_objects.get(id)
    }

    /// Where the page behind `id` currently is.
    #[must_use]
    pub fn page_state(&self, id: PageId) -> PageState {
        self.pages.state(id)
    }

    /// Where the large object behind `id` currently is.
    #[must_use]
    pub fn large_object_state(&self, id: PageId) -> PageState {
        self.large_objects.state(id)
    }

    /// Number of active pages.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages().count()
    }

    /// Number of pooled pages.
    #[must_use]
    pub const fn pooled_page_count(&self) -> usize {
        self.pooled_pages
    }

    /// Number of live large objects.
    #[must_use]
    pub fn large_object_count(&self) -> usize {
        self.large_objects().count()
    }

    /// Headers tiling an active page.
    ///
    /// # Panics
    ///
    /// Panics if an allocation area is outstanding.
    #[must_use]
    pub fn walk_page(&self, id: PageId) -> Option<HeaderIter<'_>> {
        assert!(
            !self.owns_allocation_area(),
            "page walk while an allocation area is outstanding"
        );
        self.pages.get(id).map(|page| page.headers(self.kind))
    }

    /// Space accounting as of the last sweep plus later allocations.
    #[must_use]
    pub const fn stats(&self) -> &HeapStats {
        &self.stats
    }

    /// The heap's free lists.
    #[must_use]
    pub const fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    /// Upper bound on the non-empty free-list buckets.
    #[must_use]
    pub const fn biggest_free_list_index(&self) -> usize {
        self.free_list.biggest_index()
    }

    /// Next address of the bump allocation area, if one is outstanding.
    #[must_use]
    pub const fn current_allocation_point(&self) -> Option<NonNull<u8>> {
        self.current_allocation_point
    }

    /// Bytes left in the bump allocation area.
    #[must_use]
    pub const fn remaining_allocation_size(&self) -> usize {
        self.remaining_allocation_size
    }
}

impl std::fmt::Debug for ThreadHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadHeap")
            .field("kind", &self.kind)
            .field("pages", &self.page_count())
            .field("pooled_pages", &self.pooled_pages)
            .field("large_objects", &self.large_object_count())
            .field("remaining_allocation_size", &self.remaining_allocation_size)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Logs and aborts after the OS refused to map heap memory.
#[cold]
#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
fn fatal_out_of_memory(size: usize, error: &io::Error) -> ! {
    #[cfg(feature = "tracing")]
    tracing::error!(size, %error, "out of memory mapping heap storage");
    let layout = Layout::from_size_align(size, BLINK_PAGE_SIZE)
        .unwrap_or_else(|_| Layout::new::<u8>());
    handle_alloc_error(layout)
}
