//! Normal heap pages and large objects.
//!
//! A [`HeapPage`] is one blink page of storage whose payload is tiled by
//! headers: every byte belongs to exactly one live object or free span. A
//! [`LargeHeapObject`] holds a single object in a reservation of its own.

use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::bitmap::ObjectStartBitmap;
use crate::free_list::FreeList;
use crate::header::{HeaderKind, HeaderRef};
use crate::metrics::{HeapStats, SweepMetrics};
use crate::page_memory::{blink_page_base, PageMemory};
use crate::trace::Visitor;

/// Outcome of sweeping one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSweep {
    /// Nothing survived; the page can be pooled or released.
    Empty,
    /// At least one object survived.
    Live,
}

// ============================================================================
// HeaderIter
// ============================================================================

/// Walks the headers tiling a page payload.
///
/// The next header's size is read before the current one is yielded, so the
/// caller may finalize or rewrite the yielded span (without changing its
/// size) while iterating.
pub struct HeaderIter<'a> {
    payload: NonNull<u8>,
    payload_size: usize,
    offset: usize,
    kind: HeaderKind,
    _marker: PhantomData<&'a ()>,
}

impl HeaderIter<'_> {
    /// # Safety
    ///
    /// `payload` must be a page payload of `payload_size` bytes tiled by
    /// headers of `kind`, and stay mapped for the iterator's lifetime.
    pub(crate) const unsafe fn new(
        payload: NonNull<u8>,
        payload_size: usize,
        kind: HeaderKind,
    ) -> Self {
        Self {
            payload,
            payload_size,
            offset: 0,
            kind,
            _marker: PhantomData,
        }
    }
}

impl<'a> Iterator for HeaderIter<'a> {
    type Item = HeaderRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.payload_size {
            return None;
        }
        // SAFETY: offset is inside the payload and, by the tiling invariant,
        // lands on a header.
        let header = unsafe { HeaderRef::from_address(self.payload.add(self.offset), self.kind) };
        let size = header.size();
        assert!(
            size > 0 && self.offset + size <= self.payload_size,
            "corrupted page: header at offset {} claims {size} of {} bytes",
            self.offset,
            self.payload_size
        );
        self.offset += size;
        Some(header)
    }
}

// ============================================================================
// HeapPage
// ============================================================================

/// One normal page of object storage.
#[derive(Debug)]
pub struct HeapPage {
    storage: PageMemory,
    object_start_bitmap: ObjectStartBitmap,
}

impl HeapPage {
    /// Wraps freshly committed storage. The payload is not tiled yet; the
    /// caller hands it to the free list.
    #[must_use]
    pub fn new(storage: PageMemory) -> Self {
        debug_assert_eq!(
            blink_page_base(storage.writable_region().end() - 1),
            storage.reserved_region().start(),
            "page payload must stay inside its blink page"
        );
        let object_start_bitmap = ObjectStartBitmap::new(storage.writable_region().size());
        Self {
            storage,
            object_start_bitmap,
        }
    }

    /// Backing memory of the page.
    #[must_use]
    pub const fn storage(&self) -> &PageMemory {
        &self.storage
    }

    /// First byte of the payload.
    #[must_use]
    pub const fn payload(&self) -> NonNull<u8> {
        self.storage.writable_start()
    }

    /// Bytes of payload tiled by headers.
    #[must_use]
    pub const fn payload_size(&self) -> usize {
        self.storage.writable_region().size()
    }

    /// Address just past the payload.
    #[must_use]
    pub fn payload_end(&self) -> usize {
        self.storage.writable_region().end()
    }

    /// Returns true if `address` lies in this page's blink page, guard
    /// pages included.
    #[must_use]
    pub fn contains(&self, address: usize) -> bool {
        self.storage.reserved_region().contains(address)
    }

    /// Returns true if the payload is a single free span.
    #[must_use]
    pub fn is_empty(&self, kind: HeaderKind) -> bool {
        let mut headers = self.headers(kind);
        matches!(headers.next(), Some(first) if first.is_free() && first.size() == self.payload_size())
    }

    /// Headers tiling the payload.
    #[must_use]
    pub fn headers(&self, kind: HeaderKind) -> HeaderIter<'_> {
        // SAFETY: the payload stays mapped while `self` is borrowed.
        unsafe { HeaderIter::new(self.payload(), self.payload_size(), kind) }
    }

    /// Sweeps the page: finalizes unmarked objects, unmarks survivors and
    /// returns every gap between survivors to `free_list`.
    ///
    /// When nothing survives, no span is added and the page reports
    /// [`PageSweep::Empty`].
    pub fn sweep(
        &mut self,
        kind: HeaderKind,
        zap: bool,
        free_list: &mut FreeList,
        stats: &mut HeapStats,
        metrics: &mut SweepMetrics,
    ) -> PageSweep {
        self.object_start_bitmap.invalidate();
        let payload = self.payload();
        let start = payload.as_ptr() as usize;
        let mut gap_start = 0;
        let mut survived = false;

        // SAFETY: the payload stays mapped for the whole sweep.
        let headers = unsafe { HeaderIter::new(payload, self.payload_size(), kind) };
        for header in headers {
            if header.is_free() {
                continue;
            }
            if !header.is_marked() {
                // SAFETY: live and unmarked, so never finalized before.
                unsafe { header.finalize(zap) };
                metrics.objects_finalized += 1;
                continue;
            }

            let offset = header.address() - start;
            if gap_start != offset {
                // SAFETY: the gap holds only free spans and finalized objects.
                unsafe { free_list.add(payload.add(gap_start), offset - gap_start) };
            }
            header.unmark();
            stats.increase_object_space(header.size());
            metrics.objects_surviving += 1;
            survived = true;
            gap_start = offset + header.size();
        }

        if !survived {
            return PageSweep::Empty;
        }
        if gap_start != self.payload_size() {
            // SAFETY: as above.
            unsafe { free_list.add(payload.add(gap_start), self.payload_size() - gap_start) };
        }
        stats.increase_allocated_space(self.payload_size());
        PageSweep::Live
    }

    /// Clears the mark bit of every live object.
    pub fn clear_marks(&self, kind: HeaderKind) {
        for header in self.headers(kind) {
            if !header.is_free() && header.is_marked() {
                header.unmark();
            }
        }
    }

    /// Finalizes every live object regardless of its mark and rewrites it as
    /// a free span. Returns the number of objects finalized.
    pub fn finalize_all(&mut self, kind: HeaderKind, zap: bool) -> usize {
        self.object_start_bitmap.invalidate();
        let mut finalized = 0;
        for header in self.headers(kind) {
            if header.is_free() {
                continue;
            }
            // SAFETY: live headers are finalized once and then made free.
            unsafe { header.finalize(zap) };
            header.make_free();
            finalized += 1;
        }
        finalized
    }

    /// Forgets the object-start bitmap; it is rebuilt on the next lookup.
    pub fn invalidate_object_start_bitmap(&mut self) {
        self.object_start_bitmap.invalidate();
    }

    /// Returns true if the object-start bitmap is currently valid.
    #[must_use]
    pub const fn has_object_start_bitmap(&self) -> bool {
        self.object_start_bitmap.is_computed()
    }

    fn populate_object_start_bitmap(&mut self, kind: HeaderKind) {
        self.object_start_bitmap.clear();
        let start = self.payload().as_ptr() as usize;
        // SAFETY: the payload stays mapped; the iterator does not borrow the
        // bitmap being filled.
        let headers = unsafe { HeaderIter::new(self.payload(), self.payload_size(), kind) };
        for header in headers {
            self.object_start_bitmap.set(header.address() - start);
        }
        self.object_start_bitmap.mark_computed();
    }

    /// Resolves `address` to the live object whose span contains it.
    ///
    /// Addresses in guard pages, in free spans or past the payload resolve to
    /// nothing. The page must not be carved by a bump allocation area.
    pub fn find_header(&mut self, kind: HeaderKind, address: usize) -> Option<HeaderRef<'_>> {
        let start = self.payload().as_ptr() as usize;
        if address < start || address >= self.payload_end() {
            return None;
        }
        if !self.object_start_bitmap.is_computed() {
            self.populate_object_start_bitmap(kind);
        }
        let offset = self.object_start_bitmap.find_start(address - start)?;
        // SAFETY: the bitmap only records header starts inside the payload.
        let header = unsafe { HeaderRef::from_address(self.payload().add(offset), kind) };
        debug_assert!(header.contains(address));
        (!header.is_free()).then_some(header)
    }

    /// If `address` points into a live object of this page, hands the object
    /// and its trace callback to `visitor`. Returns true if it did.
    pub fn check_and_mark_pointer(
        &mut self,
        kind: HeaderKind,
        visitor: &mut dyn Visitor,
        address: usize,
    ) -> bool {
        let Some(header) = self.find_header(kind, address) else {
            return false;
        };
        let trace = header.gc_info().trace();
        visitor.mark(header, trace);
        true
    }
}

// ============================================================================
// LargeHeapObject
// ============================================================================

/// A single object too big for a normal page.
#[derive(Debug)]
pub struct LargeHeapObject {
    storage: PageMemory,
}

impl LargeHeapObject {
    /// Wraps storage whose payload starts with the object's header.
    #[must_use]
    pub const fn new(storage: PageMemory) -> Self {
        Self { storage }
    }

    /// Address of the object's header.
    #[must_use]
    pub const fn header_address(&self) -> NonNull<u8> {
        self.storage.writable_start()
    }

    /// View of the object's header.
    #[must_use]
    pub fn header(&self, kind: HeaderKind) -> HeaderRef<'_> {
        // SAFETY: the header was written at the payload start on allocation.
        unsafe { HeaderRef::from_address(self.header_address(), kind) }
    }

    /// Span of the object, header included.
    #[must_use]
    pub fn size(&self, kind: HeaderKind) -> usize {
        self.header(kind).size()
    }

    /// Bytes reserved from the OS for this object.
    #[must_use]
    pub fn reserved_size(&self) -> usize {
        self.storage.reserved_region().size()
    }

    /// Committed payload bytes.
    #[must_use]
    pub const fn payload_size(&self) -> usize {
        self.storage.writable_region().size()
    }

    /// Returns true if `address` lies in one of the object's blink pages.
    #[must_use]
    pub fn contains(&self, address: usize) -> bool {
        self.storage.reserved_region().contains(address)
    }

    /// Resolves `address` to the object if it points into its span and the
    /// object is live.
    #[must_use]
    pub fn find_header(&self, kind: HeaderKind, address: usize) -> Option<HeaderRef<'_>> {
        let header = self.header(kind);
        (header.contains(address) && !header.is_free()).then_some(header)
    }

    /// Hands the object to `visitor` if `address` points into it and it is
    /// live.
    pub fn check_and_mark_pointer(
        &self,
        kind: HeaderKind,
        visitor: &mut dyn Visitor,
        address: usize,
    ) -> bool {
        let Some(header) = self.find_header(kind, address) else {
            return false;
        };
        visitor.mark(header, header.gc_info().trace());
        true
    }
}
