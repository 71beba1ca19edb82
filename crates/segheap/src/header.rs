//! Per-object headers.
//!
//! Every span of page memory, live or free, starts with a [`HeapObjectHeader`].
//! The header packs the span size together with three flag bits into one
//! 32-bit word and carries a magic number used for corruption checks:
//!
//! ```text
//!  31                               3   2     1      0
//! +----------------------------------+-----+------+------+
//! | size (multiple of 8)             | dbg | free | mark |
//! +----------------------------------+-----+------+------+
//! | magic                                                |
//! +------------------------------------------------------+
//! ```
//!
//! Objects in a finalized heap are prefixed by a [`FinalizedHeapObjectHeader`],
//! which adds a pointer to the object's [`GcInfo`]. Objects in a typed heap
//! share the heap's `GcInfo` and only pay for the plain header.

use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

use crate::trace::GcInfo;

/// Every object and free span is a multiple of this many bytes.
pub const ALLOCATION_GRANULARITY: usize = 8;

/// Mask of the bits below [`ALLOCATION_GRANULARITY`].
pub const ALLOCATION_MASK: usize = ALLOCATION_GRANULARITY - 1;

/// Byte written over the payload of finalized objects when zapping is enabled.
pub const FINALIZED_ZAP_VALUE: u8 = 0x2a;

const MARK_BIT: u32 = 1;
const FREE_BIT: u32 = 2;
const DEBUG_BIT: u32 = 4;
const FLAG_MASK: u32 = MARK_BIT | FREE_BIT | DEBUG_BIT;

const HEADER_MAGIC: u32 = 0x5347_4850;
const ZAPPED_MAGIC: u32 = 0x2a2a_dead;

/// Rounds `size` up to the allocation granularity.
#[must_use]
pub const fn round_to_granularity(size: usize) -> usize {
    (size + ALLOCATION_MASK) & !ALLOCATION_MASK
}

// ============================================================================
// HeapObjectHeader
// ============================================================================

/// The one-word prefix of every span in page memory.
///
/// The magic half is written in every build so that headers stay eight
/// bytes and payloads stay granularity aligned. Only debug builds check it.
#[repr(C)]
#[derive(Debug)]
pub struct HeapObjectHeader {
    encoded: u32,
    magic: u32,
}

impl HeapObjectHeader {
    /// Header of a live, unmarked object spanning `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a non-zero multiple of the allocation
    /// granularity or does not fit in the size field.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            encoded: encode_size(size),
            magic: HEADER_MAGIC,
        }
    }

    /// Header of a free span of `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`new`](Self::new).
    #[must_use]
    pub fn new_free(size: usize) -> Self {
        Self {
            encoded: encode_size(size) | FREE_BIT,
            magic: HEADER_MAGIC,
        }
    }

    /// Size of the span in bytes, header included.
    #[must_use]
    pub const fn size(&self) -> usize {
        (self.encoded & !FLAG_MASK) as usize
    }

    /// Returns true for a free span.
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.encoded & FREE_BIT != 0
    }

    /// Returns true if the object was reached during marking.
    #[must_use]
    pub const fn is_marked(&self) -> bool {
        self.encoded & MARK_BIT != 0
    }

    /// Sets the mark bit.
    pub fn mark(&mut self) {
        self.check_header();
        self.encoded |= MARK_BIT;
    }

    /// Clears the mark bit.
    pub fn unmark(&mut self) {
        self.check_header();
        self.encoded &= !MARK_BIT;
    }

    /// Returns true if the debug bit is set.
    #[must_use]
    pub const fn has_debug_mark(&self) -> bool {
        self.encoded & DEBUG_BIT != 0
    }

    /// Sets the debug bit, which has no meaning to the collector.
    pub fn set_debug_mark(&mut self) {
        self.check_header();
        self.encoded |= DEBUG_BIT;
    }

    /// Clears the debug bit.
    pub fn clear_debug_mark(&mut self) {
        self.check_header();
        self.encoded &= !DEBUG_BIT;
    }

    /// Turns a live header into a free one of the same size, dropping the
    /// mark and debug bits.
    pub fn make_free(&mut self) {
        self.encoded = (self.encoded & !FLAG_MASK) | FREE_BIT;
        self.magic = HEADER_MAGIC;
    }

    /// Debug-only corruption check.
    pub fn check_header(&self) {
        debug_assert_eq!(
            self.magic, HEADER_MAGIC,
            "corrupted heap object header at {:p}",
            ptr::from_ref(self)
        );
    }

    /// Marks the header as finalized so later use is caught by
    /// [`check_header`](Self::check_header).
    pub fn zap_magic(&mut self) {
        self.magic = ZAPPED_MAGIC;
    }

    /// Returns true once [`zap_magic`](Self::zap_magic) has run.
    #[must_use]
    pub const fn is_zapped(&self) -> bool {
        self.magic == ZAPPED_MAGIC
    }
}

fn encode_size(size: usize) -> u32 {
    assert!(
        size > 0 && size & ALLOCATION_MASK == 0,
        "header size {size} is not a positive multiple of {ALLOCATION_GRANULARITY}"
    );
    u32::try_from(size).unwrap_or_else(|_| panic!("header size {size} overflows the size field"))
}

/// Header of an object in a finalized heap: the plain header plus the
/// object's type descriptor.
#[repr(C)]
#[derive(Debug)]
pub struct FinalizedHeapObjectHeader {
    header: HeapObjectHeader,
    gc_info: &'static GcInfo,
}

impl FinalizedHeapObjectHeader {
    /// Header of a live, unmarked object spanning `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`HeapObjectHeader::new`].
    #[must_use]
    pub fn new(size: usize, gc_info: &'static GcInfo) -> Self {
        Self {
            header: HeapObjectHeader::new(size),
            gc_info,
        }
    }

    /// The plain header in front of the type descriptor.
    #[must_use]
    pub const fn header(&self) -> &HeapObjectHeader {
        &self.header
    }

    /// Type descriptor of the object.
    #[must_use]
    pub const fn gc_info(&self) -> &'static GcInfo {
        self.gc_info
    }
}

/// A free span large enough to be linked into a free-list bucket.
///
/// Free spans smaller than this carry a bare free [`HeapObjectHeader`] and
/// are only reclaimed by a later sweep.
#[repr(C)]
#[derive(Debug)]
pub struct FreeListEntry {
    pub(crate) header: HeapObjectHeader,
    pub(crate) next: Option<NonNull<FreeListEntry>>,
}

/// Smallest span that can hold a [`FreeListEntry`].
pub const FREE_LIST_ENTRY_SIZE: usize = round_to_granularity(mem::size_of::<FreeListEntry>());

// ============================================================================
// HeaderKind
// ============================================================================

/// Which header layout a heap uses.
#[derive(Debug, Clone, Copy)]
pub enum HeaderKind {
    /// Every object shares this type descriptor; headers are one word.
    Plain(&'static GcInfo),
    /// Each object records its own type descriptor.
    Finalized,
}

impl HeaderKind {
    /// Bytes in front of every payload.
    #[must_use]
    pub const fn header_size(self) -> usize {
        match self {
            Self::Plain(_) => round_to_granularity(mem::size_of::<HeapObjectHeader>()),
            Self::Finalized => round_to_granularity(mem::size_of::<FinalizedHeapObjectHeader>()),
        }
    }

    /// Span size of an object with a `payload_size`-byte payload.
    #[must_use]
    pub const fn allocation_size(self, payload_size: usize) -> usize {
        round_to_granularity(payload_size + self.header_size())
    }

    /// Returns true if objects described by `gc_info` may live in a heap of
    /// this kind.
    #[must_use]
    pub fn accepts(self, gc_info: &'static GcInfo) -> bool {
        match self {
            Self::Plain(info) => ptr::eq(info, gc_info),
            Self::Finalized => true,
        }
    }

    /// Writes a live header for a `size`-byte span at `address` and returns
    /// the payload address.
    ///
    /// # Safety
    ///
    /// `address` must be granularity aligned and point to `size` writable bytes.
    pub unsafe fn write_header(
        self,
        address: NonNull<u8>,
        size: usize,
        gc_info: &'static GcInfo,
    ) -> NonNull<u8> {
        match self {
            Self::Plain(_) => unsafe {
                address
                    .cast::<HeapObjectHeader>()
                    .write(HeapObjectHeader::new(size));
            },
            Self::Finalized => unsafe {
                address
                    .cast::<FinalizedHeapObjectHeader>()
                    .write(FinalizedHeapObjectHeader::new(size, gc_info));
            },
        }
        unsafe { address.add(self.header_size()) }
    }
}

// ============================================================================
// HeaderRef
// ============================================================================

/// A view of one header living in page memory.
///
/// All accesses go through the raw pointer so that no long-lived `&mut`
/// into page memory exists while the heap walks or mutates it.
#[derive(Clone, Copy)]
pub struct HeaderRef<'a> {
    ptr: NonNull<HeapObjectHeader>,
    kind: HeaderKind,
    _marker: PhantomData<&'a HeapObjectHeader>,
}

impl HeaderRef<'_> {
    /// # Safety
    ///
    /// `address` must point to a header written for a heap of `kind`, and the
    /// memory must stay mapped for the chosen lifetime.
    #[must_use]
    pub const unsafe fn from_address(address: NonNull<u8>, kind: HeaderKind) -> Self {
        Self {
            ptr: address.cast(),
            kind,
            _marker: PhantomData,
        }
    }

    /// Header of the object whose payload starts at `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must have been returned by an allocation in a heap of `kind`
    /// and the object must not have been swept.
    #[must_use]
    pub const unsafe fn from_payload(payload: NonNull<u8>, kind: HeaderKind) -> Self {
        unsafe { Self::from_address(payload.sub(kind.header_size()), kind) }
    }

    /// Address of the header.
    #[must_use]
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Start of the header as a byte pointer.
    #[must_use]
    pub const fn as_ptr(&self) -> NonNull<u8> {
        self.ptr.cast()
    }

    /// Layout of the header.
    #[must_use]
    pub const fn kind(&self) -> HeaderKind {
        self.kind
    }

    /// First byte after the header.
    #[must_use]
    pub const fn payload(&self) -> NonNull<u8> {
        unsafe { self.ptr.cast::<u8>().add(self.kind.header_size()) }
    }

    /// Span size, header included.
    #[must_use]
    pub fn size(&self) -> usize {
        self.read().size()
    }

    /// Span size without the header.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.size() - self.kind.header_size()
    }

    /// Returns true if `address` falls inside the span, header included.
    #[must_use]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.address() && address < self.address() + self.size()
    }

    /// Returns true for a free span.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.read().is_free()
    }

    /// Returns true if the object was reached during marking.
    #[must_use]
    pub fn is_marked(&self) -> bool {
        self.read().is_marked()
    }

    /// Sets the mark bit.
    pub fn mark(&self) {
        self.update(HeapObjectHeader::mark);
    }

    /// Clears the mark bit.
    pub fn unmark(&self) {
        self.update(HeapObjectHeader::unmark);
    }

    /// Returns true if the debug bit is set.
    #[must_use]
    pub fn has_debug_mark(&self) -> bool {
        self.read().has_debug_mark()
    }

    /// Sets the debug bit.
    pub fn set_debug_mark(&self) {
        self.update(HeapObjectHeader::set_debug_mark);
    }

    /// Clears the debug bit.
    pub fn clear_debug_mark(&self) {
        self.update(HeapObjectHeader::clear_debug_mark);
    }

    /// Returns true once the header was zapped by finalization.
    #[must_use]
    pub fn is_zapped(&self) -> bool {
        self.read().is_zapped()
    }

    /// Type descriptor of the object. Only meaningful for live headers.
    #[must_use]
    pub fn gc_info(&self) -> &'static GcInfo {
        debug_assert!(!self.is_free(), "free spans carry no type information");
        match self.kind {
            HeaderKind::Plain(info) => info,
            HeaderKind::Finalized => unsafe {
                (*self.ptr.cast::<FinalizedHeapObjectHeader>().as_ptr()).gc_info
            },
        }
    }

    /// Runs the object's finalizer, if its type has one. With `zap`, the
    /// payload is then overwritten with [`FINALIZED_ZAP_VALUE`] and the header
    /// magic is zapped.
    ///
    /// # Safety
    ///
    /// The header must be live and must not be finalized twice.
    pub unsafe fn finalize(&self, zap: bool) {
        self.read().check_header();
        let gc_info = self.gc_info();
        if let Some(finalize) = gc_info.finalizer() {
            finalize(self.payload(), self.payload_size());
        }
        if zap {
            unsafe {
                ptr::write_bytes(
                    self.payload().as_ptr(),
                    FINALIZED_ZAP_VALUE,
                    self.payload_size(),
                );
            }
            self.update(HeapObjectHeader::zap_magic);
        }
    }

    /// Rewrites the header as a free span of the same size.
    pub(crate) fn make_free(&self) {
        self.update(HeapObjectHeader::make_free);
    }

    fn read(&self) -> &HeapObjectHeader {
        unsafe { self.ptr.as_ref() }
    }

    fn update(&self, f: impl FnOnce(&mut HeapObjectHeader)) {
        f(unsafe { &mut *self.ptr.as_ptr() });
    }
}

impl std::fmt::Debug for HeaderRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderRef")
            .field("address", &self.ptr)
            .field("size", &self.size())
            .field("free", &self.is_free())
            .field("marked", &self.is_marked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::trace_nothing;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static FINALIZED: AtomicUsize = AtomicUsize::new(0);

    fn count_finalize(_payload: NonNull<u8>, size: usize) {
        FINALIZED.fetch_add(size, Ordering::SeqCst);
    }

    static PLAIN: GcInfo = GcInfo::new("Plain", trace_nothing);
    static COUNTED: GcInfo = GcInfo::with_finalizer("Counted", trace_nothing, count_finalize);

    fn buffer() -> Vec<u64> {
        vec![0; 16]
    }

    #[test]
    fn test_header_sizes() {
        assert_eq!(HeaderKind::Plain(&PLAIN).header_size(), 8);
        assert_eq!(
            HeaderKind::Finalized.header_size(),
            round_to_granularity(mem::size_of::<FinalizedHeapObjectHeader>())
        );
        assert_eq!(HeaderKind::Plain(&PLAIN).allocation_size(1), 16);
        assert_eq!(HeaderKind::Plain(&PLAIN).allocation_size(8), 16);
        assert_eq!(HeaderKind::Plain(&PLAIN).allocation_size(9), 24);
    }

    #[test]
    fn test_bits_are_independent() {
        let mut header = HeapObjectHeader::new(64);
        assert_eq!(header.size(), 64);
        assert!(!header.is_marked());
        assert!(!header.is_free());

        header.mark();
        header.set_debug_mark();
        assert!(header.is_marked());
        assert!(header.has_debug_mark());
        assert_eq!(header.size(), 64);

        header.unmark();
        assert!(!header.is_marked());
        assert!(header.has_debug_mark());

        header.clear_debug_mark();
        assert!(!header.has_debug_mark());
    }

    #[test]
    fn test_unmark_is_idempotent() {
        let mut header = HeapObjectHeader::new(16);
        header.unmark();
        assert!(!header.is_marked());
        header.unmark();
        assert!(!header.is_marked());
    }

    #[test]
    fn test_free_header() {
        let header = HeapObjectHeader::new_free(32);
        assert!(header.is_free());
        assert_eq!(header.size(), 32);

        let mut live = HeapObjectHeader::new(32);
        live.mark();
        live.make_free();
        assert!(live.is_free());
        assert!(!live.is_marked());
        header.check_header();
    }

    #[test]
    #[should_panic(expected = "not a positive multiple")]
    fn test_unaligned_size_panics() {
        let _ = HeapObjectHeader::new(12);
    }

    #[test]
    fn test_header_ref_plain() {
        let mut buf = buffer();
        let base = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
        let kind = HeaderKind::Plain(&PLAIN);

        let payload = unsafe { kind.write_header(base, 32, &PLAIN) };
        assert_eq!(payload.as_ptr() as usize, base.as_ptr() as usize + 8);

        let header = unsafe { HeaderRef::from_payload(payload, kind) };
        assert_eq!(header.address(), base.as_ptr() as usize);
        assert_eq!(header.size(), 32);
        assert_eq!(header.payload_size(), 24);
        assert!(header.contains(header.address() + 31));
        assert!(!header.contains(header.address() + 32));
        assert!(ptr::eq(header.gc_info(), &PLAIN));
    }

    #[test]
    fn test_finalize_runs_finalizer_and_zaps() {
        let mut buf = buffer();
        let base = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
        let kind = HeaderKind::Finalized;

        let payload = unsafe { kind.write_header(base, 48, &COUNTED) };
        let header = unsafe { HeaderRef::from_address(base, kind) };
        assert!(ptr::eq(header.gc_info(), &COUNTED));

        let before = FINALIZED.load(Ordering::SeqCst);
        unsafe { header.finalize(true) };
        assert_eq!(FINALIZED.load(Ordering::SeqCst) - before, 48 - kind.header_size());
        assert!(header.is_zapped());
        assert_eq!(unsafe { payload.read() }, FINALIZED_ZAP_VALUE);
    }

    #[test]
    fn test_plain_kind_accepts_only_its_info() {
        let kind = HeaderKind::Plain(&PLAIN);
        assert!(kind.accepts(&PLAIN));
        assert!(!kind.accepts(&COUNTED));
        assert!(HeaderKind::Finalized.accepts(&PLAIN));
    }
}
