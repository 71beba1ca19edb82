//! Page-granular virtual memory for the heap.
//!
//! Every heap page and every large object lives in its own reservation,
//! aligned to a blink page. The first OS page of the reservation and
//! everything past the payload are never committed, so a stray access off
//! either end of a page traps instead of corrupting a neighbour. Alignment
//! lets any interior address be mapped back to its blink page with a mask.

use std::io;
use std::ptr::NonNull;

use sys_alloc::{Reservation, ReserveOptions};

// ============================================================================
// Constants
// ============================================================================

/// Log2 of the blink page size.
pub const BLINK_PAGE_SIZE_LOG2: usize = 17;

/// Size of a blink page: the unit of heap growth and of address classification.
pub const BLINK_PAGE_SIZE: usize = 1 << BLINK_PAGE_SIZE_LOG2;

/// Mask for extracting the offset of an address inside its blink page.
pub const BLINK_PAGE_OFFSET_MASK: usize = BLINK_PAGE_SIZE - 1;

/// Mask for extracting the blink page base of an address.
pub const BLINK_PAGE_BASE_MASK: usize = !BLINK_PAGE_OFFSET_MASK;

/// Returns the OS page size.
#[must_use]
pub fn os_page_size() -> usize {
    sys_alloc::page_size()
}

/// Usable bytes of a normal heap page: a blink page minus one guard page on
/// each side.
///
/// # Panics
///
/// Panics if the OS page size leaves no room for a payload.
#[must_use]
pub fn blink_page_payload_size() -> usize {
    let guards = 2 * os_page_size();
    assert!(
        guards < BLINK_PAGE_SIZE,
        "OS page size {} is too large for {BLINK_PAGE_SIZE}-byte blink pages",
        os_page_size()
    );
    BLINK_PAGE_SIZE - guards
}

/// Rounds `address` down to the start of its blink page.
#[must_use]
pub const fn blink_page_base(address: usize) -> usize {
    address & BLINK_PAGE_BASE_MASK
}

// ============================================================================
// MemoryRegion
// ============================================================================

/// A contiguous, non-empty range of virtual memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    base: NonNull<u8>,
    size: usize,
}

impl MemoryRegion {
    /// Describes `size` bytes starting at `base`.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    #[must_use]
    pub fn new(base: NonNull<u8>, size: usize) -> Self {
        assert!(size > 0, "memory regions cannot be empty");
        Self { base, size }
    }

    /// First byte of the region.
    #[must_use]
    pub const fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Length of the region in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Address of the first byte.
    #[must_use]
    pub fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Address one past the last byte.
    #[must_use]
    pub fn end(&self) -> usize {
        self.start() + self.size
    }

    /// Returns true if `address` lies inside the region.
    #[must_use]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.start() && address < self.end()
    }

    /// Returns true if `other` lies entirely inside this region.
    #[must_use]
    pub fn contains_region(&self, other: &Self) -> bool {
        other.start() >= self.start() && other.end() <= self.end()
    }
}

// ============================================================================
// PageMemory
// ============================================================================

/// Backing storage of one heap page or large object.
///
/// Owns a blink-page-aligned reservation (released when dropped) and
/// describes the committed, writable payload inside it.
pub struct PageMemory {
    reserved: Reservation,
    writable: MemoryRegion,
}

impl PageMemory {
    /// Maps storage with at least `payload_size` writable bytes.
    ///
    /// The reservation is `payload_size` rounded up to the OS page size plus
    /// one guard page on each side, rounded up again to whole blink pages so
    /// that no other mapping can share a blink page with it.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the reservation or the commit fails.
    pub fn allocate(payload_size: usize) -> io::Result<Self> {
        let os_page = os_page_size();
        let payload = payload_size
            .max(1)
            .checked_next_multiple_of(os_page)
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        let reserved_len = (payload + 2 * os_page)
            .checked_next_multiple_of(BLINK_PAGE_SIZE)
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;

        // SAFETY: the reservation is owned by the returned PageMemory and every
        // pointer handed out below is derived from it.
        let reserved = unsafe {
            ReserveOptions::new()
                .len(reserved_len)
                .alignment(BLINK_PAGE_SIZE)
                .reserve()?
        };
        // SAFETY: [os_page, os_page + payload) is page aligned and lies inside
        // the reservation because reserved_len >= payload + 2 * os_page.
        unsafe { reserved.commit(os_page, payload)? };

        // SAFETY: os_page < reserved_len, so the offset stays in bounds.
        let base = unsafe { NonNull::new_unchecked(reserved.ptr().as_ptr().add(os_page)) };
        let writable = MemoryRegion::new(base, payload);

        Ok(Self { reserved, writable })
    }

    /// First writable byte.
    #[must_use]
    pub const fn writable_start(&self) -> NonNull<u8> {
        self.writable.base()
    }

    /// The committed payload region.
    #[must_use]
    pub const fn writable_region(&self) -> MemoryRegion {
        self.writable
    }

    /// The whole reservation, guard pages included.
    #[must_use]
    pub fn reserved_region(&self) -> MemoryRegion {
        MemoryRegion::new(self.reserved.ptr(), self.reserved.len())
    }

    /// Makes the payload accessible again after [`decommit`](Self::decommit).
    ///
    /// # Errors
    ///
    /// Returns the OS error if the pages could not be committed.
    pub fn commit(&self) -> io::Result<()> {
        // SAFETY: the writable region lies inside the reservation at a page
        // aligned offset with a page multiple length.
        unsafe {
            self.reserved
                .commit(self.writable_offset(), self.writable.size())
        }
    }

    /// Returns the payload's physical pages to the OS and makes it
    /// inaccessible. The address range stays reserved.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the pages could not be decommitted.
    pub fn decommit(&self) -> io::Result<()> {
        // SAFETY: as for `commit`; callers never keep references into a
        // decommitted payload.
        unsafe {
            self.reserved
                .decommit(self.writable_offset(), self.writable.size())
        }
    }

    fn writable_offset(&self) -> usize {
        self.writable.start() - self.reserved.ptr().as_ptr() as usize
    }
}

impl std::fmt::Debug for PageMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageMemory")
            .field("reserved", &self.reserved_region())
            .field("writable", &self.writable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_page_layout() {
        let memory = PageMemory::allocate(blink_page_payload_size()).expect("page mapping failed");
        let reserved = memory.reserved_region();
        let writable = memory.writable_region();

        assert_eq!(reserved.start() % BLINK_PAGE_SIZE, 0);
        assert_eq!(reserved.size(), BLINK_PAGE_SIZE);
        assert_eq!(writable.start(), reserved.start() + os_page_size());
        assert_eq!(writable.size(), blink_page_payload_size());
        assert!(reserved.contains_region(&writable));
        assert_eq!(blink_page_base(writable.end() - 1), reserved.start());
    }

    #[test]
    fn test_payload_is_writable_end_to_end() {
        let memory = PageMemory::allocate(blink_page_payload_size()).expect("page mapping failed");
        let start = memory.writable_start().as_ptr();
        let size = memory.writable_region().size();

        unsafe {
            start.write(0xab);
            start.add(size - 1).write(0xcd);
            assert_eq!(start.read(), 0xab);
            assert_eq!(start.add(size - 1).read(), 0xcd);
        }
    }

    #[test]
    fn test_large_reservation_covers_whole_blink_pages() {
        let memory = PageMemory::allocate(3 * BLINK_PAGE_SIZE / 2).expect("mapping failed");
        let reserved = memory.reserved_region();

        assert_eq!(reserved.start() % BLINK_PAGE_SIZE, 0);
        assert_eq!(reserved.size() % BLINK_PAGE_SIZE, 0);
        assert!(memory.writable_region().size() >= 3 * BLINK_PAGE_SIZE / 2);
        assert!(reserved.contains_region(&memory.writable_region()));
    }

    #[test]
    fn test_decommit_then_commit_zeroes_payload() {
        let memory = PageMemory::allocate(blink_page_payload_size()).expect("page mapping failed");
        let start = memory.writable_start().as_ptr();

        unsafe { start.write(7) };
        memory.decommit().expect("decommit failed");
        memory.commit().expect("commit failed");
        assert_eq!(unsafe { start.read() }, 0);
    }

    #[test]
    fn test_region_contains() {
        let memory = PageMemory::allocate(1).expect("mapping failed");
        let region = memory.writable_region();

        assert!(region.contains(region.start()));
        assert!(region.contains(region.end() - 1));
        assert!(!region.contains(region.end()));
        assert!(!region.contains(region.start() - 1));
    }
}
