//! Low-level virtual memory primitives.
//!
//! This crate is the only place that talks to the operating system about
//! address space. It hands out aligned [`Reservation`]s whose pages start out
//! inaccessible; callers commit the ranges they want to use and decommit them
//! again when the memory is parked. Everything that is never committed behaves
//! as a guard region.

use std::io;
use std::ptr::NonNull;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is typically the system page size.
/// Reservation addresses are always aligned to at least this value.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// A reserved, initially inaccessible range of virtual address space.
///
/// The whole range is released back to the OS when this handle is dropped.
pub struct Reservation {
    inner: os::ReservationInner,
}

impl Reservation {
    /// Returns a pointer to the start of the reservation.
    pub fn ptr(&self) -> NonNull<u8> {
        self.inner.ptr()
    }

    /// Returns the length of the reservation in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Reservations are never empty; provided for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Returns true if `addr` lies within `[ptr, ptr + len)`.
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.ptr().as_ptr() as usize;
        addr >= start && addr - start < self.len()
    }

    /// Makes `[offset, offset + len)` readable and writable.
    ///
    /// # Safety
    ///
    /// The range must lie inside the reservation and both `offset` and `len`
    /// must be multiples of [`page_size`].
    pub unsafe fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        unsafe { self.inner.commit(offset, len) }
    }

    /// Returns the physical memory behind `[offset, offset + len)` to the OS
    /// and makes the range inaccessible. Committing it again yields zeroed pages.
    ///
    /// # Safety
    ///
    /// The range must lie inside the reservation, both `offset` and `len`
    /// must be multiples of [`page_size`], and no live references into the
    /// range may exist.
    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        unsafe { self.inner.decommit(offset, len) }
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        let page = page_size();
        let in_bounds = offset
            .checked_add(len)
            .is_some_and(|end| end <= self.len());
        if len == 0 || !in_bounds || offset % page != 0 || len % page != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range must be non-empty, page aligned and inside the reservation",
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("ptr", &self.ptr())
            .field("len", &self.len())
            .finish()
    }
}

/// Configuration for reserving address space.
#[derive(Debug, Clone)]
pub struct ReserveOptions {
    len: usize,
    alignment: usize,
}

impl ReserveOptions {
    /// Creates a new `ReserveOptions` with length 0 and page alignment.
    /// You must set a length before reserving.
    pub fn new() -> Self {
        Self {
            len: 0,
            alignment: page_size(),
        }
    }

    /// Sets the length of the reservation in bytes. It is rounded up to the
    /// page size.
    pub fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Sets the required alignment of the reservation's start address.
    ///
    /// Must be a power of two. Values smaller than the allocation granularity
    /// are raised to it.
    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Reserves the address range. No page of it is accessible until committed.
    ///
    /// # Safety
    ///
    /// The returned reservation owns raw address space; pointers derived from
    /// it are only valid while the `Reservation` is alive and only inside
    /// committed ranges.
    pub unsafe fn reserve(&self) -> io::Result<Reservation> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        if !self.alignment.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "alignment must be a power of two",
            ));
        }

        let page = page_size();
        let len = self
            .len
            .checked_next_multiple_of(page)
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        let alignment = self.alignment.max(allocation_granularity());

        let inner = unsafe { os::ReservationInner::reserve(len, alignment)? };
        Ok(Reservation { inner })
    }
}

impl Default for ReserveOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag > 0);
        assert_eq!(ag & (ag - 1), 0, "Allocation granularity should be power of 2");
        assert!(ag >= page_size());
    }

    #[test]
    fn test_zero_length_is_rejected() {
        let err = unsafe { ReserveOptions::new().reserve() }.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_aligned_reservation() {
        let alignment = 1 << 17;
        let reservation = unsafe {
            ReserveOptions::new()
                .len(3 * page_size())
                .alignment(alignment)
                .reserve()
                .expect("failed to reserve")
        };

        assert_eq!(reservation.ptr().as_ptr() as usize % alignment, 0);
        assert_eq!(reservation.len(), 3 * page_size());
        assert!(reservation.contains(reservation.ptr().as_ptr() as usize));
        assert!(!reservation.contains(reservation.ptr().as_ptr() as usize + reservation.len()));
    }

    #[test]
    fn test_commit_write_decommit() {
        let page = page_size();
        let reservation = unsafe {
            ReserveOptions::new()
                .len(3 * page)
                .reserve()
                .expect("failed to reserve")
        };

        unsafe {
            reservation.commit(page, page).expect("commit failed");
            let ptr = reservation.ptr().as_ptr().add(page);
            ptr::write_volatile(ptr, 42);
            assert_eq!(ptr::read_volatile(ptr), 42);

            reservation.decommit(page, page).expect("decommit failed");
            reservation.commit(page, page).expect("recommit failed");
            assert_eq!(ptr::read_volatile(ptr), 0, "recommitted pages are zeroed");
        }
    }

    #[test]
    fn test_range_validation() {
        let page = page_size();
        let reservation = unsafe {
            ReserveOptions::new()
                .len(2 * page)
                .reserve()
                .expect("failed to reserve")
        };

        unsafe {
            assert!(reservation.commit(0, 3 * page).is_err());
            assert!(reservation.commit(1, page).is_err());
            assert!(reservation.commit(0, 0).is_err());
            assert!(reservation.decommit(page, page + 1).is_err());
        }
    }
}
