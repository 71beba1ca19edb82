use std::io::{self, Error};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const MAP_NORESERVE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct ReservationInner {
    ptr: NonNull<u8>,
    len: usize,
}

impl ReservationInner {
    /// Reserves `len` bytes of `PROT_NONE` address space aligned to `alignment`.
    ///
    /// Over-reserves by `alignment` bytes and unmaps the slack on both sides
    /// of the aligned window.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it calls `mmap`/`munmap`.
    pub unsafe fn reserve(len: usize, alignment: usize) -> io::Result<Self> {
        let padded = len
            .checked_add(alignment)
            .ok_or_else(|| Error::from(io::ErrorKind::OutOfMemory))?;

        let flags = libc::MAP_PRIVATE | libc::MAP_ANON | MAP_NORESERVE;
        let base = unsafe { libc::mmap(ptr::null_mut(), padded, libc::PROT_NONE, flags, -1, 0) };
        if base == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        let start = base as usize;
        let aligned = (start + alignment - 1) & !(alignment - 1);
        let head = aligned - start;
        let tail = padded - head - len;

        unsafe {
            if head > 0 {
                libc::munmap(base, head);
            }
            if tail > 0 {
                libc::munmap((aligned + len) as *mut libc::c_void, tail);
            }
        }

        let ptr = NonNull::new(aligned as *mut u8)
            .ok_or_else(|| Error::from(io::ErrorKind::OutOfMemory))?;
        Ok(Self { ptr, len })
    }

    pub unsafe fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr.as_ptr().add(offset) }.cast::<libc::c_void>();
        if unsafe { libc::mprotect(addr, len, libc::PROT_READ | libc::PROT_WRITE) } != 0 {
            return Err(Error::last_os_error());
        }
        unsafe { libc::madvise(addr, len, libc::MADV_NORMAL) };
        Ok(())
    }

    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr.as_ptr().add(offset) }.cast::<libc::c_void>();
        if unsafe { libc::madvise(addr, len, libc::MADV_DONTNEED) } != 0 {
            return Err(Error::last_os_error());
        }
        if unsafe { libc::mprotect(addr, len, libc::PROT_NONE) } != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub const fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for ReservationInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr.as_ptr().cast::<libc::c_void>(), self.len);
            }
        }
    }
}

unsafe impl Send for ReservationInner {}
unsafe impl Sync for ReservationInner {}
