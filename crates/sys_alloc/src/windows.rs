use std::io::{self, Error};
use std::mem;
use std::ptr::{self, NonNull};

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_NOACCESS, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Number of times an aligned placement is retried when another thread
/// grabs the probed range between release and re-reserve.
const RESERVE_ATTEMPTS: usize = 8;

/// Returns the system allocation granularity.
///
/// On Windows, `VirtualAlloc` address must be aligned to this value (typically 64KB),
/// which is often larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

pub struct ReservationInner {
    ptr: NonNull<u8>,
    len: usize,
}

impl ReservationInner {
    /// Reserves `len` bytes of no-access address space aligned to `alignment`.
    ///
    /// Windows cannot release part of a reservation, so an oversized probe is
    /// reserved to find an aligned address, released, and the aligned window
    /// is reserved on its own.
    pub unsafe fn reserve(len: usize, alignment: usize) -> io::Result<Self> {
        if alignment <= allocation_granularity() {
            let ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_RESERVE, PAGE_NOACCESS) };
            return NonNull::new(ptr.cast::<u8>())
                .map(|ptr| Self { ptr, len })
                .ok_or_else(Error::last_os_error);
        }

        let padded = len
            .checked_add(alignment)
            .ok_or_else(|| Error::from(io::ErrorKind::OutOfMemory))?;

        for _ in 0..RESERVE_ATTEMPTS {
            let probe = unsafe { VirtualAlloc(ptr::null(), padded, MEM_RESERVE, PAGE_NOACCESS) };
            if probe.is_null() {
                return Err(Error::last_os_error());
            }
            let aligned = (probe as usize + alignment - 1) & !(alignment - 1);
            unsafe { VirtualFree(probe, 0, MEM_RELEASE) };

            let ptr = unsafe {
                VirtualAlloc(
                    aligned as *const std::ffi::c_void,
                    len,
                    MEM_RESERVE,
                    PAGE_NOACCESS,
                )
            };
            if let Some(ptr) = NonNull::new(ptr.cast::<u8>()) {
                return Ok(Self { ptr, len });
            }
        }

        Err(Error::new(
            io::ErrorKind::OutOfMemory,
            "could not place an aligned reservation",
        ))
    }

    pub unsafe fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr.as_ptr().add(offset) }.cast::<std::ffi::c_void>();
        let ptr = unsafe { VirtualAlloc(addr, len, MEM_COMMIT, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr.as_ptr().add(offset) }.cast::<std::ffi::c_void>();
        if unsafe { VirtualFree(addr, len, MEM_DECOMMIT) } == 0 {
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
                // MEM_RELEASE requires dwSize to be 0
                VirtualFree(self.ptr.as_ptr().cast::<std::ffi::c_void>(), 0, MEM_RELEASE);
            }
        }
    }
}

unsafe impl Send for ReservationInner {}
unsafe impl Sync for ReservationInner {}
