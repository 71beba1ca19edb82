//! Conservative scanning of arbitrary memory regions.

use crate::thread_state::ThreadState;
use crate::trace::Visitor;

/// Treats every pointer-aligned word of `[region_ptr, region_ptr + region_len)`
/// as a potential reference into the heaps of `state` and marks what it
/// finds through `visitor`. Returns the number of words that resolved to a
/// live object.
///
/// Integers that happen to look like heap addresses keep their objects
/// alive; that is inherent to conservative scanning.
///
/// # Safety
///
/// `region_ptr` must be valid for reading `region_len` bytes.
///
/// # Panics
///
/// Panics if `state` is not in the marking phase.
pub unsafe fn scan_region_conservatively(
    state: &mut ThreadState,
    region_ptr: *const u8,
    region_len: usize,
    visitor: &mut dyn Visitor,
) -> usize {
    if region_ptr.is_null() || region_len == 0 {
        return 0;
    }

    let word = std::mem::size_of::<usize>();
    let start = region_ptr as usize;
    let end = start + region_len;
    let mut offset = region_ptr.align_offset(std::mem::align_of::<usize>());
    let mut found = 0;

    while start + offset + word <= end {
        // SAFETY: the caller guarantees the region is readable; the word lies
        // inside it.
        let candidate = unsafe { region_ptr.add(offset).cast::<usize>().read() };
        if candidate != 0 && state.check_and_mark_pointer(visitor, candidate) {
            found += 1;
        }
        offset += std::mem::align_of::<usize>();
    }
    found
}
