//! Conservative region scanning tests.

use std::ptr::NonNull;

use segheap::{
    scan_region_conservatively, trace_nothing, GcInfo, HeapConfig, HeapIndex, MarkingVisitor,
    ThreadState,
};

static BLOB: GcInfo = GcInfo::new("Blob", trace_nothing);

fn addr(ptr: NonNull<u8>) -> usize {
    ptr.as_ptr() as usize
}

fn region_bytes(words: &[usize]) -> (*const u8, usize) {
    (words.as_ptr().cast(), std::mem::size_of_val(words))
}

#[test]
fn test_scan_marks_objects_referenced_from_region() {
    let mut state = ThreadState::new(HeapConfig::default());
    let objects: Vec<_> = (0..4)
        .map(|_| state.allocate(HeapIndex::GENERAL, 64, &BLOB))
        .collect();

    let fake_stack = [
        0,
        addr(objects[0]) + 12,
        0xdead_beef,
        addr(objects[2]),
        usize::MAX,
        addr(objects[2]) + 63,
    ];

    state.prepare_for_gc();
    let mut visitor = MarkingVisitor::new();
    let (ptr, len) = region_bytes(&fake_stack);
    // SAFETY: the array is readable for its whole length.
    let found = unsafe { scan_region_conservatively(&mut state, ptr, len, &mut visitor) };
    assert_eq!(found, 3);
    assert_eq!(visitor.objects_marked(), 2);
    state.drain_marking(&mut visitor);

    let metrics = state.sweep();
    assert_eq!(metrics.objects_surviving, 2);
    assert_eq!(metrics.objects_finalized, 2);
}

#[test]
fn test_scan_skips_partial_words() {
    let mut state = ThreadState::new(HeapConfig::default());
    let object = state.allocate(HeapIndex::GENERAL, 64, &BLOB);
    let words = [addr(object), addr(object)];

    state.prepare_for_gc();
    let mut visitor = MarkingVisitor::new();
    let (ptr, len) = region_bytes(&words);
    // Starting one byte in leaves only the second word fully inside.
    // SAFETY: the shifted region stays inside the array.
    let found = unsafe { scan_region_conservatively(&mut state, ptr.add(1), len - 1, &mut visitor) };
    assert_eq!(found, 1);

    // SAFETY: an empty region reads nothing.
    let found = unsafe { scan_region_conservatively(&mut state, ptr, 0, &mut visitor) };
    assert_eq!(found, 0);
    state.sweep();
}

#[test]
fn test_scan_of_terminating_thread_finds_nothing() {
    let mut state = ThreadState::new(HeapConfig::default());
    let object = state.allocate(HeapIndex::GENERAL, 64, &BLOB);
    let words = [addr(object)];

    state.begin_termination();
    state.prepare_for_gc();
    let mut visitor = MarkingVisitor::new();
    let (ptr, len) = region_bytes(&words);
    // SAFETY: the array is readable for its whole length.
    let found = unsafe { scan_region_conservatively(&mut state, ptr, len, &mut visitor) };
    assert_eq!(found, 0);
    assert_eq!(state.sweep().objects_finalized, 1);
}
