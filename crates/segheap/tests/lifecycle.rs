//! Process-wide lifecycle test.
//!
//! The heap can only be initialized once per process, so the whole
//! lifecycle is exercised by a single test in its own binary.

use std::panic;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use segheap::{
    trace_nothing, with_thread_state, GcInfo, Heap, HeapConfig, HeapIndex, ThreadState,
};

static FINALIZED: AtomicUsize = AtomicUsize::new(0);

fn finalize(_payload: NonNull<u8>, _size: usize) {
    FINALIZED.fetch_add(1, Ordering::SeqCst);
}

static TRACKED: GcInfo = GcInfo::with_finalizer("Tracked", trace_nothing, finalize);

#[test]
fn test_heap_lifecycle() {
    assert!(!Heap::is_initialized());
    assert!(Heap::stack_base().is_none());
    assert!(panic::catch_unwind(ThreadState::attach).is_err());

    let stack_marker = 0usize;
    let stack_base = std::ptr::from_ref(&stack_marker) as usize;
    let config = HeapConfig {
        page_pool_limit: 2,
        ..HeapConfig::default()
    };
    Heap::init_with_config(stack_base, config);
    assert!(Heap::is_initialized());
    assert_eq!(Heap::stack_base(), Some(stack_base));
    assert_eq!(Heap::config(), Some(config));

    let second_init = panic::catch_unwind(|| Heap::init(0));
    assert!(second_init.is_err());
    assert!(Heap::is_initialized());

    ThreadState::attach();
    assert!(ThreadState::is_attached());
    assert_eq!(Heap::attached_threads(), 1);

    let kept = with_thread_state(|state| {
        assert_eq!(state.config().page_pool_limit, 2);
        let kept = state.allocate(HeapIndex::GENERAL, 32, &TRACKED);
        state.allocate(HeapIndex::GENERAL, 32, &TRACKED);
        kept
    });
    let metrics = with_thread_state(|state| state.collect_garbage(&[kept.as_ptr() as usize]));
    assert_eq!(metrics.objects_finalized, 1);

    let worker = thread::spawn(|| {
        ThreadState::attach();
        let attached = Heap::attached_threads();
        with_thread_state(|state| {
            for _ in 0..10 {
                state.allocate(HeapIndex::GENERAL, 128, &TRACKED);
            }
        });
        (attached, ThreadState::detach())
    });
    let (attached, finalized_by_worker) = worker.join().expect("worker thread");
    assert_eq!(attached, 2);
    assert_eq!(finalized_by_worker, 10);
    assert_eq!(Heap::attached_threads(), 1);

    assert!(panic::catch_unwind(Heap::shutdown).is_err());

    assert_eq!(ThreadState::detach(), 1);
    assert!(!ThreadState::is_attached());
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 12);

    Heap::shutdown();
    assert!(Heap::is_shut_down());
    assert!(!Heap::is_initialized());
    assert!(Heap::config().is_none());
    assert!(panic::catch_unwind(|| Heap::init(stack_base)).is_err());
}
