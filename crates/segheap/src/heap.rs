//! Process-wide heap lifecycle.
//!
//! [`Heap::init`] and [`Heap::shutdown`] bracket all heap activity in the
//! process and must each be called exactly once, in that order. Between the
//! two, threads attach with [`ThreadState::attach`](crate::ThreadState::attach)
//! and pick up the process configuration.

use parking_lot::Mutex;

use crate::config::HeapConfig;

#[derive(Debug)]
struct Globals {
    stack_base: usize,
    config: HeapConfig,
    attached_threads: usize,
}

#[derive(Debug)]
enum Lifecycle {
    Uninitialized,
    Running(Globals),
    ShutDown,
}

static LIFECYCLE: Mutex<Lifecycle> = Mutex::new(Lifecycle::Uninitialized);

/// Entry point for process-wide heap setup and teardown.
#[derive(Debug)]
pub struct Heap;

impl Heap {
    /// Initializes the heap with the default configuration.
    ///
    /// `stack_base` is the base of the main thread's stack, recorded for
    /// root scanning.
    ///
    /// # Panics
    ///
    /// Panics if the heap was initialized before.
    pub fn init(stack_base: usize) {
        Self::init_with_config(stack_base, HeapConfig::default());
    }

    /// Initializes the heap. Every thread attached afterwards uses `config`.
    ///
    /// # Panics
    ///
    /// Panics if the heap was initialized before, even if it has since been
    /// shut down.
    pub fn init_with_config(stack_base: usize, config: HeapConfig) {
        let mut lifecycle = LIFECYCLE.lock();
        assert!(
            matches!(*lifecycle, Lifecycle::Uninitialized),
            "Heap::init called twice"
        );
        *lifecycle = Lifecycle::Running(Globals {
            stack_base,
            config,
            attached_threads: 0,
        });
        #[cfg(feature = "tracing")]
        tracing::debug!(stack_base, ?config, "heap_initialized");
    }

    /// Shuts the heap down.
    ///
    /// # Panics
    ///
    /// Panics if the heap is not running or threads are still attached.
    pub fn shutdown() {
        let mut lifecycle = LIFECYCLE.lock();
        match &*lifecycle {
            Lifecycle::Running(globals) => assert_eq!(
                globals.attached_threads, 0,
                "Heap::shutdown with threads still attached"
            ),
            _ => panic!("Heap::shutdown without a running heap"),
        }
        *lifecycle = Lifecycle::ShutDown;
        #[cfg(feature = "tracing")]
        tracing::debug!("heap_shut_down");
    }

    /// Returns true between `init` and `shutdown`.
    #[must_use]
    pub fn is_initialized() -> bool {
        matches!(*LIFECYCLE.lock(), Lifecycle::Running(_))
    }

    /// Returns true once `shutdown` has run.
    #[must_use]
    pub fn is_shut_down() -> bool {
        matches!(*LIFECYCLE.lock(), Lifecycle::ShutDown)
    }

    /// The main thread's stack base given to [`init`](Self::init).
    #[must_use]
    pub fn stack_base() -> Option<usize> {
        match &*LIFECYCLE.lock() {
            Lifecycle::Running(globals) => Some(globals.stack_base),
            _ => None,
        }
    }

    /// Configuration given to `init`, while the heap runs.
    #[must_use]
    pub fn config() -> Option<HeapConfig> {
        match &*LIFECYCLE.lock() {
            Lifecycle::Running(globals) => Some(globals.config),
            _ => None,
        }
    }

    /// Number of currently attached threads.
    #[must_use]
    pub fn attached_threads() -> usize {
        match &*LIFECYCLE.lock() {
            Lifecycle::Running(globals) => globals.attached_threads,
            _ => 0,
        }
    }

    pub(crate) fn register_thread() -> HeapConfig {
        match &mut *LIFECYCLE.lock() {
            Lifecycle::Running(globals) => {
                globals.attached_threads += 1;
                globals.config
            }
            _ => panic!("threads can only attach to a running heap"),
        }
    }

    pub(crate) fn unregister_thread() {
        if let Lifecycle::Running(globals) = &mut *LIFECYCLE.lock() {
            globals.attached_threads -= 1;
        }
    }
}
