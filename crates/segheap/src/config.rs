//! Heap configuration.

/// How the free list picks a span for a new allocation area.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FitPolicy {
    /// Scan from the biggest non-empty bucket downwards and take the first
    /// span found. Fast, but may hand out spans much larger than requested.
    #[default]
    BiggestBucketFirst,
    /// Scan upwards from the smallest bucket whose spans are all large
    /// enough. Packs tighter at the cost of a longer scan.
    SmallestSufficientBucket,
}

/// Per-heap tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Span selection strategy of the free lists.
    pub fit_policy: FitPolicy,
    /// Maximum number of empty pages kept for reuse by one heap. Pages
    /// emptied beyond this are released to the OS.
    pub page_pool_limit: usize,
    /// Overwrite finalized payloads with
    /// [`FINALIZED_ZAP_VALUE`](crate::header::FINALIZED_ZAP_VALUE) and zap
    /// their header magic.
    pub zap_finalized: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            fit_policy: FitPolicy::default(),
            page_pool_limit: usize::MAX,
            zap_finalized: cfg!(debug_assertions),
        }
    }
}
