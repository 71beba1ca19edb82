//! Segregated free lists.
//!
//! Free spans are bucketed by the floor of their size's base-2 logarithm:
//! bucket `i` holds spans whose size lies in `[2^i, 2^(i+1))`. Each bucket is
//! an intrusive LIFO list threaded through the free memory itself.

use std::ptr::NonNull;

use crate::config::FitPolicy;
use crate::header::{
    FreeListEntry, HeapObjectHeader, ALLOCATION_MASK, FREE_LIST_ENTRY_SIZE,
};
use crate::page_memory::BLINK_PAGE_SIZE_LOG2;

/// Number of buckets. Spans never exceed a page payload, which is smaller
/// than a blink page.
pub const FREE_LIST_BUCKETS: usize = BLINK_PAGE_SIZE_LOG2;

/// Bucket holding spans of `size` bytes: `floor(log2(size))`.
///
/// # Panics
///
/// Panics if `size` is zero.
#[must_use]
pub const fn bucket_index_for_size(size: usize) -> usize {
    assert!(size > 0, "free spans cannot be empty");
    (usize::BITS - 1 - size.leading_zeros()) as usize
}

/// Smallest bucket whose every span is at least `size` bytes.
const fn bucket_index_at_least(size: usize) -> usize {
    let floor = bucket_index_for_size(size);
    if size.is_power_of_two() {
        floor
    } else {
        floor + 1
    }
}

/// The free lists of one heap.
pub struct FreeList {
    buckets: [Option<NonNull<FreeListEntry>>; FREE_LIST_BUCKETS],
    biggest_index: usize,
    policy: FitPolicy,
}

impl FreeList {
    /// Creates empty free lists using `policy`.
    #[must_use]
    pub const fn new(policy: FitPolicy) -> Self {
        Self {
            buckets: [None; FREE_LIST_BUCKETS],
            biggest_index: 0,
            policy,
        }
    }

    /// Records `[address, address + size)` as free.
    ///
    /// Spans too small for a [`FreeListEntry`] only get a free header; they
    /// stay part of the page's tiling but are not reusable until a sweep
    /// merges them with a neighbour.
    ///
    /// # Safety
    ///
    /// The span must be writable page memory that nothing else uses, and
    /// `address` must be granularity aligned.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero, not granularity aligned, or too large for
    /// any bucket.
    pub unsafe fn add(&mut self, address: NonNull<u8>, size: usize) {
        assert!(
            size > 0 && size & ALLOCATION_MASK == 0,
            "bad free span size {size}"
        );
        if size < FREE_LIST_ENTRY_SIZE {
            unsafe {
                address
                    .cast::<HeapObjectHeader>()
                    .write(HeapObjectHeader::new_free(size));
            }
            return;
        }

        let index = bucket_index_for_size(size);
        assert!(index < FREE_LIST_BUCKETS, "free span of {size} bytes has no bucket");
        let entry = address.cast::<FreeListEntry>();
        unsafe {
            entry.write(FreeListEntry {
                header: HeapObjectHeader::new_free(size),
                next: self.buckets[index],
            });
        }
        self.buckets[index] = Some(entry);
        if index > self.biggest_index {
            self.biggest_index = index;
        }
    }

    /// Unlinks a span of at least `min_size` bytes and returns its address
    /// and size. A miss is an ordinary outcome.
    ///
    /// The policy only looks at buckets whose every span is big enough.
    /// When those are empty, the bucket `min_size` itself falls into is
    /// searched span by span, so a span added with some size is always
    /// found again for that size or less.
    pub fn allocate(&mut self, min_size: usize) -> Option<(NonNull<u8>, usize)> {
        let min_size = min_size.max(1);
        match self.policy {
            FitPolicy::BiggestBucketFirst => self.allocate_biggest_first(min_size),
            FitPolicy::SmallestSufficientBucket => self.allocate_smallest_sufficient(min_size),
        }
        .or_else(|| self.allocate_from_boundary_bucket(min_size))
    }

    fn allocate_biggest_first(&mut self, min_size: usize) -> Option<(NonNull<u8>, usize)> {
        let mut index = self.biggest_index;
        while index > 0 {
            if (1usize << index) < min_size {
                break;
            }
            if let Some(span) = self.pop(index) {
                self.biggest_index = index;
                return Some(span);
            }
            index -= 1;
        }
        self.biggest_index = index;
        None
    }

    fn allocate_smallest_sufficient(&mut self, min_size: usize) -> Option<(NonNull<u8>, usize)> {
        let first = bucket_index_at_least(min_size);
        for index in first..=self.biggest_index {
            if let Some(span) = self.pop(index) {
                while self.biggest_index > 0 && self.buckets[self.biggest_index].is_none() {
                    self.biggest_index -= 1;
                }
                return Some(span);
            }
        }
        None
    }

    /// First-fit search of the bucket holding sizes like `min_size`, whose
    /// spans may be smaller or larger than `min_size`.
    fn allocate_from_boundary_bucket(&mut self, min_size: usize) -> Option<(NonNull<u8>, usize)> {
        let index = bucket_index_for_size(min_size);
        if min_size.is_power_of_two() || index > self.biggest_index {
            return None;
        }
        let mut link: *mut Option<NonNull<FreeListEntry>> = &mut self.buckets[index];
        // SAFETY: every linked entry was written into free memory by `add`
        // and stays untouched until unlinked, so following and rewriting the
        // `next` links is sound.
        unsafe {
            while let Some(entry) = *link {
                let entry_ptr = entry.as_ptr();
                (*entry_ptr).header.check_header();
                let size = (*entry_ptr).header.size();
                if size >= min_size {
                    *link = (*entry_ptr).next;
                    return Some((entry.cast(), size));
                }
                link = std::ptr::addr_of_mut!((*entry_ptr).next);
            }
        }
        None
    }

    fn pop(&mut self, index: usize) -> Option<(NonNull<u8>, usize)> {
        let entry = self.buckets[index]?;
        // SAFETY: entries are only linked by `add`, which wrote them into
        // free memory that stays untouched until popped here.
        let (next, size) = unsafe {
            let entry = entry.as_ref();
            entry.header.check_header();
            (entry.next, entry.header.size())
        };
        debug_assert!(size >= 1 << index, "span of {size} bytes in bucket {index}");
        self.buckets[index] = next;
        Some((entry.cast(), size))
    }

    /// Forgets every span. The memory keeps its free headers.
    pub fn clear(&mut self) {
        self.buckets = [None; FREE_LIST_BUCKETS];
        self.biggest_index = 0;
    }

    /// Returns true if no span is linked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Option::is_none)
    }

    /// Upper bound on the non-empty buckets.
    #[must_use]
    pub const fn biggest_index(&self) -> usize {
        self.biggest_index
    }

    /// Span selection strategy.
    #[must_use]
    pub const fn policy(&self) -> FitPolicy {
        self.policy
    }

    /// Every linked span as `(bucket, address, size)`.
    pub fn spans(&self) -> impl Iterator<Item = (usize, NonNull<u8>, usize)> + '_ {
        self.buckets.iter().enumerate().flat_map(|(index, head)| {
            let mut cursor = *head;
            std::iter::from_fn(move || {
                let entry = cursor?;
                // SAFETY: see `pop`.
                let (next, size) = unsafe { (entry.as_ref().next, entry.as_ref().header.size()) };
                cursor = next;
                Some((index, entry.cast(), size))
            })
        })
    }
}

impl std::fmt::Debug for FreeList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeList")
            .field("spans", &self.spans().count())
            .field("biggest_index", &self.biggest_index)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Buffer(Vec<u64>);

    impl Buffer {
        fn new(bytes: usize) -> Self {
            Self(vec![0; bytes / 8])
        }

        fn at(&mut self, offset: usize) -> NonNull<u8> {
            assert!(offset < self.0.len() * 8);
            NonNull::new(unsafe { self.0.as_mut_ptr().cast::<u8>().add(offset) }).unwrap()
        }
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index_for_size(16), 4);
        assert_eq!(bucket_index_for_size(31), 4);
        assert_eq!(bucket_index_for_size(32), 5);
        assert_eq!(bucket_index_for_size(96), 6);
        assert_eq!(bucket_index_at_least(96), 7);
        assert_eq!(bucket_index_at_least(64), 6);
    }

    #[test]
    fn test_add_and_allocate_exact_bucket() {
        let mut buffer = Buffer::new(4096);
        let mut list = FreeList::new(FitPolicy::BiggestBucketFirst);
        unsafe { list.add(buffer.at(0), 256) };

        assert_eq!(list.biggest_index(), 8);
        let (address, size) = list.allocate(200).expect("256-byte span satisfies 200");
        assert_eq!(address, buffer.at(0));
        assert_eq!(size, 256);
        assert!(list.is_empty());
    }

    #[test]
    fn test_added_span_is_found_for_its_own_size() {
        for policy in [FitPolicy::BiggestBucketFirst, FitPolicy::SmallestSufficientBucket] {
            for size in [16, 24, 48, 96, 200, 4088, 4096, 100_000] {
                for request in [size, size - 8, 8] {
                    let mut buffer = Buffer::new(size);
                    let mut list = FreeList::new(policy);
                    unsafe { list.add(buffer.at(0), size) };

                    let (address, found) = list
                        .allocate(request)
                        .unwrap_or_else(|| panic!("{policy:?}: {size}-byte span missed for {request}"));
                    assert_eq!(address, buffer.at(0));
                    assert_eq!(found, size);
                    assert!(list.is_empty());
                }
            }
        }
    }

    #[test]
    fn test_boundary_bucket_skips_spans_that_are_too_small() {
        let mut buffer = Buffer::new(1024);
        let mut list = FreeList::new(FitPolicy::BiggestBucketFirst);
        unsafe {
            list.add(buffer.at(0), 96);
            list.add(buffer.at(128), 72);
            list.add(buffer.at(256), 80);
        }

        // All three sit in the 64-byte bucket; only the 96-byte span fits 88.
        let (address, size) = list.allocate(88).expect("96-byte span fits");
        assert_eq!(address, buffer.at(0));
        assert_eq!(size, 96);
        assert!(list.allocate(88).is_none());

        let mut sizes: Vec<_> = list.spans().map(|(_, _, size)| size).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![72, 80]);
        assert_eq!(list.allocate(80).map(|(_, size)| size), Some(80));
        assert_eq!(list.allocate(72).map(|(_, size)| size), Some(72));
        assert!(list.is_empty());
    }

    #[test]
    fn test_biggest_first_prefers_large_spans() {
        let mut buffer = Buffer::new(8192);
        let mut list = FreeList::new(FitPolicy::BiggestBucketFirst);
        unsafe {
            list.add(buffer.at(0), 64);
            list.add(buffer.at(1024), 2048);
        }

        let (address, size) = list.allocate(32).unwrap();
        assert_eq!(address, buffer.at(1024));
        assert_eq!(size, 2048);
        assert_eq!(list.biggest_index(), 11);
    }

    #[test]
    fn test_smallest_sufficient_prefers_tight_spans() {
        let mut buffer = Buffer::new(8192);
        let mut list = FreeList::new(FitPolicy::SmallestSufficientBucket);
        unsafe {
            list.add(buffer.at(0), 64);
            list.add(buffer.at(1024), 2048);
        }

        let (address, size) = list.allocate(32).unwrap();
        assert_eq!(address, buffer.at(0));
        assert_eq!(size, 64);
        assert_eq!(list.biggest_index(), 11);

        let (_, size) = list.allocate(32).unwrap();
        assert_eq!(size, 2048);
        assert_eq!(list.biggest_index(), 0);
        assert!(list.allocate(16).is_none());
    }

    #[test]
    fn test_buckets_are_lifo() {
        let mut buffer = Buffer::new(4096);
        let mut list = FreeList::new(FitPolicy::BiggestBucketFirst);
        unsafe {
            list.add(buffer.at(0), 128);
            list.add(buffer.at(512), 128);
        }

        assert_eq!(list.allocate(128).unwrap().0, buffer.at(512));
        assert_eq!(list.allocate(128).unwrap().0, buffer.at(0));
    }

    #[test]
    fn test_tiny_span_gets_free_header_only() {
        let mut buffer = Buffer::new(64);
        let mut list = FreeList::new(FitPolicy::BiggestBucketFirst);
        unsafe { list.add(buffer.at(0), 8) };

        assert!(list.is_empty());
        let header = unsafe { buffer.at(0).cast::<HeapObjectHeader>().as_ref() };
        assert!(header.is_free());
        assert_eq!(header.size(), 8);
    }

    #[test]
    fn test_spans_and_clear() {
        let mut buffer = Buffer::new(4096);
        let mut list = FreeList::new(FitPolicy::BiggestBucketFirst);
        unsafe {
            list.add(buffer.at(0), 48);
            list.add(buffer.at(64), 512);
        }

        let mut spans: Vec<_> = list.spans().map(|(bucket, _, size)| (bucket, size)).collect();
        spans.sort_unstable();
        assert_eq!(spans, vec![(5, 48), (9, 512)]);

        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.biggest_index(), 0);
        assert_eq!(list.spans().count(), 0);
    }
}
