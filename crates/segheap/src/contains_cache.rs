//! Address-to-page lookup cache.
//!
//! Conservative marking classifies many candidate addresses, most of them
//! landing in a handful of blink pages. The cache remembers, per blink page,
//! which heap page owns it or that no page does. It must be flushed whenever
//! a page is added to or removed from any heap of the owning thread, since a
//! stale entry would steer the marker into released memory.

use crate::page_memory::{blink_page_base, BLINK_PAGE_SIZE_LOG2};
use crate::thread_heap::PageRef;
use crate::thread_state::HeapIndex;

const NUMBER_OF_ENTRIES_LOG2: usize = 12;

/// Number of cache entries. Entries are used in even/odd pairs.
pub const NUMBER_OF_ENTRIES: usize = 1 << NUMBER_OF_ENTRIES_LOG2;

/// A page of a specific heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasePageRef {
    /// Heap owning the page.
    pub heap: HeapIndex,
    /// The page or large object within that heap.
    pub page: PageRef,
}

/// Result of a cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    /// Nothing is known about the address.
    Miss,
    /// The address was looked up before and belongs to no page.
    NotInHeap,
    /// The blink page belongs to this page.
    Page(BasePageRef),
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    blink_page: usize,
    page: Option<BasePageRef>,
}

/// Two-way set associative cache keyed by blink page.
pub struct HeapContainsCache {
    entries: Box<[Option<Entry>]>,
    has_entries: bool,
}

impl HeapContainsCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: vec![None; NUMBER_OF_ENTRIES].into_boxed_slice(),
            has_entries: false,
        }
    }

    /// Index of the first entry of the pair `address` maps to.
    #[must_use]
    pub const fn hash(address: usize) -> usize {
        let mut value = address >> BLINK_PAGE_SIZE_LOG2;
        value ^= value >> NUMBER_OF_ENTRIES_LOG2;
        value ^= value >> (NUMBER_OF_ENTRIES_LOG2 * 2);
        value &= NUMBER_OF_ENTRIES - 1;
        value & !1
    }

    /// Looks up the blink page containing `address`.
    #[must_use]
    pub fn lookup(&self, address: usize) -> CacheLookup {
        let index = Self::hash(address);
        let blink_page = blink_page_base(address);
        self.entries[index..=index + 1]
            .iter()
            .flatten()
            .find(|entry| entry.blink_page == blink_page)
            .map_or(CacheLookup::Miss, |entry| {
                entry.page.map_or(CacheLookup::NotInHeap, CacheLookup::Page)
            })
    }

    /// Records that `address`'s blink page belongs to `page`, or to no page.
    /// The older entry of the pair moves to the second way and the second
    /// way's entry is evicted.
    pub fn add_entry(&mut self, address: usize, page: Option<BasePageRef>) {
        self.has_entries = true;
        let index = Self::hash(address);
        self.entries[index + 1] = self.entries[index];
        self.entries[index] = Some(Entry {
            blink_page: blink_page_base(address),
            page,
        });
    }

    /// Drops every entry.
    pub fn flush(&mut self) {
        if self.has_entries {
            self.entries.fill(None);
            self.has_entries = false;
        }
    }

    /// Returns true if nothing was added since the last flush.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.has_entries
    }
}

impl Default for HeapContainsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HeapContainsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapContainsCache")
            .field("entries", &self.entries.iter().flatten().count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{Arena, PageState};
    use crate::page_memory::BLINK_PAGE_SIZE;

    fn page_refs(count: usize) -> Vec<BasePageRef> {
        let mut arena = Arena::new();
        (0..count)
            .map(|_| BasePageRef {
                heap: HeapIndex::GENERAL,
                page: PageRef::Normal(arena.insert((), PageState::Active)),
            })
            .collect()
    }

    fn blink(page: usize) -> usize {
        page << BLINK_PAGE_SIZE_LOG2
    }

    #[test]
    fn test_hash_is_even_and_in_range() {
        for page in [0, 1, 2, 3, 4095, 4096, 4098, 1 << 20, usize::MAX >> BLINK_PAGE_SIZE_LOG2] {
            let index = HeapContainsCache::hash(blink(page));
            assert_eq!(index % 2, 0);
            assert!(index + 1 < NUMBER_OF_ENTRIES);
        }
    }

    #[test]
    fn test_interior_addresses_share_entry() {
        let refs = page_refs(1);
        let mut cache = HeapContainsCache::new();
        cache.add_entry(blink(7) + 100, Some(refs[0]));

        assert_eq!(cache.lookup(blink(7)), CacheLookup::Page(refs[0]));
        assert_eq!(cache.lookup(blink(7) + BLINK_PAGE_SIZE - 1), CacheLookup::Page(refs[0]));
        assert_eq!(cache.lookup(blink(8)), CacheLookup::Miss);
    }

    #[test]
    fn test_negative_entry() {
        let mut cache = HeapContainsCache::new();
        cache.add_entry(blink(9), None);
        assert_eq!(cache.lookup(blink(9) + 8), CacheLookup::NotInHeap);
    }

    #[test]
    fn test_two_way_eviction() {
        // Blink pages 2, 3 and 4098 all hash to the pair at index 2.
        assert_eq!(HeapContainsCache::hash(blink(2)), 2);
        assert_eq!(HeapContainsCache::hash(blink(3)), 2);
        assert_eq!(HeapContainsCache::hash(blink(4098)), 2);

        let refs = page_refs(3);
        let mut cache = HeapContainsCache::new();
        cache.add_entry(blink(2), Some(refs[0]));
        cache.add_entry(blink(3), Some(refs[1]));
        assert_eq!(cache.lookup(blink(2)), CacheLookup::Page(refs[0]));
        assert_eq!(cache.lookup(blink(3)), CacheLookup::Page(refs[1]));

        cache.add_entry(blink(4098), Some(refs[2]));
        assert_eq!(cache.lookup(blink(2)), CacheLookup::Miss);
        assert_eq!(cache.lookup(blink(3)), CacheLookup::Page(refs[1]));
        assert_eq!(cache.lookup(blink(4098)), CacheLookup::Page(refs[2]));
    }

    #[test]
    fn test_flush() {
        let refs = page_refs(1);
        let mut cache = HeapContainsCache::new();
        assert!(cache.is_empty());
        cache.add_entry(blink(5), Some(refs[0]));
        cache.add_entry(blink(6), None);
        assert!(!cache.is_empty());

        cache.flush();
        assert!(cache.is_empty());
        assert_eq!(cache.lookup(blink(5)), CacheLookup::Miss);
        assert_eq!(cache.lookup(blink(6)), CacheLookup::Miss);
    }
}
