//! Generational arena for pages and large objects.
//!
//! Pages are addressed by [`PageId`] handles instead of raw pointers. A handle
//! stays valid until its page is released; after that, the slot's generation
//! is bumped so the old handle resolves to nothing. Lists of pages (the active
//! list, the page pool, the large-object list) are threaded through the slots
//! with `next` handles.

/// Stable handle to a value stored in an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    index: u32,
    generation: u32,
}

impl PageId {
    /// Slot index, for diagnostics.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }
}

/// Lifecycle of a page's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Linked into a heap's page list and holding objects.
    Active,
    /// Empty, decommitted and waiting in the page pool.
    Pooled,
    /// Storage returned to the OS; the handle is dead.
    Released,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    state: PageState,
    next: Option<PageId>,
    value: Option<T>,
}

/// Slot storage with generational handles and intrusive singly linked lists.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    vacant: Vec<u32>,
}

impl<T> Arena<T> {
    /// Creates an empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
        }
    }

    /// Stores `value` in state `state` and returns its handle. The value is
    /// not linked into any list.
    ///
    /// # Panics
    ///
    /// Panics if the arena already holds `u32::MAX` slots.
    pub fn insert(&mut self, value: T, state: PageState) -> PageId {
        assert_ne!(state, PageState::Released, "cannot insert released storage");
        if let Some(index) = self.vacant.pop() {
            let slot = &mut self.slots[index as usize];
            slot.state = state;
            slot.next = None;
            slot.value = Some(value);
            return PageId {
                index,
                generation: slot.generation,
            };
        }

        let index = u32::try_from(self.slots.len())
            .unwrap_or_else(|_| panic!("page arena exhausted"));
        self.slots.push(Slot {
            generation: 0,
            state,
            next: None,
            value: Some(value),
        });
        PageId {
            index,
            generation: 0,
        }
    }

    fn slot(&self, id: PageId) -> Option<&Slot<T>> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.value.is_some())
    }

    fn slot_mut(&mut self, id: PageId) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.value.is_some())
    }

    fn live_slot_mut(&mut self, id: PageId) -> &mut Slot<T> {
        self.slot_mut(id)
            .unwrap_or_else(|| panic!("stale page handle {id:?}"))
    }

    /// Value behind `id`, or `None` once the handle is stale.
    #[must_use]
    pub fn get(&self, id: PageId) -> Option<&T> {
        self.slot(id).and_then(|slot| slot.value.as_ref())
    }

    /// Mutable value behind `id`, or `None` once the handle is stale.
    #[must_use]
    pub fn get_mut(&mut self, id: PageId) -> Option<&mut T> {
        self.slot_mut(id).and_then(|slot| slot.value.as_mut())
    }

    /// State of `id`. Dead handles report [`PageState::Released`].
    #[must_use]
    pub fn state(&self, id: PageId) -> PageState {
        self.slot(id).map_or(PageState::Released, |slot| slot.state)
    }

    /// # Panics
    ///
    /// Panics if `id` is dead or `state` is [`PageState::Released`]; use
    /// [`release`](Self::release) for that.
    pub fn set_state(&mut self, id: PageId, state: PageState) {
        assert_ne!(state, PageState::Released, "use Arena::release to release storage");
        self.live_slot_mut(id).state = state;
    }

    /// Removes the value behind `id` and kills the handle. The value must
    /// already be unlinked from every list.
    pub fn release(&mut self, id: PageId) -> Option<T> {
        let slot = self.slot_mut(id)?;
        let value = slot.value.take();
        slot.state = PageState::Released;
        slot.next = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(id.index);
        value
    }

    /// Successor of `id` in whatever list it is linked into.
    #[must_use]
    pub fn next(&self, id: PageId) -> Option<PageId> {
        self.slot(id).and_then(|slot| slot.next)
    }

    /// Links `id` at the front of the list starting at `head`.
    pub fn push_front(&mut self, head: &mut Option<PageId>, id: PageId) {
        self.live_slot_mut(id).next = *head;
        *head = Some(id);
    }

    /// Unlinks `id`, whose predecessor in the list is `previous` (or which is
    /// the head when `previous` is `None`).
    pub fn unlink(&mut self, head: &mut Option<PageId>, previous: Option<PageId>, id: PageId) {
        let next = self.live_slot_mut(id).next.take();
        match previous {
            Some(previous) => {
                let slot = self.live_slot_mut(previous);
                debug_assert_eq!(slot.next, Some(id), "previous does not precede the page");
                slot.next = next;
            }
            None => {
                debug_assert_eq!(*head, Some(id), "page is not the list head");
                *head = next;
            }
        }
    }

    /// Removes and returns the head of the list.
    pub fn pop_front(&mut self, head: &mut Option<PageId>) -> Option<PageId> {
        let id = (*head)?;
        self.unlink(head, None, id);
        Some(id)
    }

    /// Handles of the list starting at `head`, in link order.
    pub fn iter_list(&self, head: Option<PageId>) -> impl Iterator<Item = PageId> + '_ {
        std::iter::successors(head, |&id| self.next(id))
    }

    /// Number of live values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.vacant.len()
    }

    /// Returns true if no slot holds a value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut arena = Arena::new();
        let a = arena.insert("a", PageState::Active);
        let b = arena.insert("b", PageState::Pooled);

        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.state(b), PageState::Pooled);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_release_kills_handle() {
        let mut arena = Arena::new();
        let a = arena.insert(1, PageState::Active);
        assert_eq!(arena.release(a), Some(1));

        assert_eq!(arena.get(a), None);
        assert_eq!(arena.state(a), PageState::Released);
        assert_eq!(arena.release(a), None);

        // The slot is reused under a new generation.
        let b = arena.insert(2, PageState::Active);
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(b), Some(&2));
    }

    #[test]
    fn test_list_operations() {
        let mut arena = Arena::new();
        let mut head = None;
        let ids: Vec<_> = (0..4).map(|i| arena.insert(i, PageState::Active)).collect();
        for &id in &ids {
            arena.push_front(&mut head, id);
        }

        let order: Vec<_> = arena.iter_list(head).collect();
        assert_eq!(order, vec![ids[3], ids[2], ids[1], ids[0]]);

        // Unlink from the middle, then the head.
        arena.unlink(&mut head, Some(ids[2]), ids[1]);
        assert_eq!(arena.pop_front(&mut head), Some(ids[3]));

        let order: Vec<_> = arena.iter_list(head).collect();
        assert_eq!(order, vec![ids[2], ids[0]]);
        assert_eq!(arena.next(ids[1]), None);
    }

    #[test]
    fn test_state_transitions() {
        let mut arena = Arena::new();
        let id = arena.insert((), PageState::Active);
        arena.set_state(id, PageState::Pooled);
        assert_eq!(arena.state(id), PageState::Pooled);
        arena.set_state(id, PageState::Active);
        assert_eq!(arena.state(id), PageState::Active);
    }

    #[test]
    #[should_panic(expected = "stale page handle")]
    fn test_stale_handle_panics() {
        let mut arena = Arena::new();
        let id = arena.insert((), PageState::Active);
        arena.release(id);
        arena.set_state(id, PageState::Active);
    }
}
