//! Object-start bitmap for resolving interior pointers.
//!
//! The bitmap has one bit per allocation-granularity slot of a page payload.
//! A bit is set when a header (live or free) begins in that slot, so the
//! header owning an arbitrary address is the nearest set bit at or below the
//! address's slot.

use crate::header::ALLOCATION_GRANULARITY;

/// A lazily computed object-start bitmap.
///
/// # Example
///
/// ```
/// use segheap::bitmap::ObjectStartBitmap;
///
/// let mut bitmap = ObjectStartBitmap::new(4096);
/// bitmap.set(0);
/// bitmap.set(64);
/// bitmap.mark_computed();
/// assert_eq!(bitmap.find_start(100), Some(64));
/// assert_eq!(bitmap.find_start(63), Some(0));
/// ```
#[derive(Debug)]
pub struct ObjectStartBitmap {
    bits: Box<[u8]>,
    computed: bool,
}

impl ObjectStartBitmap {
    /// Creates an empty, not yet computed bitmap for a payload of
    /// `payload_size` bytes.
    #[must_use]
    pub fn new(payload_size: usize) -> Self {
        let slots = payload_size.div_ceil(ALLOCATION_GRANULARITY);
        Self {
            bits: vec![0; slots.div_ceil(8)].into_boxed_slice(),
            computed: false,
        }
    }

    /// Returns true if the bitmap reflects the current header layout.
    #[must_use]
    pub const fn is_computed(&self) -> bool {
        self.computed
    }

    /// Marks the bitmap stale. It is rebuilt on the next lookup.
    pub fn invalidate(&mut self) {
        self.computed = false;
    }

    /// Declares the bitmap complete after a full header walk.
    pub fn mark_computed(&mut self) {
        self.computed = true;
    }

    /// Clears every bit.
    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    /// Records a header starting at byte `offset` of the payload.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is past the payload.
    pub fn set(&mut self, offset: usize) {
        let (index, bit) = Self::position(offset);
        self.bits[index] |= 1 << bit;
    }

    /// Returns true if a header starts at `offset`.
    #[must_use]
    pub fn is_set(&self, offset: usize) -> bool {
        let (index, bit) = Self::position(offset);
        self.bits.get(index).is_some_and(|byte| byte & (1 << bit) != 0)
    }

    /// Offset of the nearest header start at or below `offset`.
    ///
    /// Scans backwards a byte at a time and uses a leading-zero count to
    /// pick the highest set bit of the first non-zero byte.
    #[must_use]
    pub fn find_start(&self, offset: usize) -> Option<usize> {
        debug_assert!(self.computed, "object-start bitmap used before being computed");
        let (mut index, bit) = Self::position(offset);
        let mask = ((1u16 << (bit + 1)) - 1) as u8;
        let mut byte = *self.bits.get(index)? & mask;
        while byte == 0 {
            index = index.checked_sub(1)?;
            byte = self.bits[index];
        }
        let slot = index * 8 + 7 - byte.leading_zeros() as usize;
        Some(slot * ALLOCATION_GRANULARITY)
    }

    const fn position(offset: usize) -> (usize, u32) {
        let slot = offset / ALLOCATION_GRANULARITY;
        (slot / 8, (slot % 8) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn computed(payload_size: usize, starts: &[usize]) -> ObjectStartBitmap {
        let mut bitmap = ObjectStartBitmap::new(payload_size);
        for &start in starts {
            bitmap.set(start);
        }
        bitmap.mark_computed();
        bitmap
    }

    #[test]
    fn test_new_bitmap_is_not_computed() {
        let bitmap = ObjectStartBitmap::new(1024);
        assert!(!bitmap.is_computed());
        assert!(!bitmap.is_set(0));
    }

    #[test]
    fn test_find_start_same_slot() {
        let bitmap = computed(1024, &[0, 16, 40]);
        assert_eq!(bitmap.find_start(16), Some(16));
        assert_eq!(bitmap.find_start(40), Some(40));
    }

    #[test]
    fn test_find_start_within_byte() {
        let bitmap = computed(1024, &[0, 16, 40]);
        assert_eq!(bitmap.find_start(39), Some(16));
        assert_eq!(bitmap.find_start(47), Some(40));
        assert_eq!(bitmap.find_start(7), Some(0));
    }

    #[test]
    fn test_find_start_across_bytes() {
        // Slot 3 is in byte 0; offset 1000 is in byte 15.
        let bitmap = computed(4096, &[24]);
        assert_eq!(bitmap.find_start(1000), Some(24));
        assert_eq!(bitmap.find_start(4095), Some(24));
    }

    #[test]
    fn test_find_start_below_first_header() {
        let bitmap = computed(1024, &[64]);
        assert_eq!(bitmap.find_start(8), None);
    }

    #[test]
    fn test_highest_bit_of_byte() {
        let bitmap = computed(1024, &[56]);
        assert_eq!(bitmap.find_start(56), Some(56));
        assert_eq!(bitmap.find_start(200), Some(56));
    }

    #[test]
    fn test_clear_and_invalidate() {
        let mut bitmap = computed(1024, &[0, 8]);
        bitmap.invalidate();
        assert!(!bitmap.is_computed());
        bitmap.clear();
        assert!(!bitmap.is_set(0));
        assert!(!bitmap.is_set(8));
    }
}
