//! CMA Occupancy Bitmap
//!
//! One bit per `1 << order_per_bit` pages of an area:
//! - 1 = handed out
//! - 0 = free (possibly lent to movable users)
//!
//! # Invariants
//!
//! - `set_bits` always equals the number of one bits
//! - `hint < len` whenever `len > 0`

use alloc::vec;
use alloc::vec::Vec;

/// Bitmap with a rotating search hint.
#[derive(Debug, Default)]
pub struct CmaBitmap {
    words: Vec<u64>,
    len: usize,
    set_bits: usize,
    hint: usize,
}

impl CmaBitmap {
    const BITS_PER_WORD: usize = 64;

    /// Create a zeroed bitmap of `len` bits.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(Self::BITS_PER_WORD)],
            len,
            set_bits: 0,
            hint: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of set bits.
    #[inline]
    #[must_use]
    pub fn weight(&self) -> usize {
        self.set_bits
    }

    /// Where the next search starts.
    #[inline]
    #[must_use]
    pub fn hint(&self) -> usize {
        self.hint
    }

    /// Move the search hint past an allocation ending at `end`.
    pub fn advance_hint(&mut self, end: usize) {
        self.hint = if end >= self.len { 0 } else { end };
    }

    #[inline]
    fn pos(bit: usize) -> (usize, u64) {
        (bit / Self::BITS_PER_WORD, 1 << (bit % Self::BITS_PER_WORD))
    }

    #[inline]
    #[must_use]
    pub fn test(&self, bit: usize) -> bool {
        let (word, mask) = Self::pos(bit);
        self.words[word] & mask != 0
    }

    /// Set `count` bits starting at `start`.
    ///
    /// # Panics
    ///
    /// Panics if the range runs past the end of the bitmap.
    pub fn set_range(&mut self, start: usize, count: usize) {
        assert!(start + count <= self.len, "bitmap range out of bounds");
        for bit in start..start + count {
            let (word, mask) = Self::pos(bit);
            if self.words[word] & mask == 0 {
                self.words[word] |= mask;
                self.set_bits += 1;
            }
        }
    }

    /// Clear `count` bits starting at `start`.
    ///
    /// # Panics
    ///
    /// Panics if the range runs past the end of the bitmap.
    pub fn clear_range(&mut self, start: usize, count: usize) {
        assert!(start + count <= self.len, "bitmap range out of bounds");
        for bit in start..start + count {
            let (word, mask) = Self::pos(bit);
            if self.words[word] & mask != 0 {
                self.words[word] &= !mask;
                self.set_bits -= 1;
            }
        }
    }

    /// Check that every bit of the range is set.
    #[must_use]
    pub fn all_set(&self, start: usize, count: usize) -> bool {
        start + count <= self.len && (start..start + count).all(|bit| self.test(bit))
    }

    fn next_zero(&self, mut bit: usize, end: usize) -> usize {
        while bit < end {
            let (word, _) = Self::pos(bit);
            // Skip fully-set words
            if bit % Self::BITS_PER_WORD == 0 && self.words[word] == !0 {
                bit += Self::BITS_PER_WORD;
                continue;
            }
            if !self.test(bit) {
                return bit;
            }
            bit += 1;
        }
        end
    }

    fn next_set(&self, mut bit: usize, end: usize) -> usize {
        while bit < end {
            let (word, _) = Self::pos(bit);
            if bit % Self::BITS_PER_WORD == 0 && self.words[word] == 0 {
                bit += Self::BITS_PER_WORD;
                continue;
            }
            if self.test(bit) {
                return bit;
            }
            bit += 1;
        }
        end
    }

    /// Find `count` clear bits at or after `start` whose first index `i`
    /// satisfies `(i + align_offset) & align_mask == 0`.
    ///
    /// # Returns
    ///
    /// The first bit of the run, or `None` if no run fits.
    #[must_use]
    pub fn find_zero_area(
        &self,
        mut start: usize,
        count: usize,
        align_mask: usize,
        align_offset: usize,
    ) -> Option<usize> {
        if count == 0 || count > self.len {
            return None;
        }
        loop {
            let index = self.next_zero(start, self.len);
            let index = ((index + align_offset + align_mask) & !align_mask).checked_sub(align_offset)?;
            let end = index.checked_add(count)?;
            if end > self.len {
                return None;
            }
            let busy = self.next_set(index, end);
            if busy < end {
                start = busy + 1;
                continue;
            }
            return Some(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear_weight() {
        let mut bm = CmaBitmap::new(200);
        bm.set_range(10, 100);
        assert_eq!(bm.weight(), 100);
        bm.set_range(50, 10);
        assert_eq!(bm.weight(), 100);
        bm.clear_range(10, 40);
        assert_eq!(bm.weight(), 60);
        assert!(bm.all_set(50, 60));
        assert!(!bm.all_set(49, 2));
    }

    #[test]
    fn test_find_first_fit() {
        let mut bm = CmaBitmap::new(256);
        assert_eq!(bm.find_zero_area(0, 256, 0, 0), Some(0));
        bm.set_range(0, 3);
        assert_eq!(bm.find_zero_area(0, 4, 0, 0), Some(3));
        assert_eq!(bm.find_zero_area(0, 4, 3, 0), Some(4));
        assert_eq!(bm.find_zero_area(0, 254, 0, 0), None);
    }

    #[test]
    fn test_find_skips_busy_runs() {
        let mut bm = CmaBitmap::new(192);
        bm.set_range(0, 64);
        bm.set_range(70, 2);
        assert_eq!(bm.find_zero_area(0, 8, 0, 0), Some(72));
        assert_eq!(bm.find_zero_area(0, 4, 0, 0), Some(64));
    }

    #[test]
    fn test_find_with_offset() {
        let bm = CmaBitmap::new(64);
        // Area base misaligned by 2 units: first aligned index is 2.
        assert_eq!(bm.find_zero_area(0, 4, 3, 2), Some(2));
    }

    #[test]
    fn test_hint_wraps() {
        let mut bm = CmaBitmap::new(16);
        bm.advance_hint(8);
        assert_eq!(bm.hint(), 8);
        bm.advance_hint(16);
        assert_eq!(bm.hint(), 0);
    }
}
