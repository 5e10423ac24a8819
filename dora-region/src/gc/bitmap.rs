use std::sync::atomic::{AtomicU64, Ordering};

const BITS: usize = 64;

/// Fixed-size bitmap backed by atomic words. Setting and clearing bits is
/// lock-free; bulk operations are not atomic as a whole.
pub struct Bitmap {
    words: Box<[AtomicU64]>,
    len: usize,
}

impl Bitmap {
    pub fn new(len: usize) -> Bitmap {
        let count = (len + BITS - 1) / BITS;
        let words: Vec<AtomicU64> = (0..count).map(|_| AtomicU64::new(0)).collect();

        Bitmap {
            words: words.into_boxed_slice(),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn get(&self, idx: usize) -> bool {
        debug_assert!(idx < self.len);
        let word = self.words[idx / BITS].load(Ordering::Acquire);
        word & (1 << (idx % BITS)) != 0
    }

    /// Sets the bit, returns true if it was clear before.
    #[inline(always)]
    pub fn set(&self, idx: usize) -> bool {
        debug_assert!(idx < self.len);
        let bit = 1 << (idx % BITS);
        let old = self.words[idx / BITS].fetch_or(bit, Ordering::AcqRel);
        old & bit == 0
    }

    #[inline(always)]
    pub fn clear(&self, idx: usize) {
        debug_assert!(idx < self.len);
        let bit = 1 << (idx % BITS);
        self.words[idx / BITS].fetch_and(!bit, Ordering::AcqRel);
    }

    /// Sets all bits in `[from, to)`.
    pub fn set_range(&self, from: usize, to: usize) {
        self.for_each_word(from, to, |word, mask| {
            word.fetch_or(mask, Ordering::AcqRel);
        });
    }

    /// Clears all bits in `[from, to)`.
    pub fn clear_range(&self, from: usize, to: usize) {
        self.for_each_word(from, to, |word, mask| {
            word.fetch_and(!mask, Ordering::AcqRel);
        });
    }

    /// Returns true if any bit in `[from, to)` is set.
    pub fn any_in_range(&self, from: usize, to: usize) -> bool {
        let mut found = false;

        self.for_each_word(from, to, |word, mask| {
            found = found || word.load(Ordering::Acquire) & mask != 0;
        });

        found
    }

    /// Returns true if every bit in `[from, to)` is set.
    pub fn all_in_range(&self, from: usize, to: usize) -> bool {
        let mut all = true;

        self.for_each_word(from, to, |word, mask| {
            all = all && word.load(Ordering::Acquire) & mask == mask;
        });

        all
    }

    fn for_each_word<F>(&self, from: usize, to: usize, mut f: F)
    where
        F: FnMut(&AtomicU64, u64),
    {
        debug_assert!(from <= to && to <= self.len);
        let mut idx = from;

        while idx < to {
            let bit = idx % BITS;
            let count = (BITS - bit).min(to - idx);
            let mask = if count == BITS {
                u64::MAX
            } else {
                ((1u64 << count) - 1) << bit
            };

            f(&self.words[idx / BITS], mask);
            idx += count;
        }
    }

    /// Highest set bit with index `<= idx`.
    pub fn find_prev_set(&self, idx: usize) -> Option<usize> {
        debug_assert!(idx < self.len);
        let mut word_idx = idx / BITS;
        let bit = idx % BITS;

        let mask = if bit == BITS - 1 {
            u64::MAX
        } else {
            (1u64 << (bit + 1)) - 1
        };
        let mut word = self.words[word_idx].load(Ordering::Acquire) & mask;

        loop {
            if word != 0 {
                let top = BITS - 1 - word.leading_zeros() as usize;
                return Some(word_idx * BITS + top);
            }

            if word_idx == 0 {
                return None;
            }

            word_idx -= 1;
            word = self.words[word_idx].load(Ordering::Acquire);
        }
    }

    /// Lowest bit with index `>= from` whose value equals `value`.
    pub fn find_next(&self, from: usize, value: bool) -> Option<usize> {
        let mut idx = from;

        while idx < self.len {
            let bit = idx % BITS;
            let mut word = self.words[idx / BITS].load(Ordering::Acquire);

            if !value {
                word = !word;
            }

            word &= u64::MAX << bit;

            if word != 0 {
                let found = (idx - bit) + word.trailing_zeros() as usize;
                return if found < self.len { Some(found) } else { None };
            }

            idx += BITS - bit;
        }

        None
    }

    pub fn load_word(&self, idx: usize) -> u64 {
        self.words[idx].load(Ordering::Acquire)
    }

    pub fn store_word(&self, idx: usize, value: u64) {
        self.words[idx].store(value, Ordering::Release);
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Acquire) == 0)
    }

    pub fn count_ones(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Release);
        }
    }

    /// Snapshot of all set indices.
    pub fn ones(&self) -> Vec<usize> {
        let mut result = Vec::new();
        let mut idx = 0;

        while let Some(found) = self.find_next(idx, true) {
            result.push(found);
            idx = found + 1;
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear_bits() {
        let bitmap = Bitmap::new(100);
        assert!(bitmap.set(3));
        assert!(!bitmap.set(3));
        assert!(bitmap.get(3));
        bitmap.clear(3);
        assert!(!bitmap.get(3));
        assert!(bitmap.is_empty());
    }

    #[test]
    fn ranges_across_words() {
        let bitmap = Bitmap::new(200);
        bitmap.set_range(60, 130);
        assert_eq!(bitmap.count_ones(), 70);
        assert!(bitmap.all_in_range(60, 130));
        assert!(!bitmap.any_in_range(0, 60));
        assert!(!bitmap.any_in_range(130, 200));
        assert!(bitmap.any_in_range(129, 131));

        bitmap.clear_range(64, 128);
        assert_eq!(bitmap.ones(), vec![60, 61, 62, 63, 128, 129]);
    }

    #[test]
    fn full_word_range() {
        let bitmap = Bitmap::new(128);
        bitmap.set_range(64, 128);
        assert_eq!(bitmap.load_word(1), u64::MAX);
        assert_eq!(bitmap.load_word(0), 0);
    }

    #[test]
    fn search_backwards() {
        let bitmap = Bitmap::new(256);
        assert_eq!(bitmap.find_prev_set(255), None);
        bitmap.set(5);
        bitmap.set(70);
        assert_eq!(bitmap.find_prev_set(255), Some(70));
        assert_eq!(bitmap.find_prev_set(70), Some(70));
        assert_eq!(bitmap.find_prev_set(69), Some(5));
        assert_eq!(bitmap.find_prev_set(63), Some(5));
        assert_eq!(bitmap.find_prev_set(4), None);
    }

    #[test]
    fn search_forwards() {
        let bitmap = Bitmap::new(70);
        assert_eq!(bitmap.find_next(0, true), None);
        assert_eq!(bitmap.find_next(0, false), Some(0));

        bitmap.set_range(0, 66);
        assert_eq!(bitmap.find_next(0, false), Some(66));
        assert_eq!(bitmap.find_next(67, true), None);
        assert_eq!(bitmap.find_next(65, true), Some(65));

        bitmap.set_range(66, 70);
        assert_eq!(bitmap.find_next(0, false), None);
    }
}
