use std::sync::atomic::{AtomicU64, Ordering};

use crate::gc::{Address, ADDRESS_SPACE_BITS};
use crate::os::{self, Reservation};

/// One bit per arena over the whole user address space. Bits are only
/// set while holding the arena reservation lock, lookups are lock-free.
pub struct Classifier {
    bits: Reservation,
    arena_shift: usize,
    arenas: usize,
}

impl Classifier {
    pub fn new(arena_size: usize) -> Option<Classifier> {
        assert!(arena_size.is_power_of_two());
        let arena_shift = arena_size.trailing_zeros() as usize;
        assert!(arena_shift < ADDRESS_SPACE_BITS);

        let arenas = 1usize << (ADDRESS_SPACE_BITS - arena_shift);
        let words = (arenas + 63) / 64;
        let bits = os::reserve_zeroed(words * std::mem::size_of::<AtomicU64>())?;

        Some(Classifier {
            bits,
            arena_shift,
            arenas,
        })
    }

    #[inline(always)]
    fn word(&self, idx: usize) -> &AtomicU64 {
        debug_assert!(idx < self.arenas);
        let ptr = self.bits.start().to_ptr::<AtomicU64>();
        unsafe { &*ptr.add(idx / 64) }
    }

    #[inline(always)]
    fn index(&self, addr: Address) -> Option<usize> {
        let idx = addr.to_usize() >> self.arena_shift;

        if idx < self.arenas {
            Some(idx)
        } else {
            None
        }
    }

    /// Marks the arena starting at `arena` as region memory.
    pub fn add_arena(&self, arena: Address) {
        debug_assert!(arena.is_aligned(1 << self.arena_shift));
        let idx = self
            .index(arena)
            .unwrap_or_else(|| panic!("arena {} outside of classified address space", arena));

        self.word(idx).fetch_or(1 << (idx % 64), Ordering::Release);
    }

    pub fn remove_arena(&self, arena: Address) {
        if let Some(idx) = self.index(arena) {
            self.word(idx).fetch_and(!(1 << (idx % 64)), Ordering::Release);
        }
    }

    /// Returns true if `addr` points into region memory.
    #[inline(always)]
    pub fn contains(&self, addr: Address) -> bool {
        match self.index(addr) {
            Some(idx) => self.word(idx).load(Ordering::Acquire) & (1 << (idx % 64)) != 0,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::M;

    #[test]
    fn classify_arenas() {
        let classifier = Classifier::new(64 * M).expect("classifier");
        let arena = Address::from(128 * M);

        assert!(!classifier.contains(arena));
        classifier.add_arena(arena);
        assert!(classifier.contains(arena));
        assert!(classifier.contains(arena.offset(64 * M - 1)));
        assert!(!classifier.contains(arena.offset(64 * M)));
        assert!(!classifier.contains(arena.sub(1)));

        classifier.remove_arena(arena);
        assert!(!classifier.contains(arena));
    }

    #[test]
    fn addresses_beyond_user_space_are_unclassified() {
        let classifier = Classifier::new(64 * M).expect("classifier");
        assert!(!classifier.contains(Address::from(usize::MAX)));
        assert!(!classifier.contains(Address::null()));
    }
}
