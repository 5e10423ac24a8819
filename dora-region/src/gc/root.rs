use std::sync::atomic::AtomicUsize;

use crate::gc::Address;

/// Location holding a reference: an object field, a global or a stack slot.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Slot(Address);

impl Slot {
    pub fn at(addr: Address) -> Slot {
        debug_assert!(addr.is_word_aligned());
        Slot(addr)
    }

    /// Slot backed by a Rust location, used for roots outside the heap.
    pub fn of(location: &AtomicUsize) -> Slot {
        Slot(Address::from_ptr(location as *const _))
    }

    pub fn address(self) -> Address {
        self.0
    }

    pub fn get(self) -> Address {
        Address::from(unsafe { self.0.load_word() })
    }

    /// Raw store, bypasses the write barrier.
    pub fn set(self, obj: Address) {
        unsafe { self.0.store_word(obj.to_usize()) }
    }
}

/// Fixed set of root slots owned by the embedder, e.g. globals of a
/// test program or a driver.
pub struct RootSet {
    slots: Box<[AtomicUsize]>,
}

impl RootSet {
    pub fn new(len: usize) -> RootSet {
        let slots: Vec<AtomicUsize> = (0..len)
            .map(|_| AtomicUsize::new(0))
            .collect();

        RootSet {
            slots: slots.into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, idx: usize) -> Slot {
        Slot::of(&self.slots[idx])
    }

    pub fn slots(&self) -> Vec<Slot> {
        self.slots.iter().map(Slot::of).collect()
    }
}
