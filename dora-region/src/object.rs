use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use fixedbitset::FixedBitSet;

use crate::gc::{Address, Area, Slot};
use crate::mem;

// The two low bits of the header word are the double-buffered mark
// bits. Class descriptors are word aligned so the bits are always free.
const MARK_MASK: usize = 0b11;

pub const HEADER_SIZE: usize = mem::ptr_width_usize();

/// Selects one of the two mark bits, alternating between GC cycles.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Parity(usize);

impl Parity {
    pub fn of_cycle(cycle: u64) -> Parity {
        Parity((cycle & 1) as usize)
    }

    pub fn other(self) -> Parity {
        Parity(self.0 ^ 1)
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        self.0
    }

    #[inline(always)]
    fn bit(self) -> usize {
        1 << self.0
    }
}

/// Layout descriptor shared by all instances of a type.
pub struct Class {
    name: String,
    size: usize,
    refs: FixedBitSet,
}

impl Class {
    /// Creates a class with `size` bytes per instance (including the header)
    /// and reference fields at the given word indices. Word 0 is the header.
    /// Classes live for the rest of the process.
    pub fn new(name: &str, size: usize, refs: &[usize]) -> &'static Class {
        assert!(size > HEADER_SIZE, "class {} has no fields", name);
        assert!(
            size % mem::ptr_width_usize() == 0,
            "size of class {} is not word aligned",
            name
        );

        let words = size / mem::ptr_width_usize();
        let mut bitset = FixedBitSet::with_capacity(words);

        for &idx in refs {
            assert!(
                idx > 0 && idx < words,
                "reference field {} outside of class {}",
                idx,
                name
            );
            bitset.insert(idx);
        }

        Box::leak(Box::new(Class {
            name: name.to_string(),
            size,
            refs: bitset,
        }))
    }

    /// Class with `fields` reference fields following the header.
    pub fn with_ref_fields(name: &str, fields: usize) -> &'static Class {
        let refs: Vec<usize> = (1..=fields).collect();
        Class::new(name, (fields + 1) * mem::ptr_width_usize(), &refs)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn words(&self) -> usize {
        self.size / mem::ptr_width_usize()
    }

    pub fn is_ref(&self, idx: usize) -> bool {
        self.refs.contains(idx)
    }

    pub fn ref_fields(&self) -> impl Iterator<Item = usize> + '_ {
        self.refs.ones()
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Class({}, {} bytes)", self.name, self.size)
    }
}

#[repr(C)]
pub struct Header {
    word: AtomicUsize,
}

impl Header {
    #[inline(always)]
    pub fn size() -> usize {
        HEADER_SIZE
    }

    #[inline(always)]
    pub fn raw(&self) -> usize {
        self.word.load(Ordering::Relaxed)
    }

    pub(crate) fn install(&self, class: &'static Class) {
        let value = class as *const Class as usize;
        debug_assert_eq!(value & MARK_MASK, 0);
        self.word.store(value, Ordering::Relaxed);
    }

    pub(crate) fn install_marked(&self, class: &'static Class, parity: Parity) {
        let value = class as *const Class as usize;
        self.word.store(value | parity.bit(), Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn class(&self) -> &'static Class {
        class_from_raw(self.raw())
    }

    /// Sets the mark bit for `parity`, returns true if it was clear before.
    #[inline(always)]
    pub fn try_mark(&self, parity: Parity) -> bool {
        let bit = parity.bit();
        let old = self.word.fetch_or(bit, Ordering::Relaxed);
        old & bit == 0
    }

    #[inline(always)]
    pub fn is_marked(&self, parity: Parity) -> bool {
        self.raw() & parity.bit() != 0
    }

    #[inline(always)]
    pub fn clear_mark(&self, parity: Parity) {
        self.word.fetch_and(!parity.bit(), Ordering::Relaxed);
    }
}

/// Decodes the class pointer of a raw header word.
#[inline(always)]
pub fn class_from_raw(raw: usize) -> &'static Class {
    let ptr = (raw & !MARK_MASK) as *const Class;
    debug_assert!(!ptr.is_null());
    unsafe { &*ptr }
}

#[repr(C)]
pub struct Obj {
    header: Header,
    data: u8,
}

impl Obj {
    #[inline(always)]
    pub fn header(&self) -> &Header {
        &self.header
    }

    #[inline(always)]
    pub fn address(&self) -> Address {
        Address::from_ptr(self as *const _)
    }

    #[inline(always)]
    pub fn class(&self) -> &'static Class {
        self.header.class()
    }

    pub fn size(&self) -> usize {
        self.class().size()
    }

    pub fn area(&self) -> Area {
        self.address().area_start(self.size())
    }

    pub fn field(&self, idx: usize) -> Slot {
        debug_assert!(idx > 0 && idx < self.class().words());
        Slot::at(self.address().add_ptr(idx))
    }

    pub fn visit_reference_fields<F>(&self, mut f: F)
    where
        F: FnMut(Slot),
    {
        let class = self.class();

        for idx in class.ref_fields() {
            f(Slot::at(self.address().add_ptr(idx)));
        }
    }

    /// Installs the header and clears all fields of a fresh allocation.
    pub(crate) fn initialize(addr: Address, class: &'static Class, marked: Option<Parity>) {
        for idx in 1..class.words() {
            unsafe { addr.add_ptr(idx).store_word(0) };
        }

        let obj = addr.to_obj();

        match marked {
            Some(parity) => obj.header.install_marked(class, parity),
            None => obj.header.install(class),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_reference_map() {
        let class = Class::new("Pair", 32, &[1, 3]);
        assert_eq!(class.words(), 4);
        assert!(class.is_ref(1));
        assert!(!class.is_ref(2));
        assert_eq!(class.ref_fields().collect::<Vec<_>>(), vec![1, 3]);

        let node = Class::with_ref_fields("Node", 2);
        assert_eq!(node.size(), 24);
        assert_eq!(node.ref_fields().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    #[should_panic]
    fn class_rejects_header_reference() {
        Class::new("Bad", 16, &[0]);
    }

    #[test]
    fn mark_bits_are_double_buffered() {
        let class = Class::with_ref_fields("Cell", 1);
        let mut memory = vec![0usize; 2];
        let addr = Address::from_ptr(memory.as_mut_ptr());

        Obj::initialize(addr, class, None);
        let obj = addr.to_obj();

        let even = Parity::of_cycle(2);
        let odd = even.other();

        assert!(obj.header().try_mark(even));
        assert!(!obj.header().try_mark(even));
        assert!(!obj.header().is_marked(odd));
        assert!(std::ptr::eq(obj.class(), class));

        obj.header().clear_mark(even);
        assert!(!obj.header().is_marked(even));
        assert!(std::ptr::eq(obj.class(), class));
    }

    #[test]
    fn initialize_clears_fields() {
        let class = Class::with_ref_fields("Cell", 2);
        let mut memory = vec![usize::MAX; 3];
        let addr = Address::from_ptr(memory.as_mut_ptr());

        Obj::initialize(addr, class, Some(Parity::of_cycle(1)));
        let obj = addr.to_obj();

        assert!(obj.header().is_marked(Parity::of_cycle(1)));
        assert!(obj.field(1).get().is_null());
        assert!(obj.field(2).get().is_null());

        let mut fields = 0;
        obj.visit_reference_fields(|_| fields += 1);
        assert_eq!(fields, 2);
    }
}
