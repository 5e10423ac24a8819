use std::cmp::{Ord, Ordering, PartialOrd};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use thiserror::Error;

use crate::mem;
use crate::object::Obj;

pub mod arena;
pub mod bitmap;
pub mod block;
pub mod classifier;
pub mod collector;
pub mod freelist;
pub mod general;
pub mod marking;
pub mod root;
pub mod sweep;
pub mod verify;

pub use crate::gc::root::Slot;

pub const K: usize = 1024;
pub const M: usize = K * K;
pub const G: usize = K * M;

// Number of address bits covered by the classifier. User space on
// x86-64 and aarch64 fits into 48 bits.
pub const ADDRESS_SPACE_BITS: usize = 48;

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct Address(usize);

impl Address {
    #[inline(always)]
    pub fn from(val: usize) -> Address {
        Address(val)
    }

    #[inline(always)]
    pub fn area_start(self, size: usize) -> Area {
        Area::new(self, self.offset(size))
    }

    #[inline(always)]
    pub fn offset_from(self, base: Address) -> usize {
        debug_assert!(self >= base);

        self.to_usize() - base.to_usize()
    }

    #[inline(always)]
    pub fn offset(self, offset: usize) -> Address {
        Address(self.0 + offset)
    }

    #[inline(always)]
    pub fn sub(self, offset: usize) -> Address {
        Address(self.0 - offset)
    }

    #[inline(always)]
    pub fn add_ptr(self, words: usize) -> Address {
        Address(self.0 + words * mem::ptr_width_usize())
    }

    #[inline(always)]
    pub fn to_usize(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Address {
        Address(ptr as usize)
    }

    #[inline(always)]
    pub fn to_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    #[inline(always)]
    pub fn to_mut_ptr<T>(&self) -> *mut T {
        self.0 as *const T as *mut T
    }

    #[inline(always)]
    pub fn null() -> Address {
        Address(0)
    }

    #[inline(always)]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn is_non_null(self) -> bool {
        self.0 != 0
    }

    #[inline(always)]
    pub fn align_down(self, alignment: usize) -> Address {
        debug_assert!(alignment.is_power_of_two());
        Address(self.0 & !(alignment - 1))
    }

    #[inline(always)]
    pub fn is_aligned(self, alignment: usize) -> bool {
        debug_assert!(alignment.is_power_of_two());
        (self.0 & (alignment - 1)) == 0
    }

    #[inline(always)]
    pub fn is_word_aligned(self) -> bool {
        self.is_aligned(mem::ptr_width_usize())
    }

    #[inline(always)]
    pub fn is_os_page_aligned(self) -> bool {
        mem::is_os_page_aligned(self.to_usize())
    }

    #[inline(always)]
    pub fn to_obj(&self) -> &'static Obj {
        unsafe { &*self.to_ptr::<Obj>() }
    }

    /// Atomic view of the word at this address.
    ///
    /// The address needs to be word aligned and point into committed memory
    /// that outlives the returned reference.
    #[inline(always)]
    pub unsafe fn word(self) -> &'static AtomicUsize {
        debug_assert!(self.is_word_aligned());
        unsafe { &*self.to_ptr::<AtomicUsize>() }
    }

    #[inline(always)]
    pub unsafe fn load_word(self) -> usize {
        unsafe { self.word() }.load(AtomicOrdering::Relaxed)
    }

    #[inline(always)]
    pub unsafe fn store_word(self, value: usize) {
        unsafe { self.word() }.store(value, AtomicOrdering::Relaxed);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.to_usize())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.to_usize())
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Address) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Address) -> Ordering {
        self.to_usize().cmp(&other.to_usize())
    }
}

impl From<usize> for Address {
    fn from(val: usize) -> Address {
        Address(val)
    }
}

/// Half-open address range `[start, end)`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Area {
    pub start: Address,
    pub end: Address,
}

impl Area {
    pub fn new(start: Address, end: Address) -> Area {
        debug_assert!(start <= end);

        Area { start, end }
    }

    #[inline(always)]
    pub fn start(&self) -> Address {
        self.start
    }

    #[inline(always)]
    pub fn end(&self) -> Address {
        self.end
    }

    #[inline(always)]
    pub fn contains(&self, addr: Address) -> bool {
        self.start <= addr && addr < self.end
    }

    #[inline(always)]
    pub fn valid_top(&self, addr: Address) -> bool {
        self.start <= addr && addr <= self.end
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.end.to_usize() - self.start.to_usize()
    }
}

impl Default for Area {
    fn default() -> Area {
        Area {
            start: Address::null(),
            end: Address::null(),
        }
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

pub struct FormattedSize {
    size: usize,
}

impl fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Error)]
pub enum AllocError {
    #[error("out of memory while allocating {size} bytes")]
    OutOfMemory { size: usize },
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum GcReason {
    AllocationFailure,
    ForceCollect,
    Stress,
}

impl GcReason {
    fn message(&self) -> &'static str {
        match self {
            GcReason::AllocationFailure => "alloc failure",
            GcReason::ForceCollect => "force collect",
            GcReason::Stress => "stress",
        }
    }
}

impl fmt::Display for GcReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

#[cfg(test)]
mod tests {
    use super::{formatted_size, Address, Area, K, M};

    #[test]
    fn area_contains_is_half_open() {
        let area = Area::new(Address::from(0x1000), Address::from(0x2000));
        assert!(area.contains(Address::from(0x1000)));
        assert!(area.contains(Address::from(0x1fff)));
        assert!(!area.contains(Address::from(0x2000)));
        assert!(area.valid_top(Address::from(0x2000)));
        assert_eq!(area.size(), 0x1000);
    }

    #[test]
    fn align_down_to_block() {
        let addr = Address::from(0x12345);
        assert_eq!(addr.align_down(8 * K), Address::from(0x12000));
        assert!(!Address::from(0x5000).is_aligned(8 * K));
        assert!(!Address::from(0x7000).is_aligned(8 * K));
        assert!(Address::from(0x8000).is_aligned(8 * K));
    }

    #[test]
    fn format_sizes() {
        assert_eq!(format!("{}", formatted_size(100)), "100B");
        assert_eq!(format!("{}", formatted_size(8 * K)), "8.0K");
        assert_eq!(format!("{}", formatted_size(64 * M)), "64.0M");
    }
}
