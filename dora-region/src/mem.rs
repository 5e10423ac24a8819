use std::mem::size_of;

use crate::os;

#[inline(always)]
pub const fn ptr_width_usize() -> usize {
    size_of::<*const u8>()
}

/// returns true if given value is a multiple of a page size.
pub fn is_os_page_aligned(val: usize) -> bool {
    let align = os::page_size_bits();

    // we can use shifts here since we know that
    // page size is power of 2
    val == ((val >> align) << align)
}

/// round the given value up to the nearest multiple of a page
pub fn os_page_align_up(val: usize) -> usize {
    let align = os::page_size_bits();

    // we know that page size is power of 2, hence
    // we can use shifts instead of expensive division
    ((val + (1 << align) - 1) >> align) << align
}

/// rounds the given value `val` up to the nearest multiple
/// of `align`.
pub fn align_usize_up(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }

    ((value + align - 1) / align) * align
}

/// rounds the given value `val` down to the nearest multiple
/// of `align`.
pub fn align_usize_down(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }

    (value / align) * align
}

/// Number of words needed for `size` bytes.
#[inline(always)]
pub fn words(size: usize) -> usize {
    align_usize_up(size, ptr_width_usize()) / ptr_width_usize()
}
