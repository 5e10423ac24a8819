use std::ptr;

use lazy_static::lazy_static;

use crate::gc::Address;
use crate::mem;

lazy_static! {
    static ref PAGE_SIZE: usize = determine_page_size();
}

fn determine_page_size() -> usize {
    let val = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if val <= 0 {
        panic!("could not determine page size.");
    }

    let val = val as usize;
    assert!(val.is_power_of_two());
    val
}

pub fn page_size() -> usize {
    *PAGE_SIZE
}

pub fn page_size_bits() -> usize {
    page_size().trailing_zeros() as usize
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MemoryPermission {
    None,
    ReadWrite,
}

impl MemoryPermission {
    fn to_prot(self) -> libc::c_int {
        match self {
            MemoryPermission::None => libc::PROT_NONE,
            MemoryPermission::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// Reserved address range. The range is released again on drop.
pub struct Reservation {
    start: Address,
    size: usize,
}

impl Reservation {
    pub fn start(&self) -> Address {
        self.start
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> Address {
        self.start.offset(self.size)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        free(self.start, self.size);
    }
}

fn map(size: usize, permission: MemoryPermission) -> Option<Address> {
    debug_assert!(mem::is_os_page_aligned(size));

    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            permission.to_prot(),
            libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        None
    } else {
        Some(Address::from_ptr(ptr))
    }
}

/// Reserves `size` bytes of address space aligned to `align`. Nothing is
/// committed, every page needs to be committed with `commit_at` before use.
pub fn reserve_align(size: usize, align: usize) -> Option<Reservation> {
    debug_assert!(mem::is_os_page_aligned(size));
    debug_assert!(mem::is_os_page_aligned(align));

    let align = if align == 0 { page_size() } else { align };
    let unaligned_size = size + align - page_size();

    let unaligned_start = map(unaligned_size, MemoryPermission::None)?;
    let aligned_start: Address = mem::align_usize_up(unaligned_start.to_usize(), align).into();

    let gap_start = aligned_start.offset_from(unaligned_start);
    let gap_end = unaligned_size - size - gap_start;

    if gap_start > 0 {
        free(unaligned_start, gap_start);
    }

    if gap_end > 0 {
        free(aligned_start.offset(size), gap_end);
    }

    Some(Reservation {
        start: aligned_start,
        size,
    })
}

/// Maps zero-initialized, readable and writable memory. Physical pages are
/// only committed by the OS on first touch.
pub fn reserve_zeroed(size: usize) -> Option<Reservation> {
    let size = mem::os_page_align_up(size);
    let start = map(size, MemoryPermission::ReadWrite)?;

    Some(Reservation { start, size })
}

/// Commits pages in an already reserved range. The range is widened to
/// page boundaries, committing an already committed page is harmless.
/// Returns false when the OS refuses to back the range.
pub fn commit_at(ptr: Address, size: usize, permission: MemoryPermission) -> bool {
    let start = ptr.align_down(page_size());
    let end = mem::os_page_align_up(ptr.offset(size).to_usize());

    let res = unsafe {
        libc::mprotect(
            start.to_mut_ptr(),
            end - start.to_usize(),
            permission.to_prot(),
        )
    };

    res == 0
}

/// Gives the physical pages of the range back to the OS. The range stays
/// reserved and reads as zero afterwards.
pub fn discard(ptr: Address, size: usize) {
    debug_assert!(ptr.is_os_page_aligned());
    debug_assert!(mem::is_os_page_aligned(size));

    let res = unsafe { libc::madvise(ptr.to_mut_ptr(), size, libc::MADV_DONTNEED) };

    if res != 0 {
        panic!("discarding memory with madvise() failed");
    }
}

pub fn free(ptr: Address, size: usize) {
    debug_assert!(ptr.is_os_page_aligned());
    debug_assert!(mem::is_os_page_aligned(size));

    let result = unsafe { libc::munmap(ptr.to_mut_ptr(), size) };

    if result != 0 {
        panic!("munmap() failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::{K, M};

    #[test]
    fn page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert_eq!(1 << page_size_bits(), page_size());
    }

    #[test]
    fn reserve_aligned_range() {
        let reservation = reserve_align(4 * M, 4 * M).expect("reservation failed");
        assert!(reservation.start().is_aligned(4 * M));
        assert_eq!(reservation.size(), 4 * M);

        let start = reservation.start();
        assert!(commit_at(start, page_size(), MemoryPermission::ReadWrite));

        unsafe {
            start.store_word(42);
            assert_eq!(start.load_word(), 42);
        }

        discard(start, page_size());
        assert_eq!(unsafe { start.load_word() }, 0);
    }

    #[test]
    fn zeroed_reservation_reads_zero() {
        let reservation = reserve_zeroed(64 * K).expect("reservation failed");
        let addr = reservation.start().offset(16 * K);
        assert_eq!(unsafe { addr.load_word() }, 0);
    }
}
