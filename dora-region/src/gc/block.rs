use std::convert::TryFrom;
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::flags::RegionFlags;
use crate::gc::bitmap::Bitmap;
use crate::gc::{Address, Area};
use crate::mem;
use crate::object::Parity;

pub const POISON: usize = 0xdead_beef_dead_beef;

#[derive(Copy, Clone, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum BlockState {
    /// In a free list, no lines allocated.
    Free = 0,
    /// Owned by a live region.
    Bound = 1,
    /// Owner region exited, only faded survivors remain.
    Unbound = 2,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BlockLayout {
    pub block_size: usize,
    pub line_size: usize,
}

impl BlockLayout {
    pub fn new(flags: &RegionFlags) -> BlockLayout {
        BlockLayout {
            block_size: flags.block_size,
            line_size: flags.line_size,
        }
    }

    pub fn lines(&self) -> usize {
        self.block_size / self.line_size
    }

    pub fn words(&self) -> usize {
        self.block_size / mem::ptr_width_usize()
    }

    pub fn words_per_line(&self) -> usize {
        self.line_size / mem::ptr_width_usize()
    }
}

/// Side metadata of one block. Lives outside of the block memory.
pub struct BlockInfo {
    area: Area,
    layout: BlockLayout,
    state: AtomicU8,
    owner_thread: AtomicUsize,
    owner_generation: AtomicU64,
    epoch: AtomicU64,
    alloc: Bitmap,
    line_marks: [Bitmap; 2],
    starts: Bitmap,
    fade: Bitmap,
}

impl BlockInfo {
    pub fn new(start: Address, layout: BlockLayout) -> BlockInfo {
        BlockInfo {
            area: start.area_start(layout.block_size),
            layout,
            state: AtomicU8::new(BlockState::Free.into()),
            owner_thread: AtomicUsize::new(0),
            owner_generation: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            alloc: Bitmap::new(layout.lines()),
            line_marks: [Bitmap::new(layout.lines()), Bitmap::new(layout.lines())],
            starts: Bitmap::new(layout.words()),
            fade: Bitmap::new(layout.words()),
        }
    }

    pub fn start(&self) -> Address {
        self.area.start
    }

    pub fn end(&self) -> Address {
        self.area.end
    }

    pub fn area(&self) -> Area {
        self.area
    }

    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.area.contains(addr)
    }

    pub fn state(&self) -> BlockState {
        let raw = self.state.load(Ordering::Acquire);
        BlockState::try_from(raw)
            .unwrap_or_else(|_| panic!("corrupted state {} for block {}", raw, self.start()))
    }

    pub fn transition(&self, from: BlockState, to: BlockState) -> bool {
        self.state
            .compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Hands the block to region `generation` of `thread`. Fails if the
    /// block is not in state `from` anymore.
    pub fn bind(&self, from: BlockState, thread: usize, generation: u64) -> bool {
        debug_assert!(from != BlockState::Bound);

        if !self.transition(from, BlockState::Bound) {
            return false;
        }

        self.owner_thread.store(thread, Ordering::Relaxed);
        self.owner_generation.store(generation, Ordering::Relaxed);
        true
    }

    pub fn unbind(&self) {
        self.clear_owner();
        self.state.store(BlockState::Unbound.into(), Ordering::Release);
    }

    fn clear_owner(&self) {
        self.owner_thread.store(0, Ordering::Relaxed);
        self.owner_generation.store(0, Ordering::Relaxed);
    }

    pub fn owner_thread(&self) -> usize {
        self.owner_thread.load(Ordering::Relaxed)
    }

    /// Generation of the owning region, 0 if unbound.
    pub fn generation(&self) -> u64 {
        self.owner_generation.load(Ordering::Relaxed)
    }

    pub fn is_bound_to(&self, thread: usize) -> bool {
        self.state() == BlockState::Bound && self.owner_thread() == thread
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Starts releasing memory of this block. Readers that observed the
    /// previous epoch are invalidated.
    pub fn advance_epoch(&self) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        fence(Ordering::Release);
        epoch
    }

    /// Re-validates a read of block memory started at `epoch`.
    pub fn epoch_unchanged(&self, epoch: u64) -> bool {
        fence(Ordering::Acquire);
        self.epoch.load(Ordering::Relaxed) == epoch
    }

    #[inline(always)]
    pub fn word_index(&self, addr: Address) -> usize {
        debug_assert!(self.contains(addr));
        addr.offset_from(self.start()) / mem::ptr_width_usize()
    }

    #[inline(always)]
    pub fn line_index(&self, addr: Address) -> usize {
        debug_assert!(self.area.valid_top(addr));
        addr.offset_from(self.start()) / self.layout.line_size
    }

    pub fn line_address(&self, line: usize) -> Address {
        self.start().offset(line * self.layout.line_size)
    }

    /// Lines `[first, last)` covered by `size` bytes at `addr`.
    pub fn lines_of(&self, addr: Address, size: usize) -> (usize, usize) {
        let first = self.line_index(addr);
        let last = self.line_index(addr.offset(size - 1)) + 1;
        (first, last)
    }

    fn words_of_line(&self, line: usize) -> (usize, usize) {
        let words = self.layout.words_per_line();
        (line * words, (line + 1) * words)
    }

    /// Records a fresh allocation of `size` bytes at `addr`.
    pub fn record_object(&self, addr: Address, size: usize) {
        self.starts.set(self.word_index(addr));
        let (first, last) = self.lines_of(addr, size);
        self.alloc.set_range(first, last);
    }

    pub fn mark_lines(&self, addr: Address, size: usize, parity: Parity) {
        let (first, last) = self.lines_of(addr, size);
        self.line_marks[parity.index()].set_range(first, last);
    }

    pub fn is_object_start(&self, addr: Address) -> bool {
        self.starts.get(self.word_index(addr))
    }

    /// Start of the object containing `addr`.
    pub fn object_start(&self, addr: Address) -> Option<Address> {
        self.starts
            .find_prev_set(self.word_index(addr))
            .map(|word| self.start().add_ptr(word))
    }

    /// Object starts in lines `[first, last)`.
    pub fn objects_in_lines(&self, first: usize, last: usize) -> Vec<Address> {
        let (from, _) = self.words_of_line(first);
        let (_, to) = self.words_of_line(last - 1);
        let mut result = Vec::new();
        let mut idx = from;

        while let Some(word) = self.starts.find_next(idx, true) {
            if word >= to {
                break;
            }

            result.push(self.start().add_ptr(word));
            idx = word + 1;
        }

        result
    }

    pub fn objects(&self) -> Vec<Address> {
        self.objects_in_lines(0, self.layout.lines())
    }

    #[inline(always)]
    pub fn is_faded(&self, addr: Address) -> bool {
        self.fade.get(self.word_index(addr))
    }

    /// Fades all words of the object at `addr`. Returns false if the object
    /// was already faded.
    pub fn fade_object(&self, addr: Address, size: usize) -> bool {
        let first = self.word_index(addr);

        if self.fade.get(first) {
            return false;
        }

        self.fade.set_range(first, first + mem::words(size));
        true
    }

    pub fn is_object_faded(&self, addr: Address, size: usize) -> bool {
        let first = self.word_index(addr);
        self.fade.all_in_range(first, first + mem::words(size))
    }

    pub fn line_has_fade(&self, line: usize) -> bool {
        let (from, to) = self.words_of_line(line);
        self.fade.any_in_range(from, to)
    }

    pub fn is_line_allocated(&self, line: usize) -> bool {
        self.alloc.get(line)
    }

    pub fn lines_allocated(&self, first: usize, last: usize) -> bool {
        self.alloc.all_in_range(first, last)
    }

    pub fn is_line_marked(&self, line: usize, parity: Parity) -> bool {
        self.line_marks[parity.index()].get(line)
    }

    pub fn allocated_lines(&self) -> Vec<usize> {
        self.alloc.ones()
    }

    pub fn allocated_line_count(&self) -> usize {
        self.alloc.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.alloc.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.alloc.count_ones() == self.layout.lines()
    }

    /// Next run of free lines at or after `from`, as `(first, last)`.
    pub fn next_hole(&self, from: usize) -> Option<(usize, usize)> {
        let first = self.alloc.find_next(from, false)?;
        let last = self
            .alloc
            .find_next(first, true)
            .unwrap_or(self.layout.lines());

        Some((first, last))
    }

    /// Returns a line to the block: clears all metadata covering it and
    /// optionally poisons its memory.
    pub fn release_line(&self, line: usize, poison: bool) {
        let (from, to) = self.words_of_line(line);

        self.alloc.clear(line);
        self.line_marks[0].clear(line);
        self.line_marks[1].clear(line);
        self.starts.clear_range(from, to);
        self.fade.clear_range(from, to);

        if poison {
            for word in from..to {
                unsafe { self.start().add_ptr(word).store_word(POISON) };
            }
        }
    }

    pub fn clear_line_marks(&self, parity: Parity) {
        self.line_marks[parity.index()].clear_all();
    }

    pub fn has_clean_metadata(&self) -> bool {
        self.alloc.is_empty()
            && self.starts.is_empty()
            && self.fade.is_empty()
            && self.line_marks[0].is_empty()
            && self.line_marks[1].is_empty()
    }
}

/// Handle to the metadata of a block. Block metadata is owned by its arena
/// and lives as long as the heap.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Block(NonNull<BlockInfo>);

unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    pub(crate) fn from_info(info: NonNull<BlockInfo>) -> Block {
        Block(info)
    }

    pub fn as_ptr(self) -> *mut BlockInfo {
        self.0.as_ptr()
    }
}

impl Deref for Block {
    type Target = BlockInfo;

    fn deref(&self) -> &BlockInfo {
        unsafe { self.0.as_ref() }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Block({}, {:?})", self.area(), self.state())
    }
}
