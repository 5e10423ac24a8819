use std::panic::{self, AssertUnwindSafe, Location};

use crate::barrier::Escape;
use crate::gc::block::Block;
use crate::gc::freelist::LocalFreeList;
use crate::gc::{Address, AllocError};
use crate::heap::{BlockUse, Heap};
use crate::mutator;

/// Bump pointer into the current hole of a block.
pub struct Cursor {
    block: Option<Block>,
    top: Address,
    limit: Address,
    next_line: usize,
}

impl Cursor {
    pub fn empty() -> Cursor {
        Cursor {
            block: None,
            top: Address::null(),
            limit: Address::null(),
            next_line: 0,
        }
    }

    pub fn block(&self) -> Option<Block> {
        self.block
    }

    fn install(&mut self, block: Block) {
        self.block = Some(block);
        self.next_line = 0;
        self.top = Address::null();
        self.limit = Address::null();
        self.next_hole();
    }

    /// Moves to the next run of free lines. Returns false once the block
    /// has no holes left.
    fn next_hole(&mut self) -> bool {
        let block = match self.block {
            Some(block) => block,
            None => return false,
        };

        match block.next_hole(self.next_line) {
            Some((first, last)) => {
                self.top = block.line_address(first);
                self.limit = block.line_address(last);
                self.next_line = last;
                true
            }

            None => {
                self.top = self.limit;
                self.next_line = block.layout().lines();
                false
            }
        }
    }

    fn bump(&mut self, size: usize) -> Option<(Address, Block)> {
        let block = self.block?;

        if self.top.offset(size) <= self.limit {
            let addr = self.top;
            self.top = addr.offset(size);
            Some((addr, block))
        } else {
            None
        }
    }
}

/// A dynamic allocation scope of one thread. Objects allocated while the
/// region is active are reclaimed when it exits unless they faded.
pub struct Region {
    generation: u64,
    thread: usize,
    entered_cycle: u64,
    main: Cursor,
    secondary: Cursor,
    blocks: Vec<Block>,
    suspended: bool,
    objects: usize,
    bytes: usize,
}

impl Region {
    pub(crate) fn new(generation: u64, thread: usize, entered_cycle: u64) -> Region {
        Region {
            generation,
            thread,
            entered_cycle,
            main: Cursor::empty(),
            secondary: Cursor::empty(),
            blocks: Vec::new(),
            suspended: false,
            objects: 0,
            bytes: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn thread(&self) -> usize {
        self.thread
    }

    /// Completed GC cycles when the region was entered.
    pub fn entered_cycle(&self) -> u64 {
        self.entered_cycle
    }

    /// Blocks bound to this region, in acquisition order.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn main_block(&self) -> Option<Block> {
        self.main.block()
    }

    pub fn secondary_block(&self) -> Option<Block> {
        self.secondary.block()
    }

    pub fn allocated_objects(&self) -> usize {
        self.objects
    }

    pub fn allocated_bytes(&self) -> usize {
        self.bytes
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub(crate) fn set_suspended(&mut self, suspended: bool) -> bool {
        std::mem::replace(&mut self.suspended, suspended)
    }

    /// Reserves `size` bytes in one of the region's blocks.
    pub(crate) fn allocate(
        &mut self,
        heap: &Heap,
        local: &mut LocalFreeList,
        size: usize,
    ) -> Result<(Address, Block), AllocError> {
        let result = if size <= heap.layout().line_size {
            self.allocate_small(heap, local, size)?
        } else {
            self.allocate_medium(heap, local, size)?
        };

        self.objects += 1;
        self.bytes += size;

        Ok(result)
    }

    fn allocate_small(
        &mut self,
        heap: &Heap,
        local: &mut LocalFreeList,
        size: usize,
    ) -> Result<(Address, Block), AllocError> {
        loop {
            if let Some(result) = self.main.bump(size) {
                return Ok(result);
            }

            if !self.main.next_hole() {
                break;
            }
        }

        let block = heap.acquire_block(local, BlockUse::Main, self.thread, self.generation)?;
        self.blocks.push(block);
        self.main.install(block);

        self.main.bump(size).ok_or(AllocError::OutOfMemory { size })
    }

    fn allocate_medium(
        &mut self,
        heap: &Heap,
        local: &mut LocalFreeList,
        size: usize,
    ) -> Result<(Address, Block), AllocError> {
        if let Some(result) = self.main.bump(size) {
            return Ok(result);
        }

        loop {
            if let Some(result) = self.secondary.bump(size) {
                return Ok(result);
            }

            if !self.secondary.next_hole() {
                break;
            }
        }

        let block =
            heap.acquire_block(local, BlockUse::Secondary, self.thread, self.generation)?;
        self.blocks.push(block);
        self.secondary.install(block);

        self.secondary.bump(size).ok_or(AllocError::OutOfMemory { size })
    }
}

/// Runs `body` in a fresh region of the current thread. The region is torn
/// down when `body` returns or unwinds, region objects referenced by the
/// result are faded first.
#[track_caller]
pub fn enter_region<R, F>(body: F) -> R
where
    R: Escape,
    F: FnOnce() -> R,
{
    let site = Location::caller();
    let generation = mutator::with_current(|mutator| mutator.push_region());
    let result = panic::catch_unwind(AssertUnwindSafe(body));

    mutator::with_current(|mutator| {
        if let Ok(value) = &result {
            mutator.fade_escaping_at(value, generation, site);
        }

        mutator.exit_region(generation);
    });

    match result {
        Ok(value) => value,
        Err(payload) => panic::resume_unwind(payload),
    }
}

/// Runs `body` with region allocation of the current thread suspended.
/// Outside of a region this just runs `body`.
pub fn ignore<R, F>(body: F) -> R
where
    F: FnOnce() -> R,
{
    let previous = mutator::with_current(|mutator| mutator.suspend_region());
    let result = panic::catch_unwind(AssertUnwindSafe(body));

    mutator::with_current(|mutator| mutator.restore_region(previous));

    match result {
        Ok(value) => value,
        Err(payload) => panic::resume_unwind(payload),
    }
}
