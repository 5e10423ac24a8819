use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use log::debug;

use crate::gc::block::{Block, BlockInfo, BlockLayout};
use crate::gc::classifier::Classifier;
use crate::gc::{formatted_size, Address, AllocError, Area};
use crate::os::{self, MemoryPermission, Reservation};

/// Aligned chunk of reserved address space, carved into blocks on demand.
/// The first block holds the arena header: a pointer back to this struct.
pub struct Arena {
    reservation: Reservation,
    layout: BlockLayout,
    blocks: Box<[AtomicPtr<BlockInfo>]>,
    next: AtomicUsize,
}

impl Arena {
    fn new(size: usize, layout: BlockLayout) -> Option<Box<Arena>> {
        let reservation = os::reserve_align(size, size)?;
        let count = size / layout.block_size;

        let blocks: Vec<AtomicPtr<BlockInfo>> = (0..count)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();

        let arena = Box::new(Arena {
            reservation,
            layout,
            blocks: blocks.into_boxed_slice(),
            next: AtomicUsize::new(1),
        });

        let header = arena.start();

        if !os::commit_at(header, layout.block_size, MemoryPermission::ReadWrite) {
            return None;
        }

        unsafe {
            header.store_word(&*arena as *const Arena as usize);
        }

        Some(arena)
    }

    pub fn start(&self) -> Address {
        self.reservation.start()
    }

    pub fn area(&self) -> Area {
        self.reservation.start().area_start(self.reservation.size())
    }

    /// Arena containing `addr`. The address has to be classified as
    /// region memory.
    pub fn from_address(addr: Address, arena_size: usize) -> &'static Arena {
        let start = addr.align_down(arena_size);
        let arena = unsafe { start.load_word() } as *const Arena;

        if arena.is_null() {
            panic!("no arena header for region address {}", addr);
        }

        let arena = unsafe { &*arena };
        debug_assert_eq!(arena.start(), start);
        arena
    }

    /// Block containing `addr`, None if that block was never carved.
    pub fn block_at(&self, addr: Address) -> Option<Block> {
        let idx = addr.offset_from(self.start()) / self.layout.block_size;

        if idx == 0 || idx >= self.blocks.len() {
            return None;
        }

        NonNull::new(self.blocks[idx].load(Ordering::Acquire)).map(Block::from_info)
    }

    fn carve(&self) -> Result<Option<Block>, AllocError> {
        let idx = self.next.load(Ordering::Relaxed);

        if idx >= self.blocks.len() {
            return Ok(None);
        }

        let start = self.start().offset(idx * self.layout.block_size);

        if !os::commit_at(start, self.layout.block_size, MemoryPermission::ReadWrite) {
            return Err(AllocError::OutOfMemory {
                size: self.layout.block_size,
            });
        }

        let info = Box::into_raw(Box::new(BlockInfo::new(start, self.layout)));
        self.blocks[idx].store(info, Ordering::Release);
        self.next.store(idx + 1, Ordering::Relaxed);

        Ok(NonNull::new(info).map(Block::from_info))
    }

    pub fn blocks(&self) -> impl Iterator<Item = Block> + '_ {
        let carved = self.next.load(Ordering::Acquire);

        self.blocks[1..carved]
            .iter()
            .filter_map(|info| NonNull::new(info.load(Ordering::Acquire)).map(Block::from_info))
    }

    pub fn carved_blocks(&self) -> usize {
        self.next.load(Ordering::Relaxed) - 1
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        for info in self.blocks.iter() {
            let info = info.swap(ptr::null_mut(), Ordering::AcqRel);

            if !info.is_null() {
                unsafe { drop(Box::from_raw(info)) };
            }
        }
    }
}

/// All arenas of a heap. Guarded by the arena reservation lock.
pub struct ArenaSpace {
    arenas: Vec<Box<Arena>>,
    arena_size: usize,
    layout: BlockLayout,
    reserved: usize,
    limit: usize,
}

impl ArenaSpace {
    pub fn new(arena_size: usize, layout: BlockLayout, limit: usize) -> ArenaSpace {
        assert!(arena_size % layout.block_size == 0);

        ArenaSpace {
            arenas: Vec::new(),
            arena_size,
            layout,
            reserved: 0,
            limit,
        }
    }

    /// Carves a new block from the current arena, reserving another arena
    /// once the current one is exhausted.
    pub fn carve_block(&mut self, classifier: &Classifier) -> Result<Block, AllocError> {
        if let Some(arena) = self.arenas.last() {
            if let Some(block) = arena.carve()? {
                return Ok(block);
            }
        }

        let arena = self.reserve_arena(classifier)?;

        match arena.carve()? {
            Some(block) => Ok(block),
            None => Err(AllocError::OutOfMemory {
                size: self.layout.block_size,
            }),
        }
    }

    fn reserve_arena(&mut self, classifier: &Classifier) -> Result<&Arena, AllocError> {
        let oom = AllocError::OutOfMemory {
            size: self.arena_size,
        };

        if self.reserved + self.arena_size > self.limit {
            debug!(
                "region arenas exhausted at {} reserved",
                formatted_size(self.reserved)
            );
            return Err(oom);
        }

        let arena = Arena::new(self.arena_size, self.layout).ok_or(oom)?;
        classifier.add_arena(arena.start());

        debug!(
            "reserved region arena {} ({})",
            arena.area(),
            formatted_size(self.arena_size)
        );

        self.reserved += self.arena_size;
        self.arenas.push(arena);

        self.arenas.last().map(|arena| &**arena).ok_or(oom)
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.arenas.iter().flat_map(|arena| arena.blocks()).collect()
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    pub fn arenas(&self) -> usize {
        self.arenas.len()
    }

    pub fn carved_blocks(&self) -> usize {
        self.arenas.iter().map(|arena| arena.carved_blocks()).sum()
    }

    pub fn release(&mut self, classifier: &Classifier) {
        for arena in self.arenas.drain(..) {
            classifier.remove_arena(arena.start());
        }

        self.reserved = 0;
    }
}
