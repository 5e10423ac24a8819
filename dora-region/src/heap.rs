use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use lazy_static::lazy_static;
use log::{debug, error, info};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::diagnostics::Diagnostics;
use crate::flags::{FlagsError, RegionFlags};
use crate::gc::arena::{Arena, ArenaSpace};
use crate::gc::block::{Block, BlockLayout, BlockState};
use crate::gc::classifier::Classifier;
use crate::gc::collector::{self, Collector, CycleSummary, GcPhase};
use crate::gc::freelist::{BlockList, LocalFreeList};
use crate::gc::general::GeneralHeap;
use crate::gc::{formatted_size, Address, AllocError, GcReason, Slot};

lazy_static! {
    static ref DEFAULT_HEAP: Arc<Heap> = create_default_heap();
}

fn create_default_heap() -> Arc<Heap> {
    let flags = RegionFlags::from_env().unwrap_or_else(|err| {
        error!("ignoring invalid region options: {}", err);
        RegionFlags::default()
    });

    match Heap::new(flags) {
        Ok(heap) => heap,
        Err(err) => panic!("could not create default heap: {}", err),
    }
}

/// Process-wide heap configured from the environment, used by the
/// thread-local region API.
pub fn default_heap() -> Arc<Heap> {
    DEFAULT_HEAP.clone()
}

#[derive(Debug, Error)]
pub enum HeapError {
    #[error(transparent)]
    Flags(#[from] FlagsError),
    #[error("could not reserve the region classifier for {arena_size} byte arenas")]
    Classifier { arena_size: usize },
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BlockUse {
    /// Cursor for small objects, may reuse partially free blocks.
    Main,
    /// Cursor for medium objects, always starts on an empty block.
    Secondary,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapStats {
    pub arenas: usize,
    pub reserved: usize,
    pub carved_blocks: usize,
    pub free_blocks: usize,
    pub recyclable_blocks: usize,
    pub deferred_blocks: usize,
    pub general_objects: usize,
    pub general_bytes: usize,
}

pub struct Heap {
    flags: RegionFlags,
    layout: BlockLayout,
    classifier: Classifier,
    arenas: Mutex<ArenaSpace>,
    free_blocks: BlockList,
    recyclable: BlockList,
    deferred: BlockList,
    general: GeneralHeap,
    collector: Collector,
    safepoint: RwLock<()>,
    next_generation: AtomicU64,
    next_thread: AtomicUsize,
    diagnostics: Diagnostics,
}

impl Heap {
    pub fn new(flags: RegionFlags) -> Result<Arc<Heap>, HeapError> {
        flags.validate()?;

        let classifier = Classifier::new(flags.arena_size).ok_or(HeapError::Classifier {
            arena_size: flags.arena_size,
        })?;

        let layout = BlockLayout::new(&flags);
        let arenas = ArenaSpace::new(flags.arena_size, layout, flags.max_region_memory);

        if flags.gc_verbose {
            info!(
                "GC: regions {}, block {}, line {}, large objects > {}, arena {}",
                if flags.enabled { "enabled" } else { "disabled" },
                formatted_size(flags.block_size),
                formatted_size(flags.line_size),
                formatted_size(flags.large_object_threshold),
                formatted_size(flags.arena_size),
            );
        }

        Ok(Arc::new(Heap {
            layout,
            classifier,
            arenas: Mutex::new(arenas),
            free_blocks: BlockList::new(),
            recyclable: BlockList::new(),
            deferred: BlockList::new(),
            general: GeneralHeap::new(),
            collector: Collector::new(),
            safepoint: RwLock::new(()),
            next_generation: AtomicU64::new(1),
            next_thread: AtomicUsize::new(1),
            diagnostics: Diagnostics::new(flags.profile),
            flags,
        }))
    }

    pub fn flags(&self) -> &RegionFlags {
        &self.flags
    }

    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn general(&self) -> &GeneralHeap {
        &self.general
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub(crate) fn safepoint(&self) -> &RwLock<()> {
        &self.safepoint
    }

    pub(crate) fn free_blocks(&self) -> &BlockList {
        &self.free_blocks
    }

    pub(crate) fn recyclable(&self) -> &BlockList {
        &self.recyclable
    }

    pub(crate) fn deferred(&self) -> &BlockList {
        &self.deferred
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_thread(&self) -> usize {
        self.next_thread.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns true if `addr` points into region memory.
    #[inline(always)]
    pub fn is_region_address(&self, addr: Address) -> bool {
        self.classifier.contains(addr)
    }

    /// Block containing a region address, None for all other addresses.
    pub fn find_block(&self, addr: Address) -> Option<Block> {
        if !self.classifier.contains(addr) {
            return None;
        }

        Some(self.block_of(addr))
    }

    /// Block containing `addr`. The address needs to be classified as
    /// region memory, failing to resolve its block is fatal.
    pub fn block_of(&self, addr: Address) -> Block {
        debug_assert!(self.classifier.contains(addr));
        let arena = Arena::from_address(addr, self.flags.arena_size);

        arena
            .block_at(addr)
            .unwrap_or_else(|| panic!("no block for region address {}", addr))
    }

    /// Start of the region object containing `addr`.
    pub fn object_start(&self, block: Block, addr: Address) -> Address {
        block.object_start(addr).unwrap_or_else(|| {
            panic!(
                "object start bitmap of block {} has no object for {}",
                block.area(),
                addr
            )
        })
    }

    /// Returns true if `addr` is a live region object that escaped.
    pub fn is_faded(&self, addr: Address) -> bool {
        match self.find_block(addr) {
            Some(block) => block.state() != BlockState::Free && block.is_faded(addr),
            None => false,
        }
    }

    /// Generation of the region owning `addr`, None if the address is not
    /// in a bound block.
    pub fn region_of(&self, addr: Address) -> Option<u64> {
        let block = self.find_block(addr)?;

        if block.state() == BlockState::Bound {
            Some(block.generation())
        } else {
            None
        }
    }

    /// Hands out a block for a region cursor and binds it to region
    /// `generation` of `thread`.
    pub(crate) fn acquire_block(
        &self,
        local: &mut LocalFreeList,
        purpose: BlockUse,
        thread: usize,
        generation: u64,
    ) -> Result<Block, AllocError> {
        let (block, from) = self.find_free_block(local, purpose)?;

        if !block.bind(from, thread, generation) {
            panic!(
                "block {} changed state while being acquired from {:?}",
                block.area(),
                from
            );
        }

        debug!(
            "region {} of thread {} acquired block {} ({:?}, from {:?})",
            generation,
            thread,
            block.area(),
            purpose,
            from
        );

        Ok(block)
    }

    fn find_free_block(
        &self,
        local: &mut LocalFreeList,
        purpose: BlockUse,
    ) -> Result<(Block, BlockState), AllocError> {
        if let Some(block) = local.pop().or_else(|| self.free_blocks.pop()) {
            debug_assert!(block.has_clean_metadata());
            return Ok((block, BlockState::Free));
        }

        if purpose == BlockUse::Main {
            while let Some(block) = self.recyclable.pop() {
                if block.state() == BlockState::Unbound && !block.is_full() {
                    return Ok((block, BlockState::Unbound));
                }
            }
        }

        let block = self.arenas.lock().carve_block(&self.classifier)?;
        Ok((block, BlockState::Free))
    }

    /// All carved blocks of all arenas.
    pub fn blocks(&self) -> Vec<Block> {
        self.arenas.lock().blocks()
    }

    pub fn stats(&self) -> HeapStats {
        let arenas = self.arenas.lock();

        HeapStats {
            arenas: arenas.arenas(),
            reserved: arenas.reserved(),
            carved_blocks: arenas.carved_blocks(),
            free_blocks: self.free_blocks.len(),
            recyclable_blocks: self.recyclable.len(),
            deferred_blocks: self.deferred.len(),
            general_objects: self.general.len(),
            general_bytes: self.general.allocated_bytes(),
        }
    }

    pub fn phase(&self) -> GcPhase {
        self.collector.phase()
    }

    /// Stops the world, shades `roots` and starts concurrent marking.
    /// Returns false if a cycle is already running.
    pub fn start_cycle(&self, roots: &[Slot], reason: GcReason) -> bool {
        collector::start_cycle(self, roots, reason)
    }

    /// Processes up to `budget` grey objects, concurrently with mutators.
    pub fn mark_step(&self, budget: usize) -> usize {
        collector::mark_step(self, budget)
    }

    /// Stops the world, finishes marking and sweeps. Returns None if no
    /// cycle was running.
    pub fn finish_cycle(&self, roots: &[Slot]) -> Option<CycleSummary> {
        collector::finish_cycle(self, roots)
    }

    /// Runs a complete marking and sweeping cycle.
    pub fn collect(&self, roots: &[Slot], reason: GcReason) -> CycleSummary {
        collector::collect(self, roots, reason)
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if self.flags.gc_stats {
            println!("{}", self.diagnostics.report());
        }

        self.arenas.get_mut().release(&self.classifier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::M;

    fn heap() -> Arc<Heap> {
        let mut flags = RegionFlags::enabled();
        flags.arena_size = M;
        flags.max_region_memory = 2 * M;
        Heap::new(flags).expect("heap")
    }

    #[test]
    fn invalid_flags_are_rejected() {
        let mut flags = RegionFlags::enabled();
        flags.line_size = 100;
        assert!(matches!(
            Heap::new(flags),
            Err(HeapError::Flags(FlagsError::NotPowerOfTwo { .. }))
        ));
    }

    #[test]
    fn acquire_prefers_local_then_global_blocks() {
        let heap = heap();
        let mut local = LocalFreeList::new(1);

        let carved = heap
            .acquire_block(&mut local, BlockUse::Main, 1, 1)
            .expect("block");
        assert_eq!(carved.state(), BlockState::Bound);
        assert_eq!(heap.region_of(carved.start()), Some(1));
        assert_eq!(heap.block_of(carved.start().offset(64)), carved);

        carved.unbind();
        assert!(carved.transition(BlockState::Unbound, BlockState::Free));
        heap.free_blocks().push(carved);

        let reused = heap
            .acquire_block(&mut local, BlockUse::Secondary, 1, 2)
            .expect("block");
        assert_eq!(reused, carved);
        assert_eq!(reused.generation(), 2);
        assert!(heap.free_blocks().is_empty());
    }

    #[test]
    fn secondary_blocks_skip_recyclable_list() {
        let heap = heap();
        let mut local = LocalFreeList::new(1);

        let block = heap
            .acquire_block(&mut local, BlockUse::Main, 1, 1)
            .expect("block");
        block.record_object(block.start(), 16);
        block.unbind();
        heap.recyclable().push(block);

        let secondary = heap
            .acquire_block(&mut local, BlockUse::Secondary, 1, 2)
            .expect("block");
        assert_ne!(secondary, block);

        let main = heap
            .acquire_block(&mut local, BlockUse::Main, 1, 2)
            .expect("block");
        assert_eq!(main, block);
        assert_eq!(heap.stats().carved_blocks, 2);
    }

    #[test]
    fn region_memory_is_capped() {
        let heap = heap();
        let mut local = LocalFreeList::new(0);
        let mut result = Ok(());

        // two arenas with 127 usable blocks each
        for _ in 0..255 {
            if let Err(err) = heap.acquire_block(&mut local, BlockUse::Main, 1, 1) {
                result = Err(err);
                break;
            }
        }

        assert_eq!(result, Err(AllocError::OutOfMemory { size: M }));
        assert_eq!(heap.stats().carved_blocks, 254);
    }

    #[test]
    fn unclassified_addresses_have_no_block() {
        let heap = heap();
        let local = 0usize;
        let addr = Address::from_ptr(&local);

        assert!(!heap.is_region_address(addr));
        assert_eq!(heap.find_block(addr), None);
        assert_eq!(heap.region_of(addr), None);
        assert!(!heap.is_faded(addr));
    }
}
