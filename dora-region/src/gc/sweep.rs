use fixedbitset::FixedBitSet;
use parking_lot::Mutex;

use crate::gc::block::{Block, BlockState};
use crate::gc::collector::GcPhase;
use crate::gc::freelist::LocalFreeList;
use crate::gc::general::GeneralSweep;
use crate::gc::Address;
use crate::heap::Heap;
use crate::object::Parity;
use crate::os;
use crate::region::Region;

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct EagerSweep {
    pub blocks_swept: usize,
    pub lines_released: usize,
    pub blocks_freed: usize,
    pub blocks_deferred: usize,
    pub blocks_skipped: usize,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullSweep {
    pub blocks_swept: usize,
    pub lines_released: usize,
    pub blocks_freed: usize,
    pub recyclable: usize,
    pub general: GeneralSweep,
}

enum Fate {
    Freed,
    Recyclable,
    Kept,
}

/// Releases all lines of the exiting `region` that no faded object
/// touches. While the collector is marking, the blocks are only unbound
/// and their lines are released at mark termination.
///
/// Blocks that are not bound to `region` anymore are skipped, so sweeping
/// a region a second time does nothing. Needs the safepoint in read mode.
pub fn eager_sweep(heap: &Heap, local: &mut LocalFreeList, region: &Region) -> EagerSweep {
    let marking = heap.phase() == GcPhase::Marking;
    let completed = heap.collector().completed_cycles();
    let mut result = EagerSweep::default();

    for &block in region.blocks() {
        if block.state() != BlockState::Bound || block.generation() != region.generation() {
            result.blocks_skipped += 1;
            continue;
        }

        block.advance_epoch();
        block.unbind();
        result.blocks_swept += 1;

        if marking {
            heap.deferred().push(block);
            result.blocks_deferred += 1;
            continue;
        }

        result.lines_released += release_unfaded_lines(heap, block, completed);

        match reclaim(heap, block) {
            Fate::Freed => {
                local.push(block, heap.free_blocks());
                result.blocks_freed += 1;
            }

            Fate::Recyclable => heap.recyclable().push(block),
            Fate::Kept => {}
        }
    }

    result
}

/// Finishes eager sweeps that ran during marking. Needs the safepoint in
/// write mode with marking terminated.
pub fn release_deferred(heap: &Heap) -> EagerSweep {
    let completed = heap.collector().completed_cycles();
    let mut result = EagerSweep::default();

    for block in heap.deferred().take() {
        debug_assert_eq!(block.state(), BlockState::Unbound);
        result.blocks_swept += 1;
        result.lines_released += release_unfaded_lines(heap, block, completed);

        match reclaim(heap, block) {
            Fate::Freed => {
                heap.free_blocks().push(block);
                result.blocks_freed += 1;
            }

            Fate::Recyclable => heap.recyclable().push(block),
            Fate::Kept => {}
        }
    }

    result
}

fn release_unfaded_lines(heap: &Heap, block: Block, completed: u64) -> usize {
    let poison = heap.flags().poison;
    let mut released = 0;

    for line in block.allocated_lines() {
        if block.line_has_fade(line) {
            continue;
        }

        record_deaths(heap, block, line, completed);
        block.release_line(line, poison);
        released += 1;
    }

    released
}

fn record_deaths(heap: &Heap, block: Block, line: usize, completed: u64) {
    let diagnostics = heap.diagnostics();

    if diagnostics.is_profiling() {
        diagnostics.record_deaths(&block.objects_in_lines(line, line + 1), completed);
    }
}

// Decides where an unbound block goes after sweeping.
fn reclaim(heap: &Heap, block: Block) -> Fate {
    debug_assert_eq!(block.state(), BlockState::Unbound);

    if block.is_empty() {
        if block.transition(BlockState::Unbound, BlockState::Free) {
            discard(heap, block);
            return Fate::Freed;
        }

        return Fate::Kept;
    }

    if block.is_full() {
        Fate::Kept
    } else {
        Fate::Recyclable
    }
}

fn discard(heap: &Heap, block: Block) {
    let block_size = heap.layout().block_size;

    if heap.flags().poison || !block.start().is_os_page_aligned() {
        return;
    }

    if block_size % os::page_size() == 0 {
        os::discard(block.start(), block_size);
    }
}

#[derive(Default)]
struct SweepParts {
    lines_released: usize,
    freed: Vec<Block>,
    recyclable: Vec<Block>,
}

/// Releases every line without a mark of `parity` in all region blocks and
/// rebuilds the recyclable list, then sweeps the general heap. Needs the
/// safepoint in write mode with marking terminated.
pub fn full_sweep(heap: &Heap, parity: Parity) -> FullSweep {
    let completed = heap.collector().completed_cycles();

    heap.recyclable().take();

    let blocks: Vec<Block> = heap
        .blocks()
        .into_iter()
        .filter(|block| block.state() != BlockState::Free)
        .collect();

    let workers = heap.flags().gc_workers().max(1).min(blocks.len().max(1));
    let parts: Mutex<SweepParts> = Mutex::new(SweepParts::default());

    {
        let blocks = &blocks;
        let parts = &parts;
        let mut pool = heap.collector().pool(heap.flags().gc_workers());

        pool.scoped(|scoped| {
            for worker in 0..workers {
                scoped.execute(move || {
                    let mut local = SweepParts::default();

                    for &block in blocks.iter().skip(worker).step_by(workers) {
                        local.lines_released += sweep_block(heap, block, parity, completed);

                        if block.state() != BlockState::Unbound {
                            continue;
                        }

                        match reclaim(heap, block) {
                            Fate::Freed => local.freed.push(block),
                            Fate::Recyclable => local.recyclable.push(block),
                            Fate::Kept => {}
                        }
                    }

                    let mut parts = parts.lock();
                    parts.lines_released += local.lines_released;
                    parts.freed.append(&mut local.freed);
                    parts.recyclable.append(&mut local.recyclable);
                });
            }
        });
    }

    let mut parts = parts.into_inner();

    let result = FullSweep {
        blocks_swept: blocks.len(),
        lines_released: parts.lines_released,
        blocks_freed: parts.freed.len(),
        recyclable: parts.recyclable.len(),
        general: sweep_general(heap, parity, completed),
    };

    heap.free_blocks().append(&mut parts.freed);
    heap.recyclable().append(&mut parts.recyclable);

    result
}

fn sweep_block(heap: &Heap, block: Block, parity: Parity, completed: u64) -> usize {
    let poison = heap.flags().poison;
    let mut dead = FixedBitSet::with_capacity(heap.layout().lines());

    for line in block.allocated_lines() {
        if !block.is_line_marked(line, parity) {
            dead.insert(line);
        }
    }

    for line in dead.ones() {
        record_deaths(heap, block, line, completed);
        block.release_line(line, poison);
    }

    // the other mark bit is used by the next cycle
    for object in block.objects() {
        object.to_obj().header().clear_mark(parity.other());
    }

    block.clear_line_marks(parity.other());

    dead.count_ones(..)
}

fn sweep_general(heap: &Heap, parity: Parity, completed: u64) -> GeneralSweep {
    let diagnostics = heap.diagnostics();

    heap.general().sweep(parity, |addr: Address| {
        diagnostics.record_death(addr, completed);
    })
}
