use std::convert::TryFrom;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crossbeam_deque::Injector;
use log::info;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use scoped_threadpool::Pool;

use crate::gc::marking::{self, MarkStats, Marker, WorkItem};
use crate::gc::sweep::{self, EagerSweep, FullSweep};
use crate::gc::verify::{Verifier, VerifierPhase};
use crate::gc::{GcReason, Slot};
use crate::heap::Heap;
use crate::object::Parity;
use crate::timer::Timer;

#[derive(Copy, Clone, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum GcPhase {
    Idle = 0,
    Marking = 1,
    Sweeping = 2,
}

#[derive(Default)]
struct CycleState {
    reason: Option<GcReason>,
    marking: MarkStats,
    start_pause: f32,
}

/// State machine of the tracing collector. Phase changes only happen with
/// the safepoint held in write mode.
pub struct Collector {
    phase: AtomicU8,
    cycle: AtomicU64,
    completed: AtomicU64,
    grey: Injector<WorkItem>,
    pool: Mutex<Option<Pool>>,
    state: Mutex<CycleState>,
}

impl Collector {
    pub fn new() -> Collector {
        Collector {
            phase: AtomicU8::new(GcPhase::Idle.into()),
            cycle: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            grey: Injector::new(),
            pool: Mutex::new(None),
            state: Mutex::new(CycleState::default()),
        }
    }

    pub fn phase(&self) -> GcPhase {
        let raw = self.phase.load(Ordering::Acquire);
        GcPhase::try_from(raw).unwrap_or_else(|_| panic!("corrupted GC phase {}", raw))
    }

    fn set_phase(&self, phase: GcPhase) {
        self.phase.store(phase.into(), Ordering::Release);
    }

    /// Number of the current (or last) cycle.
    pub fn cycle(&self) -> u64 {
        self.cycle.load(Ordering::Acquire)
    }

    pub fn parity(&self) -> Parity {
        Parity::of_cycle(self.cycle())
    }

    pub fn completed_cycles(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn grey(&self) -> &Injector<WorkItem> {
        &self.grey
    }

    pub(crate) fn pool(&self, workers: usize) -> MappedMutexGuard<'_, Pool> {
        MutexGuard::map(self.pool.lock(), |pool| {
            pool.get_or_insert_with(|| Pool::new(workers as u32))
        })
    }

    fn record_marking(&self, stats: MarkStats) {
        let mut state = self.state.lock();
        state.marking.traced += stats.traced;
        state.marking.stale += stats.stale;
    }
}

impl Default for Collector {
    fn default() -> Collector {
        Collector::new()
    }
}

#[derive(Clone, Debug)]
pub struct CycleSummary {
    pub cycle: u64,
    pub reason: Option<GcReason>,
    pub traced: usize,
    pub stale: usize,
    pub deferred: EagerSweep,
    pub sweep: FullSweep,
    pub start_pause: f32,
    pub finish_pause: f32,
}

fn shade_roots(heap: &Heap, roots: &[Slot], parity: Parity) {
    let grey = heap.collector().grey();

    for root in roots {
        if let Some(item) = marking::shade(heap, root.get(), parity) {
            grey.push(item);
        }
    }
}

fn drain(heap: &Heap, budget: usize) -> usize {
    let collector = heap.collector();
    let stats = Marker::new(heap, collector.parity(), collector.grey()).run(budget);
    collector.record_marking(stats);
    stats.traced
}

pub fn start_cycle(heap: &Heap, roots: &[Slot], reason: GcReason) -> bool {
    let _safepoint = heap.safepoint().write();
    let collector = heap.collector();

    if collector.phase() != GcPhase::Idle {
        return false;
    }

    let mut timer = Timer::new(true);
    let cycle = collector.cycle.fetch_add(1, Ordering::AcqRel) + 1;
    let parity = Parity::of_cycle(cycle);

    collector.set_phase(GcPhase::Marking);
    shade_roots(heap, roots, parity);

    let pause = timer.stop();

    {
        let mut state = collector.state.lock();
        *state = CycleState {
            reason: Some(reason),
            marking: MarkStats::default(),
            start_pause: pause,
        };
    }

    heap.diagnostics().record_pause(pause);

    if heap.flags().gc_verbose {
        info!(
            "GC: start cycle {} ({}), {} roots, pause {:.1}ms",
            cycle,
            reason,
            roots.len(),
            pause
        );
    }

    true
}

/// Marks concurrently with mutators, at most `budget` objects.
pub fn mark_step(heap: &Heap, budget: usize) -> usize {
    let _safepoint = heap.safepoint().read();

    if heap.collector().phase() != GcPhase::Marking {
        return 0;
    }

    drain(heap, budget)
}

pub fn finish_cycle(heap: &Heap, roots: &[Slot]) -> Option<CycleSummary> {
    let _safepoint = heap.safepoint().write();
    let collector = heap.collector();

    if collector.phase() != GcPhase::Marking {
        return None;
    }

    let mut timer = Timer::new(true);
    let cycle = collector.cycle();
    let parity = collector.parity();

    shade_roots(heap, roots, parity);
    drain(heap, usize::MAX);
    debug_assert!(collector.grey().is_empty());

    collector.set_phase(GcPhase::Sweeping);

    if heap.flags().gc_verify {
        Verifier::new(heap, roots, parity, VerifierPhase::PreSweep).verify();
    }

    let deferred = sweep::release_deferred(heap);
    let full = sweep::full_sweep(heap, parity);

    if heap.flags().gc_verify {
        Verifier::new(heap, roots, parity, VerifierPhase::PostSweep).verify();
    }

    collector.completed.fetch_add(1, Ordering::AcqRel);
    collector.set_phase(GcPhase::Idle);

    let pause = timer.stop();
    let state = std::mem::take(&mut *collector.state.lock());

    let diagnostics = heap.diagnostics();
    diagnostics.record_pause(pause);
    diagnostics.record_deferred_release(&deferred);
    diagnostics.record_full_sweep(&full);

    if heap.flags().gc_verbose {
        info!(
            "GC: full sweep cycle {}: traced {} (stale {}), lines {} -> free, blocks {} -> free, {} recyclable, deferred {} blocks, general {} freed, pause {:.1}ms",
            cycle,
            state.marking.traced,
            state.marking.stale,
            full.lines_released + deferred.lines_released,
            full.blocks_freed + deferred.blocks_freed,
            full.recyclable,
            deferred.blocks_swept,
            full.general.freed_objects,
            pause
        );
    }

    Some(CycleSummary {
        cycle,
        reason: state.reason,
        traced: state.marking.traced,
        stale: state.marking.stale,
        deferred,
        sweep: full,
        start_pause: state.start_pause,
        finish_pause: pause,
    })
}

/// Runs a whole cycle. A cycle already in progress is finished first.
pub fn collect(heap: &Heap, roots: &[Slot], reason: GcReason) -> CycleSummary {
    loop {
        start_cycle(heap, roots, reason);

        if let Some(summary) = finish_cycle(heap, roots) {
            return summary;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::RegionFlags;
    use crate::gc::root::RootSet;
    use crate::gc::M;
    use crate::object::Class;
    use std::sync::Arc;

    fn heap() -> Arc<Heap> {
        let mut flags = RegionFlags::enabled();
        flags.arena_size = M;
        flags.gc_verify = true;
        Heap::new(flags).expect("heap")
    }

    #[test]
    fn phases_follow_cycle() {
        let heap = heap();
        let roots = RootSet::new(1);

        assert_eq!(heap.phase(), GcPhase::Idle);
        assert!(heap.finish_cycle(&roots.slots()).is_none());
        assert!(heap.start_cycle(&roots.slots(), GcReason::ForceCollect));
        assert_eq!(heap.phase(), GcPhase::Marking);
        assert!(!heap.start_cycle(&roots.slots(), GcReason::ForceCollect));

        let summary = heap.finish_cycle(&roots.slots()).expect("running cycle");
        assert_eq!(summary.cycle, 1);
        assert_eq!(summary.reason, Some(GcReason::ForceCollect));
        assert_eq!(heap.phase(), GcPhase::Idle);
        assert_eq!(heap.collector().completed_cycles(), 1);
    }

    #[test]
    fn collect_frees_unreachable_general_objects() {
        let heap = heap();
        let class = Class::with_ref_fields("Node", 1);
        let roots = RootSet::new(1);

        let live = heap.general().allocate(class, None).expect("alloc");
        let child = heap.general().allocate(class, None).expect("alloc");
        heap.general().allocate(class, None).expect("alloc");
        live.to_obj().field(1).set(child);
        roots.slot(0).set(live);

        let summary = heap.collect(&roots.slots(), GcReason::ForceCollect);

        assert_eq!(summary.traced, 2);
        assert_eq!(summary.sweep.general.freed_objects, 1);
        assert!(heap.general().contains(live));
        assert!(heap.general().contains(child));

        // survivors keep working in the next cycle with the other parity
        let summary = heap.collect(&roots.slots(), GcReason::ForceCollect);
        assert_eq!(summary.cycle, 2);
        assert_eq!(summary.sweep.general.freed_objects, 0);
        assert_eq!(heap.general().len(), 2);
    }

    #[test]
    fn mark_steps_are_bounded() {
        let heap = heap();
        let class = Class::with_ref_fields("Node", 1);
        let roots = RootSet::new(3);

        for idx in 0..3 {
            let obj = heap.general().allocate(class, None).expect("alloc");
            roots.slot(idx).set(obj);
        }

        assert_eq!(heap.mark_step(10), 0);
        assert!(heap.start_cycle(&roots.slots(), GcReason::Stress));
        assert_eq!(heap.mark_step(2), 2);
        assert_eq!(heap.mark_step(10), 1);
        assert_eq!(heap.mark_step(10), 0);

        let summary = heap.finish_cycle(&roots.slots()).expect("running cycle");
        assert_eq!(summary.traced, 3);
        assert_eq!(summary.sweep.general.freed_objects, 0);
    }
}
