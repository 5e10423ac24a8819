use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::Arc;

use log::trace;

use crate::barrier::{self, Escape};
use crate::diagnostics::Site;
use crate::gc::collector::GcPhase;
use crate::gc::freelist::LocalFreeList;
use crate::gc::marking;
use crate::gc::sweep::{self, EagerSweep};
use crate::gc::{Address, AllocError, Slot};
use crate::heap::{default_heap, Heap};
use crate::object::{Class, Obj};
use crate::region::Region;

/// Allocation and write barrier state of one thread.
pub struct Mutator {
    heap: Arc<Heap>,
    thread: usize,
    regions: Vec<Region>,
    local_free: LocalFreeList,
}

impl Mutator {
    pub fn new(heap: Arc<Heap>) -> Mutator {
        let thread = heap.register_thread();
        let local_free = LocalFreeList::new(heap.flags().local_free_blocks);

        Mutator {
            heap,
            thread,
            regions: Vec::new(),
            local_free,
        }
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn thread_id(&self) -> usize {
        self.thread
    }

    pub fn region_depth(&self) -> usize {
        self.regions.len()
    }

    pub fn in_region(&self) -> bool {
        !self.regions.is_empty()
    }

    /// Innermost region, also when it is suspended.
    pub fn current_region(&self) -> Option<&Region> {
        self.regions.last()
    }

    pub fn current_generation(&self) -> Option<u64> {
        self.regions.last().map(|region| region.generation())
    }

    pub fn local_free_blocks(&self) -> usize {
        self.local_free.len()
    }

    pub fn is_faded(&self, obj: Address) -> bool {
        self.heap.is_faded(obj)
    }

    pub fn region_of(&self, obj: Address) -> Option<u64> {
        self.heap.region_of(obj)
    }

    /// Allocates an instance of `class`: in the innermost region if there
    /// is one and the object is small enough, otherwise in the general heap.
    #[track_caller]
    pub fn allocate(&mut self, class: &'static Class) -> Result<Address, AllocError> {
        self.allocate_at(class, Location::caller())
    }

    pub(crate) fn allocate_at(
        &mut self,
        class: &'static Class,
        site: Site,
    ) -> Result<Address, AllocError> {
        let heap: &Heap = &self.heap;
        let _safepoint = heap.safepoint().read();

        let collector = heap.collector();
        let black = if collector.phase() == GcPhase::Marking {
            Some(collector.parity())
        } else {
            None
        };
        let completed = collector.completed_cycles();
        let size = class.size();

        let region = match self.regions.last_mut() {
            Some(region) if heap.flags().enabled && !region.is_suspended() => {
                if size <= heap.flags().large_object_threshold {
                    Some(region)
                } else {
                    heap.diagnostics().record_skip(site);
                    None
                }
            }

            _ => None,
        };

        let region = match region {
            Some(region) => region,
            None => {
                let addr = heap.general().allocate(class, black)?;
                heap.diagnostics().record_general_object(addr, size, site, completed);
                return Ok(addr);
            }
        };

        let (addr, block) = region.allocate(heap, &mut self.local_free, size)?;
        Obj::initialize(addr, class, black);
        block.record_object(addr, size);

        if let Some(parity) = black {
            block.mark_lines(addr, size, parity);
        }

        heap.diagnostics().record_region_object(addr, size, site, completed);
        Ok(addr)
    }

    pub fn read_ref(&self, obj: Address, field: usize) -> Address {
        obj.to_obj().field(field).get()
    }

    /// Stores `value` into reference field `field` of `obj`.
    #[track_caller]
    pub fn write_ref(&self, obj: Address, field: usize, value: Address) {
        let slot = obj.to_obj().field(field);
        self.write_slot_at(slot, value, Location::caller());
    }

    /// Stores `value` into a heap or global slot. Only stack slots of
    /// frames inside the innermost region may be written with `Slot::set`
    /// directly, slots of enclosing frames go through here.
    #[track_caller]
    pub fn write_slot(&self, slot: Slot, value: Address) {
        self.write_slot_at(slot, value, Location::caller());
    }

    pub(crate) fn write_slot_at(&self, slot: Slot, value: Address, site: Site) {
        let heap: &Heap = &self.heap;
        let _safepoint = heap.safepoint().read();
        let collector = heap.collector();

        if collector.phase() == GcPhase::Marking {
            if let Some(item) = marking::shade(heap, value, collector.parity()) {
                collector.grey().push(item);
            }
        }

        if self.in_region() {
            if let Some((block, start)) =
                barrier::fade_target(heap, self.thread, slot.address(), value)
            {
                let faded = barrier::fade(heap, self.thread, block, start);
                heap.diagnostics().record_fade(site, faded);
            }
        }

        slot.set(value);
    }

    /// Runs `body` in a fresh region. The region is swept when `body`
    /// returns or unwinds.
    ///
    /// Region objects referenced by the result are faded before the sweep.
    /// Any other reference leaving `body` has to be stored with
    /// `write_slot` or `write_ref`.
    #[track_caller]
    pub fn enter_region<R, F>(&mut self, body: F) -> R
    where
        R: Escape,
        F: FnOnce(&mut Mutator) -> R,
    {
        let site = Location::caller();
        let generation = self.push_region();
        let result = panic::catch_unwind(AssertUnwindSafe(|| body(&mut *self)));

        if let Ok(value) = &result {
            self.fade_escaping_at(value, generation, site);
        }

        self.exit_region(generation);

        match result {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Fades the objects of region `generation`, and of regions nested in
    /// it, that `value` hands to the enclosing frame. Returns the number of
    /// newly faded objects.
    pub(crate) fn fade_escaping_at<V>(&self, value: &V, generation: u64, site: Site) -> usize
    where
        V: Escape + ?Sized,
    {
        let heap: &Heap = &self.heap;
        let _safepoint = heap.safepoint().read();
        let mut faded = 0;

        value.visit_addresses(&mut |addr| {
            if let Some((block, start)) =
                barrier::escape_target(heap, self.thread, generation, addr)
            {
                faded += barrier::fade(heap, self.thread, block, start);
            }
        });

        if faded > 0 {
            heap.diagnostics().record_fade(site, faded);
        }

        faded
    }

    /// Runs `body` with region allocation suspended. Outside of a region
    /// this just runs `body`.
    pub fn ignore<R, F>(&mut self, body: F) -> R
    where
        F: FnOnce(&mut Mutator) -> R,
    {
        let previous = self.suspend_region();
        let result = panic::catch_unwind(AssertUnwindSafe(|| body(&mut *self)));
        self.restore_region(previous);

        match result {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Installs a new innermost region and returns its generation.
    pub fn push_region(&mut self) -> u64 {
        let generation = self.heap.next_generation();
        let entered = self.heap.collector().completed_cycles();
        self.regions
            .push(Region::new(generation, self.thread, entered));

        trace!(
            "thread {} entered region {} (depth {})",
            self.thread,
            generation,
            self.regions.len()
        );

        generation
    }

    /// Removes the innermost region, which has to be `generation`, sweeps
    /// it and makes the outer region current again.
    pub fn exit_region(&mut self, generation: u64) -> Region {
        let region = self.pop_region(generation);
        let result = self.eager_sweep(&region);

        let cycles = self
            .heap
            .collector()
            .completed_cycles()
            .saturating_sub(region.entered_cycle());
        self.heap.diagnostics().record_region_exit(cycles);

        trace!(
            "thread {} exited region {}: {} objects, {} blocks swept, {} lines released",
            self.thread,
            generation,
            region.allocated_objects(),
            result.blocks_swept,
            result.lines_released
        );

        region
    }

    fn pop_region(&mut self, generation: u64) -> Region {
        match self.regions.pop() {
            Some(region) if region.generation() == generation => region,
            Some(region) => panic!(
                "exiting region {} while region {} is innermost",
                generation,
                region.generation()
            ),
            None => panic!("exiting region {} without active region", generation),
        }
    }

    /// Eagerly sweeps the blocks of `region`. Sweeping the same region
    /// again is a no-op.
    pub fn eager_sweep(&mut self, region: &Region) -> EagerSweep {
        let heap: &Heap = &self.heap;
        let _safepoint = heap.safepoint().read();
        let result = sweep::eager_sweep(heap, &mut self.local_free, region);

        if result.blocks_swept > 0 {
            heap.diagnostics().record_eager_sweep(&result);
        }

        result
    }

    /// Suspends the innermost region. Returns its previous suspension state,
    /// None outside of a region.
    pub fn suspend_region(&mut self) -> Option<bool> {
        self.regions
            .last_mut()
            .map(|region| region.set_suspended(true))
    }

    pub fn restore_region(&mut self, previous: Option<bool>) {
        if let (Some(suspended), Some(region)) = (previous, self.regions.last_mut()) {
            region.set_suspended(suspended);
        }
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        while let Some(region) = self.regions.pop() {
            self.eager_sweep(&region);
        }

        self.local_free.flush(self.heap.free_blocks());
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Mutator>> = RefCell::new(None);
}

/// Runs `f` with the mutator of the current thread, created on first use
/// for the default heap.
pub fn with_current<R, F>(f: F) -> R
where
    F: FnOnce(&mut Mutator) -> R,
{
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        let mutator = current.get_or_insert_with(|| Mutator::new(default_heap()));
        f(mutator)
    })
}

/// Allocates with the mutator of the current thread.
#[track_caller]
pub fn allocate(class: &'static Class) -> Result<Address, AllocError> {
    let site = Location::caller();
    with_current(|mutator| mutator.allocate_at(class, site))
}

/// Stores a reference with the mutator of the current thread.
#[track_caller]
pub fn write_ref(obj: Address, field: usize, value: Address) {
    let site = Location::caller();
    with_current(|mutator| {
        let slot = obj.to_obj().field(field);
        mutator.write_slot_at(slot, value, site)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::RegionFlags;
    use crate::gc::M;

    fn mutator() -> Mutator {
        let mut flags = RegionFlags::enabled();
        flags.arena_size = M;
        Mutator::new(Heap::new(flags).expect("heap"))
    }

    #[test]
    fn allocation_outside_region_uses_general_heap() {
        let mut mutator = mutator();
        let class = Class::with_ref_fields("Node", 1);
        let obj = mutator.allocate(class).expect("alloc");

        assert!(mutator.heap().general().contains(obj));
        assert_eq!(mutator.region_of(obj), None);
    }

    #[test]
    fn allocation_inside_region_uses_blocks() {
        let mut mutator = mutator();
        let class = Class::with_ref_fields("Node", 1);

        mutator.enter_region(|m| {
            let obj = m.allocate(class).expect("alloc");
            assert_eq!(m.region_of(obj), m.current_generation());
            assert_eq!(m.heap().diagnostics().region_objects(), 1);
        });

        assert!(!mutator.in_region());
    }

    #[test]
    fn disabled_regions_allocate_in_general_heap() {
        let mut flags = RegionFlags::default();
        flags.arena_size = M;
        let mut mutator = Mutator::new(Heap::new(flags).expect("heap"));
        let class = Class::with_ref_fields("Node", 1);

        mutator.enter_region(|m| {
            let obj = m.allocate(class).expect("alloc");
            assert!(m.heap().general().contains(obj));
        });
    }

    #[test]
    fn ignore_suspends_and_restores() {
        let mut mutator = mutator();
        let class = Class::with_ref_fields("Node", 1);

        assert_eq!(mutator.ignore(|m| m.region_depth()), 0);

        mutator.enter_region(|m| {
            let general = m.ignore(|m| m.allocate(class).expect("alloc"));
            assert!(m.heap().general().contains(general));

            let region = m.allocate(class).expect("alloc");
            assert!(m.region_of(region).is_some());
        });
    }

    #[test]
    fn returned_objects_fade() {
        let mut mutator = mutator();
        let class = Class::with_ref_fields("Node", 1);

        let (obj, alloc) = mutator.enter_region(|m| {
            let obj = m.allocate(class).expect("alloc");
            assert!(!m.is_faded(obj));
            (obj, m.allocate(class))
        });

        let alloc = alloc.expect("alloc");
        assert!(mutator.is_faded(obj));
        assert!(mutator.is_faded(alloc));
        assert_eq!(mutator.heap().diagnostics().faded_objects(), 2);
    }

    #[test]
    fn returning_outer_objects_keeps_them_blue() {
        let mut mutator = mutator();
        let class = Class::with_ref_fields("Node", 1);

        mutator.enter_region(|m| {
            let outer = m.allocate(class).expect("alloc");
            let same = m.enter_region(|_| outer);

            assert_eq!(same, outer);
            assert!(!m.is_faded(outer));
        });
    }

    #[test]
    #[should_panic(expected = "without active region")]
    fn exiting_unknown_region_panics() {
        let mut mutator = mutator();
        mutator.exit_region(42);
    }

    #[test]
    fn dropping_mutator_returns_blocks() {
        let mut flags = RegionFlags::enabled();
        flags.arena_size = M;
        let heap = Heap::new(flags).expect("heap");
        let class = Class::with_ref_fields("Node", 1);

        {
            let mut mutator = Mutator::new(heap.clone());
            mutator.enter_region(|m| {
                m.allocate(class).expect("alloc");
            });
            assert_eq!(mutator.local_free_blocks(), 1);
        }

        assert_eq!(heap.stats().free_blocks, 1);
    }
}
