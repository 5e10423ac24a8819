use crossbeam_deque::{Injector, Steal, Worker};

use crate::gc::block::{Block, BlockState};
use crate::gc::Address;
use crate::heap::Heap;
use crate::object::{class_from_raw, Parity};

/// Grey object together with the epoch of its block when it was shaded.
/// General heap objects use epoch 0 and are never invalidated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    pub addr: Address,
    pub epoch: u64,
}

/// Marks `value` for `parity`. Returns a work item if the object was white.
pub fn shade(heap: &Heap, value: Address, parity: Parity) -> Option<WorkItem> {
    if value.is_null() {
        return None;
    }

    if heap.is_region_address(value) {
        let block = heap.block_of(value);

        if block.state() == BlockState::Free || !block.is_object_start(value) {
            panic!(
                "shading {} which is not an object in block {}",
                value,
                block.area()
            );
        }

        let epoch = block.epoch();

        if value.to_obj().header().try_mark(parity) {
            return Some(WorkItem { addr: value, epoch });
        }
    } else if heap.general().contains(value) {
        if value.to_obj().header().try_mark(parity) {
            return Some(WorkItem {
                addr: value,
                epoch: 0,
            });
        }
    }

    None
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkStats {
    pub traced: usize,
    pub stale: usize,
}

/// Drains grey objects from the shared queue. Several markers can run at
/// the same time, each with its own local deque.
pub struct Marker<'a> {
    heap: &'a Heap,
    parity: Parity,
    grey: &'a Injector<WorkItem>,
    worker: Worker<WorkItem>,
    fields: Vec<Address>,
    stats: MarkStats,
}

impl<'a> Marker<'a> {
    pub fn new(heap: &'a Heap, parity: Parity, grey: &'a Injector<WorkItem>) -> Marker<'a> {
        Marker {
            heap,
            parity,
            grey,
            worker: Worker::new_lifo(),
            fields: Vec::new(),
            stats: MarkStats::default(),
        }
    }

    /// Processes up to `budget` objects. Unprocessed local work goes back
    /// into the shared queue.
    pub fn run(mut self, budget: usize) -> MarkStats {
        let mut processed = 0;

        while processed < budget {
            let item = match self.pop() {
                Some(item) => item,
                None => break,
            };

            self.process(item);
            processed += 1;
        }

        while let Some(item) = self.worker.pop() {
            self.grey.push(item);
        }

        self.stats
    }

    fn pop(&mut self) -> Option<WorkItem> {
        self.worker.pop().or_else(|| self.pop_global())
    }

    fn pop_global(&mut self) -> Option<WorkItem> {
        loop {
            let result = self.grey.steal_batch_and_pop(&self.worker);

            match result {
                Steal::Empty => break,
                Steal::Success(value) => return Some(value),
                Steal::Retry => continue,
            }
        }

        None
    }

    fn process(&mut self, item: WorkItem) {
        match self.heap.find_block(item.addr) {
            Some(block) => self.trace_region_object(block, item),
            None => self.trace_general_object(item.addr),
        }

        self.stats.traced += 1;
    }

    // The block may be swept by its owner while we read it. All reads are
    // atomic and only used after the epoch check passed again.
    fn trace_region_object(&mut self, block: Block, item: WorkItem) {
        if !valid(block, item) {
            self.stats.stale += 1;
            return;
        }

        let raw = item.addr.to_obj().header().raw();

        if !valid(block, item) {
            self.stats.stale += 1;
            return;
        }

        let class = class_from_raw(raw);
        self.fields.clear();

        for idx in class.ref_fields() {
            let value = unsafe { item.addr.add_ptr(idx).load_word() };
            self.fields.push(Address::from(value));
        }

        if !valid(block, item) {
            self.stats.stale += 1;
            return;
        }

        block.mark_lines(item.addr, class.size(), self.parity);

        for idx in 0..self.fields.len() {
            let value = self.fields[idx];

            if let Some(item) = shade(self.heap, value, self.parity) {
                self.worker.push(item);
            }
        }
    }

    fn trace_general_object(&mut self, addr: Address) {
        let heap = self.heap;
        let parity = self.parity;
        let worker = &self.worker;

        addr.to_obj().visit_reference_fields(|field| {
            if let Some(item) = shade(heap, field.get(), parity) {
                worker.push(item);
            }
        });
    }
}

// Faded objects stay put while the collector is marking, their lines are
// never released by an eager sweep.
fn valid(block: Block, item: WorkItem) -> bool {
    block.epoch_unchanged(item.epoch) || block.is_faded(item.addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::RegionFlags;
    use crate::gc::freelist::LocalFreeList;
    use crate::gc::M;
    use crate::heap::BlockUse;
    use crate::object::{Class, Obj};
    use std::sync::Arc;

    fn heap() -> Arc<Heap> {
        let mut flags = RegionFlags::enabled();
        flags.arena_size = M;
        Heap::new(flags).expect("heap")
    }

    #[test]
    fn marker_traces_region_and_general_objects() {
        let heap = heap();
        let mut local = LocalFreeList::new(1);
        let class = Class::with_ref_fields("Node", 1);
        let parity = Parity::of_cycle(1);
        let block = heap
            .acquire_block(&mut local, BlockUse::Main, 1, 1)
            .expect("block");

        let region_obj = block.start();
        Obj::initialize(region_obj, class, None);
        block.record_object(region_obj, class.size());

        let general_obj = heap.general().allocate(class, None).expect("alloc");
        region_obj.to_obj().field(1).set(general_obj);

        let grey = Injector::new();
        grey.push(shade(&heap, region_obj, parity).expect("white"));
        assert_eq!(shade(&heap, region_obj, parity), None);

        let stats = Marker::new(&heap, parity, &grey).run(usize::MAX);

        assert_eq!(stats.traced, 2);
        assert!(grey.is_empty());
        assert!(general_obj.to_obj().header().is_marked(parity));
        assert!(block.is_line_marked(0, parity));
        assert!(!block.is_line_marked(1, parity));
    }

    #[test]
    fn stale_items_are_skipped() {
        let heap = heap();
        let mut local = LocalFreeList::new(1);
        let class = Class::with_ref_fields("Node", 1);
        let parity = Parity::of_cycle(1);
        let block = heap
            .acquire_block(&mut local, BlockUse::Main, 1, 1)
            .expect("block");

        let blue = block.start();
        let faded = block.start().offset(16);

        for &obj in &[blue, faded] {
            Obj::initialize(obj, class, None);
            block.record_object(obj, class.size());
        }

        block.fade_object(faded, class.size());

        let grey = Injector::new();
        grey.push(shade(&heap, blue, parity).expect("white"));
        grey.push(shade(&heap, faded, parity).expect("white"));
        block.advance_epoch();

        let stats = Marker::new(&heap, parity, &grey).run(usize::MAX);
        assert_eq!(stats.traced, 2);
        assert_eq!(stats.stale, 1);
    }

    #[test]
    fn budget_leaves_work_in_queue() {
        let heap = heap();
        let class = Class::with_ref_fields("Node", 1);
        let parity = Parity::of_cycle(1);
        let grey = Injector::new();

        for _ in 0..4 {
            let obj = heap.general().allocate(class, None).expect("alloc");
            grey.push(shade(&heap, obj, parity).expect("white"));
        }

        let stats = Marker::new(&heap, parity, &grey).run(1);
        assert_eq!(stats.traced, 1);
        assert!(!grey.is_empty());

        let stats = Marker::new(&heap, parity, &grey).run(usize::MAX);
        assert_eq!(stats.traced, 3);
        assert!(grey.is_empty());
    }
}
