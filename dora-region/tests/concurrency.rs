mod common;

use std::panic::{self, AssertUnwindSafe};
use std::thread;

use dora_region::gc::block::BlockState;
use dora_region::{Address, GcPhase, GcReason, Mutator, RootSet};

use common::{heap, line_allocated, node};

#[test]
fn eager_sweep_during_marking_is_deferred() {
    let heap = heap();
    let mut mutator = Mutator::new(heap.clone());
    let globals = RootSet::new(1);
    let stack = RootSet::new(1);
    let node = node();

    let mut roots = globals.slots();
    roots.extend(stack.slots());

    let generation = mutator.push_region();
    let blue = mutator.allocate(node).expect("alloc");
    stack.slot(0).set(blue);

    for _ in 0..7 {
        mutator.allocate(node).expect("alloc");
    }

    assert!(heap.start_cycle(&roots, GcReason::Stress));

    // allocated black in line 1
    let escaped = mutator.allocate(node).expect("alloc");
    mutator.write_slot(globals.slot(0), escaped);

    for _ in 0..16 {
        mutator.allocate(node).expect("alloc");
    }

    stack.slot(0).set(Address::null());

    let region = mutator.exit_region(generation);
    let block = region.main_block().expect("main block");

    assert_eq!(block.state(), BlockState::Unbound);
    assert_eq!(heap.stats().deferred_blocks, 1);
    assert!(line_allocated(&heap, blue));

    let report = heap.diagnostics().report();
    assert_eq!(report.eager_deferred, 1);
    assert_eq!(report.eager_lines, 0);

    // the grey item for blue became stale when its block was swept
    assert_eq!(heap.mark_step(usize::MAX), 1);

    let summary = heap.finish_cycle(&roots).expect("running cycle");
    assert_eq!(summary.traced, 1);
    assert_eq!(summary.stale, 1);
    assert_eq!(summary.deferred.blocks_swept, 1);
    assert_eq!(summary.deferred.lines_released, 3);
    assert_eq!(summary.sweep.lines_released, 0);
    assert_eq!(heap.stats().deferred_blocks, 0);

    assert!(!line_allocated(&heap, blue));
    assert!(!block.is_object_start(blue));
    assert!(line_allocated(&heap, escaped));
    assert!(heap.is_faded(escaped));
    assert_eq!(heap.diagnostics().report().eager_lines, 3);
}

#[test]
fn insertion_barrier_shades_stored_objects() {
    let heap = heap();
    let mut mutator = Mutator::new(heap.clone());
    let globals = RootSet::new(1);
    let node = node();

    let holder = mutator.allocate(node).expect("alloc");
    let child = mutator.allocate(node).expect("alloc");
    mutator.write_slot(globals.slot(0), holder);

    assert!(heap.start_cycle(&globals.slots(), GcReason::Stress));
    assert_eq!(heap.mark_step(usize::MAX), 1);

    // holder was already scanned
    mutator.write_ref(holder, 1, child);

    let summary = heap.finish_cycle(&globals.slots()).expect("running cycle");
    assert_eq!(summary.traced, 2);
    assert_eq!(summary.sweep.general.freed_objects, 0);
    assert!(heap.general().contains(child));
    assert_eq!(heap.phase(), GcPhase::Idle);
}

#[test]
fn panicking_body_tears_down_region() {
    let heap = heap();
    let mut mutator = Mutator::new(heap.clone());
    let node = node();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        mutator.enter_region::<(), _>(|m| {
            for _ in 0..10 {
                m.allocate(node).expect("alloc");
            }

            panic!("body failed");
        })
    }));

    let payload = result.expect_err("panic passes through");
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"body failed"));

    assert!(!mutator.in_region());
    assert_eq!(mutator.local_free_blocks(), 1);

    let report = heap.diagnostics().report();
    assert_eq!(report.regions, 1);
    assert_eq!(report.eager_blocks_freed, 1);
}

#[test]
fn inner_panic_keeps_outer_region() {
    let heap = heap();
    let mut mutator = Mutator::new(heap.clone());
    let node = node();

    mutator.enter_region(|m| {
        let outer = m.current_generation();
        let before = m.allocate(node).expect("alloc");

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            m.enter_region::<(), _>(|m| {
                m.allocate(node).expect("alloc");
                panic!("inner failed");
            })
        }));
        assert!(result.is_err());

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            m.ignore::<(), _>(|_| panic!("ignored body failed"))
        }));
        assert!(result.is_err());

        assert_eq!(m.region_depth(), 1);
        assert_eq!(m.current_generation(), outer);
        assert_eq!(m.current_region().map(|r| r.is_suspended()), Some(false));

        let after = m.allocate(node).expect("alloc");
        assert_eq!(after, before.offset(16));
    });
}

#[test]
fn threads_use_private_regions_while_marking() {
    let heap = heap();
    let globals = RootSet::new(4);
    let node = node();

    assert!(heap.start_cycle(&globals.slots(), GcReason::Stress));

    thread::scope(|scope| {
        for idx in 0..4 {
            let heap = heap.clone();
            let globals = &globals;

            scope.spawn(move || {
                let mut mutator = Mutator::new(heap);

                for _ in 0..50 {
                    mutator.enter_region(|m| {
                        let mut head = Address::null();

                        for _ in 0..100 {
                            let obj = m.allocate(node).expect("alloc");
                            m.write_ref(obj, 1, head);
                            head = obj;
                        }

                        let escapee = m.allocate(node).expect("alloc");
                        m.write_slot(globals.slot(idx), escapee);
                        assert!(!m.is_faded(head));
                    });
                }
            });
        }

        scope.spawn(|| {
            for _ in 0..100 {
                heap.mark_step(64);
                thread::yield_now();
            }
        });
    });

    let deferred = heap.stats().deferred_blocks;
    assert!(deferred >= 200);

    let summary = heap.finish_cycle(&globals.slots()).expect("running cycle");
    assert_eq!(summary.deferred.blocks_swept, deferred);

    for idx in 0..4 {
        let escapee = globals.slot(idx).get();
        assert!(heap.is_faded(escapee));
        assert!(line_allocated(&heap, escapee));
        assert_eq!(heap.region_of(escapee), None);
    }

    assert_eq!(heap.diagnostics().region_objects(), 4 * 50 * 101);
    assert_eq!(heap.diagnostics().faded_objects(), 4 * 50);

    let summary = heap.collect(&globals.slots(), GcReason::ForceCollect);
    assert_eq!(summary.traced, 4);
}

#[test]
fn threads_share_recyclable_blocks() {
    let heap = heap();
    let globals = RootSet::new(2);
    let node = node();

    thread::scope(|scope| {
        for idx in 0..2 {
            let heap = heap.clone();
            let globals = &globals;

            scope.spawn(move || {
                let mut mutator = Mutator::new(heap);

                for _ in 0..20 {
                    mutator.enter_region(|m| {
                        for _ in 0..50 {
                            m.allocate(node).expect("alloc");
                        }

                        let escapee = m.allocate(node).expect("alloc");
                        m.write_slot(globals.slot(idx), escapee);
                    });
                }
            });
        }
    });

    let summary = heap.collect(&globals.slots(), GcReason::ForceCollect);
    assert_eq!(summary.traced, 2);

    let stats = heap.stats();
    assert_eq!(stats.deferred_blocks, 0);
    assert_eq!(stats.free_blocks + stats.recyclable_blocks, stats.carved_blocks);
}
