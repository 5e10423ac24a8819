use std::collections::{HashMap, HashSet};
use std::fmt;

use fixedbitset::FixedBitSet;

use crate::gc::block::{Block, BlockState};
use crate::gc::{Address, Slot};
use crate::heap::Heap;
use crate::object::Parity;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum VerifierPhase {
    PreSweep,
    PostSweep,
}

impl VerifierPhase {
    fn is_pre(self) -> bool {
        match self {
            VerifierPhase::PreSweep => true,
            VerifierPhase::PostSweep => false,
        }
    }
}

impl fmt::Display for VerifierPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            VerifierPhase::PreSweep => "pre sweep",
            VerifierPhase::PostSweep => "post sweep",
        };

        write!(f, "{}", text)
    }
}

/// Checks heap invariants while the world is stopped. Every violation
/// panics.
pub struct Verifier<'a> {
    heap: &'a Heap,
    roots: &'a [Slot],
    parity: Parity,
    phase: VerifierPhase,
    reachable_lines: HashMap<Address, FixedBitSet>,
}

impl<'a> Verifier<'a> {
    pub fn new(
        heap: &'a Heap,
        roots: &'a [Slot],
        parity: Parity,
        phase: VerifierPhase,
    ) -> Verifier<'a> {
        Verifier {
            heap,
            roots,
            parity,
            phase,
            reachable_lines: HashMap::new(),
        }
    }

    pub fn verify(&mut self) {
        self.verify_blocks();
        self.verify_reachable();
    }

    fn verify_blocks(&self) {
        for block in self.heap.blocks() {
            if block.state() == BlockState::Free {
                assert!(
                    block.has_clean_metadata(),
                    "{}: free block {} has metadata",
                    self.phase,
                    block.area()
                );
                continue;
            }

            for object in block.objects() {
                self.verify_object_start(block, object);

                if self.phase.is_pre() && block.is_faded(object) {
                    self.verify_faded_referents(object);
                }

                if !self.phase.is_pre() {
                    assert!(
                        !object.to_obj().header().is_marked(self.parity.other()),
                        "{}: object {} carries mark bit of next cycle",
                        self.phase,
                        object
                    );
                }
            }
        }
    }

    fn verify_object_start(&self, block: Block, object: Address) {
        let line = block.line_index(object);

        assert!(
            block.is_line_allocated(line),
            "{}: object {} starts in free line {} of block {}",
            self.phase,
            object,
            line,
            block.area()
        );
    }

    fn verify_faded_referents(&self, object: Address) {
        let obj = object.to_obj();

        if !obj.header().is_marked(self.parity) {
            return;
        }

        obj.visit_reference_fields(|field| {
            let referent = field.get();

            if let Some(block) = self.heap.find_block(referent) {
                if block.state() == BlockState::Bound {
                    assert!(
                        block.is_faded(referent),
                        "{}: faded object {} references blue object {}",
                        self.phase,
                        object,
                        referent
                    );
                }
            }
        });
    }

    fn verify_reachable(&mut self) {
        let mut visited: HashSet<Address> = HashSet::new();
        let mut worklist: Vec<Address> = Vec::new();

        for root in self.roots {
            let value = root.get();

            if value.is_non_null() && visited.insert(value) {
                worklist.push(value);
            }
        }

        while let Some(object) = worklist.pop() {
            self.verify_reachable_object(object);

            object.to_obj().visit_reference_fields(|field| {
                let value = field.get();

                if value.is_non_null() && visited.insert(value) {
                    worklist.push(value);
                }
            });
        }

        if !self.phase.is_pre() {
            self.verify_reachable_lines();
        }
    }

    fn verify_reachable_object(&mut self, object: Address) {
        match self.heap.find_block(object) {
            Some(block) => {
                assert!(
                    block.state() != BlockState::Free,
                    "{}: reachable object {} in free block {}",
                    self.phase,
                    object,
                    block.area()
                );

                assert!(
                    block.is_object_start(object),
                    "{}: reachable object {} has no start bit",
                    self.phase,
                    object
                );

                let (first, last) = block.lines_of(object, object.to_obj().size());
                let lines = self
                    .reachable_lines
                    .entry(block.start())
                    .or_insert_with(|| FixedBitSet::with_capacity(block.layout().lines()));
                lines.insert_range(first..last);
            }

            None => {
                assert!(
                    self.heap.general().contains(object),
                    "{}: reachable object {} outside of the heap",
                    self.phase,
                    object
                );
            }
        }

        if self.phase.is_pre() {
            assert!(
                object.to_obj().header().is_marked(self.parity),
                "{}: reachable object {} is not marked",
                self.phase,
                object
            );
        }
    }

    fn verify_reachable_lines(&self) {
        for (&start, lines) in &self.reachable_lines {
            let block = self.heap.block_of(start);

            for line in lines.ones() {
                assert!(
                    block.is_line_allocated(line),
                    "{}: line {} of block {} holds reachable objects but was released",
                    self.phase,
                    line,
                    block.area()
                );
            }
        }
    }
}
