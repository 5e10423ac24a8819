#![allow(dead_code)]

use std::sync::Arc;

use dora_region::gc::block::Block;
use dora_region::gc::M;
use dora_region::{Address, Class, Heap, RegionFlags};

pub fn flags() -> RegionFlags {
    let mut flags = RegionFlags::enabled();
    flags.arena_size = M;
    flags.gc_workers = 2;
    flags.gc_verify = true;
    flags
}

pub fn heap() -> Arc<Heap> {
    Heap::new(flags()).expect("heap")
}

/// 16 bytes: header and one reference field.
pub fn node() -> &'static Class {
    Class::with_ref_fields("Node", 1)
}

/// 24 bytes: header and two reference fields.
pub fn pair() -> &'static Class {
    Class::with_ref_fields("Pair", 2)
}

pub fn block_of(heap: &Heap, obj: Address) -> Block {
    heap.find_block(obj).expect("region object")
}

pub fn line_allocated(heap: &Heap, obj: Address) -> bool {
    let block = block_of(heap, obj);
    block.is_line_allocated(block.line_index(obj))
}
