use std::collections::HashSet;

use crate::gc::block::Block;
use crate::gc::{Address, AllocError};
use crate::heap::Heap;

/// Values that can carry references out of a region body.
pub trait Escape {
    /// Calls `f` with every reference held by this value.
    fn visit_addresses(&self, f: &mut dyn FnMut(Address));
}

impl Escape for Address {
    fn visit_addresses(&self, f: &mut dyn FnMut(Address)) {
        f(*self);
    }
}

macro_rules! no_references {
    ($($ty:ty),*) => {
        $(
            impl Escape for $ty {
                fn visit_addresses(&self, _: &mut dyn FnMut(Address)) {}
            }
        )*
    };
}

no_references!(
    (),
    bool,
    char,
    u8,
    u32,
    u64,
    usize,
    i32,
    i64,
    isize,
    f64,
    String,
    str,
    AllocError
);

impl<T: Escape + ?Sized> Escape for &T {
    fn visit_addresses(&self, f: &mut dyn FnMut(Address)) {
        (**self).visit_addresses(f);
    }
}

impl<T: Escape> Escape for [T] {
    fn visit_addresses(&self, f: &mut dyn FnMut(Address)) {
        for value in self {
            value.visit_addresses(f);
        }
    }
}

impl<T: Escape, const N: usize> Escape for [T; N] {
    fn visit_addresses(&self, f: &mut dyn FnMut(Address)) {
        self.as_slice().visit_addresses(f);
    }
}

impl<T: Escape> Escape for Vec<T> {
    fn visit_addresses(&self, f: &mut dyn FnMut(Address)) {
        self.as_slice().visit_addresses(f);
    }
}

impl<T: Escape, S> Escape for HashSet<T, S> {
    fn visit_addresses(&self, f: &mut dyn FnMut(Address)) {
        for value in self {
            value.visit_addresses(f);
        }
    }
}

impl<T: Escape> Escape for Option<T> {
    fn visit_addresses(&self, f: &mut dyn FnMut(Address)) {
        if let Some(value) = self {
            value.visit_addresses(f);
        }
    }
}

impl<T: Escape, E: Escape> Escape for Result<T, E> {
    fn visit_addresses(&self, f: &mut dyn FnMut(Address)) {
        match self {
            Ok(value) => value.visit_addresses(f),
            Err(err) => err.visit_addresses(f),
        }
    }
}

macro_rules! tuple_references {
    ($($name:ident),+) => {
        impl<$($name: Escape),+> Escape for ($($name,)+) {
            #[allow(non_snake_case)]
            fn visit_addresses(&self, f: &mut dyn FnMut(Address)) {
                let ($($name,)+) = self;
                $($name.visit_addresses(f);)+
            }
        }
    };
}

tuple_references!(A);
tuple_references!(A, B);
tuple_references!(A, B, C);
tuple_references!(A, B, C, D);

/// Block and start of `value` if it is a blue object of `thread`.
fn blue_object(heap: &Heap, thread: usize, value: Address) -> Option<(Block, Address)> {
    if value.is_null() || !heap.is_region_address(value) {
        return None;
    }

    let target = heap.block_of(value);

    // blue objects are only ever visible to the thread owning their block
    if !target.is_bound_to(thread) {
        return None;
    }

    let start = heap.object_start(target, value);

    if target.is_faded(start) {
        None
    } else {
        Some((target, start))
    }
}

/// Decides whether storing `value` into the word at `dst` lets a blue
/// object of `thread` escape. Returns the block and start of the object
/// that needs to be faded.
///
/// Stores into the same or a younger region of the owning thread only fade
/// if the destination word already faded. Everything else (general heap,
/// globals, unbound blocks, blocks of other threads, older regions) fades.
pub fn fade_target(
    heap: &Heap,
    thread: usize,
    dst: Address,
    value: Address,
) -> Option<(Block, Address)> {
    let (target, start) = blue_object(heap, thread, value)?;

    if !heap.is_region_address(dst) {
        return Some((target, start));
    }

    let holder = heap.block_of(dst);

    if !holder.is_bound_to(thread) || holder.generation() < target.generation() {
        return Some((target, start));
    }

    if holder.is_faded(dst) {
        Some((target, start))
    } else {
        None
    }
}

/// Decides whether `value`, handed out of region `generation` of `thread`
/// to the enclosing frame, needs to be faded. Objects of this region and of
/// inner regions fade, objects of enclosing regions stay blue.
pub fn escape_target(
    heap: &Heap,
    thread: usize,
    generation: u64,
    value: Address,
) -> Option<(Block, Address)> {
    let (target, start) = blue_object(heap, thread, value)?;

    if target.generation() >= generation {
        Some((target, start))
    } else {
        None
    }
}

/// Fades the object at `start` and every blue object of `thread` reachable
/// from it. Returns the number of newly faded objects.
pub fn fade(heap: &Heap, thread: usize, block: Block, start: Address) -> usize {
    let mut worklist: Vec<(Block, Address)> = vec![(block, start)];
    let mut faded = 0;

    while let Some((block, object)) = worklist.pop() {
        if !block.is_bound_to(thread) {
            continue;
        }

        if !block.is_object_start(object) {
            panic!(
                "fading {} in block {} without object start",
                object,
                block.area()
            );
        }

        let obj = object.to_obj();

        if !block.fade_object(object, obj.size()) {
            continue;
        }

        faded += 1;

        obj.visit_reference_fields(|field| {
            let referent = field.get();

            if referent.is_null() || !heap.is_region_address(referent) {
                return;
            }

            let target = heap.block_of(referent);

            if target.is_bound_to(thread) && !target.is_faded(referent) {
                worklist.push((target, heap.object_start(target, referent)));
            }
        });
    }

    faded
}
