use std::alloc::{self, Layout};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::gc::{Address, AllocError};
use crate::mem;
use crate::object::{Class, Obj, Parity};

/// Fallback heap for everything not allocated in a region. Objects are
/// malloc'ed individually and tracked in a registry for the collector.
pub struct GeneralHeap {
    objects: Mutex<BTreeMap<Address, usize>>,
    allocated: AtomicUsize,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneralSweep {
    pub freed_objects: usize,
    pub freed_bytes: usize,
}

impl GeneralHeap {
    pub fn new() -> GeneralHeap {
        GeneralHeap {
            objects: Mutex::new(BTreeMap::new()),
            allocated: AtomicUsize::new(0),
        }
    }

    fn layout(size: usize) -> Result<Layout, AllocError> {
        Layout::from_size_align(size, mem::ptr_width_usize())
            .map_err(|_| AllocError::OutOfMemory { size })
    }

    pub fn allocate(
        &self,
        class: &'static Class,
        marked: Option<Parity>,
    ) -> Result<Address, AllocError> {
        let size = class.size();
        let layout = GeneralHeap::layout(size)?;
        let ptr = unsafe { alloc::alloc(layout) };

        if ptr.is_null() {
            return Err(AllocError::OutOfMemory { size });
        }

        let addr = Address::from_ptr(ptr);
        Obj::initialize(addr, class, marked);

        self.objects.lock().insert(addr, size);
        self.allocated.fetch_add(size, Ordering::Relaxed);

        Ok(addr)
    }

    /// Returns true if `addr` is the start of a general heap object.
    pub fn contains(&self, addr: Address) -> bool {
        self.objects.lock().contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Frees all objects without the mark bit of `parity` and clears the
    /// other mark bit on survivors. `dead` sees every freed object before
    /// its memory is released.
    pub fn sweep<F>(&self, parity: Parity, mut dead: F) -> GeneralSweep
    where
        F: FnMut(Address),
    {
        let mut result = GeneralSweep::default();
        let mut objects = self.objects.lock();

        objects.retain(|&addr, &mut size| {
            let header = addr.to_obj().header();

            if header.is_marked(parity) {
                header.clear_mark(parity.other());
                return true;
            }

            dead(addr);
            result.freed_objects += 1;
            result.freed_bytes += size;

            // layout was valid when the object was allocated
            if let Ok(layout) = GeneralHeap::layout(size) {
                unsafe { alloc::dealloc(addr.to_mut_ptr(), layout) };
            }

            false
        });

        self.allocated.fetch_sub(result.freed_bytes, Ordering::Relaxed);
        result
    }
}

impl Default for GeneralHeap {
    fn default() -> GeneralHeap {
        GeneralHeap::new()
    }
}

impl Drop for GeneralHeap {
    fn drop(&mut self) {
        let objects = std::mem::take(&mut *self.objects.lock());

        for (addr, size) in objects {
            if let Ok(layout) = GeneralHeap::layout(size) {
                unsafe { alloc::dealloc(addr.to_mut_ptr(), layout) };
            }
        }
    }
}
