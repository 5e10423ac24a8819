pub mod barrier;
pub mod diagnostics;
pub mod flags;
pub mod gc;
pub mod heap;
pub mod mem;
pub mod mutator;
pub mod object;
pub mod os;
pub mod region;
pub mod timer;

pub use crate::barrier::Escape;
pub use crate::diagnostics::{Diagnostics, DiagnosticsReport};
pub use crate::flags::{FlagsError, RegionFlags};
pub use crate::gc::collector::{CycleSummary, GcPhase};
pub use crate::gc::root::RootSet;
pub use crate::gc::{Address, AllocError, GcReason, Slot};
pub use crate::heap::{default_heap, Heap, HeapError, HeapStats};
pub use crate::mutator::{allocate, with_current, write_ref, Mutator};
pub use crate::object::Class;
pub use crate::region::{enter_region, ignore, Region};
