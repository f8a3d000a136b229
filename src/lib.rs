//! A user-space heap allocator that manages the process heap through the
//! program break (`sbrk`) and anonymous mappings (`mmap`).
//!
//! Small blocks are carved from the program break and recycled through 128
//! kilobyte-class bins with splitting and coalescing; requests at or above
//! [`LARGE_THRESHOLD`] bypass the break entirely and get their own anonymous
//! mapping. [`HeapAllocator`] is the instance API; [`GlobalHeap`] is a
//! process-wide default carrying the classic `malloc`/`calloc`/`realloc`/
//! `free` shape.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("brkalloc supports only 64-bit targets.");

#[cfg(not(unix))]
compile_error!("brkalloc requires a Unix target (program break and anonymous mappings).");

// public module: contains implementation details (hidden via pub(crate))
pub mod heap;

// allocator core
pub use heap::alloc::{
    AllocError, GlobalHeap, HeapAllocator, HeapConfig, HeapStats, RecyclePolicy, LARGE_THRESHOLD,
    MAX_REQUEST,
};

// layout constants
pub use heap::block::{ALIGNMENT, HEADER_SIZE};

// OS seam
pub use heap::os::{OsError, OsOps, PlatformOs};

// process-wide diagnostic gauges
pub use heap::stats::OsGauges;
