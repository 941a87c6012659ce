//! # void_heap - Engine Heap
//!
//! General-purpose heap shared by every engine subsystem:
//! - Size classes: requests are served from per-class free lists
//! - Chunks: page-granular regions sliced into same-size blocks
//! - Tracking: every live allocation carries its source site for leak reports
//! - Compaction: live blocks slide together, handles stay valid
//!
//! Allocations are addressed through [`HeapHandle`]s rather than raw
//! pointers, so [`Heap::defragment`] can relocate payloads safely.
//!
//! ```no_run
//! use void_heap::prelude::*;
//!
//! let heap = Heap::new(HeapConfig::default()).unwrap();
//! let handle = heap.allocate(64, AllocSite::caller()).unwrap();
//! heap.write(handle, 0, b"hello").unwrap();
//! heap.deallocate(handle).unwrap();
//! ```

#[macro_use]
mod error;

mod block;
mod bucket;
mod chunk;
mod compact;
pub mod config;
pub mod global;
pub mod handle;
pub mod heap;
pub mod report;
pub mod scoped;
pub mod size_class;
pub mod tracker;

pub use block::BLOCK_HEADER_SIZE;
pub use config::{CompactionMode, ConfigError, ConfigResult, HeapConfig};
pub use error::{HeapError, HeapResult};
pub use handle::HeapHandle;
pub use heap::Heap;
pub use report::{BucketStats, CompactionSummary, HeapStats, LeakEntry, LeakReport};
pub use scoped::ScopedAlloc;
pub use size_class::{SizeClassTable, NUM_BUCKETS, WORD_ALIGN};
pub use tracker::{AllocSite, AllocationInfo};

/// Align `value` up to `align`, `None` on overflow
#[inline]
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Align a value up to the given alignment
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Check if an address is aligned
#[inline]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & (align - 1) == 0
}

pub mod prelude {
    pub use crate::{AllocSite, Heap, HeapConfig, HeapError, HeapHandle, HeapResult};
    pub use crate::{CompactionMode, HeapStats, LeakReport, ScopedAlloc};
    pub use crate::{align_up, checked_align_up, is_aligned};
}
