//! # void_pages - Page-Granular Memory Source
//!
//! The leaf of the heap stack. Hands out large, page-aligned, zero-filled
//! regions and takes them back:
//! - [`PageSource`]: the contract the heap consumes
//! - [`SystemPages`]: `mmap` on Unix, `VirtualAlloc` on Windows
//! - [`CountingPages`]: call-counting decorator with an optional budget

use core::fmt;
use core::ptr::NonNull;

use thiserror::Error;

pub mod counting;
pub mod system;

pub use counting::{CountingPages, PageCounters};
pub use system::SystemPages;

/// Errors from a page source
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageError {
    #[error("Zero-size page request")]
    ZeroSize,

    #[error("Page request size overflows the address space")]
    Overflow,

    #[error("Operating system refused {requested} bytes")]
    Exhausted { requested: usize },

    #[error("Page budget exceeded: requested {requested} bytes, {remaining} remaining")]
    BudgetExceeded { requested: usize, remaining: usize },
}

/// Result type for page operations
pub type PageResult<T> = Result<T, PageError>;

/// A page-aligned span of memory owned by whoever holds it.
///
/// Dropping a region does not return it; it must go back through
/// [`PageSource::release_pages`] on the source that produced it.
pub struct PageRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the region is plain memory exclusively owned by its holder
unsafe impl Send for PageRegion {}
unsafe impl Sync for PageRegion {}

impl PageRegion {
    /// Wrap a raw span.
    ///
    /// # Safety
    /// `ptr` must point to `len` readable and writable bytes that stay valid
    /// until the region is released, and nothing else may own them.
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Start address of the span
    #[inline]
    pub fn base_addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the region as bytes
    pub fn as_slice(&self) -> &[u8] {
        // Safety: from_raw guarantees `len` valid bytes owned by this region
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// View the region as mutable bytes
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: from_raw guarantees `len` valid bytes owned by this region,
        // and `&mut self` makes the borrow exclusive
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl fmt::Debug for PageRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageRegion({:p}, {} bytes)", self.ptr, self.len)
    }
}

/// Something that can hand out and take back page-granular memory.
///
/// Implementations round requests up to [`PageSource::page_size`] themselves
/// and must fail promptly instead of retrying.
pub trait PageSource: Send + Sync {
    /// Page granularity in bytes (a power of two)
    fn page_size(&self) -> usize;

    /// Acquire at least `min_size` zero-filled bytes
    fn request_pages(&self, min_size: usize) -> PageResult<PageRegion>;

    /// Give a region back. The region must come from this source.
    fn release_pages(&self, region: PageRegion);
}

/// Round `size` up to a multiple of `page_size`, `None` on overflow
#[inline]
pub fn round_to_pages(size: usize, page_size: usize) -> Option<usize> {
    debug_assert!(page_size.is_power_of_two());
    size.checked_add(page_size - 1).map(|s| s & !(page_size - 1))
}

pub mod prelude {
    pub use crate::{round_to_pages, PageError, PageRegion, PageResult, PageSource};
    pub use crate::{CountingPages, PageCounters, SystemPages};
}
