//! Scope-bound allocations

use crate::error::HeapResult;
use crate::handle::HeapHandle;
use crate::heap::Heap;
use crate::tracker::AllocSite;

/// An allocation freed when the guard goes out of scope
pub struct ScopedAlloc<'h> {
    heap: &'h Heap,
    handle: HeapHandle,
}

impl<'h> ScopedAlloc<'h> {
    pub fn new(heap: &'h Heap, size: usize, site: AllocSite) -> HeapResult<Self> {
        let handle = heap.allocate(size, site)?;
        Ok(Self { heap, handle })
    }

    pub fn handle(&self) -> HeapHandle {
        self.handle
    }

    pub fn size(&self) -> HeapResult<usize> {
        self.heap.size_of(self.handle)
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> HeapResult<R> {
        self.heap.with_bytes(self.handle, f)
    }

    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> HeapResult<R> {
        self.heap.with_bytes_mut(self.handle, f)
    }

    /// Keep the allocation past the scope; the caller now frees it
    pub fn into_handle(self) -> HeapHandle {
        let handle = self.handle;
        core::mem::forget(self);
        handle
    }
}

impl Drop for ScopedAlloc<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.heap.deallocate(self.handle) {
            log::warn!("Scoped allocation {:?} not freed: {}", self.handle, e);
        }
    }
}
