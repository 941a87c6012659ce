//! Heap manager
//!
//! Composes the size-class table, the bucket free lists, the chunk list and
//! the allocation tracker behind a single lock. Every public operation takes
//! the lock for its full duration, chunk creation included.
//!
//! ```text
//!  allocate(size)
//!      |
//!      v
//!  classify(size + header) --> bucket free list --(empty)--> new chunk
//!      |                              |                          |
//!      |                              +<-------- slice ----------+
//!      v                              v
//!  track(site) <---------------- pop block
//!      |
//!      v
//!  HeapHandle
//! ```

use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use void_pages::{round_to_pages, PageSource, SystemPages};

use crate::block::{Block, BlockRef, BlockState, BLOCK_HEADER_SIZE};
use crate::bucket::Bucket;
use crate::chunk::Chunk;
use crate::compact;
use crate::config::{CompactionMode, HeapConfig};
use crate::error::{HeapError, HeapResult};
use crate::handle::{next_heap_id, HeapHandle, SlotKey, Slots};
use crate::report::{BucketStats, CompactionSummary, HeapStats, LeakReport};
use crate::scoped::ScopedAlloc;
use crate::size_class::{SizeClassTable, CATCH_ALL, MIN_CLASS_SIZE, WORD_ALIGN};
use crate::tracker::{AllocSite, AllocationInfo, AllocationTracker};
use crate::checked_align_up;

/// Running counters
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Totals {
    pub total_allocated: usize,
    pub peak_allocation: usize,
    pub allocation_count: usize,
    pub lifetime_allocations: u64,
    pub lifetime_deallocations: u64,
    pub orphaned_blocks: usize,
}

pub(crate) struct HeapState {
    /// Stamped into every handle this heap issues
    pub id: u32,
    pub config: HeapConfig,
    pub source: Arc<dyn PageSource>,
    pub classes: SizeClassTable,
    pub buckets: Vec<Bucket>,
    pub chunks: Vec<Chunk>,
    pub handles: Slots<BlockRef>,
    pub tracker: AllocationTracker,
    pub totals: Totals,
    pub allocs_since_defrag: usize,
    pub last_defrag: Instant,
    pub defrag_count: u64,
    pub reserved_bytes: usize,
    leaks_reported: bool,
}

/// The engine heap.
///
/// `Heap` is `Send + Sync`; share it with an `Arc`. Dropping it releases
/// every chunk back to its page source.
pub struct Heap {
    state: Mutex<HeapState>,
}

impl Heap {
    /// Create a heap backed by the operating system
    pub fn new(config: HeapConfig) -> HeapResult<Self> {
        Self::with_source(config, Arc::new(SystemPages::new()))
    }

    /// Create a heap backed by `source`
    pub fn with_source(config: HeapConfig, source: Arc<dyn PageSource>) -> HeapResult<Self> {
        config.validate()?;

        log::info!(
            "Heap initialized: {} size classes, {} byte chunks, page size {}",
            crate::NUM_BUCKETS,
            config.chunk_size,
            source.page_size()
        );

        Ok(Self {
            state: Mutex::new(HeapState::new(config, source)),
        })
    }

    pub fn config(&self) -> HeapConfig {
        self.state.lock().config.clone()
    }

    /// Allocate `size` payload bytes
    pub fn allocate(&self, size: usize, site: AllocSite) -> HeapResult<HeapHandle> {
        self.state.lock().allocate(size, site)
    }

    /// Allocate `size` payload bytes starting at a multiple of `alignment`.
    ///
    /// `alignment` must be a power of two and at least [`WORD_ALIGN`].
    pub fn allocate_aligned(
        &self,
        size: usize,
        alignment: usize,
        site: AllocSite,
    ) -> HeapResult<HeapHandle> {
        self.state.lock().allocate_aligned(size, alignment, site)
    }

    /// Free an allocation. The null handle is a no-op.
    pub fn deallocate(&self, handle: HeapHandle) -> HeapResult<()> {
        if handle.is_null() {
            return Ok(());
        }
        self.state.lock().deallocate(handle)
    }

    /// Allocate `size` bytes freed when the guard drops
    #[track_caller]
    pub fn scoped(&self, size: usize) -> HeapResult<ScopedAlloc<'_>> {
        ScopedAlloc::new(self, size, AllocSite::caller())
    }

    /// Compact every chunk now
    pub fn defragment(&self) -> CompactionSummary {
        self.state.lock().defragment()
    }

    /// Whether `handle` refers to a live allocation
    pub fn contains(&self, handle: HeapHandle) -> bool {
        let state = self.state.lock();
        state.key_of(handle).map_or(false, |key| state.handles.contains(key))
    }

    /// Payload size recorded for `handle`
    pub fn size_of(&self, handle: HeapHandle) -> HeapResult<usize> {
        let state = self.state.lock();
        state.locate(handle).map(|(_, _, len)| len)
    }

    /// Provenance record for `handle`
    pub fn info(&self, handle: HeapHandle) -> HeapResult<AllocationInfo> {
        let state = self.state.lock();
        let (at, _, _) = state.locate(handle)?;
        state
            .block(at)
            .tracking
            .and_then(|key| state.tracker.get(key))
            .cloned()
            .ok_or(HeapError::InvalidHandle(handle))
    }

    /// Current payload address.
    ///
    /// Only valid until the next [`Heap::defragment`] (explicit or
    /// automatic); resolve through the handle afterwards.
    pub fn address(&self, handle: HeapHandle) -> HeapResult<NonNull<u8>> {
        let state = self.state.lock();
        let (at, offset, _) = state.locate(handle)?;
        Ok(state.chunks[at.chunk as usize].ptr_at(offset))
    }

    /// Run `f` over the payload bytes.
    ///
    /// `f` runs with the heap locked: calling back into this heap from
    /// inside it deadlocks.
    pub fn with_bytes<R>(&self, handle: HeapHandle, f: impl FnOnce(&[u8]) -> R) -> HeapResult<R> {
        let state = self.state.lock();
        let (at, offset, len) = state.locate(handle)?;
        Ok(f(&state.chunks[at.chunk as usize].bytes()[offset..offset + len]))
    }

    /// Run `f` over the payload bytes mutably.
    ///
    /// `f` runs with the heap locked: calling back into this heap from
    /// inside it deadlocks.
    pub fn with_bytes_mut<R>(
        &self,
        handle: HeapHandle,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> HeapResult<R> {
        let mut state = self.state.lock();
        let (at, offset, len) = state.locate(handle)?;
        Ok(f(&mut state.chunks[at.chunk as usize].bytes_mut()[offset..offset + len]))
    }

    /// Copy payload bytes starting at `offset` into `buf`
    pub fn read(&self, handle: HeapHandle, offset: usize, buf: &mut [u8]) -> HeapResult<()> {
        let state = self.state.lock();
        let (at, start, end) = state.range(handle, offset, buf.len())?;
        buf.copy_from_slice(&state.chunks[at.chunk as usize].bytes()[start..end]);
        Ok(())
    }

    /// Copy `data` into the payload starting at `offset`
    pub fn write(&self, handle: HeapHandle, offset: usize, data: &[u8]) -> HeapResult<()> {
        let mut state = self.state.lock();
        let (at, start, end) = state.range(handle, offset, data.len())?;
        state.chunks[at.chunk as usize].bytes_mut()[start..end].copy_from_slice(data);
        Ok(())
    }

    /// Snapshot of heap statistics
    pub fn stats(&self) -> HeapStats {
        self.state.lock().stats()
    }

    /// Snapshot and log heap statistics
    pub fn report_stats(&self) -> HeapStats {
        let stats = self.stats();
        stats.log();
        stats
    }

    /// Every live allocation, in allocation order
    pub fn leaks(&self) -> LeakReport {
        self.state.lock().tracker.leak_report()
    }

    /// Collect and log every live allocation
    pub fn report_leaks(&self) -> LeakReport {
        let report = self.leaks();
        report.log();
        report
    }

    /// `1 - allocated / reserved`
    pub fn fragmentation(&self) -> f32 {
        self.state.lock().fragmentation()
    }

    /// Tear the heap down, returning what was still allocated
    pub fn shutdown(self) -> LeakReport {
        let report = {
            let mut state = self.state.lock();
            let report = state.tracker.leak_report();
            if state.config.report_leaks_on_drop && !report.is_empty() {
                report.log();
            }
            state.leaks_reported = true;
            report
        };
        drop(self);
        report
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let state = self.state.get_mut();

        if state.config.report_leaks_on_drop && !state.leaks_reported && !state.tracker.is_empty() {
            state.tracker.leak_report().log();
        }

        let source = Arc::clone(&state.source);
        let released = state.chunks.len();
        for chunk in state.chunks.drain(..) {
            source.release_pages(chunk.into_region());
        }
        log::debug!("Heap released {} chunks ({} bytes)", released, state.reserved_bytes);
    }
}

impl HeapState {
    fn new(config: HeapConfig, source: Arc<dyn PageSource>) -> Self {
        let classes = SizeClassTable::new();
        let page_size = source.page_size();

        let buckets = classes
            .iter()
            .map(|(index, block_size)| {
                let per_chunk = if SizeClassTable::is_catch_all(index) {
                    config.catch_all_free_limit
                } else {
                    let request = block_size.max(config.chunk_size);
                    round_to_pages(request, page_size).unwrap_or(request) / block_size
                };
                Bucket::new(index, block_size, per_chunk)
            })
            .collect();

        Self {
            id: next_heap_id(),
            config,
            source,
            classes,
            buckets,
            chunks: Vec::new(),
            handles: Slots::new(),
            tracker: AllocationTracker::new(),
            totals: Totals::default(),
            allocs_since_defrag: 0,
            last_defrag: Instant::now(),
            defrag_count: 0,
            reserved_bytes: 0,
            leaks_reported: false,
        }
    }

    /// Header-inclusive, word-aligned size for a request with `extra` slack
    fn request_size(size: usize, extra: usize) -> Option<usize> {
        let total = size.checked_add(extra)?.checked_add(BLOCK_HEADER_SIZE)?;
        checked_align_up(total, WORD_ALIGN)
    }

    pub fn block(&self, at: BlockRef) -> &Block {
        match self.chunks.get(at.chunk as usize).and_then(|c| c.block(at.slot)) {
            Some(block) => block,
            None => invariant_violation!("missing block {:?}", at),
        }
    }

    pub fn block_mut(&mut self, at: BlockRef) -> &mut Block {
        match self.chunks.get_mut(at.chunk as usize).and_then(|c| c.block_mut(at.slot)) {
            Some(block) => block,
            None => invariant_violation!("missing block {:?}", at),
        }
    }

    /// Slot key of a handle issued by this heap
    fn key_of(&self, handle: HeapHandle) -> Option<SlotKey> {
        (handle.heap_id() == self.id).then(|| handle.key())
    }

    /// Resolve a handle to its block, payload offset and payload length
    fn locate(&self, handle: HeapHandle) -> HeapResult<(BlockRef, usize, usize)> {
        let at = *self
            .key_of(handle)
            .and_then(|key| self.handles.get(key))
            .ok_or(HeapError::InvalidHandle(handle))?;
        let block = self.block(at);
        Ok((at, block.payload_offset(), block.requested))
    }

    /// Resolve a handle plus a byte range to chunk offsets
    fn range(&self, handle: HeapHandle, offset: usize, len: usize) -> HeapResult<(BlockRef, usize, usize)> {
        let (at, start, size) = self.locate(handle)?;
        let end = offset.saturating_add(len);
        if end > size {
            return Err(HeapError::OutOfBounds { offset, end, size });
        }
        Ok((at, start + offset, start + end))
    }

    fn maybe_defragment(&mut self) {
        let threshold = self.config.defrag_threshold;
        if threshold > 0 && self.allocs_since_defrag >= threshold {
            let summary = self.defragment();
            log::debug!("Automatic defragmentation after {} allocations: {}", threshold, summary);
        }
    }

    pub fn defragment(&mut self) -> CompactionSummary {
        self.allocs_since_defrag = 0;
        self.last_defrag = Instant::now();
        self.defrag_count += 1;

        match self.config.compaction {
            CompactionMode::Relocate => compact::compact(self),
            CompactionMode::Disabled => {
                log::debug!("Defragmentation skipped: compaction disabled");
                CompactionSummary::default()
            }
        }
    }

    fn allocate(&mut self, size: usize, site: AllocSite) -> HeapResult<HeapHandle> {
        if size == 0 {
            log::debug!("Rejected zero-size allocation from {}", site);
            return Err(HeapError::ZeroSize);
        }
        let total = Self::request_size(size, 0).ok_or(HeapError::OutOfMemory {
            requested: size,
            source: None,
        })?;

        self.maybe_defragment();

        let bucket = self.classes.classify(total);
        let at = match self.take_free(bucket, total) {
            Some(at) => at,
            None => {
                self.grow(bucket, total, size)?;
                match self.take_free(bucket, total) {
                    Some(at) => at,
                    None => invariant_violation!("fresh chunk for bucket {} has no block", bucket),
                }
            }
        };

        let keep = self.classes.block_size(bucket);
        self.split_tail(at, keep);
        Ok(self.commit(at, size, WORD_ALIGN, site))
    }

    fn allocate_aligned(
        &mut self,
        size: usize,
        alignment: usize,
        site: AllocSite,
    ) -> HeapResult<HeapHandle> {
        if size == 0 {
            log::debug!("Rejected zero-size aligned allocation from {}", site);
            return Err(HeapError::ZeroSize);
        }
        if !alignment.is_power_of_two() || alignment < WORD_ALIGN {
            log::debug!("Rejected alignment {} from {}", alignment, site);
            return Err(HeapError::InvalidAlignment {
                alignment,
                min: WORD_ALIGN,
            });
        }
        let total = Self::request_size(size, alignment).ok_or(HeapError::OutOfMemory {
            requested: size,
            source: None,
        })?;

        self.maybe_defragment();

        let bucket = self.classes.classify(total);
        let (at, slack) = match self.take_aligned(bucket, size, alignment) {
            Some(found) => found,
            None => {
                self.grow(bucket, total, size)?;
                self.take_aligned(bucket, size, alignment)
                    .ok_or(HeapError::OutOfMemory {
                        requested: size,
                        source: None,
                    })?
            }
        };

        self.place_aligned(at, slack);
        let used = checked_align_up(BLOCK_HEADER_SIZE + self.block(at).padding + size, WORD_ALIGN)
            .unwrap_or(usize::MAX);
        let keep = used.max(self.classes.block_size(bucket));
        self.split_tail(at, keep);
        Ok(self.commit(at, size, alignment, site))
    }

    fn deallocate(&mut self, handle: HeapHandle) -> HeapResult<()> {
        let removed = self.key_of(handle).and_then(|key| self.handles.remove(key));
        let Some(at) = removed else {
            log::debug!("Rejected deallocation of invalid handle {:?}", handle);
            return Err(HeapError::InvalidHandle(handle));
        };
        let poison = self.config.poison_on_free;

        let Some(chunk) = self.chunks.get_mut(at.chunk as usize) else {
            invariant_violation!("handle {:?} points at missing chunk {}", handle, at.chunk)
        };
        let bucket = match chunk.header(at.slot) {
            Some(header) if header.belongs_to(at) => header.bucket(),
            _ => invariant_violation!("header stamp of {:?} does not match {:?}", handle, at),
        };

        let (tracking, payload, span) = match chunk.block_mut(at.slot) {
            Some(block) if block.is_live() => {
                let payload = block.payload_offset()..block.payload_offset() + block.size();
                let tracking = block.tracking.take();
                block.padding = 0;
                block.requested = 0;
                block.align = WORD_ALIGN;
                (tracking, payload, block.span)
            }
            _ => invariant_violation!("handle {:?} resolves to a block that is not live", handle),
        };

        chunk.used -= span;
        if poison {
            chunk.bytes_mut()[payload].fill(0);
        }

        let Some(info) = tracking.and_then(|key| self.tracker.remove(key)) else {
            invariant_violation!("live block {:?} has no tracker record", at)
        };
        self.totals.total_allocated -= info.size;
        self.totals.allocation_count -= 1;
        self.totals.lifetime_deallocations += 1;
        log::trace!(
            "Freed {} bytes at {:#x} from {} (bucket {})",
            info.size,
            info.address,
            info.site,
            bucket
        );

        self.release(at);
        self.maybe_defragment();
        Ok(())
    }

    /// Take a block able to hold `total` bytes from `bucket`
    fn take_free(&mut self, bucket: usize, total: usize) -> Option<BlockRef> {
        let chunks = &mut self.chunks;
        let bucket = &mut self.buckets[bucket];

        if SizeClassTable::is_catch_all(bucket.index) {
            bucket.take_first(chunks, |block, _| block.span >= total)
        } else {
            bucket.pop(chunks)
        }
    }

    /// Take a block whose payload can start at a multiple of `alignment`
    /// and still hold `size` bytes, with the leading slack that takes
    fn take_aligned(&mut self, bucket: usize, size: usize, alignment: usize) -> Option<(BlockRef, usize)> {
        let chunks = &mut self.chunks;
        let at = self.buckets[bucket].take_first(chunks, |block, base| {
            aligned_slack(base, block, alignment)
                .map_or(false, |slack| block.size() >= slack.saturating_add(size))
        })?;

        let base = self.chunks[at.chunk as usize].base_addr();
        match aligned_slack(base, self.block(at), alignment) {
            Some(slack) => Some((at, slack)),
            None => invariant_violation!("aligned block {:?} lost its fit", at),
        }
    }

    /// Move the payload of `at` forward by `slack`, carving the slack into
    /// its own free block when it is large enough to be one
    fn place_aligned(&mut self, at: BlockRef, slack: usize) {
        if slack == 0 {
            return;
        }

        let carved_bucket = if slack >= MIN_CLASS_SIZE {
            self.classes.classify_floor(slack)
        } else {
            None
        };

        match carved_bucket {
            Some(bucket) => {
                let block = self.block_mut(at);
                let offset = block.offset;
                block.offset += slack;
                block.span -= slack;

                let slot = self.chunks[at.chunk as usize].insert(Block::free(offset, slack, bucket));
                self.release(BlockRef::new(at.chunk, slot));
            }
            None => self.block_mut(at).padding = slack,
        }
    }

    /// Give the part of `at` past `keep` bytes back to its bucket when that
    /// part can serve the bucket on its own
    fn split_tail(&mut self, at: BlockRef, keep: usize) {
        let block = self.block(at);
        let bucket = block.bucket;
        if SizeClassTable::is_catch_all(bucket) || block.span < keep {
            return;
        }
        let remainder = block.span - keep;
        if remainder < self.classes.block_size(bucket) {
            return;
        }

        let block = self.block_mut(at);
        block.span = keep;
        let offset = block.end();

        let chunk = &mut self.chunks[at.chunk as usize];
        let slot = chunk.insert(Block::free(offset, remainder, bucket));
        self.buckets[bucket].push(&mut self.chunks, BlockRef::new(at.chunk, slot));
    }

    /// Acquire a chunk for `bucket` and link its blocks
    fn grow(&mut self, bucket: usize, total: usize, requested: usize) -> HeapResult<()> {
        let catch_all = SizeClassTable::is_catch_all(bucket);
        let block_size = if catch_all {
            total
        } else {
            self.classes.block_size(bucket)
        };
        let want = if catch_all {
            total
        } else {
            block_size.max(self.config.chunk_size)
        };

        let region = self.source.request_pages(want).map_err(|e| {
            log::warn!("Chunk request of {} bytes for bucket {} failed: {}", want, bucket, e);
            HeapError::OutOfMemory {
                requested,
                source: Some(e),
            }
        })?;

        if region.len() < block_size {
            log::warn!("Page source returned {} bytes, wanted {}", region.len(), block_size);
            self.source.release_pages(region);
            return Err(HeapError::OutOfMemory {
                requested,
                source: None,
            });
        }

        let id = self.chunks.len() as u32;
        let mut chunk = Chunk::new(id, region, bucket);
        let slice_size = if catch_all { chunk.len() } else { block_size };
        let slots = chunk.slice(slice_size);

        log::debug!(
            "Chunk {} created for bucket {}: {} bytes, {} blocks",
            id,
            bucket,
            chunk.len(),
            slots.len()
        );

        self.reserved_bytes += chunk.len();
        self.chunks.push(chunk);

        let bucket = &mut self.buckets[bucket];
        bucket.chunks += 1;
        for slot in slots.into_iter().rev() {
            bucket.push(&mut self.chunks, BlockRef::new(id, slot));
        }
        Ok(())
    }

    /// Hand a free block back to its bucket, or orphan it when the bucket
    /// is at capacity
    fn release(&mut self, at: BlockRef) {
        let target = self.filing_bucket(self.block(at));
        let bounded = self.config.bounded_free_lists;

        match target {
            Some(bucket) if !bounded || self.buckets[bucket].has_room() => {
                self.buckets[bucket].push(&mut self.chunks, at);
            }
            _ => {
                let block = self.block_mut(at);
                block.state = BlockState::Orphaned;
                block.next = None;
                self.totals.orphaned_blocks += 1;
                log::trace!("Orphaned block {:?}", at);
            }
        }
    }

    /// Bucket a free block may be listed in without breaking the class
    /// size guarantee
    fn filing_bucket(&self, block: &Block) -> Option<usize> {
        if SizeClassTable::is_catch_all(block.bucket) {
            Some(CATCH_ALL)
        } else if block.span >= self.classes.block_size(block.bucket) {
            Some(block.bucket)
        } else {
            self.classes.classify_floor(block.span)
        }
    }

    /// Mark `at` live, stamp it, and record its provenance
    fn commit(&mut self, at: BlockRef, size: usize, align: usize, site: AllocSite) -> HeapHandle {
        let handle = HeapHandle::new(self.id, self.handles.insert(at));

        let chunk = &mut self.chunks[at.chunk as usize];
        let base = chunk.base_addr();
        let Some(block) = chunk.block_mut(at.slot) else {
            invariant_violation!("committing missing block {:?}", at)
        };
        block.state = BlockState::Live;
        block.next = None;
        block.align = align;
        block.requested = size;
        let span = block.span;
        let bucket = block.bucket;
        let address = base + block.payload_offset();

        chunk.used += span;
        chunk.stamp(at.slot);

        let key = self.tracker.record(address, size, site, handle);
        self.block_mut(at).tracking = Some(key);

        let totals = &mut self.totals;
        totals.total_allocated += size;
        totals.peak_allocation = totals.peak_allocation.max(totals.total_allocated);
        totals.allocation_count += 1;
        totals.lifetime_allocations += 1;
        self.buckets[bucket].served += 1;
        self.allocs_since_defrag += 1;

        log::trace!("Allocated {} bytes at {:#x} for {} ({:?})", size, address, site, handle);
        handle
    }

    fn fragmentation(&self) -> f32 {
        if self.reserved_bytes == 0 {
            return 0.0;
        }
        1.0 - self.totals.total_allocated as f32 / self.reserved_bytes as f32
    }

    fn stats(&self) -> HeapStats {
        debug_assert_eq!(self.tracker.len(), self.totals.allocation_count);
        debug_assert_eq!(self.tracker.total_bytes(), self.totals.total_allocated);

        let buckets = self
            .buckets
            .iter()
            .map(|bucket| BucketStats {
                index: bucket.index,
                block_size: (!SizeClassTable::is_catch_all(bucket.index)).then_some(bucket.block_size),
                free_count: bucket.free_count,
                max_blocks_per_chunk: bucket.max_blocks_per_chunk,
                chunks: bucket.chunks,
                served: bucket.served,
            })
            .collect();

        HeapStats {
            allocation_count: self.totals.allocation_count,
            total_allocated: self.totals.total_allocated,
            peak_allocation: self.totals.peak_allocation,
            lifetime_allocations: self.totals.lifetime_allocations,
            lifetime_deallocations: self.totals.lifetime_deallocations,
            chunk_count: self.chunks.len(),
            reserved_bytes: self.reserved_bytes,
            orphaned_blocks: self.totals.orphaned_blocks,
            defrag_count: self.defrag_count,
            since_last_defrag: self.last_defrag.elapsed(),
            fragmentation: self.fragmentation(),
            buckets,
        }
    }
}

/// Bytes between a free block's payload start and the next multiple of
/// `alignment`
fn aligned_slack(base: usize, block: &Block, alignment: usize) -> Option<usize> {
    let start = base.checked_add(block.payload_offset())?;
    Some(checked_align_up(start, alignment)? - start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use void_pages::CountingPages;

    fn site() -> AllocSite {
        AllocSite::new("heap.rs", 1)
    }

    fn manual() -> HeapConfig {
        HeapConfig::default().with_defrag_threshold(0)
    }

    #[test]
    fn test_freed_block_is_reused() {
        let heap = Heap::new(manual()).unwrap();

        let first = heap.allocate(100, site()).unwrap();
        let address = heap.address(first).unwrap();
        heap.deallocate(first).unwrap();

        let second = heap.allocate(100, site()).unwrap();
        assert_eq!(heap.address(second).unwrap(), address);
        assert_ne!(first, second);
        assert_eq!(heap.stats().chunk_count, 1);
    }

    #[test]
    fn test_header_stamped_on_commit() {
        let heap = Heap::new(manual()).unwrap();
        let handle = heap.allocate(48, site()).unwrap();

        let state = heap.state.lock();
        let at = *state.handles.get(handle.key()).unwrap();
        let header = state.chunks[at.chunk as usize].header(at.slot).unwrap();
        assert!(header.belongs_to(at));
        assert_eq!(header.bucket(), state.classes.classify(64));
    }

    #[test]
    fn test_tail_is_split_after_compaction() {
        let heap = Heap::new(manual()).unwrap();
        let kept = heap.allocate(100, site()).unwrap();
        heap.defragment();

        let bucket = SizeClassTable::new().classify(120);
        assert_eq!(heap.stats().buckets[bucket].free_count, 1);

        let next = heap.allocate(100, site()).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.buckets[bucket].free_count, 1);
        assert_eq!(stats.chunk_count, 1);

        let state = heap.state.lock();
        let at = *state.handles.get(next.key()).unwrap();
        assert_eq!(state.block(at).span, 128);
        drop(state);

        heap.deallocate(kept).unwrap();
        heap.deallocate(next).unwrap();
    }

    #[test]
    fn test_full_bucket_orphans_blocks() {
        let heap = Heap::new(manual().with_chunk_size(4096)).unwrap();
        let bucket = 5;
        let per_chunk = heap.stats().buckets[bucket].max_blocks_per_chunk;

        let handles: Vec<_> = (0..=per_chunk)
            .map(|_| heap.allocate(1000, site()).unwrap())
            .collect();
        assert_eq!(heap.stats().buckets[bucket].chunks, 2);

        for handle in handles {
            heap.deallocate(handle).unwrap();
        }
        let stats = heap.stats();
        assert_eq!(stats.buckets[bucket].free_count, per_chunk);
        assert_eq!(stats.orphaned_blocks, per_chunk);

        let summary = heap.defragment();
        assert_eq!(summary.tail_blocks, 2);
        assert_eq!(summary.blocks_moved, 0);

        let stats = heap.stats();
        assert_eq!(stats.orphaned_blocks, 0);
        assert_eq!(stats.buckets[bucket].free_count, 2);
    }

    #[test]
    fn test_unbounded_free_lists_never_orphan() {
        let mut config = manual().with_chunk_size(4096);
        config.bounded_free_lists = false;
        let heap = Heap::new(config).unwrap();
        let per_chunk = heap.stats().buckets[5].max_blocks_per_chunk;

        let handles: Vec<_> = (0..=per_chunk)
            .map(|_| heap.allocate(1000, site()).unwrap())
            .collect();
        for handle in handles {
            heap.deallocate(handle).unwrap();
        }

        let stats = heap.stats();
        assert_eq!(stats.orphaned_blocks, 0);
        assert_eq!(stats.buckets[5].free_count, 2 * per_chunk);
    }

    #[test]
    fn test_aligned_slack_is_carved() {
        let heap = Heap::new(manual()).unwrap();
        let handle = heap.allocate_aligned(100, 4096, site()).unwrap();

        let address = heap.address(handle).unwrap().as_ptr() as usize;
        assert_eq!(address % 4096, 0);

        // The leading slack of the first block became a free block of its own.
        let stats = heap.stats();
        let carved: usize = stats.buckets[..9].iter().map(|b| b.free_count).sum();
        assert_eq!(carved, 1);
        heap.deallocate(handle).unwrap();
    }

    #[test]
    fn test_poison_on_free() {
        let heap = Heap::new(manual()).unwrap();
        let handle = heap.allocate(64, site()).unwrap();
        heap.write(handle, 0, &[0xAB; 64]).unwrap();
        let address = heap.address(handle).unwrap();
        heap.deallocate(handle).unwrap();

        let again = heap.allocate(64, site()).unwrap();
        assert_eq!(heap.address(again).unwrap(), address);
        heap.with_bytes(again, |bytes| assert!(bytes.iter().all(|b| *b == 0)))
            .unwrap();
    }

    #[test]
    fn test_shutdown_reports_and_releases() {
        let pages = Arc::new(CountingPages::system());
        let heap = Heap::with_source(manual(), pages.clone()).unwrap();

        let kept = heap.allocate(100, AllocSite::new("world.rs", 7).with_tag("ecs")).unwrap();
        let big = heap.allocate(2_000_000, site()).unwrap();
        heap.deallocate(big).unwrap();
        assert_eq!(pages.requests(), 2);

        let report = heap.shutdown();
        assert_eq!(report.count, 1);
        assert_eq!(report.bytes, 100);
        assert_eq!(report.entries[0].handle, kept);
        assert_eq!(report.entries[0].site.to_string(), "world.rs:7 [ecs]");

        assert_eq!(pages.releases(), 2);
        assert_eq!(pages.outstanding_bytes(), 0);
    }

    #[test]
    fn test_catch_all_free_limit() {
        let run = |config: HeapConfig| {
            let heap = Heap::new(config).unwrap();
            let a = heap.allocate(2_000_000, site()).unwrap();
            let b = heap.allocate(2_000_000, site()).unwrap();
            heap.deallocate(a).unwrap();
            heap.deallocate(b).unwrap();
            let stats = heap.stats();
            (stats.buckets[CATCH_ALL].free_count, stats.orphaned_blocks)
        };

        assert_eq!(run(manual()), (1, 1));
        assert_eq!(run(manual().with_catch_all_free_limit(2)), (2, 0));
    }

    #[test]
    fn test_drop_releases_chunks() {
        let pages = Arc::new(CountingPages::system());
        {
            let heap = Heap::with_source(manual(), pages.clone()).unwrap();
            heap.allocate(100, site()).unwrap();
            heap.allocate(200_000, site()).unwrap();
            heap.allocate(2_000_000, site()).unwrap();
            assert_eq!(pages.requests(), 3);
        }
        assert_eq!(pages.releases(), 3);
        assert_eq!(pages.outstanding_bytes(), 0);
    }

    #[test]
    fn test_catch_all_first_fit() {
        let heap = Heap::new(manual()).unwrap();
        let big = heap.allocate(2_000_000, site()).unwrap();
        heap.deallocate(big).unwrap();

        let smaller = heap.allocate(1_500_000, site()).unwrap();
        assert_eq!(heap.stats().chunk_count, 1);
        assert_eq!(heap.size_of(smaller).unwrap(), 1_500_000);
    }
}
