//! Compactor
//!
//! Slides the live blocks of every chunk toward offset 0, then turns the
//! free space left at the end of each chunk into a single free block.
//! Handles resolve through block slots, so only the block offsets, the
//! header stamps and the tracker addresses change.
//!
//! ```text
//! before:  [A][free][B][orphan][free][C][free]
//! after:   [A][B][C][        tail          ]
//! ```

use crate::align_up;
use crate::block::{Block, BlockRef, BLOCK_HEADER_SIZE};
use crate::heap::HeapState;
use crate::report::CompactionSummary;
use crate::size_class::{SizeClassTable, CATCH_ALL, MIN_CLASS_SIZE};

/// Compact every chunk and rebuild the free lists from the chunk tails
pub(crate) fn compact(state: &mut HeapState) -> CompactionSummary {
    let mut summary = CompactionSummary::default();

    for bucket in &mut state.buckets {
        bucket.clear();
    }
    state.totals.orphaned_blocks = 0;

    let mut tails = Vec::new();
    for index in 0..state.chunks.len() {
        if let Some(tail) = compact_chunk(state, index, &mut summary) {
            tails.push(tail);
        }
    }

    // Tails go in without the capacity check; they are the only free space left.
    for (at, bucket) in tails {
        state.buckets[bucket].push(&mut state.chunks, at);
        summary.tail_blocks += 1;
    }

    log::debug!("Defragmentation {}", summary);
    summary
}

/// Compact one chunk, returning its tail block and the bucket to file it in
fn compact_chunk(
    state: &mut HeapState,
    index: usize,
    summary: &mut CompactionSummary,
) -> Option<(BlockRef, usize)> {
    let HeapState {
        chunks,
        tracker,
        classes,
        ..
    } = state;
    let chunk = &mut chunks[index];
    let base = chunk.base_addr();

    summary.chunks_scanned += 1;

    let mut cursor = 0;
    let mut used = 0;
    let mut last_live = None;

    for slot in chunk.slots_by_offset() {
        let Some(block) = chunk.block(slot).cloned() else {
            invariant_violation!("chunk {} lost slot {} during compaction", index, slot)
        };

        if !block.is_live() {
            chunk.remove(slot);
            summary.blocks_reclaimed += 1;
            continue;
        }

        let mut moved = block.clone();
        if block.offset > cursor {
            let payload = align_up(base + cursor + BLOCK_HEADER_SIZE, block.align) - base;
            let padding = payload - cursor - BLOCK_HEADER_SIZE;

            if block.span >= BLOCK_HEADER_SIZE + padding + block.requested {
                let src = block.payload_offset();
                chunk
                    .bytes_mut()
                    .copy_within(src..src + block.requested, payload);

                moved.offset = cursor;
                moved.padding = padding;

                let relocated = block
                    .tracking
                    .map_or(false, |key| tracker.relocate(key, base + payload));
                if !relocated {
                    invariant_violation!("live block {} of chunk {} is untracked", slot, index);
                }

                summary.blocks_moved += 1;
                summary.bytes_moved += block.requested;
            } else {
                // Too little room at the new alignment: keep the payload
                // in place and absorb the gap as leading padding.
                let gap = block.offset - cursor;
                moved.offset = cursor;
                moved.span += gap;
                moved.padding += gap;
            }

            if let Some(target) = chunk.block_mut(slot) {
                *target = moved.clone();
            }
            chunk.stamp(slot);
        }

        cursor = moved.end();
        used += moved.span;
        last_live = Some(slot);
    }

    let tail = chunk.len() - cursor;
    let mut filed = None;

    if tail > 0 {
        match tail_bucket(classes, chunk.bucket(), tail) {
            Some(bucket) => {
                let slot = chunk.insert(Block::free(cursor, tail, bucket));
                filed = Some((chunk.block_ref(slot), bucket));
            }
            None => {
                let last = match last_live {
                    Some(slot) => chunk.block_mut(slot),
                    None => None,
                };
                let Some(block) = last else {
                    invariant_violation!("chunk {} has an unusable tail of {} bytes", index, tail)
                };
                block.span += tail;
                used += tail;
            }
        }
    }

    chunk.used = used;
    filed
}

/// Bucket for a chunk tail, `None` when it is too small to stand alone
fn tail_bucket(classes: &SizeClassTable, chunk_bucket: usize, tail: usize) -> Option<usize> {
    if tail < MIN_CLASS_SIZE {
        None
    } else if SizeClassTable::is_catch_all(chunk_bucket) {
        Some(CATCH_ALL)
    } else if tail >= classes.block_size(chunk_bucket) {
        Some(chunk_bucket)
    } else {
        classes.classify_floor(tail)
    }
}
