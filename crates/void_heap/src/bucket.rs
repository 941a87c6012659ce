//! Buckets - one free list per size class
//!
//! The free list is singly linked through [`Block::next`], using
//! [`BlockRef`] indices instead of pointers stored in freed payloads.
//!
//! [`Block::next`]: crate::block::Block::next

use crate::block::{Block, BlockRef, BlockState};
use crate::chunk::Chunk;

pub struct Bucket {
    pub index: usize,
    /// Upper bound of the requests this class serves, header included
    pub block_size: usize,
    /// Blocks a fresh chunk of this class is sliced into; caps the free list
    pub max_blocks_per_chunk: usize,
    pub free_count: usize,
    /// Chunks created for this class
    pub chunks: usize,
    /// Allocations served over the heap's lifetime
    pub served: u64,
    head: Option<BlockRef>,
}

fn block_mut(chunks: &mut [Chunk], at: BlockRef) -> &mut Block {
    match chunks.get_mut(at.chunk as usize).and_then(|c| c.block_mut(at.slot)) {
        Some(block) => block,
        None => invariant_violation!("free list references missing block {:?}", at),
    }
}

impl Bucket {
    pub fn new(index: usize, block_size: usize, max_blocks_per_chunk: usize) -> Self {
        Self {
            index,
            block_size,
            max_blocks_per_chunk,
            free_count: 0,
            chunks: 0,
            served: 0,
            head: None,
        }
    }

    /// Whether another freed block may be linked without passing the cap
    #[inline]
    pub fn has_room(&self) -> bool {
        self.free_count < self.max_blocks_per_chunk
    }

    pub fn push(&mut self, chunks: &mut [Chunk], at: BlockRef) {
        let block = block_mut(chunks, at);
        block.bucket = self.index;
        block.state = BlockState::Free;
        block.next = self.head;
        self.head = Some(at);
        self.free_count += 1;
    }

    pub fn pop(&mut self, chunks: &mut [Chunk]) -> Option<BlockRef> {
        let at = self.head?;
        let block = block_mut(chunks, at);
        self.head = block.next.take();
        self.free_count -= 1;
        Some(at)
    }

    /// Unlink the first block accepted by `fits`.
    ///
    /// `fits` sees the block and its chunk's base address.
    pub fn take_first<F>(&mut self, chunks: &mut [Chunk], mut fits: F) -> Option<BlockRef>
    where
        F: FnMut(&Block, usize) -> bool,
    {
        let mut prev: Option<BlockRef> = None;
        let mut current = self.head;

        while let Some(at) = current {
            let chunk = &chunks[at.chunk as usize];
            let base = chunk.base_addr();
            let (accepted, next) = match chunk.block(at.slot) {
                Some(block) => (fits(block, base), block.next),
                None => invariant_violation!("free list references missing block {:?}", at),
            };

            if accepted {
                block_mut(chunks, at).next = None;
                match prev {
                    Some(p) => block_mut(chunks, p).next = next,
                    None => self.head = next,
                }
                self.free_count -= 1;
                return Some(at);
            }

            prev = current;
            current = next;
        }

        None
    }

    /// Forget every linked block; the blocks themselves are left alone
    pub fn clear(&mut self) {
        self.head = None;
        self.free_count = 0;
    }
}
