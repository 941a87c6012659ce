//! Chunks - page-sourced regions sliced into blocks
//!
//! A chunk is created for one bucket and sliced into that bucket's block
//! size. Splits and compaction can later change the spans, but the blocks
//! of a chunk always tile it from offset 0 to its length.

use core::ptr::NonNull;
use void_pages::PageRegion;

use crate::block::{Block, BlockHeader, BlockRef, BLOCK_HEADER_SIZE};

pub struct Chunk {
    id: u32,
    region: PageRegion,
    /// Size class the chunk was sliced for
    bucket: usize,
    /// Block slots, stable across compaction
    blocks: Vec<Option<Block>>,
    /// Vacant slot indices
    vacant: Vec<u32>,
    /// Bytes spanned by live blocks
    pub used: usize,
}

impl Chunk {
    pub fn new(id: u32, region: PageRegion, bucket: usize) -> Self {
        Self {
            id,
            region,
            bucket,
            blocks: Vec::new(),
            vacant: Vec::new(),
            used: 0,
        }
    }

    /// Cut the whole region into `block_size` spans filed under `bucket`.
    ///
    /// Leftover bytes too small for another block extend the last span.
    /// Returns the new slots in address order.
    pub fn slice(&mut self, block_size: usize) -> Vec<u32> {
        debug_assert!(self.blocks.is_empty());
        debug_assert!(block_size > BLOCK_HEADER_SIZE && block_size <= self.len());

        let count = self.len() / block_size;
        let mut slots = Vec::with_capacity(count);

        for i in 0..count {
            let mut span = block_size;
            if i + 1 == count {
                span += self.len() - count * block_size;
            }
            let slot = self.insert(Block::free(i * block_size, span, self.bucket));
            slots.push(slot);
        }

        slots
    }

    #[inline]
    pub fn bucket(&self) -> usize {
        self.bucket
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.region.len()
    }

    #[inline]
    pub fn base_addr(&self) -> usize {
        self.region.base_addr()
    }

    #[inline]
    pub fn block_ref(&self, slot: u32) -> BlockRef {
        BlockRef::new(self.id, slot)
    }

    pub fn insert(&mut self, block: Block) -> u32 {
        if let Some(slot) = self.vacant.pop() {
            self.blocks[slot as usize] = Some(block);
            slot
        } else {
            self.blocks.push(Some(block));
            (self.blocks.len() - 1) as u32
        }
    }

    pub fn remove(&mut self, slot: u32) -> Option<Block> {
        let block = self.blocks.get_mut(slot as usize)?.take()?;
        self.vacant.push(slot);
        Some(block)
    }

    #[inline]
    pub fn block(&self, slot: u32) -> Option<&Block> {
        self.blocks.get(slot as usize)?.as_ref()
    }

    #[inline]
    pub fn block_mut(&mut self, slot: u32) -> Option<&mut Block> {
        self.blocks.get_mut(slot as usize)?.as_mut()
    }

    /// Occupied slots sorted by offset
    pub fn slots_by_offset(&self) -> Vec<u32> {
        let mut slots: Vec<u32> = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_some())
            .map(|(i, _)| i as u32)
            .collect();
        slots.sort_by_key(|slot| self.blocks[*slot as usize].as_ref().map(|b| b.offset));
        slots
    }

    /// Pointer to `offset` bytes into the region
    #[inline]
    pub fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.len());
        // SAFETY: offset stays within the mapped region
        unsafe { NonNull::new_unchecked(self.region.as_ptr().add(offset)) }
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        self.region.as_slice()
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.region.as_mut_slice()
    }

    /// Write the header stamp for `slot` at its current offset
    pub fn stamp(&mut self, slot: u32) {
        let Some(block) = self.block(slot) else {
            invariant_violation!("stamping vacant slot {} of chunk {}", slot, self.id)
        };
        let offset = block.offset;
        let header = BlockHeader::new(block.bucket, self.block_ref(slot));
        header.write_to(&mut self.bytes_mut()[offset..]);
    }

    /// Read back the header stamp of `slot`
    pub fn header(&self, slot: u32) -> Option<BlockHeader> {
        let block = self.block(slot)?;
        Some(BlockHeader::read_from(&self.bytes()[block.offset..]))
    }

    pub fn into_region(self) -> PageRegion {
        self.region
    }
}
