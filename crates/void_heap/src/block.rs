//! Blocks and block headers
//!
//! A block is a span of a chunk. Its bookkeeping lives in the chunk's slot
//! array, addressed by [`BlockRef`]; the first [`BLOCK_HEADER_SIZE`] bytes of
//! the span carry a stamped [`BlockHeader`] that must agree with it.
//!
//! ```text
//! offset
//! +--------------+-----------+----------------------------+
//! | BlockHeader  |  padding  |  payload (size bytes)      |
//! +--------------+-----------+----------------------------+
//! |<------------------------- span ---------------------->|
//! ```

use bytemuck::{Pod, Zeroable};

use crate::handle::SlotKey;

/// Header bytes reserved in front of every payload
pub const BLOCK_HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

const HEADER_MAGIC: u32 = 0x5648_4550;

/// On-chunk header stamp
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct BlockHeader {
    magic: u32,
    bucket: u32,
    chunk: u32,
    slot: u32,
}

impl BlockHeader {
    pub fn new(bucket: usize, at: BlockRef) -> Self {
        Self {
            magic: HEADER_MAGIC,
            bucket: bucket as u32,
            chunk: at.chunk,
            slot: at.slot,
        }
    }

    pub fn write_to(&self, bytes: &mut [u8]) {
        bytes[..BLOCK_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(self));
    }

    pub fn read_from(bytes: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(&bytes[..BLOCK_HEADER_SIZE])
    }

    /// Whether this stamp was written for the block at `at`
    pub fn belongs_to(&self, at: BlockRef) -> bool {
        self.magic == HEADER_MAGIC && self.chunk == at.chunk && self.slot == at.slot
    }

    pub fn bucket(&self) -> usize {
        self.bucket as usize
    }
}

/// Address of a block: chunk index plus slot within that chunk
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockRef {
    pub chunk: u32,
    pub slot: u32,
}

impl BlockRef {
    #[inline]
    pub const fn new(chunk: u32, slot: u32) -> Self {
        Self { chunk, slot }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    /// Linked into a bucket free list
    Free,
    /// Handed out and tracked
    Live,
    /// Freed while its bucket was at capacity; reclaimed by compaction
    Orphaned,
}

/// Block bookkeeping
#[derive(Clone, Debug)]
pub struct Block {
    /// Start of the header within the chunk
    pub offset: usize,
    /// Total bytes from `offset` to the next block
    pub span: usize,
    /// Slack between the header and the payload
    pub padding: usize,
    /// Size class this block is filed under
    pub bucket: usize,
    /// Alignment the payload must keep when moved
    pub align: usize,
    /// Bytes the caller asked for while live
    pub requested: usize,
    /// Next free block in the bucket list
    pub next: Option<BlockRef>,
    /// Tracker record while live
    pub tracking: Option<SlotKey>,
    pub state: BlockState,
}

impl Block {
    pub fn free(offset: usize, span: usize, bucket: usize) -> Self {
        debug_assert!(span >= BLOCK_HEADER_SIZE);
        Self {
            offset,
            span,
            padding: 0,
            bucket,
            align: crate::WORD_ALIGN,
            requested: 0,
            next: None,
            tracking: None,
            state: BlockState::Free,
        }
    }

    /// Usable payload bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.span - BLOCK_HEADER_SIZE - self.padding
    }

    /// Payload start within the chunk
    #[inline]
    pub fn payload_offset(&self) -> usize {
        self.offset + BLOCK_HEADER_SIZE + self.padding
    }

    /// One past the last byte of the span
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.span
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.state == BlockState::Live
    }
}
