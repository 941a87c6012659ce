//! Diagnostic reports
//!
//! Snapshots of heap state taken under the heap lock. Each report renders
//! as line-oriented text and is also serializable.

use core::fmt;
use core::time::Duration;
use serde::Serialize;

use crate::handle::HeapHandle;
use crate::tracker::AllocSite;

/// Free-list state of one size class
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BucketStats {
    pub index: usize,
    /// Nominal block size; `None` for the catch-all
    pub block_size: Option<usize>,
    pub free_count: usize,
    pub max_blocks_per_chunk: usize,
    pub chunks: usize,
    pub served: u64,
}

/// Heap-wide statistics
#[derive(Clone, Debug, Serialize)]
pub struct HeapStats {
    /// Live allocations
    pub allocation_count: usize,
    /// Payload bytes currently allocated
    pub total_allocated: usize,
    /// High-water mark of `total_allocated`
    pub peak_allocation: usize,
    pub lifetime_allocations: u64,
    pub lifetime_deallocations: u64,
    pub chunk_count: usize,
    /// Bytes obtained from the page source
    pub reserved_bytes: usize,
    /// Freed blocks dropped from their full free lists
    pub orphaned_blocks: usize,
    pub defrag_count: u64,
    pub since_last_defrag: Duration,
    /// `1 - total_allocated / reserved_bytes`
    pub fragmentation: f32,
    pub buckets: Vec<BucketStats>,
}

impl HeapStats {
    /// Emit the report through the log facade
    pub fn log(&self) {
        for line in self.to_string().lines() {
            log::info!("{}", line);
        }
    }
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(f, "  allocations: {}", self.allocation_count)?;
        writeln!(
            f,
            "  allocated: {} bytes (peak {} bytes)",
            self.total_allocated, self.peak_allocation
        )?;
        writeln!(
            f,
            "  lifetime: {} allocations, {} deallocations",
            self.lifetime_allocations, self.lifetime_deallocations
        )?;
        writeln!(
            f,
            "  chunks: {} ({} bytes reserved, fragmentation {:.1}%)",
            self.chunk_count,
            self.reserved_bytes,
            self.fragmentation * 100.0
        )?;
        writeln!(f, "  orphaned blocks: {}", self.orphaned_blocks)?;
        writeln!(
            f,
            "  defragmentations: {} (last {:.3}s ago)",
            self.defrag_count,
            self.since_last_defrag.as_secs_f64()
        )?;

        for bucket in self.buckets.iter().filter(|b| b.chunks > 0 || b.free_count > 0) {
            match bucket.block_size {
                Some(size) => write!(f, "  bucket {:>2} ({:>7} B)", bucket.index, size)?,
                None => write!(f, "  bucket {:>2} (catch-all)", bucket.index)?,
            }
            writeln!(
                f,
                ": {} free / {} per chunk, {} chunks",
                bucket.free_count, bucket.max_blocks_per_chunk, bucket.chunks
            )?;
        }
        Ok(())
    }
}

/// One outstanding allocation
#[derive(Clone, Copy, Debug, Serialize)]
pub struct LeakEntry {
    pub size: usize,
    pub address: usize,
    pub site: AllocSite,
    pub handle: HeapHandle,
}

/// Every allocation still live at the time of the report
#[derive(Clone, Debug, Default, Serialize)]
pub struct LeakReport {
    pub entries: Vec<LeakEntry>,
    pub count: usize,
    pub bytes: usize,
}

impl LeakReport {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn log(&self) {
        for line in self.to_string().lines() {
            log::info!("{}", line);
        }
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(
                f,
                "Leak: {} bytes at {:#x} allocated at {}",
                entry.size, entry.address, entry.site
            )?;
        }
        writeln!(f, "{} leaked allocations, {} bytes", self.count, self.bytes)
    }
}

/// What one defragmentation pass did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CompactionSummary {
    pub chunks_scanned: usize,
    pub blocks_moved: usize,
    pub bytes_moved: usize,
    /// Free and orphaned blocks folded away
    pub blocks_reclaimed: usize,
    /// Tail blocks re-linked into free lists
    pub tail_blocks: usize,
}

impl fmt::Display for CompactionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "compacted {} chunks: moved {} blocks ({} bytes), reclaimed {}, {} tail blocks",
            self.chunks_scanned,
            self.blocks_moved,
            self.bytes_moved,
            self.blocks_reclaimed,
            self.tail_blocks
        )
    }
}
