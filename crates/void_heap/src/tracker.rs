//! Allocation tracker - provenance for every live allocation
//!
//! One [`AllocationInfo`] exists per live allocation. The records feed the
//! leak report and are the source of truth for which blocks are live when
//! the compactor runs.

use core::fmt;
use core::panic::Location;
use serde::Serialize;

use crate::handle::{HeapHandle, SlotKey, Slots};
use crate::report::{LeakEntry, LeakReport};

/// Where an allocation was requested from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct AllocSite {
    pub file: &'static str,
    pub line: u32,
    pub tag: Option<&'static str>,
}

impl AllocSite {
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self {
            file,
            line,
            tag: None,
        }
    }

    /// The source location of the call to this function
    #[track_caller]
    pub fn caller() -> Self {
        let location = Location::caller();
        Self::new(location.file(), location.line())
    }

    /// A site with no location, for allocations made on behalf of others
    pub const fn unknown() -> Self {
        Self::new("<unknown>", 0)
    }

    /// Attach a subsystem tag
    pub const fn with_tag(mut self, tag: &'static str) -> Self {
        self.tag = Some(tag);
        self
    }
}

impl fmt::Display for AllocSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)?;
        if let Some(tag) = self.tag {
            write!(f, " [{}]", tag)?;
        }
        Ok(())
    }
}

/// Provenance record for one live allocation
#[derive(Clone, Debug, Serialize)]
pub struct AllocationInfo {
    /// Current payload address; updated when compaction moves the block
    pub address: usize,
    /// Payload bytes requested
    pub size: usize,
    pub site: AllocSite,
    pub handle: HeapHandle,
    /// Allocation order, used to sort reports
    pub sequence: u64,
}

#[derive(Default)]
pub(crate) struct AllocationTracker {
    records: Slots<AllocationInfo>,
    next_sequence: u64,
    total_bytes: usize,
}

impl AllocationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        address: usize,
        size: usize,
        site: AllocSite,
        handle: HeapHandle,
    ) -> SlotKey {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.total_bytes += size;

        self.records.insert(AllocationInfo {
            address,
            size,
            site,
            handle,
            sequence,
        })
    }

    pub fn remove(&mut self, key: SlotKey) -> Option<AllocationInfo> {
        let info = self.records.remove(key)?;
        self.total_bytes -= info.size;
        Some(info)
    }

    pub fn get(&self, key: SlotKey) -> Option<&AllocationInfo> {
        self.records.get(key)
    }

    /// Point a record at the payload's new address
    pub fn relocate(&mut self, key: SlotKey, address: usize) -> bool {
        match self.records.get_mut(key) {
            Some(info) => {
                info.address = address;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sum of tracked payload sizes
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Records in allocation order
    pub fn ordered(&self) -> Vec<&AllocationInfo> {
        let mut records: Vec<&AllocationInfo> = self.records.iter().map(|(_, info)| info).collect();
        records.sort_by_key(|info| info.sequence);
        records
    }

    pub fn leak_report(&self) -> LeakReport {
        let entries: Vec<LeakEntry> = self
            .ordered()
            .into_iter()
            .map(|info| LeakEntry {
                size: info.size,
                address: info.address,
                site: info.site,
                handle: info.handle,
            })
            .collect();

        LeakReport {
            count: entries.len(),
            bytes: self.total_bytes,
            entries,
        }
    }
}
