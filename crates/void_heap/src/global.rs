//! Process-wide heap
//!
//! Engine subsystems that do not own a [`Heap`] share this one. It is
//! initialized once at startup and torn down explicitly at shutdown.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::HeapConfig;
use crate::error::{HeapError, HeapResult};
use crate::heap::Heap;
use crate::report::LeakReport;

static GLOBAL: RwLock<Option<Arc<Heap>>> = parking_lot::const_rwlock(None);

/// Create the global heap from `config`
pub fn init(config: HeapConfig) -> HeapResult<Arc<Heap>> {
    let mut global = GLOBAL.write();
    if global.is_some() {
        return Err(HeapError::AlreadyInitialized);
    }
    let heap = Arc::new(Heap::new(config)?);
    *global = Some(Arc::clone(&heap));
    Ok(heap)
}

/// Install an existing heap as the global heap
pub fn init_with(heap: Heap) -> HeapResult<Arc<Heap>> {
    let mut global = GLOBAL.write();
    if global.is_some() {
        return Err(HeapError::AlreadyInitialized);
    }
    let heap = Arc::new(heap);
    *global = Some(Arc::clone(&heap));
    Ok(heap)
}

/// The global heap
pub fn heap() -> HeapResult<Arc<Heap>> {
    GLOBAL.read().clone().ok_or(HeapError::NotInitialized)
}

pub fn is_initialized() -> bool {
    GLOBAL.read().is_some()
}

/// Uninstall the global heap and report what it still holds.
///
/// The heap itself is released once the last outstanding `Arc` drops.
/// Returns `None` if no heap was installed.
pub fn shutdown() -> Option<LeakReport> {
    let heap = GLOBAL.write().take()?;
    let report = heap.leaks();
    log::info!(
        "Global heap shut down with {} live allocations ({} bytes)",
        report.count,
        report.bytes
    );
    Some(report)
}
