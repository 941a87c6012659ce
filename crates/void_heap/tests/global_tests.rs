//! Process-wide heap lifecycle
//!
//! Kept in one test since the global heap is shared by the whole binary.

use void_heap::{global, AllocSite, HeapConfig, HeapError};

#[test]
fn test_global_lifecycle() {
    assert!(!global::is_initialized());
    assert!(matches!(global::heap(), Err(HeapError::NotInitialized)));
    assert!(global::shutdown().is_none());

    let heap = global::init(HeapConfig::default()).unwrap();
    assert!(global::is_initialized());
    assert!(matches!(
        global::init(HeapConfig::default()),
        Err(HeapError::AlreadyInitialized)
    ));

    let kept = heap.allocate(128, AllocSite::caller().with_tag("global")).unwrap();
    let freed = global::heap()
        .unwrap()
        .allocate(256, AllocSite::caller())
        .unwrap();
    heap.deallocate(freed).unwrap();
    drop(heap);

    let report = global::shutdown().unwrap();
    assert_eq!(report.count, 1);
    assert_eq!(report.bytes, 128);
    assert_eq!(report.entries[0].handle, kept);
    assert!(!global::is_initialized());

    let heap = void_heap::Heap::new(HeapConfig::default()).unwrap();
    global::init_with(heap).unwrap();
    assert!(global::shutdown().unwrap().is_empty());
}
