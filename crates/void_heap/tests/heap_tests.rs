//! Integration tests for void_heap
//!
//! Tests allocation, reuse, alignment, exhaustion, compaction and reporting

use std::sync::Arc;
use std::thread;

use void_heap::*;
use void_pages::{CountingPages, PageError};

fn manual() -> HeapConfig {
    HeapConfig::default().with_defrag_threshold(0)
}

fn counted(config: HeapConfig) -> (Arc<CountingPages>, Heap) {
    let pages = Arc::new(CountingPages::system());
    let heap = Heap::with_source(config, pages.clone()).unwrap();
    (pages, heap)
}

fn fill(heap: &Heap, handle: HeapHandle, seed: u8) {
    heap.with_bytes_mut(handle, |bytes| {
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = seed.wrapping_add(i as u8);
        }
    })
    .unwrap();
}

fn check(heap: &Heap, handle: HeapHandle, seed: u8) {
    heap.with_bytes(handle, |bytes| {
        for (i, byte) in bytes.iter().enumerate() {
            assert_eq!(*byte, seed.wrapping_add(i as u8), "byte {} of {:?}", i, handle);
        }
    })
    .unwrap();
}

#[test]
fn test_round_trip_reuses_bucket() {
    let heap = Heap::new(manual()).unwrap();
    let classes = SizeClassTable::new();

    for size in [1, 24, 100, 500, 1000, 3000, 8000, 20_000, 300_000] {
        let bucket = classes.classify(align_up(size + BLOCK_HEADER_SIZE, WORD_ALIGN));

        let handle = heap.allocate(size, AllocSite::caller()).unwrap();
        let served = heap.stats().buckets[bucket].free_count;
        let chunks = heap.stats().chunk_count;

        heap.deallocate(handle).unwrap();
        assert_eq!(heap.stats().buckets[bucket].free_count, served + 1, "size {}", size);

        let again = heap.allocate(size, AllocSite::caller()).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.buckets[bucket].free_count, served, "size {}", size);
        assert_eq!(stats.chunk_count, chunks);

        heap.deallocate(again).unwrap();
    }
}

#[test]
fn test_aligned_allocations() {
    let heap = Heap::new(manual()).unwrap();

    for alignment in [8, 16, 32, 64, 4096] {
        for size in [1, 7, 64, 100, 1000, 5000] {
            let handle = heap
                .allocate_aligned(size, alignment, AllocSite::caller())
                .unwrap();
            let address = heap.address(handle).unwrap().as_ptr() as usize;
            assert!(is_aligned(address, alignment), "{} bytes at {}", size, alignment);
            assert_eq!(heap.size_of(handle).unwrap(), size);
        }
    }
}

#[test]
fn test_leak_accounting() {
    let heap = Heap::new(manual()).unwrap();
    let sizes = [8, 100, 250, 4096, 70_000, 1_500_000];

    for size in sizes {
        heap.allocate(size, AllocSite::caller().with_tag("leak")).unwrap();
    }

    let report = heap.report_leaks();
    assert_eq!(report.count, sizes.len());
    assert_eq!(report.bytes, sizes.iter().sum::<usize>());
    let reported: Vec<usize> = report.entries.iter().map(|e| e.size).collect();
    assert_eq!(reported, sizes);
    assert!(report.entries.iter().all(|e| e.site.tag == Some("leak")));
}

#[test]
fn test_invalid_requests_leave_counters() {
    let (pages, heap) = counted(manual());
    let before = heap.stats();

    assert!(matches!(heap.allocate(0, AllocSite::caller()), Err(HeapError::ZeroSize)));
    assert!(matches!(
        heap.allocate_aligned(16, 3, AllocSite::caller()),
        Err(HeapError::InvalidAlignment { alignment: 3, .. })
    ));
    assert!(matches!(
        heap.allocate_aligned(16, 4, AllocSite::caller()),
        Err(HeapError::InvalidAlignment { alignment: 4, .. })
    ));
    assert!(matches!(
        heap.allocate_aligned(0, 16, AllocSite::caller()),
        Err(HeapError::ZeroSize)
    ));

    let after = heap.stats();
    assert_eq!(after.allocation_count, before.allocation_count);
    assert_eq!(after.lifetime_allocations, before.lifetime_allocations);
    assert_eq!(after.total_allocated, before.total_allocated);
    assert_eq!(after.chunk_count, 0);
    assert_eq!(pages.requests(), 0);
}

#[test]
fn test_freed_block_reused_without_new_chunk() {
    let (pages, heap) = counted(manual());

    let small = heap.allocate(100, AllocSite::new("physics.rs", 10).with_tag("physics")).unwrap();
    let page = heap.allocate(4096, AllocSite::new("render.rs", 20).with_tag("render")).unwrap();
    let tiny = heap.allocate(50, AllocSite::new("audio.rs", 30).with_tag("audio")).unwrap();

    let address = heap.address(page).unwrap();
    heap.deallocate(page).unwrap();

    let requests = pages.requests();
    let chunks = heap.stats().chunk_count;
    let again = heap.allocate(4096, AllocSite::new("render.rs", 40).with_tag("render")).unwrap();
    assert_eq!(heap.address(again).unwrap(), address);
    assert_eq!(pages.requests(), requests);
    assert_eq!(heap.stats().chunk_count, chunks);

    heap.deallocate(again).unwrap();
    let report = heap.report_leaks();
    assert_eq!(report.count, 2);
    assert_eq!(report.entries[0].size, 100);
    assert_eq!(report.entries[0].handle, small);
    assert_eq!(report.entries[1].size, 50);
    assert_eq!(report.entries[1].handle, tiny);
    assert_eq!(report.bytes, 150);
}

#[test]
fn test_compaction_preserves_contents() {
    let heap = Heap::new(manual()).unwrap();

    let mut handles = Vec::new();
    for i in 0..200usize {
        let size = 24 + (i * 37) % 900;
        let handle = if i % 5 == 0 {
            heap.allocate_aligned(size, 64, AllocSite::caller()).unwrap()
        } else {
            heap.allocate(size, AllocSite::caller()).unwrap()
        };
        fill(&heap, handle, i as u8);
        handles.push((i, handle));
    }

    let mut kept = Vec::new();
    for (i, handle) in handles {
        if i % 2 == 0 {
            heap.deallocate(handle).unwrap();
        } else {
            kept.push((i, handle));
        }
    }

    let summary = heap.defragment();
    assert!(summary.blocks_moved > 0);
    assert_eq!(heap.stats().orphaned_blocks, 0);

    for (i, handle) in &kept {
        check(&heap, *handle, *i as u8);
        let info = heap.info(*handle).unwrap();
        assert_eq!(info.address, heap.address(*handle).unwrap().as_ptr() as usize);
        if i % 5 == 0 {
            assert!(is_aligned(info.address, 64));
        }
    }

    // The compacted heap keeps serving requests.
    let fresh = heap.allocate(300, AllocSite::caller()).unwrap();
    fill(&heap, fresh, 9);
    for (i, handle) in &kept {
        check(&heap, *handle, *i as u8);
    }
    check(&heap, fresh, 9);
}

#[test]
fn test_threshold_triggers_compaction() {
    let heap = Heap::new(HeapConfig::default().with_defrag_threshold(10)).unwrap();

    for _ in 0..10 {
        heap.allocate(64, AllocSite::caller()).unwrap();
    }
    assert_eq!(heap.stats().defrag_count, 0);

    heap.allocate(64, AllocSite::caller()).unwrap();
    assert_eq!(heap.stats().defrag_count, 1);
}

#[test]
fn test_disabled_compaction_moves_nothing() {
    let config = manual().with_compaction(CompactionMode::Disabled);
    let heap = Heap::new(config).unwrap();

    let a = heap.allocate(100, AllocSite::caller()).unwrap();
    let b = heap.allocate(100, AllocSite::caller()).unwrap();
    heap.deallocate(a).unwrap();
    let address = heap.address(b).unwrap();

    assert_eq!(heap.defragment(), CompactionSummary::default());
    assert_eq!(heap.address(b).unwrap(), address);
    assert_eq!(heap.stats().defrag_count, 1);
}

#[test]
fn test_exhausted_source() {
    let pages = Arc::new(CountingPages::system().with_max_requests(1));
    let heap = Heap::with_source(manual(), pages.clone()).unwrap();

    let first = heap.allocate(100, AllocSite::caller()).unwrap();
    let before = heap.stats();

    match heap.allocate(10_000, AllocSite::caller()) {
        Err(HeapError::OutOfMemory { requested, source }) => {
            assert_eq!(requested, 10_000);
            assert!(matches!(source, Some(PageError::Exhausted { .. })));
        }
        other => panic!("expected exhaustion, got {:?}", other),
    }

    let after = heap.stats();
    assert_eq!(after.chunk_count, before.chunk_count);
    assert_eq!(after.allocation_count, 1);
    assert_eq!(after.reserved_bytes, before.reserved_bytes);
    assert_eq!(pages.failures(), 1);

    // The existing chunk still serves its own class.
    heap.allocate(100, AllocSite::caller()).unwrap();
    heap.deallocate(first).unwrap();
}

#[test]
fn test_stale_handles_rejected() {
    let heap = Heap::new(manual()).unwrap();
    let handle = heap.allocate(32, AllocSite::caller()).unwrap();

    heap.deallocate(handle).unwrap();
    assert!(matches!(heap.deallocate(handle), Err(HeapError::InvalidHandle(h)) if h == handle));
    assert!(matches!(heap.size_of(handle), Err(HeapError::InvalidHandle(_))));
    assert!(!heap.contains(handle));

    // A new allocation in the same slot does not revive the old handle.
    let reused = heap.allocate(32, AllocSite::caller()).unwrap();
    assert_eq!(reused.index(), handle.index());
    assert_ne!(reused.generation(), handle.generation());
    assert!(heap.write(handle, 0, &[1]).is_err());

    assert!(heap.deallocate(HeapHandle::null()).is_ok());
    assert_eq!(heap.stats().allocation_count, 1);
}

#[test]
fn test_byte_access_bounds() {
    let heap = Heap::new(manual()).unwrap();
    let handle = heap.allocate(16, AllocSite::caller()).unwrap();

    heap.write(handle, 8, b"void").unwrap();
    let mut buf = [0u8; 4];
    heap.read(handle, 8, &mut buf).unwrap();
    assert_eq!(&buf, b"void");

    assert!(matches!(
        heap.write(handle, 14, b"void"),
        Err(HeapError::OutOfBounds { offset: 14, end: 18, size: 16 })
    ));
}

#[test]
fn test_stats_track_peak_and_fragmentation() {
    let heap = Heap::new(manual()).unwrap();
    assert_eq!(heap.fragmentation(), 0.0);

    let a = heap.allocate(1000, AllocSite::caller()).unwrap();
    let b = heap.allocate(2000, AllocSite::caller()).unwrap();
    heap.deallocate(a).unwrap();

    let stats = heap.report_stats();
    assert_eq!(stats.total_allocated, 2000);
    assert_eq!(stats.peak_allocation, 3000);
    assert_eq!(stats.lifetime_allocations, 2);
    assert_eq!(stats.lifetime_deallocations, 1);
    assert!(stats.fragmentation > 0.0 && stats.fragmentation < 1.0);
    assert!(stats.to_string().contains("allocations: 1"));

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["total_allocated"], 2000);
    assert_eq!(json["buckets"].as_array().unwrap().len(), NUM_BUCKETS);
    heap.deallocate(b).unwrap();
}

#[test]
fn test_concurrent_callers() {
    let heap = Arc::new(Heap::new(HeapConfig::default().with_defrag_threshold(500)).unwrap());

    let workers: Vec<_> = (0..4u8)
        .map(|t| {
            let heap = Arc::clone(&heap);
            thread::spawn(move || {
                let mut live = Vec::new();
                for i in 0..400usize {
                    let handle = heap.allocate(16 + i % 300, AllocSite::caller()).unwrap();
                    fill(&heap, handle, t);
                    live.push(handle);
                    if i % 3 == 0 {
                        let handle = live.swap_remove(0);
                        check(&heap, handle, t);
                        heap.deallocate(handle).unwrap();
                    }
                }
                for handle in live {
                    check(&heap, handle, t);
                    heap.deallocate(handle).unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    let stats = heap.stats();
    assert_eq!(stats.allocation_count, 0);
    assert_eq!(stats.total_allocated, 0);
    assert!(heap.leaks().is_empty());
}

#[test]
fn test_foreign_handles_rejected() {
    let a = Heap::new(manual()).unwrap();
    let b = Heap::new(manual()).unwrap();

    let from_a = a.allocate(64, AllocSite::caller()).unwrap();
    let from_b = b.allocate(64, AllocSite::caller()).unwrap();
    assert_eq!(from_a.index(), from_b.index());
    assert_eq!(from_a.generation(), from_b.generation());
    assert_ne!(from_a.heap_id(), from_b.heap_id());
    b.write(from_b, 0, b"mine").unwrap();

    assert!(matches!(b.deallocate(from_a), Err(HeapError::InvalidHandle(h)) if h == from_a));
    assert!(!b.contains(from_a));
    assert!(matches!(b.size_of(from_a), Err(HeapError::InvalidHandle(_))));
    assert!(b.write(from_a, 0, b"evil").is_err());
    assert!(b.with_bytes(from_a, |_| ()).is_err());
    assert!(b.address(from_a).is_err());

    // Heap `b` keeps its own allocation untouched.
    assert!(b.contains(from_b));
    let mut buf = [0u8; 4];
    b.read(from_b, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"mine");
    assert_eq!(b.stats().allocation_count, 1);

    a.deallocate(from_a).unwrap();
    b.deallocate(from_b).unwrap();
}
