//! Heap report demonstration
//!
//! This example shows:
//! - Loading a heap configuration from TOML
//! - Tagged allocations from several subsystems
//! - Defragmentation with handles that stay valid
//! - Statistics and leak reports through the log facade
//!
//! Run with `RUST_LOG=debug` to see chunk creation and compaction.

use void_heap::prelude::*;

const CONFIG: &str = r#"
chunk_size = 65536
defrag_threshold = 0
compaction = "relocate"
"#;

fn main() -> Result<(), HeapError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("Engine Heap Demo");
    println!("================\n");

    let config = HeapConfig::from_toml_str(CONFIG)?;
    let heap = Heap::new(config)?;

    let mesh = heap.allocate(100, AllocSite::caller().with_tag("render"))?;
    let scratch = heap.allocate(4096, AllocSite::caller().with_tag("physics"))?;
    let voice = heap.allocate(50, AllocSite::caller().with_tag("audio"))?;
    let texture = heap.allocate_aligned(8192, 4096, AllocSite::caller().with_tag("render"))?;

    heap.write(mesh, 0, b"vertex data")?;
    heap.deallocate(scratch)?;

    {
        let frame = heap.scoped(256)?;
        frame.with_bytes_mut(|bytes| bytes.fill(0xFF))?;
        println!("Frame scratch of {} bytes lives until end of scope", frame.size()?);
    }

    let summary = heap.defragment();
    println!("Defragmented: {}", summary);

    let mut text = [0u8; 11];
    heap.read(mesh, 0, &mut text)?;
    println!("Mesh still reads {:?} after compaction", String::from_utf8_lossy(&text));

    heap.report_stats();
    heap.deallocate(texture)?;

    // `voice` and `mesh` are intentionally leaked.
    let report = heap.report_leaks();
    println!("\n{} allocations outstanding ({:?} first)", report.count, voice);

    Ok(())
}
