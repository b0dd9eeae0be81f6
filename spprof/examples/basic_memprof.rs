//! Minimal heap profiling session against a toy host runtime.
//!
//! The demo plays the role of the host's allocator hooks: it reports a
//! stream of synthetic allocations from two call sites, frees part of
//! them, and prints the snapshot, the top allocators, and the stats.
//!
//! Run with: `cargo run --example basic_memprof`

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use spprof::host::{
    CodeDescriptor, CodeInfo, FrameRecord, HostRuntime, ThreadRef, ThreadState,
};
use spprof::AllocationProfiler;

#[derive(Default)]
struct DemoHost {
    lock: Mutex<()>,
    codes: Mutex<HashMap<usize, CodeInfo>>,
    epoch: AtomicU64,
}

impl DemoHost {
    fn add_code(&self, name: &str, file: &str, line: u32) -> *const CodeDescriptor {
        let info = CodeInfo {
            function_name: name.to_string(),
            filename: file.to_string(),
            line,
        };
        let ptr = Box::into_raw(Box::new(info.clone())) as usize;
        self.codes.lock().unwrap().insert(ptr, info);
        ptr as *const CodeDescriptor
    }
}

unsafe impl HostRuntime for DemoHost {
    fn enumerate_threads(&self) -> Vec<ThreadRef> {
        Vec::new()
    }

    fn with_global_lock(&self, f: &mut dyn FnMut()) {
        let _guard = self.lock.lock().unwrap();
        f();
    }

    unsafe fn retain_code(&self, _code: *const CodeDescriptor) {}
    unsafe fn release_code(&self, _code: *const CodeDescriptor) {}

    unsafe fn describe_code(&self, code: *const CodeDescriptor, lasti: u32) -> Option<CodeInfo> {
        self.codes.lock().unwrap().get(&(code as usize)).map(|info| CodeInfo {
            line: info.line + lasti,
            ..info.clone()
        })
    }

    fn gc_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    fn live_code_snapshot(&self) -> Vec<*const CodeDescriptor> {
        Vec::new()
    }

    fn thread_name(&self, _os_tid: u64) -> Option<String> {
        None
    }
}

fn main() {
    env_logger::init();

    let host = Arc::new(DemoHost::default());
    let loader = host.add_code("load_dataset", "pipeline.x", 12);
    let cache = host.add_code("fill_cache", "cache.x", 48);

    // The "interpreter thread" sits in load_dataset() or fill_cache().
    let state: &'static ThreadState = Box::leak(Box::new(ThreadState::new(1)));
    let loader_frame: &'static FrameRecord = Box::leak(Box::new(FrameRecord::new(loader, 2)));
    let cache_frame: &'static FrameRecord = Box::leak(Box::new(FrameRecord::new(cache, 5)));

    let profiler = AllocationProfiler::new(Arc::clone(&host) as _);
    unsafe { profiler.register_thread(state) };
    profiler.start(64 * 1024).expect("start memory profiling");

    // 4000 x 16 KiB from load_dataset: all retained.
    state.set_current_frame(loader_frame);
    for i in 0..4000u64 {
        profiler.record_alloc(0x1000_0000 + i * 0x4000, 16 * 1024);
    }

    // 8000 x 8 KiB from fill_cache: half freed again.
    state.set_current_frame(cache_frame);
    for i in 0..8000u64 {
        profiler.record_alloc(0x5000_0000 + i * 0x2000, 8 * 1024);
    }
    for i in 0..4000u64 {
        profiler.record_free(0x5000_0000 + i * 0x2000);
    }
    state.set_current_frame(std::ptr::null());

    let snapshot = profiler.snapshot();
    println!(
        "estimated live heap: {:.1} MiB across {} live samples ({} total, {} freed)",
        snapshot.estimated_heap_bytes as f64 / (1024.0 * 1024.0),
        snapshot.live_samples,
        snapshot.total_samples,
        profiler.stats().freed_samples,
    );

    println!("\ntop allocators:");
    for row in snapshot.top_allocators(5) {
        println!(
            "  {:>10.1} KiB in {:>4} samples  {} ({}:{})",
            row.estimated_bytes as f64 / 1024.0,
            row.sample_count,
            row.function,
            row.file,
            row.line
        );
    }

    println!("\ncollapsed (bytes):\n{}", snapshot.to_collapsed());

    let stats = profiler.stats();
    println!(
        "heap map load {:.2}%, {} collisions, {} unique stacks",
        stats.heap_map_load_percent, stats.collisions, stats.unique_stacks
    );

    profiler.stop();
    profiler.shutdown();
}
