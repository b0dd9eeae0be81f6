//! Minimal CPU profiling session against a toy host runtime.
//!
//! Real embeddings implement [`spprof::host::HostRuntime`] over an actual
//! interpreter; this demo fakes one interpreter thread that alternates
//! between two call stacks while burning CPU, then prints the collapsed
//! profile and the flame-graph JSON.
//!
//! Run with: `cargo run --example basic_profile`

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use spprof::host::{
    CodeDescriptor, CodeInfo, FrameRecord, HostRuntime, ThreadRef, ThreadState,
};
use spprof::{BackendChoice, CpuConfig, Profiler};

/// A host with a fixed set of "code objects" and one interpreter thread.
#[derive(Default)]
struct DemoHost {
    lock: Mutex<()>,
    codes: Mutex<HashMap<usize, CodeInfo>>,
    threads: Mutex<Vec<(u64, usize)>>,
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
        self.threads
            .lock()
            .unwrap()
            .iter()
            .map(|&(os_tid, state)| ThreadRef {
                os_tid,
                state: state as *const ThreadState,
            })
            .collect()
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
        self.codes
            .lock()
            .unwrap()
            .keys()
            .map(|&ptr| ptr as *const CodeDescriptor)
            .collect()
    }

    fn thread_name(&self, os_tid: u64) -> Option<String> {
        (os_tid == 1).then(|| "main".to_string())
    }

    fn runtime_version(&self) -> String {
        "demo-1.0".to_string()
    }
}

fn main() {
    env_logger::init();

    let host = Arc::new(DemoHost::default());
    let main_mod = host.add_code("<module>", "app.x", 1);
    let render = host.add_code("render", "app.x", 40);
    let simulate = host.add_code("simulate", "app.x", 90);

    // One fake interpreter thread: <module> calling render() or simulate().
    let state: &'static ThreadState = Box::leak(Box::new(ThreadState::new(1)));
    let root: &'static FrameRecord = Box::leak(Box::new(FrameRecord::new(main_mod, 0)));
    let render_frame: &'static FrameRecord = Box::leak(Box::new(FrameRecord::new(render, 3)));
    let simulate_frame: &'static FrameRecord =
        Box::leak(Box::new(FrameRecord::new(simulate, 7)));
    render_frame.set_back(root);
    simulate_frame.set_back(root);
    host.add_thread_state(state);

    let stop = Arc::new(AtomicBool::new(false));
    let worker_stop = Arc::clone(&stop);
    let render_addr = render_frame as *const FrameRecord as usize;
    let simulate_addr = simulate_frame as *const FrameRecord as usize;
    let state_addr = state as *const ThreadState as usize;
    let worker = std::thread::spawn(move || {
        let state = unsafe { &*(state_addr as *const ThreadState) };
        let mut flip = 0u64;
        while !worker_stop.load(Ordering::Relaxed) {
            let frame = if flip % 3 == 0 {
                simulate_addr
            } else {
                render_addr
            };
            state.set_current_frame(frame as *const FrameRecord);
            // Burn a little CPU in the "interpreter".
            for _ in 0..50_000 {
                flip = flip.wrapping_mul(6364136223846793005).wrapping_add(1);
            }
            std::hint::black_box(flip);
        }
        state.set_current_frame(std::ptr::null());
    });

    let profiler = Profiler::new(host);
    profiler
        .start(CpuConfig {
            interval_ms: 5,
            backend: BackendChoice::Supervisor,
            ..CpuConfig::default()
        })
        .expect("start profiling");

    std::thread::sleep(Duration::from_millis(500));
    stop.store(true, Ordering::Relaxed);
    worker.join().unwrap();

    let profile = profiler.stop_and_collect().expect("collect profile");
    let agg = profile.aggregate();

    println!(
        "collected {} samples over {:.0} ms ({:.1} Hz effective)",
        profile.sample_count(),
        profile.total_duration_ms(),
        profile.effective_rate_hz()
    );
    println!(
        "{} unique stacks, compression {:.1}x",
        agg.unique_stack_count(),
        agg.compression_ratio()
    );
    println!("\ncollapsed:\n{}", profile.to_collapsed());
    println!(
        "flame-graph JSON:\n{}",
        serde_json::to_string_pretty(&profile.to_flame_json()).unwrap()
    );
}

impl DemoHost {
    fn add_thread_state(&self, state: &'static ThreadState) {
        self.threads
            .lock()
            .unwrap()
            .push((state.os_tid, state as *const ThreadState as usize));
    }
}
