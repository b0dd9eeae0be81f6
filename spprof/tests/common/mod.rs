//! A mock host runtime for integration tests: synthetic code descriptors,
//! synthetic interpreter frame chains, a real mutex as the global execution
//! lock, and test-controlled GC epochs.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use spprof::host::{
    CodeDescriptor, CodeInfo, FrameRecord, HostRuntime, ThreadRef, ThreadState,
};

struct MockCode {
    name: String,
    file: String,
    line: u32,
    refs: AtomicI64,
}

#[derive(Default)]
pub struct MockRuntime {
    lock: Mutex<()>,
    codes: Mutex<HashMap<usize, Arc<MockCode>>>,
    threads: Mutex<Vec<(u64, usize)>>,
    names: Mutex<HashMap<u64, String>>,
    epoch: AtomicU64,
}

impl MockRuntime {
    pub fn new() -> Arc<MockRuntime> {
        Arc::new(MockRuntime::default())
    }

    /// Create a code descriptor. The returned pointer is a real heap
    /// address, so it passes the walker's plausibility checks.
    pub fn add_code(&self, name: &str, file: &str, line: u32) -> *const CodeDescriptor {
        let code = Arc::new(MockCode {
            name: name.to_string(),
            file: file.to_string(),
            line,
            refs: AtomicI64::new(0),
        });
        let ptr = Arc::as_ptr(&code) as usize;
        self.codes.lock().unwrap().insert(ptr, code);
        ptr as *const CodeDescriptor
    }

    /// Forget a descriptor, as the host GC would. Panics if the engine
    /// still holds a strong reference.
    pub fn collect_code(&self, code: *const CodeDescriptor) {
        let removed = self.codes.lock().unwrap().remove(&(code as usize));
        if let Some(code) = removed {
            assert_eq!(
                code.refs.load(Ordering::Relaxed),
                0,
                "collected a descriptor the profiler still retains"
            );
        }
        self.epoch.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::Relaxed);
    }

    pub fn refcount(&self, code: *const CodeDescriptor) -> i64 {
        self.codes
            .lock()
            .unwrap()
            .get(&(code as usize))
            .map(|c| c.refs.load(Ordering::Relaxed))
            .unwrap_or(-1)
    }

    pub fn add_thread(&self, os_tid: u64, state: *const ThreadState) {
        self.threads.lock().unwrap().push((os_tid, state as usize));
    }

    pub fn set_thread_name(&self, os_tid: u64, name: &str) {
        self.names.lock().unwrap().insert(os_tid, name.to_string());
    }
}

unsafe impl HostRuntime for MockRuntime {
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

    unsafe fn retain_code(&self, code: *const CodeDescriptor) {
        if let Some(code) = self.codes.lock().unwrap().get(&(code as usize)) {
            code.refs.fetch_add(1, Ordering::Relaxed);
        }
    }

    unsafe fn release_code(&self, code: *const CodeDescriptor) {
        if let Some(code) = self.codes.lock().unwrap().get(&(code as usize)) {
            code.refs.fetch_sub(1, Ordering::Relaxed);
        }
    }

    unsafe fn describe_code(&self, code: *const CodeDescriptor, lasti: u32) -> Option<CodeInfo> {
        self.codes
            .lock()
            .unwrap()
            .get(&(code as usize))
            .map(|code| CodeInfo {
                function_name: code.name.clone(),
                filename: code.file.clone(),
                // The mock treats the instruction index as a line offset.
                line: code.line + lasti,
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
        self.names.lock().unwrap().get(&os_tid).cloned()
    }

    fn runtime_version(&self) -> String {
        "mock-1.0".to_string()
    }
}

/// Build a leaked interpreter frame chain, root first, and point `state`'s
/// current frame at the leaf.
pub fn install_stack(
    state: &ThreadState,
    codes: &[(*const CodeDescriptor, u32)],
) -> Vec<&'static FrameRecord> {
    let mut frames: Vec<&'static FrameRecord> = Vec::new();
    for &(code, lasti) in codes {
        let frame: &'static FrameRecord = Box::leak(Box::new(FrameRecord::new(code, lasti)));
        if let Some(prev) = frames.last() {
            frame.set_back(*prev);
        }
        frames.push(frame);
    }
    if let Some(leaf) = frames.last() {
        state.set_current_frame(*leaf);
    }
    frames
}

/// A leaked thread state, stable for the process lifetime as the engine
/// requires.
pub fn leak_thread_state(os_tid: u64) -> &'static ThreadState {
    Box::leak(Box::new(ThreadState::new(os_tid)))
}

/// Only one sampling session may exist per process, so tests that start
/// sessions must not overlap.
pub fn session_guard() -> std::sync::MutexGuard<'static, ()> {
    let _ = env_logger::builder().is_test(true).try_init();
    static GUARD: Mutex<()> = Mutex::new(());
    GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
