//! Code-object registry: makes captured descriptor pointers safe to
//! dereference at drain time, even though the host GC may reclaim code
//! descriptors at any point.
//!
//! Two branches, matching the two classes of sampler backend:
//!
//! - Backends that capture while holding the host's global execution lock
//!   (supervisor, host callback, allocator hooks) register every freshly
//!   captured descriptor here, which takes a strong reference on it. Those
//!   descriptors stay dereferenceable until [`CodeRegistry::release_all`].
//! - The signal-handler backend publishes bare pointers. Before the drain
//!   dereferences one of those, it is validated against the shadow table of
//!   descriptors alive at session start, cross-checked with the GC epoch:
//!   if the epoch advanced since capture and the pointer is not in the
//!   shadow table, the frame resolves to the `"<stale>"` sentinel.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use spprof_profile::Frame;

use crate::host::{CodeDescriptor, HostRuntime};
use crate::sample::CapturedFrame;
use crate::stats::CpuCounters;

pub(crate) const STALE_SENTINEL: &str = "<stale>";
pub(crate) const UNKNOWN_SENTINEL: &str = "<unknown>";

struct CodeEntry {
    epoch_added: u64,
    captures: u64,
    retained: bool,
}

pub(crate) struct CodeRegistry {
    host: Arc<dyn HostRuntime>,
    entries: Mutex<FxHashMap<usize, CodeEntry>>,
    /// Descriptors alive at session start. Frozen; lock-free reads.
    shadow: FxHashSet<usize>,
    session_start_epoch: u64,
}

impl CodeRegistry {
    /// Build the registry at session start. Must be called with the host's
    /// global execution lock held so the shadow snapshot is consistent.
    pub fn new_locked(host: Arc<dyn HostRuntime>) -> Self {
        let shadow: FxHashSet<usize> = host
            .live_code_snapshot()
            .into_iter()
            .map(|p| p as usize)
            .collect();
        let session_start_epoch = host.gc_epoch();
        CodeRegistry {
            host,
            entries: Mutex::new(FxHashMap::default()),
            shadow,
            session_start_epoch,
        }
    }

    /// Record a captured descriptor, taking a strong reference the first
    /// time it is seen. Caller must hold the host's global execution lock.
    pub fn note_capture_locked(&self, code: *const CodeDescriptor) {
        if code.is_null() {
            return;
        }
        let mut entries = self.entries.lock();
        let epoch = self.host.gc_epoch();
        entries
            .entry(code as usize)
            .and_modify(|e| e.captures += 1)
            .or_insert_with(|| {
                unsafe { self.host.retain_code(code) };
                CodeEntry {
                    epoch_added: epoch,
                    captures: 1,
                    retained: true,
                }
            });
    }

    /// Resolve one captured frame to a display [`Frame`]. Never fails: a
    /// descriptor that cannot be safely dereferenced or recognized resolves
    /// to a sentinel frame that keeps the instruction index in `line`.
    pub fn resolve(&self, frame: CapturedFrame, capture_epoch: u64, counters: &CpuCounters) -> Frame {
        if frame.code.is_null() {
            counters.unknown_frames.fetch_add(1, Ordering::Relaxed);
            return sentinel(UNKNOWN_SENTINEL, frame.lasti);
        }

        let key = frame.code as usize;
        let retained = {
            let entries = self.entries.lock();
            entries.get(&key).is_some_and(|e| {
                // One full collection of grace after the entry's epoch even
                // if the reference was somehow dropped early.
                e.retained || self.host.gc_epoch() <= e.epoch_added + 1
            })
        };

        if !retained {
            let current_epoch = self.host.gc_epoch();
            let since = if capture_epoch != 0 {
                capture_epoch
            } else {
                self.session_start_epoch
            };
            if current_epoch > since && !self.shadow.contains(&key) {
                counters.stale_frames.fetch_add(1, Ordering::Relaxed);
                return sentinel(STALE_SENTINEL, frame.lasti);
            }
        }

        match unsafe { self.host.describe_code(frame.code, frame.lasti) } {
            Some(info) => Frame::interpreted(&info.function_name, &info.filename, info.line),
            None => {
                counters.unknown_frames.fetch_add(1, Ordering::Relaxed);
                sentinel(UNKNOWN_SENTINEL, frame.lasti)
            }
        }
    }

    /// Number of distinct descriptors captured through the lock-held path.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn total_captures(&self) -> u64 {
        self.entries.lock().values().map(|e| e.captures).sum()
    }

    /// Release all strong references in bulk. Called after the drain
    /// completes, with the host's global execution lock held.
    pub fn release_all_locked(&self) {
        let mut entries = self.entries.lock();
        for (&key, entry) in entries.iter_mut() {
            if entry.retained {
                unsafe { self.host.release_code(key as *const CodeDescriptor) };
                entry.retained = false;
            }
        }
    }
}

fn sentinel(name: &str, lasti: u32) -> Frame {
    Frame::interpreted(name, name, lasti)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{CodeInfo, ThreadRef};
    use std::sync::atomic::{AtomicI64, AtomicU64};

    /// Minimal host: descriptors are small integers; refcounts and the GC
    /// epoch are test-controlled.
    #[derive(Default)]
    struct EpochHost {
        epoch: AtomicU64,
        refs: Mutex<FxHashMap<usize, AtomicI64>>,
        known: Mutex<FxHashSet<usize>>,
    }

    impl EpochHost {
        fn add_code(&self, addr: usize) -> *const CodeDescriptor {
            self.known.lock().insert(addr);
            addr as *const CodeDescriptor
        }
    }

    unsafe impl HostRuntime for EpochHost {
        fn enumerate_threads(&self) -> Vec<ThreadRef> {
            Vec::new()
        }
        fn with_global_lock(&self, f: &mut dyn FnMut()) {
            f()
        }
        unsafe fn retain_code(&self, code: *const CodeDescriptor) {
            self.refs
                .lock()
                .entry(code as usize)
                .or_insert_with(|| AtomicI64::new(0))
                .fetch_add(1, Ordering::Relaxed);
        }
        unsafe fn release_code(&self, code: *const CodeDescriptor) {
            self.refs
                .lock()
                .get(&(code as usize))
                .expect("release without retain")
                .fetch_sub(1, Ordering::Relaxed);
        }
        unsafe fn describe_code(
            &self,
            code: *const CodeDescriptor,
            lasti: u32,
        ) -> Option<CodeInfo> {
            if !self.known.lock().contains(&(code as usize)) {
                return None;
            }
            Some(CodeInfo {
                function_name: format!("fn_{:x}", code as usize),
                filename: "mod.x".to_string(),
                line: lasti,
            })
        }
        fn gc_epoch(&self) -> u64 {
            self.epoch.load(Ordering::Relaxed)
        }
        fn live_code_snapshot(&self) -> Vec<*const CodeDescriptor> {
            self.known
                .lock()
                .iter()
                .map(|&a| a as *const CodeDescriptor)
                .collect()
        }
        fn thread_name(&self, _os_tid: u64) -> Option<String> {
            None
        }
    }

    fn captured(addr: usize, lasti: u32) -> CapturedFrame {
        CapturedFrame {
            code: addr as *const CodeDescriptor,
            lasti,
        }
    }

    #[test]
    fn retained_descriptor_resolves_after_epoch_advance() {
        let host = Arc::new(EpochHost::default());
        let code = host.add_code(0x1000);
        let registry = CodeRegistry::new_locked(host.clone());
        let counters = CpuCounters::default();

        registry.note_capture_locked(code);
        host.epoch.store(10, Ordering::Relaxed);

        let frame = registry.resolve(captured(0x1000, 5), 0, &counters);
        assert_eq!(frame.function_name, "fn_1000");
        assert_eq!(frame.line, 5);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn repeat_captures_take_one_reference() {
        let host = Arc::new(EpochHost::default());
        let code = host.add_code(0x2000);
        let registry = CodeRegistry::new_locked(host.clone());

        for _ in 0..5 {
            registry.note_capture_locked(code);
        }
        assert_eq!(registry.total_captures(), 5);
        assert_eq!(
            host.refs.lock()[&0x2000].load(Ordering::Relaxed),
            1,
            "only the first capture retains"
        );

        registry.release_all_locked();
        assert_eq!(host.refs.lock()[&0x2000].load(Ordering::Relaxed), 0);
    }

    #[test]
    fn unregistered_pointer_goes_stale_after_epoch_advance() {
        let host = Arc::new(EpochHost::default());
        host.add_code(0x1000);
        let registry = CodeRegistry::new_locked(host.clone());
        let counters = CpuCounters::default();

        // A descriptor created after session start, captured by the signal
        // path (never registered), then the GC runs.
        host.known.lock().insert(0x3000);
        host.epoch.store(1, Ordering::Relaxed);

        let frame = registry.resolve(captured(0x3000, 9), 0, &counters);
        assert_eq!(frame.function_name, STALE_SENTINEL);
        assert_eq!(frame.line, 9, "instruction index survives");
        assert_eq!(counters.stale_frames.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn shadow_member_survives_epoch_advance() {
        let host = Arc::new(EpochHost::default());
        host.add_code(0x4000);
        let registry = CodeRegistry::new_locked(host.clone());
        let counters = CpuCounters::default();

        host.epoch.store(3, Ordering::Relaxed);
        let frame = registry.resolve(captured(0x4000, 2), 0, &counters);
        assert_eq!(frame.function_name, "fn_4000");
    }

    #[test]
    fn unknown_descriptor_resolves_to_sentinel() {
        let host = Arc::new(EpochHost::default());
        let registry = CodeRegistry::new_locked(host.clone());
        let counters = CpuCounters::default();

        // Never seen by the host, epoch unchanged: deref is attempted but
        // the host does not recognize it.
        let frame = registry.resolve(captured(0x5000, 1), 0, &counters);
        assert_eq!(frame.function_name, UNKNOWN_SENTINEL);
        assert_eq!(counters.unknown_frames.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn null_code_is_unknown() {
        let host = Arc::new(EpochHost::default());
        let registry = CodeRegistry::new_locked(host.clone());
        let counters = CpuCounters::default();
        let frame = registry.resolve(
            CapturedFrame {
                code: std::ptr::null(),
                lasti: 3,
            },
            0,
            &counters,
        );
        assert_eq!(frame.function_name, UNKNOWN_SENTINEL);
    }

    #[test]
    fn double_release_is_idempotent() {
        let host = Arc::new(EpochHost::default());
        let code = host.add_code(0x6000);
        let registry = CodeRegistry::new_locked(host.clone());
        registry.note_capture_locked(code);
        registry.release_all_locked();
        registry.release_all_locked();
        assert_eq!(host.refs.lock()[&0x6000].load(Ordering::Relaxed), 0);
    }
}
