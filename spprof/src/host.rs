//! Interface between the engine and the host interpreter runtime.
//!
//! The host shares two things with the engine. First, `#[repr(C)]` layouts
//! ([`ThreadState`], [`FrameRecord`]) that the stack walker reads with plain
//! atomic loads from capture context, where nothing may be dereferenced
//! beyond these structs. Second, the [`HostRuntime`] trait, which covers
//! everything that happens outside capture context: symbolication,
//! descriptor lifetime management, GC-epoch queries, thread enumeration and
//! naming.

use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

/// Opaque host code descriptor. The engine only ever handles pointers to
/// these; field access goes through [`HostRuntime::describe_code`].
#[repr(C)]
pub struct CodeDescriptor {
    _private: [u8; 0],
}

/// One interpreter frame, as laid out by the host.
///
/// The walker loads these fields from a thread that may be running, so every
/// field the walker touches is an atomic. The host updates `current_frame`
/// and the frame chain with release stores.
#[repr(C)]
pub struct FrameRecord {
    /// Code descriptor executing in this frame. Never dereferenced in
    /// capture context.
    pub code: AtomicPtr<CodeDescriptor>,
    /// Current instruction (or line) index within `code`.
    pub lasti: AtomicU32,
    /// Caller frame, or null at the bottom of the stack.
    pub back: AtomicPtr<FrameRecord>,
}

impl FrameRecord {
    pub fn new(code: *const CodeDescriptor, lasti: u32) -> Self {
        FrameRecord {
            code: AtomicPtr::new(code as *mut CodeDescriptor),
            lasti: AtomicU32::new(lasti),
            back: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    pub fn set_back(&self, back: *const FrameRecord) {
        self.back.store(back as *mut FrameRecord, Ordering::Release);
    }

    pub fn set_lasti(&self, lasti: u32) {
        self.lasti.store(lasti, Ordering::Release);
    }
}

/// Per-thread interpreter state shared with the engine.
///
/// The host owns one of these per interpreter thread and keeps it alive (and
/// at a stable address) from `register_thread` until after
/// `unregister_thread` returns.
#[repr(C)]
pub struct ThreadState {
    /// Innermost frame currently executing, or null when the thread is not
    /// running interpreter code.
    pub current_frame: AtomicPtr<FrameRecord>,
    /// OS thread id, for sample attribution and thread-name lookup.
    pub os_tid: u64,
    /// Set by the host when the thread is about to exit; the walker treats
    /// a nonzero value like a null frame.
    pub shutting_down: AtomicU64,
}

impl ThreadState {
    pub fn new(os_tid: u64) -> Self {
        ThreadState {
            current_frame: AtomicPtr::new(std::ptr::null_mut()),
            os_tid,
            shutting_down: AtomicU64::new(0),
        }
    }

    pub fn set_current_frame(&self, frame: *const FrameRecord) {
        self.current_frame
            .store(frame as *mut FrameRecord, Ordering::Release);
    }
}

/// A reference to one interpreter thread, produced by
/// [`HostRuntime::enumerate_threads`].
#[derive(Debug, Clone, Copy)]
pub struct ThreadRef {
    pub os_tid: u64,
    pub state: *const ThreadState,
}

// The pointer targets are host-owned and valid for the enumeration window;
// the supervisor thread is the only consumer.
unsafe impl Send for ThreadRef {}

/// Resolved source location for a `(code, lasti)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeInfo {
    pub function_name: String,
    pub filename: String,
    pub line: u32,
}

/// The services the engine needs from the host runtime.
///
/// # Safety
///
/// Implementors must uphold the concurrency contract: `retain_code`,
/// `release_code` and `describe_code` are only called while it is legal to
/// touch host objects (the caller either holds the host's global execution
/// lock or owns a strong reference obtained through `retain_code`);
/// `enumerate_threads` is only called under the global lock and the returned
/// `ThreadState` pointers must stay valid until the lock is released.
pub unsafe trait HostRuntime: Send + Sync {
    /// All interpreter threads, for the supervisor backend. Called with the
    /// global execution lock held.
    fn enumerate_threads(&self) -> Vec<ThreadRef>;

    /// Run `f` while holding the host's global execution lock. Interpreter
    /// threads cannot mutate their frame chains while `f` runs.
    fn with_global_lock(&self, f: &mut dyn FnMut());

    /// Take a strong reference on `code`, preventing the host GC from
    /// reclaiming it.
    ///
    /// # Safety
    ///
    /// `code` must currently be a live descriptor and the caller must hold
    /// the global execution lock.
    unsafe fn retain_code(&self, code: *const CodeDescriptor);

    /// Release a reference taken with `retain_code`.
    ///
    /// # Safety
    ///
    /// Must pair with a prior `retain_code` of the same descriptor.
    unsafe fn release_code(&self, code: *const CodeDescriptor);

    /// Resolve a descriptor and instruction index to a source location.
    /// Returns `None` for descriptors the host does not recognize.
    ///
    /// # Safety
    ///
    /// `code` must be safe to dereference per the registry's lifetime rules.
    unsafe fn describe_code(&self, code: *const CodeDescriptor, lasti: u32) -> Option<CodeInfo>;

    /// Counter incremented by the host GC on every collection cycle.
    fn gc_epoch(&self) -> u64;

    /// Descriptors alive right now. Seeds the registry's shadow table at
    /// session start. Called with the global lock held.
    fn live_code_snapshot(&self) -> Vec<*const CodeDescriptor>;

    /// Display name for an OS thread, if the host tracks one.
    fn thread_name(&self, os_tid: u64) -> Option<String>;

    /// Host runtime version string for profile metadata.
    fn runtime_version(&self) -> String {
        String::new()
    }

    /// Platform string for profile metadata.
    fn platform(&self) -> String {
        format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_chain_links() {
        let root = FrameRecord::new(0x1000 as *const CodeDescriptor, 1);
        let leaf = FrameRecord::new(0x2000 as *const CodeDescriptor, 2);
        leaf.set_back(&root);

        let back = leaf.back.load(Ordering::Acquire);
        assert_eq!(back as *const FrameRecord, &root as *const FrameRecord);
        assert!(root.back.load(Ordering::Acquire).is_null());
    }

    #[test]
    fn thread_state_starts_idle() {
        let state = ThreadState::new(42);
        assert!(state.current_frame.load(Ordering::Acquire).is_null());
        assert_eq!(state.os_tid, 42);
    }
}
