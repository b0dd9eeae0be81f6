//! Fork safety.
//!
//! A fork can land between any two instructions of any hook, so the child
//! inherits every table in an indeterminate state and none of the timers or
//! sampler threads. The pre-fork hook quiesces both profilers (allocator
//! hooks turn into no-ops, new captures stop), the parent hook lifts the
//! quiesce, and the child hook additionally resets per-process state so the
//! child can start sessions of its own. Children never inherit an active
//! session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{OnceLock, Weak};

use parking_lot::Mutex;

use crate::session::{self, ProfilerInner};

/// Set between the pre-fork and post-fork hooks; capture and allocator
/// hooks bail out while it holds.
static FORK_LOCKOUT: AtomicBool = AtomicBool::new(false);

pub(crate) fn lockout() -> bool {
    FORK_LOCKOUT.load(Ordering::Acquire)
}

#[derive(Default)]
struct Participants {
    cpu: Vec<Weak<ProfilerInner>>,
    mem: Vec<Weak<crate::alloc::MemInner>>,
}

static PARTICIPANTS: OnceLock<Mutex<Participants>> = OnceLock::new();

fn participants() -> &'static Mutex<Participants> {
    PARTICIPANTS.get_or_init(|| Mutex::new(Participants::default()))
}

pub(crate) fn register_cpu(inner: &std::sync::Arc<ProfilerInner>) {
    let mut p = participants().lock();
    p.cpu.retain(|w| w.strong_count() > 0);
    p.cpu.push(std::sync::Arc::downgrade(inner));
}

pub(crate) fn register_mem(inner: &std::sync::Arc<crate::alloc::MemInner>) {
    let mut p = participants().lock();
    p.mem.retain(|w| w.strong_count() > 0);
    p.mem.push(std::sync::Arc::downgrade(inner));
}

/// Quiesce before a fork: block hooks and captures in every thread. Also
/// installed as the `pthread_atfork` prepare handler.
pub fn prepare_fork() {
    FORK_LOCKOUT.store(true, Ordering::Release);
}

/// Resume the parent after a fork. The parent's session continues
/// untouched.
pub fn parent_after_fork() {
    FORK_LOCKOUT.store(false, Ordering::Release);
}

/// Reset the child after a fork: no inherited session, no armed hooks.
/// The child may call `start()` cleanly on either profiler.
pub fn child_after_fork() {
    session::fork_child_reset_process_state();
    #[cfg(any(target_os = "linux", target_os = "android"))]
    crate::sampler::timer::fork_child_reset();

    if let Some(p) = participants().try_lock() {
        for weak in &p.cpu {
            if let Some(inner) = weak.upgrade() {
                inner.fork_child_reset();
            }
        }
        for weak in &p.mem {
            if let Some(inner) = weak.upgrade() {
                inner.fork_child_reset();
            }
        }
    }

    FORK_LOCKOUT.store(false, Ordering::Release);
}

extern "C" fn atfork_prepare() {
    prepare_fork();
}

extern "C" fn atfork_parent() {
    parent_after_fork();
}

extern "C" fn atfork_child() {
    child_after_fork();
}

static HOOKS: OnceLock<i32> = OnceLock::new();

/// Wire the three hooks into `pthread_atfork`. Idempotent; hosts that
/// drive fork handling themselves can skip this and call the hook
/// functions directly.
pub fn install_fork_hooks() -> bool {
    let rc = *HOOKS.get_or_init(|| unsafe {
        libc::pthread_atfork(
            Some(atfork_prepare),
            Some(atfork_parent),
            Some(atfork_child),
        )
    });
    rc == 0
}
