//! Per-thread POSIX interval timers delivering SIGPROF (Linux/Android).
//!
//! Each registered thread gets its own timer armed with
//! `SIGEV_THREAD_ID`, so the signal lands on the thread that owns the
//! interpreter state being sampled. The handler is async-signal-safe: it
//! reads the thread's registration from const-initialized TLS, walks the
//! frame chain, and publishes into the ring. Strong references are never
//! taken in the handler; the drain path validates descriptor pointers
//! through the registry's shadow table instead.

use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::{ProfilerError, Result};
use crate::sampler::{capture_into, current_reg};
use crate::session::SessionShared;

/// Hard cap on how long `stop` waits for in-flight handlers.
const QUIESCENCE_DEADLINE: Duration = Duration::from_millis(100);

/// Session visible to the signal handler. Holds one strong reference,
/// released by `stop` once no handler can still be running.
static ACTIVE: AtomicPtr<SessionShared> = AtomicPtr::new(std::ptr::null_mut());

/// Handlers currently executing. `stop` spins until this reaches zero.
static INFLIGHT: AtomicU64 = AtomicU64::new(0);

/// Linux `struct sigevent` with the `SIGEV_THREAD_ID` target field, which
/// libc's portable definition does not expose. Layout per the kernel ABI:
/// the thread id aliases the start of the padding union, total size 64.
#[repr(C)]
struct SigEventThreadId {
    sigev_value: libc::sigval,
    sigev_signo: libc::c_int,
    sigev_notify: libc::c_int,
    sigev_notify_thread_id: libc::c_int,
    _pad: [libc::c_int; 11],
}

struct TimerHandle(libc::timer_t);

// timer_t is an opaque kernel handle; deleting from another thread is fine.
unsafe impl Send for TimerHandle {}

pub(crate) struct TimerBackend {
    timers: Mutex<FxHashMap<u64, TimerHandle>>,
    old_action: libc::sigaction,
    interval_ms: u64,
}

impl TimerBackend {
    /// Install the SIGPROF handler and arm one timer per registered thread.
    /// Timer creation failure is fatal: everything armed so far is torn
    /// down and the error propagates, leaving no partial activation.
    pub fn start(shared: &Arc<SessionShared>, tids: &[u64]) -> Result<TimerBackend> {
        let old_action = install_handler()?;
        let raw = Arc::into_raw(Arc::clone(shared)) as *mut SessionShared;
        ACTIVE.store(raw, Ordering::Release);

        let mut backend = TimerBackend {
            timers: Mutex::new(FxHashMap::default()),
            old_action,
            interval_ms: shared.config.interval_ms,
        };

        for &tid in tids {
            if let Err(err) = backend.arm_thread(tid) {
                backend.disarm_all();
                quiesce(shared);
                restore_handler(&backend.old_action);
                return Err(err);
            }
        }
        Ok(backend)
    }

    /// Arm a timer targeting `tid`. Callable while the session runs, for
    /// threads registered late.
    pub fn arm_thread(&self, tid: u64) -> Result<()> {
        let mut sev: SigEventThreadId = unsafe { std::mem::zeroed() };
        sev.sigev_signo = libc::SIGPROF;
        sev.sigev_notify = libc::SIGEV_THREAD_ID;
        sev.sigev_notify_thread_id = tid as libc::c_int;

        let mut timer_id: libc::timer_t = std::ptr::null_mut();
        let rc = unsafe {
            libc::timer_create(
                libc::CLOCK_MONOTONIC,
                &mut sev as *mut SigEventThreadId as *mut libc::sigevent,
                &mut timer_id,
            )
        };
        if rc != 0 {
            return Err(ProfilerError::TimerSetup(
                "timer_create",
                last_errno(),
            ));
        }

        let interval = libc::timespec {
            tv_sec: (self.interval_ms / 1000) as libc::time_t,
            tv_nsec: ((self.interval_ms % 1000) * 1_000_000) as libc::c_long,
        };
        let spec = libc::itimerspec {
            it_interval: interval,
            it_value: interval,
        };
        let rc = unsafe { libc::timer_settime(timer_id, 0, &spec, std::ptr::null_mut()) };
        if rc != 0 {
            unsafe { libc::timer_delete(timer_id) };
            return Err(ProfilerError::TimerSetup(
                "timer_settime",
                last_errno(),
            ));
        }

        self.timers.lock().insert(tid, TimerHandle(timer_id));
        Ok(())
    }

    pub fn disarm_thread(&self, tid: u64) {
        if let Some(TimerHandle(timer_id)) = self.timers.lock().remove(&tid) {
            unsafe { libc::timer_delete(timer_id) };
        }
    }

    fn disarm_all(&self) {
        let mut timers = self.timers.lock();
        for (_, TimerHandle(timer_id)) in timers.drain() {
            unsafe { libc::timer_delete(timer_id) };
        }
    }

    /// Disarm every timer, wait until no handler can still publish, then
    /// drop the handler's session reference and restore the old action.
    pub fn stop(&mut self, shared: &SessionShared) {
        self.disarm_all();
        quiesce(shared);
        restore_handler(&self.old_action);
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn install_handler() -> Result<libc::sigaction> {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
        sigprof_handler;
    action.sa_sigaction = handler as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    unsafe { libc::sigemptyset(&mut action.sa_mask) };

    let mut old_action: libc::sigaction = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::sigaction(libc::SIGPROF, &action, &mut old_action) };
    if rc != 0 {
        return Err(ProfilerError::TimerSetup("sigaction", last_errno()));
    }
    Ok(old_action)
}

fn restore_handler(old_action: &libc::sigaction) {
    unsafe { libc::sigaction(libc::SIGPROF, old_action, std::ptr::null_mut()) };
}

/// Detach the handler's session pointer and wait for in-flight handlers,
/// bounded by [`QUIESCENCE_DEADLINE`]. On timeout the reference is leaked
/// rather than freed under a live handler, and the timeout is counted.
fn quiesce(shared: &SessionShared) {
    let raw = ACTIVE.swap(std::ptr::null_mut(), Ordering::AcqRel);
    if raw.is_null() {
        return;
    }

    let deadline = Instant::now() + QUIESCENCE_DEADLINE;
    while INFLIGHT.load(Ordering::Acquire) != 0 {
        if Instant::now() >= deadline {
            shared
                .counters
                .quiescence_timeouts
                .fetch_add(1, Ordering::Relaxed);
            warn!("timed out waiting for SIGPROF handlers to quiesce; leaking session reference");
            return;
        }
        std::thread::sleep(Duration::from_micros(50));
    }

    drop(unsafe { Arc::from_raw(raw as *const SessionShared) });
}

/// Reset handler-visible state in a forked child. POSIX timers are not
/// inherited across fork, so no handler will fire; the inherited session
/// reference is leaked rather than freed (another surviving reference may
/// exist in the parent's address space image).
pub(crate) fn fork_child_reset() {
    ACTIVE.store(std::ptr::null_mut(), Ordering::Release);
    INFLIGHT.store(0, Ordering::Release);
}

/// Frame pointer of the interrupted context, for the native-frame suffix.
fn context_frame_pointer(ctx: *mut libc::c_void) -> usize {
    if ctx.is_null() {
        return 0;
    }
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        let ucontext = unsafe { &*(ctx as *const libc::ucontext_t) };
        ucontext.uc_mcontext.gregs[libc::REG_RBP as usize] as usize
    }
    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    {
        let ucontext = unsafe { &*(ctx as *const libc::ucontext_t) };
        ucontext.uc_mcontext.regs[29] as usize
    }
    #[cfg(not(any(
        all(target_os = "linux", target_arch = "x86_64"),
        all(target_os = "linux", target_arch = "aarch64")
    )))]
    {
        let _ = ctx;
        0
    }
}

/// The SIGPROF handler. Async-signal-safe: const-init TLS read, atomic
/// loads, bounded memory reads, one ring publish. Further SIGPROF delivery
/// is blocked while it runs (default sigaction masking).
extern "C" fn sigprof_handler(
    _signo: libc::c_int,
    _info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    let saved_errno = unsafe { *libc::__errno_location() };

    // Publish the in-flight mark before loading ACTIVE, so `quiesce`
    // (swap-then-wait) cannot miss this handler.
    INFLIGHT.fetch_add(1, Ordering::AcqRel);
    let shared = ACTIVE.load(Ordering::Acquire);
    if !shared.is_null() && !crate::fork::lockout() {
        let shared = unsafe { &*shared };
        let reg = current_reg();
        if reg.is_null() {
            shared
                .counters
                .drops_no_thread_state
                .fetch_add(1, Ordering::Relaxed);
        } else {
            let reg = unsafe { &*reg };
            let scratch = unsafe { &mut *reg.scratch.get() };
            let fp = if shared.config.enable_native_frames {
                context_frame_pointer(ctx)
            } else {
                0
            };
            unsafe { capture_into(shared, reg.state, scratch, fp) };
        }
    }
    INFLIGHT.fetch_sub(1, Ordering::AcqRel);

    unsafe { *libc::__errno_location() = saved_errno };
}
