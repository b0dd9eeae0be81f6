//! Sampler backends: deliver capture events at the configured interval.
//!
//! Three backends share one capture contract: call the stack walker exactly
//! once per event and publish at most one sample per call. They differ only
//! in concurrency contract:
//!
//! - [`timer`]: per-thread POSIX interval timers delivering SIGPROF; the
//!   capture runs in an async-signal context (Linux/Android).
//! - [`supervisor`]: a dedicated thread takes the host's global execution
//!   lock each tick and walks every interpreter thread.
//! - [`callback`]: the host's own timer calls in while holding the lock;
//!   only the current thread is captured.

pub(crate) mod callback;
pub(crate) mod supervisor;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) mod timer;

use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::Ordering;

use crate::error::{ProfilerError, Result};
use crate::host::ThreadState;
use crate::ring::DEFAULT_RING_CAPACITY;
use crate::sample::{RawSample, MAX_STACK_DEPTH};
use crate::session::SessionShared;
use crate::time;
use crate::walker::{self, WalkError};

/// Which sampler backend drives capture events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendChoice {
    /// Pick the platform's preferred backend: per-thread timers where
    /// signal delivery is dependable, the supervisor thread elsewhere.
    #[default]
    Auto,
    TimerSignal,
    Supervisor,
    HostCallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResolvedBackend {
    TimerSignal,
    Supervisor,
    HostCallback,
}

impl BackendChoice {
    pub(crate) fn resolve(self) -> Result<ResolvedBackend> {
        match self {
            BackendChoice::Auto => {
                #[cfg(any(target_os = "linux", target_os = "android"))]
                {
                    Ok(ResolvedBackend::TimerSignal)
                }
                #[cfg(not(any(target_os = "linux", target_os = "android")))]
                {
                    Ok(ResolvedBackend::Supervisor)
                }
            }
            BackendChoice::TimerSignal => {
                #[cfg(any(target_os = "linux", target_os = "android"))]
                {
                    Ok(ResolvedBackend::TimerSignal)
                }
                #[cfg(not(any(target_os = "linux", target_os = "android")))]
                {
                    Err(ProfilerError::PlatformUnsupported(
                        "per-thread signal timers are only available on Linux",
                    ))
                }
            }
            BackendChoice::Supervisor => Ok(ResolvedBackend::Supervisor),
            BackendChoice::HostCallback => Ok(ResolvedBackend::HostCallback),
        }
    }
}

/// CPU profiling configuration.
#[derive(Debug, Clone)]
pub struct CpuConfig {
    /// Mean sampling interval in milliseconds. Minimum 1.
    pub interval_ms: u64,
    /// Frames kept per sample; deeper stacks are truncated. 1 to 256.
    pub max_stack_depth: usize,
    /// Also collect a native-frame suffix where the backend supports it.
    pub enable_native_frames: bool,
    pub backend: BackendChoice,
    /// Ring buffer capacity in slots; must be a power of two.
    pub ring_capacity: usize,
}

impl Default for CpuConfig {
    fn default() -> Self {
        CpuConfig {
            interval_ms: 10,
            max_stack_depth: MAX_STACK_DEPTH,
            enable_native_frames: false,
            backend: BackendChoice::Auto,
            ring_capacity: DEFAULT_RING_CAPACITY,
        }
    }
}

impl CpuConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.interval_ms < 1 {
            return Err(ProfilerError::InvalidConfig("interval_ms must be >= 1"));
        }
        if self.max_stack_depth < 1 || self.max_stack_depth > MAX_STACK_DEPTH {
            return Err(ProfilerError::InvalidConfig(
                "max_stack_depth must be between 1 and 256",
            ));
        }
        if !self.ring_capacity.is_power_of_two() {
            return Err(ProfilerError::InvalidConfig(
                "ring_capacity must be a power of two",
            ));
        }
        Ok(())
    }
}

/// Per-thread registration record. Lives from `register_thread` until
/// `unregister_thread` (or process exit); holds the pre-allocated scratch
/// sample so capture contexts never allocate.
pub(crate) struct ThreadReg {
    pub state: *const ThreadState,
    pub os_tid: u64,
    pub scratch: UnsafeCell<RawSample>,
}

impl ThreadReg {
    pub fn new(state: *const ThreadState, os_tid: u64) -> Box<ThreadReg> {
        Box::new(ThreadReg {
            state,
            os_tid,
            scratch: UnsafeCell::new(unsafe { std::mem::zeroed() }),
        })
    }
}

unsafe impl Send for ThreadReg {}
unsafe impl Sync for ThreadReg {}

thread_local! {
    // Const-initialized so reads from a signal handler never run lazy
    // initialization.
    static CURRENT_REG: Cell<*const ThreadReg> = const { Cell::new(std::ptr::null()) };
}

pub(crate) fn set_current_reg(reg: *const ThreadReg) {
    CURRENT_REG.with(|c| c.set(reg));
}

pub(crate) fn current_reg() -> *const ThreadReg {
    CURRENT_REG.with(|c| c.get())
}

/// Outcome of one capture attempt, for the caller's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CaptureOutcome {
    Published,
    Idle,
    RingFull,
    InvalidState,
    NoThreadState,
}

/// Walk one thread into `scratch` and publish the result.
///
/// This is the common capture hook of every backend. It is bounded and
/// allocation-free; when called from a signal handler everything it touches
/// is async-signal-safe. `native_fp` seeds the optional native-frame walk
/// (0 to skip).
///
/// # Safety
///
/// `state` and `scratch` follow the walker's rules: host-owned, live, and
/// not concurrently mutated except through the atomic frame protocol.
pub(crate) unsafe fn capture_into(
    shared: &SessionShared,
    state: *const ThreadState,
    scratch: &mut RawSample,
    native_fp: usize,
) -> CaptureOutcome {
    let outcome = walker::walk_interpreter(state, shared.config.max_stack_depth, scratch);
    match outcome {
        Err(WalkError::NoThreadState) => {
            shared
                .counters
                .drops_no_thread_state
                .fetch_add(1, Ordering::Relaxed);
            return CaptureOutcome::NoThreadState;
        }
        Err(WalkError::InvalidState) => {
            shared
                .counters
                .drops_invalid_state
                .fetch_add(1, Ordering::Relaxed);
            return CaptureOutcome::InvalidState;
        }
        Ok(()) => {}
    }
    if scratch.depth == 0 {
        return CaptureOutcome::Idle;
    }

    if shared.config.enable_native_frames && native_fp != 0 {
        walker::walk_native(native_fp, scratch);
    }

    scratch.timestamp_ns = time::monotonic_nanos();
    scratch.gc_epoch = shared.epoch_hint.load(Ordering::Acquire);
    if scratch.truncated {
        shared.counters.truncated.fetch_add(1, Ordering::Relaxed);
    }

    let sample: &RawSample = scratch;
    if shared.ring.try_publish(|slot| *slot = *sample) {
        shared.counters.collected.fetch_add(1, Ordering::Relaxed);
        CaptureOutcome::Published
    } else {
        CaptureOutcome::RingFull
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        CpuConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = CpuConfig {
            interval_ms: 0,
            ..CpuConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ProfilerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn oversized_depth_is_rejected() {
        let config = CpuConfig {
            max_stack_depth: MAX_STACK_DEPTH + 1,
            ..CpuConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_power_of_two_ring_is_rejected() {
        let config = CpuConfig {
            ring_capacity: 1000,
            ..CpuConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn supervisor_resolves_everywhere() {
        assert_eq!(
            BackendChoice::Supervisor.resolve().unwrap(),
            ResolvedBackend::Supervisor
        );
    }
}
