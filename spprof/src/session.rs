//! Session lifecycle and the CPU profiler's control surface.
//!
//! One process holds at most one active CPU sampling session. The
//! lifecycle is a small state machine — Idle, Running, Stopping, ShutDown —
//! guarded by one mutex; hot paths read atomic snapshots only.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use spprof_profile::Profile;

use crate::drain::{self, DrainBatch};
use crate::error::{ProfilerError, Result};
use crate::fork;
use crate::host::{HostRuntime, ThreadState};
use crate::registry::CodeRegistry;
use crate::ring::RingBuffer;
use crate::sample::RawSample;
use crate::sampler::supervisor::SupervisorBackend;
#[cfg(any(target_os = "linux", target_os = "android"))]
use crate::sampler::timer::TimerBackend;
use crate::sampler::{callback, CpuConfig, ResolvedBackend, ThreadReg};
use crate::stats::{CpuCounters, CpuStats};
use crate::time;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Idle,
    Running,
    Stopping,
    ShutDown,
}

/// Everything a capture context needs, shared between the control surface,
/// the backends and the drain path.
pub(crate) struct SessionShared {
    pub ring: RingBuffer<RawSample>,
    pub counters: CpuCounters,
    pub config: CpuConfig,
    pub backend_kind: ResolvedBackend,
    pub host: Arc<dyn HostRuntime>,
    pub registry: CodeRegistry,
    /// Most recently observed GC epoch; stamped into samples so the drain
    /// can bound descriptor staleness.
    pub epoch_hint: AtomicU64,
    pub start_monotonic_ns: u64,
    /// 0 while the session is running.
    pub end_monotonic_ns: AtomicU64,
    /// Cleared at stop before backends are torn down; capture hooks that
    /// are not signal handlers check it.
    pub running: AtomicBool,
}

impl SessionShared {
    pub fn duration_ns(&self) -> u64 {
        let end = self.end_monotonic_ns.load(Ordering::Acquire);
        let end = if end == 0 { time::monotonic_nanos() } else { end };
        end.saturating_sub(self.start_monotonic_ns)
    }
}

enum ActiveBackend {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Timer(TimerBackend),
    Supervisor(SupervisorBackend),
    Callback,
}

struct RegisteredThread {
    reg: *const ThreadReg,
}

// Registration records are heap-allocated and only freed on the owning
// thread; the map just tracks them.
unsafe impl Send for RegisteredThread {}

/// Only one CPU session may be active per process, across all `Profiler`
/// instances.
static PROCESS_SESSION: AtomicBool = AtomicBool::new(false);

pub(crate) struct ProfilerInner {
    host: Arc<dyn HostRuntime>,
    lifecycle: Mutex<Lifecycle>,
    session: Mutex<Option<Arc<SessionShared>>>,
    backend: Mutex<Option<ActiveBackend>>,
    registered: Mutex<FxHashMap<u64, RegisteredThread>>,
    start_wall: Mutex<Option<SystemTime>>,
    end_wall: Mutex<Option<SystemTime>>,
    last_stats: Mutex<Option<CpuStats>>,
}

impl ProfilerInner {
    /// Reset per-process state in a forked child. The child inherits no
    /// timers and no sampler thread, so the inherited session is dead
    /// weight: discard it so the child can start its own.
    pub(crate) fn fork_child_reset(&self) {
        // try_lock: a mutex held by a thread that did not survive the fork
        // would never unlock; skipping the reset beats deadlocking.
        if let Some(mut lifecycle) = self.lifecycle.try_lock() {
            if *lifecycle == Lifecycle::Running || *lifecycle == Lifecycle::Stopping {
                *lifecycle = Lifecycle::Idle;
            }
        }
        if let Some(mut backend) = self.backend.try_lock() {
            // Dropping a supervisor handle only detaches the (nonexistent)
            // thread; no join, no teardown.
            *backend = None;
        }
        if let Some(mut session) = self.session.try_lock() {
            *session = None;
        }
    }
}

/// The sampling CPU profiler.
///
/// Create one per host runtime with [`Profiler::new`], register interpreter
/// threads, then drive sessions with [`start`](Profiler::start) /
/// [`stop`](Profiler::stop) / [`drain`](Profiler::drain) or the one-shot
/// [`stop_and_collect`](Profiler::stop_and_collect).
pub struct Profiler {
    inner: Arc<ProfilerInner>,
}

impl Profiler {
    pub fn new(host: Arc<dyn HostRuntime>) -> Profiler {
        let inner = Arc::new(ProfilerInner {
            host,
            lifecycle: Mutex::new(Lifecycle::Idle),
            session: Mutex::new(None),
            backend: Mutex::new(None),
            registered: Mutex::new(FxHashMap::default()),
            start_wall: Mutex::new(None),
            end_wall: Mutex::new(None),
            last_stats: Mutex::new(None),
        });
        fork::register_cpu(&inner);
        Profiler { inner }
    }

    /// Begin a sampling session. Fails if one is already active anywhere in
    /// the process, and never leaves a partially armed session behind.
    pub fn start(&self, config: CpuConfig) -> Result<()> {
        config.validate()?;
        let backend_kind = config.backend.resolve()?;
        let inner = &*self.inner;

        let mut lifecycle = inner.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::ShutDown => return Err(ProfilerError::ShutDown),
            _ => return Err(ProfilerError::AlreadyRunning),
        }
        if PROCESS_SESSION
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ProfilerError::AlreadyRunning);
        }

        time::warm_up();

        let mut registry = None;
        let host = Arc::clone(&inner.host);
        inner.host.with_global_lock(&mut || {
            registry = Some(CodeRegistry::new_locked(Arc::clone(&host)));
        });
        let registry = registry.expect("with_global_lock must run its closure");

        let shared = Arc::new(SessionShared {
            ring: RingBuffer::with_capacity(config.ring_capacity),
            counters: CpuCounters::default(),
            config,
            backend_kind,
            host: Arc::clone(&inner.host),
            registry,
            epoch_hint: AtomicU64::new(inner.host.gc_epoch()),
            start_monotonic_ns: time::monotonic_nanos(),
            end_monotonic_ns: AtomicU64::new(0),
            running: AtomicBool::new(true),
        });

        let backend = match backend_kind {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            ResolvedBackend::TimerSignal => {
                let tids: Vec<u64> = inner.registered.lock().keys().copied().collect();
                match TimerBackend::start(&shared, &tids) {
                    Ok(backend) => ActiveBackend::Timer(backend),
                    Err(err) => {
                        PROCESS_SESSION.store(false, Ordering::Release);
                        return Err(err);
                    }
                }
            }
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            ResolvedBackend::TimerSignal => {
                PROCESS_SESSION.store(false, Ordering::Release);
                return Err(ProfilerError::PlatformUnsupported(
                    "per-thread signal timers are only available on Linux",
                ));
            }
            ResolvedBackend::Supervisor => match SupervisorBackend::start(Arc::clone(&shared)) {
                Ok(backend) => ActiveBackend::Supervisor(backend),
                Err(err) => {
                    PROCESS_SESSION.store(false, Ordering::Release);
                    return Err(ProfilerError::TimerSetup(
                        "spawn sampler thread",
                        err.raw_os_error().unwrap_or(0),
                    ));
                }
            },
            ResolvedBackend::HostCallback => ActiveBackend::Callback,
        };

        *inner.session.lock() = Some(shared);
        *inner.backend.lock() = Some(backend);
        *inner.start_wall.lock() = Some(SystemTime::now());
        *inner.end_wall.lock() = None;
        *inner.last_stats.lock() = None;
        *lifecycle = Lifecycle::Running;
        Ok(())
    }

    /// End the session: disarm the backend and wait (bounded) until no
    /// capture can still publish. Idempotent; stopping a stopped profiler
    /// is a no-op. Collected samples stay drainable afterwards.
    pub fn stop(&self) -> Result<()> {
        let inner = &*self.inner;
        let mut lifecycle = inner.lifecycle.lock();
        if *lifecycle != Lifecycle::Running {
            return Ok(());
        }
        *lifecycle = Lifecycle::Stopping;

        let shared = inner
            .session
            .lock()
            .clone()
            .expect("running session must have shared state");
        shared.running.store(false, Ordering::Release);

        if let Some(backend) = inner.backend.lock().take() {
            match backend {
                #[cfg(any(target_os = "linux", target_os = "android"))]
                ActiveBackend::Timer(mut backend) => backend.stop(&shared),
                ActiveBackend::Supervisor(mut backend) => backend.stop(),
                ActiveBackend::Callback => {}
            }
        }

        shared
            .end_monotonic_ns
            .store(time::monotonic_nanos(), Ordering::Release);
        *inner.end_wall.lock() = Some(SystemTime::now());

        *lifecycle = Lifecycle::Idle;
        PROCESS_SESSION.store(false, Ordering::Release);
        Ok(())
    }

    /// Drain up to `max_samples` resolved samples. Usable mid-session for
    /// long recordings and after `stop` to collect the remainder.
    pub fn drain(&self, max_samples: usize) -> DrainBatch {
        let shared = self.inner.session.lock().clone();
        match shared {
            Some(shared) => drain::drain_batch(&shared, max_samples),
            None => DrainBatch::empty(),
        }
    }

    /// Release the registry's strong references and discard the drained
    /// session. Call after the final [`drain`](Profiler::drain); the stats
    /// of the finished session remain readable.
    pub fn finalize(&self) {
        let inner = &*self.inner;
        let Some(shared) = inner.session.lock().take() else {
            return;
        };
        *inner.last_stats.lock() = Some(CpuStats::gather(
            &shared.counters,
            shared.config.interval_ms,
            shared.ring.dropped(),
            shared.duration_ns(),
        ));
        inner.host.with_global_lock(&mut || {
            shared.registry.release_all_locked();
        });
    }

    /// Stop, drain everything, and package the session as a [`Profile`].
    pub fn stop_and_collect(&self) -> Result<Profile> {
        let inner = &*self.inner;
        if inner.session.lock().is_none() {
            return Err(ProfilerError::NotRunning);
        }
        let start_wall = inner.start_wall.lock().unwrap_or_else(SystemTime::now);

        self.stop()?;

        let interval_ms = inner
            .session
            .lock()
            .as_ref()
            .map(|s| s.config.interval_ms)
            .unwrap_or(0);
        let mut profile = Profile::new(start_wall, interval_ms);
        profile.runtime_version = inner.host.runtime_version();
        profile.platform = inner.host.platform();

        loop {
            let batch = self.drain(4096);
            profile.dropped_count = batch.dropped_count;
            for sample in batch.samples {
                profile.push_sample(sample);
            }
            if !batch.has_more {
                break;
            }
        }

        let end_wall = inner.end_wall.lock().unwrap_or_else(SystemTime::now);
        profile.finish(end_wall);
        self.finalize();
        Ok(profile)
    }

    pub fn is_active(&self) -> bool {
        *self.inner.lifecycle.lock() == Lifecycle::Running
    }

    /// Current (or, after [`finalize`](Profiler::finalize), final) session
    /// statistics.
    pub fn stats(&self) -> CpuStats {
        let inner = &*self.inner;
        if let Some(shared) = inner.session.lock().as_ref() {
            return CpuStats::gather(
                &shared.counters,
                shared.config.interval_ms,
                shared.ring.dropped(),
                shared.duration_ns(),
            );
        }
        inner
            .last_stats
            .lock()
            .clone()
            .unwrap_or_else(|| CpuStats::gather(&CpuCounters::default(), 0, 0, 0))
    }

    /// Register the calling thread for sampling. `state` is the host-owned
    /// interpreter state of this thread.
    ///
    /// # Safety
    ///
    /// `state` must stay valid (and at a stable address) until
    /// [`unregister_thread`](Profiler::unregister_thread) returns on this
    /// thread.
    pub unsafe fn register_thread(&self, state: *const ThreadState) -> bool {
        if state.is_null() {
            return false;
        }
        let inner = &*self.inner;
        let os_tid = (*state).os_tid;

        let mut registered = inner.registered.lock();
        if registered.contains_key(&os_tid) {
            return true;
        }
        let reg = Box::into_raw(ThreadReg::new(state, os_tid));
        crate::sampler::set_current_reg(reg);
        registered.insert(os_tid, RegisteredThread { reg });
        drop(registered);

        #[cfg(any(target_os = "linux", target_os = "android"))]
        if self.is_active() {
            if let Some(ActiveBackend::Timer(backend)) = inner.backend.lock().as_ref() {
                if let Err(err) = backend.arm_thread(os_tid) {
                    log::warn!("could not arm sampling timer for thread {os_tid}: {err}");
                    return false;
                }
            }
        }
        true
    }

    /// Unregister the calling thread. Safe to call from threads that never
    /// registered.
    pub fn unregister_thread(&self) -> bool {
        let inner = &*self.inner;
        let reg_ptr = crate::sampler::current_reg();
        if reg_ptr.is_null() {
            return false;
        }
        let os_tid = unsafe { (*reg_ptr).os_tid };

        #[cfg(any(target_os = "linux", target_os = "android"))]
        if let Some(ActiveBackend::Timer(backend)) = inner.backend.lock().as_ref() {
            backend.disarm_thread(os_tid);
        }

        crate::sampler::set_current_reg(std::ptr::null());
        if let Some(entry) = inner.registered.lock().remove(&os_tid) {
            // The timer is gone and TLS is cleared; a signal that slipped in
            // between sees a null registration, so the record can go.
            drop(unsafe { Box::from_raw(entry.reg as *mut ThreadReg) });
        }
        true
    }

    /// Capture hook for the host-callback backend. Call from the host's
    /// timer while holding the global execution lock; a no-op unless a
    /// callback-backend session is running.
    pub fn on_timer_tick(&self) {
        let shared = self.inner.session.lock().clone();
        let Some(shared) = shared else {
            return;
        };
        if shared.backend_kind != ResolvedBackend::HostCallback
            || !shared.running.load(Ordering::Acquire)
        {
            return;
        }
        callback::tick(&shared);
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        if self.is_active() {
            let _ = self.stop();
        }
        // Registration records of still-registered threads are leaked on
        // purpose: their TLS slots cannot be cleared from here.
    }
}

pub(crate) fn fork_child_reset_process_state() {
    PROCESS_SESSION.store(false, Ordering::Release);
}
