//! Supervisor-thread backend: a dedicated thread wakes at the sampling
//! interval, takes the host's global execution lock, and walks every
//! interpreter thread while none of them can mutate its frame chain.
//!
//! No signal handler is involved; captured descriptors get strong
//! references through the code-object registry right away.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, warn};

use crate::sample::RawSample;
use crate::sampler::{capture_into, CaptureOutcome};
use crate::session::SessionShared;

pub(crate) struct SupervisorBackend {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl SupervisorBackend {
    pub fn start(shared: Arc<SessionShared>) -> std::io::Result<SupervisorBackend> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("spprof-sampler".to_string())
            .spawn(move || {
                run_loop(&shared, &stop_rx);
            })?;
        Ok(SupervisorBackend {
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Ask the supervisor to exit and wait for it. The loop re-checks the
    /// stop channel at least once per interval, so this is bounded.
    pub fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("spprof sampler thread panicked during shutdown");
            }
        }
    }
}

fn run_loop(shared: &SessionShared, stop_rx: &crossbeam_channel::Receiver<()>) {
    let interval = Duration::from_millis(shared.config.interval_ms);
    let mut scratch: Box<RawSample> = Box::new(unsafe { std::mem::zeroed() });
    let mut last_sleep_overshoot = Duration::from_nanos(0);
    let mut ticks: u64 = 0;

    loop {
        let tick_start = Instant::now();
        sample_all_threads(shared, &mut scratch);
        ticks += 1;

        // Sleep the remainder of the interval, compensating for how long
        // the previous sleep overshot.
        let intended_wakeup = tick_start + interval;
        let intended_wait = intended_wakeup.saturating_duration_since(Instant::now());
        let sleep_time = if intended_wait > last_sleep_overshoot {
            intended_wait - last_sleep_overshoot
        } else {
            Duration::from_nanos(0)
        };

        let before_sleep = Instant::now();
        match stop_rx.recv_timeout(sleep_time) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        last_sleep_overshoot = Instant::now()
            .duration_since(before_sleep)
            .checked_sub(sleep_time)
            .unwrap_or_else(|| Duration::from_nanos(0));
    }

    debug!("spprof sampler thread exiting after {ticks} ticks");
}

fn sample_all_threads(shared: &SessionShared, scratch: &mut RawSample) {
    if crate::fork::lockout() {
        return;
    }
    let host = Arc::clone(&shared.host);
    host.with_global_lock(&mut || {
        // Interpreter threads are parked on the lock, so the GC cannot run
        // and frame chains cannot mutate until we release it.
        shared
            .epoch_hint
            .store(shared.host.gc_epoch(), Ordering::Release);

        for thread in shared.host.enumerate_threads() {
            let outcome = unsafe { capture_into(shared, thread.state, scratch, 0) };
            if outcome != CaptureOutcome::Published {
                continue;
            }
            for frame in scratch.interpreter_frames() {
                shared.registry.note_capture_locked(frame.code);
            }
        }
    });
}
