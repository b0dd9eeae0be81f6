//! Host-callback backend: the host runtime's own timer invokes
//! [`tick`] while holding its global execution lock. Only the calling
//! thread is captured. Used when neither signal timers nor a supervisor
//! thread are workable.

use std::sync::atomic::Ordering;

use crate::sampler::{capture_into, current_reg, CaptureOutcome};
use crate::session::SessionShared;

/// Capture the calling thread. The caller must hold the host's global
/// execution lock; the walker and registry rely on frames and descriptors
/// being frozen for the duration.
pub(crate) fn tick(shared: &SessionShared) {
    if crate::fork::lockout() {
        return;
    }
    let reg = current_reg();
    if reg.is_null() {
        shared
            .counters
            .drops_no_thread_state
            .fetch_add(1, Ordering::Relaxed);
        return;
    }

    shared
        .epoch_hint
        .store(shared.host.gc_epoch(), Ordering::Release);

    let reg = unsafe { &*reg };
    let scratch = unsafe { &mut *reg.scratch.get() };
    let outcome = unsafe { capture_into(shared, reg.state, scratch, 0) };
    if outcome == CaptureOutcome::Published {
        for frame in scratch.interpreter_frames() {
            shared.registry.note_capture_locked(frame.code);
        }
    }
}
