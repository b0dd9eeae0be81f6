//! Drain path: converts raw ring-buffer samples into resolved samples,
//! deferring to the code-object registry for every descriptor dereference.
//!
//! Runs on a normal thread (never in capture context), so it may allocate
//! and call host APIs freely.

use rustc_hash::FxHashMap;
use spprof_profile::{Frame, Sample};

use crate::sample::RawSample;
use crate::session::SessionShared;
use crate::walker;

/// One chunk of resolved samples, as returned by
/// [`crate::Profiler::drain`].
#[derive(Debug, Clone)]
pub struct DrainBatch {
    pub samples: Vec<Sample>,
    /// More samples remain in the ring; call `drain` again.
    pub has_more: bool,
    /// Total samples dropped so far this session (ring overflow plus
    /// capture-time rejections).
    pub dropped_count: u64,
}

impl DrainBatch {
    pub(crate) fn empty() -> DrainBatch {
        DrainBatch {
            samples: Vec::new(),
            has_more: false,
            dropped_count: 0,
        }
    }
}

pub(crate) fn drain_batch(shared: &SessionShared, max_samples: usize) -> DrainBatch {
    let mut scratch: Box<RawSample> = Box::new(unsafe { std::mem::zeroed() });
    let mut samples = Vec::with_capacity(max_samples.min(1024));
    // Thread names and native symbols rarely change within a drain; cache
    // both lookups across samples.
    let mut name_cache: FxHashMap<u64, Option<String>> = FxHashMap::default();
    let mut native_cache: FxHashMap<u64, Frame> = FxHashMap::default();

    while samples.len() < max_samples && shared.ring.pop_into(&mut scratch) {
        let mut frames =
            Vec::with_capacity(scratch.depth as usize + scratch.native_depth as usize);

        for captured in scratch.interpreter_frames() {
            frames.push(
                shared
                    .registry
                    .resolve(*captured, scratch.gc_epoch, &shared.counters),
            );
        }
        for &ip in scratch.native_frames() {
            let frame = native_cache
                .entry(ip)
                .or_insert_with(|| {
                    let resolved = walker::resolve_native_ip(ip);
                    Frame::native(&resolved.symbol, &resolved.filename)
                })
                .clone();
            frames.push(frame);
        }

        let thread_name = name_cache
            .entry(scratch.os_tid)
            .or_insert_with(|| shared.host.thread_name(scratch.os_tid))
            .clone();

        samples.push(Sample {
            timestamp_ns: scratch.timestamp_ns,
            thread_id: scratch.os_tid,
            thread_name,
            frames,
        });
    }

    let counters = &shared.counters;
    DrainBatch {
        has_more: shared.ring.approx_len() > 0,
        dropped_count: shared.ring.dropped()
            + counters
                .drops_invalid_state
                .load(std::sync::atomic::Ordering::Relaxed)
            + counters
                .drops_no_thread_state
                .load(std::sync::atomic::Ordering::Relaxed),
        samples,
    }
}
