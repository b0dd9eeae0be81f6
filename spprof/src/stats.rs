use std::sync::atomic::{AtomicU64, Ordering};

use serde_derive::Serialize;

/// Hot-path counters for a CPU session. All monotonically increasing while
/// the session runs; read with relaxed loads.
#[derive(Debug, Default)]
pub(crate) struct CpuCounters {
    pub collected: AtomicU64,
    pub drops_invalid_state: AtomicU64,
    pub drops_no_thread_state: AtomicU64,
    pub truncated: AtomicU64,
    pub quiescence_timeouts: AtomicU64,
    pub stale_frames: AtomicU64,
    pub unknown_frames: AtomicU64,
}

/// Average cost of one capture, used for the overhead estimate: frame walk,
/// ring publish and signal dispatch.
const HANDLER_COST_NS: u64 = 25_000;

/// Point-in-time statistics for a CPU profiling session.
#[derive(Debug, Clone, Serialize)]
pub struct CpuStats {
    pub collected_samples: u64,
    /// Configured sampling interval.
    pub interval_ms: u64,
    /// All drops: ring overflow + invalid thread state + missing state.
    pub dropped_samples: u64,
    pub drops_ring_full: u64,
    pub drops_invalid_state: u64,
    pub drops_no_thread_state: u64,
    pub truncated_samples: u64,
    pub stale_frames: u64,
    pub unknown_frames: u64,
    pub quiescence_timeouts: u64,
    pub duration_ns: u64,
    pub overhead_estimate_pct: f64,
}

impl CpuStats {
    pub(crate) fn gather(
        counters: &CpuCounters,
        interval_ms: u64,
        ring_dropped: u64,
        duration_ns: u64,
    ) -> CpuStats {
        let collected = counters.collected.load(Ordering::Relaxed);
        let drops_invalid_state = counters.drops_invalid_state.load(Ordering::Relaxed);
        let drops_no_thread_state = counters.drops_no_thread_state.load(Ordering::Relaxed);

        let overhead_estimate_pct = if duration_ns > 0 {
            (collected * HANDLER_COST_NS) as f64 / duration_ns as f64 * 100.0
        } else {
            0.0
        };

        CpuStats {
            collected_samples: collected,
            interval_ms,
            dropped_samples: ring_dropped + drops_invalid_state + drops_no_thread_state,
            drops_ring_full: ring_dropped,
            drops_invalid_state,
            drops_no_thread_state,
            truncated_samples: counters.truncated.load(Ordering::Relaxed),
            stale_frames: counters.stale_frames.load(Ordering::Relaxed),
            unknown_frames: counters.unknown_frames.load(Ordering::Relaxed),
            quiescence_timeouts: counters.quiescence_timeouts.load(Ordering::Relaxed),
            duration_ns,
            overhead_estimate_pct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overhead_estimate_scales_with_sample_count() {
        let counters = CpuCounters::default();
        counters.collected.store(1000, Ordering::Relaxed);
        // 1000 samples at 25us each over 1s -> 2.5%.
        let stats = CpuStats::gather(&counters, 10, 0, 1_000_000_000);
        assert!((stats.overhead_estimate_pct - 2.5).abs() < 1e-9);
    }

    #[test]
    fn zero_duration_has_zero_overhead() {
        let counters = CpuCounters::default();
        let stats = CpuStats::gather(&counters, 10, 0, 0);
        assert_eq!(stats.overhead_estimate_pct, 0.0);
    }

    #[test]
    fn dropped_sums_all_sources() {
        let counters = CpuCounters::default();
        counters.drops_invalid_state.store(3, Ordering::Relaxed);
        counters.drops_no_thread_state.store(2, Ordering::Relaxed);
        let stats = CpuStats::gather(&counters, 10, 7, 1);
        assert_eq!(stats.dropped_samples, 12);
    }
}
