use thiserror::Error;

/// Errors surfaced at the control boundary.
///
/// Capture-time and resolution-time degradation (inconsistent thread state,
/// ring overflow, heap map saturation, stale descriptors) is never an error:
/// it is absorbed into the session counters and visible through
/// [`crate::CpuStats`] / [`crate::MemStats`]. A partial profile always beats
/// a missing one.
#[derive(Debug, Clone, Error)]
pub enum ProfilerError {
    #[error("a profiling session is already running")]
    AlreadyRunning,

    #[error("no profiling session is running")]
    NotRunning,

    #[error("the profiler has been shut down; it cannot be started again")]
    ShutDown,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("platform support missing: {0}")]
    PlatformUnsupported(&'static str),

    #[error("failed to arm the sampling timer: {0} (errno {1})")]
    TimerSetup(&'static str, i32),
}

pub type Result<T> = std::result::Result<T, ProfilerError>;
