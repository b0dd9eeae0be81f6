//! In-process sampling profiler engine for managed interpreter runtimes.
//!
//! Two profilers share one data plane:
//!
//! - [`Profiler`] builds CPU profiles from periodic stack snapshots of
//!   interpreter threads. Capture contexts copy frame pointers into a
//!   lock-free ring buffer; the drain path symbolizes them through the
//!   code-object registry, which keeps captured descriptors safe from the
//!   host's garbage collector.
//! - [`AllocationProfiler`] builds memory profiles from Poisson-sampled
//!   heap allocations with lifetime tracking: a lock-free address map,
//!   content-addressed stack interning, and a counting bloom filter that
//!   short-circuits the free path.
//!
//! The host runtime is reached exclusively through [`host::HostRuntime`]
//! and the shared `#[repr(C)]` thread/frame layouts, so the engine embeds
//! into any interpreter that can express those. Profiles are packaged with
//! the [`spprof_profile`] crate (re-exported as [`profile`]).
//!
//! ```no_run
//! use std::sync::Arc;
//! use spprof::{CpuConfig, Profiler};
//! # fn host() -> Arc<dyn spprof::host::HostRuntime> { unimplemented!() }
//!
//! let profiler = Profiler::new(host());
//! profiler.start(CpuConfig::default())?;
//! // ... workload ...
//! let profile = profiler.stop_and_collect()?;
//! let json = serde_json::to_string(&profile.to_flame_json())?;
//! # let _ = json;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub use spprof_profile as profile;

pub mod alloc;
mod drain;
mod error;
pub mod fork;
pub mod host;
mod registry;
mod ring;
mod sample;
mod sampler;
mod session;
mod stats;
mod time;
mod walker;

pub use alloc::{
    AllocationProfiler, AllocationSample, Confidence, FramePointerHealth, HeapSnapshot, MemConfig,
    MemStats, TopAllocator, DEFAULT_SAMPLING_RATE_BYTES,
};
pub use drain::DrainBatch;
pub use error::{ProfilerError, Result};
pub use sample::{MAX_NATIVE_DEPTH, MAX_STACK_DEPTH};
pub use sampler::{BackendChoice, CpuConfig};
pub use session::Profiler;
pub use stats::CpuStats;
pub use walker::{capture_native_stack, native_unwinding_available, NativeFrame};
