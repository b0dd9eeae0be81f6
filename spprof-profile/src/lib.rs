//! Profile data model and output formats for the spprof sampling profiler.
//!
//! A profiling session produces a [`Profile`]: a list of [`Sample`]s, each a
//! leaf-first stack of [`Frame`]s captured on one thread at one point in
//! time. For long sessions, [`Profile::aggregate`] compresses identical
//! stacks into an [`AggregatedProfile`] of unique stacks with counts.
//!
//! Two interchange formats are supported:
//!
//! - a nested flame-graph JSON document ([`flamejson::Document`]) with a
//!   shared, deduplicated frame table and per-thread weighted samples,
//! - the line-oriented collapsed stack format ([`collapsed`]) consumed by
//!   the classic `flamegraph.pl` tooling.
//!
//! Both can be produced from either profile form:
//!
//! ```
//! use spprof_profile::{Frame, Profile, Sample};
//! use std::time::SystemTime;
//!
//! let mut profile = Profile::new(SystemTime::now(), 10);
//! profile.push_sample(Sample {
//!     timestamp_ns: 0,
//!     thread_id: 1,
//!     thread_name: Some("main".to_string()),
//!     frames: vec![
//!         Frame::interpreted("inner", "app.x", 12),
//!         Frame::interpreted("outer", "app.x", 40),
//!     ],
//! });
//! profile.finish(SystemTime::now());
//!
//! let json = serde_json::to_string(&profile.to_flame_json()).unwrap();
//! let collapsed = profile.to_collapsed();
//! assert!(collapsed.starts_with("outer (app.x:40);inner (app.x:12) 1\n"));
//! # let _ = json;
//! ```

mod aggregate;
pub mod collapsed;
mod fast_hash_map;
mod frame;
pub mod flamejson;
mod profile;

pub use aggregate::{AggregatedProfile, AggregatedStack};
pub use frame::Frame;
pub use profile::{Profile, Sample};

/// Version reported in the `exporter` field of emitted documents.
pub const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");
