use std::time::SystemTime;

use crate::collapsed;
use crate::flamejson::{Document, DocumentBuilder, WeightUnit};
use crate::frame::Frame;

/// A unique call stack with its occurrence count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedStack {
    /// Leaf-first, like [`crate::Sample::frames`].
    pub frames: Vec<Frame>,
    pub thread_id: u64,
    pub thread_name: Option<String>,
    pub count: u64,
}

/// Memory-efficient profile form: unique stacks with counts instead of
/// individual samples. Produced by [`crate::Profile::aggregate`].
#[derive(Debug, Clone)]
pub struct AggregatedProfile {
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub interval_ms: u64,
    pub stacks: Vec<AggregatedStack>,
    /// Sample count of the originating profile.
    pub total_samples: u64,
    pub dropped_count: u64,
    pub runtime_version: String,
    pub platform: String,
}

impl AggregatedProfile {
    pub fn unique_stack_count(&self) -> usize {
        self.stacks.len()
    }

    /// Ratio of original samples to unique stacks. Higher means the
    /// workload spent more time in a small set of stacks.
    pub fn compression_ratio(&self) -> f64 {
        if self.stacks.is_empty() {
            return 1.0;
        }
        self.total_samples as f64 / self.stacks.len() as f64
    }

    pub fn memory_reduction_pct(&self) -> f64 {
        if self.total_samples == 0 {
            return 0.0;
        }
        (1.0 - (self.stacks.len() as f64 / self.total_samples as f64)) * 100.0
    }

    /// Build the nested flame-graph JSON document. Each unique stack is
    /// emitted `count` times so viewers that do not understand weights still
    /// show correct proportions; the per-sample weight stays the sampling
    /// interval.
    pub fn to_flame_json(&self) -> Document {
        let mut builder = DocumentBuilder::new("spprof profile");
        let weight_ns = self.interval_ms * 1_000_000;

        let mut thread_order: Vec<u64> = Vec::new();
        for stack in &self.stacks {
            if !thread_order.contains(&stack.thread_id) {
                thread_order.push(stack.thread_id);
            }
        }

        for thread_id in thread_order {
            let stacks: Vec<&AggregatedStack> = self
                .stacks
                .iter()
                .filter(|s| s.thread_id == thread_id)
                .collect();
            let thread_name = stacks
                .iter()
                .find_map(|s| s.thread_name.clone())
                .unwrap_or_else(|| format!("Thread-{thread_id}"));
            let total: u64 = stacks.iter().map(|s| s.count).sum();

            let handle = builder.add_profile(
                &thread_name,
                WeightUnit::Nanoseconds,
                0,
                total * weight_ns,
            );
            for stack in stacks {
                for _ in 0..stack.count {
                    builder.add_sample(handle, &stack.frames, weight_ns);
                }
            }
        }

        builder.finish()
    }

    pub fn to_collapsed(&self) -> String {
        collapsed::render(
            self.stacks
                .iter()
                .map(|s| (s.frames.as_slice(), s.count)),
        )
    }
}
