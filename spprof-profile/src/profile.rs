use std::time::SystemTime;

use crate::aggregate::{AggregatedProfile, AggregatedStack};
use crate::collapsed;
use crate::fast_hash_map::FastHashMap;
use crate::flamejson::{self, Document, DocumentBuilder, WeightUnit};
use crate::frame::Frame;

/// A single profiling sample: one captured stack on one thread.
///
/// `frames` is leaf-first: `frames[0]` is the innermost function that was
/// executing when the sample was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub timestamp_ns: u64,
    pub thread_id: u64,
    pub thread_name: Option<String>,
    pub frames: Vec<Frame>,
}

/// Result of a CPU profiling session.
#[derive(Debug, Clone)]
pub struct Profile {
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub interval_ms: u64,
    pub samples: Vec<Sample>,
    pub dropped_count: u64,
    /// Version string of the host runtime, e.g. `"3.12.1"`.
    pub runtime_version: String,
    /// Platform triple-ish string, e.g. `"linux-6.8-x86_64"`.
    pub platform: String,
}

impl Profile {
    pub fn new(start_time: SystemTime, interval_ms: u64) -> Self {
        Profile {
            start_time,
            end_time: start_time,
            interval_ms,
            samples: Vec::new(),
            dropped_count: 0,
            runtime_version: String::new(),
            platform: String::new(),
        }
    }

    pub fn push_sample(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    pub fn finish(&mut self, end_time: SystemTime) {
        self.end_time = end_time;
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn total_duration_ms(&self) -> f64 {
        match self.end_time.duration_since(self.start_time) {
            Ok(d) => d.as_secs_f64() * 1000.0,
            Err(_) => 0.0,
        }
    }

    /// Effective sampling rate in samples per second.
    pub fn effective_rate_hz(&self) -> f64 {
        let duration_s = self.total_duration_ms() / 1000.0;
        if duration_s <= 0.0 {
            return 0.0;
        }
        self.samples.len() as f64 / duration_s
    }

    /// Compress identical stacks into unique stacks with occurrence counts.
    ///
    /// Long sessions of a steady workload produce mostly-identical samples;
    /// the aggregated form stores each unique (stack, thread) pair once.
    pub fn aggregate(&self) -> AggregatedProfile {
        let mut order: Vec<AggregatedStack> = Vec::new();
        let mut index: FastHashMap<(u64, Vec<Frame>), usize> = FastHashMap::default();

        for sample in &self.samples {
            let key = (sample.thread_id, sample.frames.clone());
            match index.get(&key) {
                Some(&i) => order[i].count += 1,
                None => {
                    index.insert(key, order.len());
                    order.push(AggregatedStack {
                        frames: sample.frames.clone(),
                        thread_id: sample.thread_id,
                        thread_name: sample.thread_name.clone(),
                        count: 1,
                    });
                }
            }
        }

        AggregatedProfile {
            start_time: self.start_time,
            end_time: self.end_time,
            interval_ms: self.interval_ms,
            stacks: order,
            total_samples: self.samples.len() as u64,
            dropped_count: self.dropped_count,
            runtime_version: self.runtime_version.clone(),
            platform: self.platform.clone(),
        }
    }

    /// Build the nested flame-graph JSON document.
    ///
    /// Samples are grouped per thread in first-seen order. Each sample's
    /// weight is the nominal sampling interval in nanoseconds.
    pub fn to_flame_json(&self) -> Document {
        let mut builder = DocumentBuilder::new("spprof profile");
        let weight_ns = self.interval_ms * 1_000_000;

        for (thread_id, thread_samples) in group_by_thread(&self.samples) {
            let thread_name = thread_samples
                .iter()
                .find_map(|s| s.thread_name.clone())
                .unwrap_or_else(|| format!("Thread-{thread_id}"));
            let start_ts = thread_samples.first().map_or(0, |s| s.timestamp_ns);
            let end_ts = thread_samples.last().map_or(start_ts, |s| s.timestamp_ns);

            let handle = builder.add_profile(
                &thread_name,
                WeightUnit::Nanoseconds,
                0,
                end_ts.saturating_sub(start_ts),
            );
            for sample in &thread_samples {
                builder.add_sample(handle, &sample.frames, weight_ns);
            }
        }

        builder.finish()
    }

    /// Render the collapsed stack format. See [`collapsed`].
    pub fn to_collapsed(&self) -> String {
        collapsed::render(
            self.samples
                .iter()
                .map(|s| (s.frames.as_slice(), 1u64)),
        )
    }
}

/// Groups samples by thread id, preserving the order in which threads first
/// appear and the sample order within each thread.
fn group_by_thread(samples: &[Sample]) -> Vec<(u64, Vec<&Sample>)> {
    let mut order: Vec<(u64, Vec<&Sample>)> = Vec::new();
    let mut index: FastHashMap<u64, usize> = FastHashMap::default();
    for sample in samples {
        match index.get(&sample.thread_id) {
            Some(&i) => order[i].1.push(sample),
            None => {
                index.insert(sample.thread_id, order.len());
                order.push((sample.thread_id, vec![sample]));
            }
        }
    }
    order
}

/// Reconstruct a [`Profile`] from a parsed flame-graph document.
///
/// The document does not carry OS thread ids or capture timestamps, so
/// thread ids are synthesized from profile position and timestamps from the
/// cumulative sample weights. Stacks and weights survive exactly.
pub(crate) fn profile_from_document(doc: &Document) -> Profile {
    let mut profile = Profile::new(SystemTime::UNIX_EPOCH, 0);
    for (thread_index, thread) in doc.profiles.iter().enumerate() {
        let mut elapsed = thread.start_value;
        for (stack, weight) in thread.samples.iter().zip(&thread.weights) {
            let mut frames: Vec<Frame> = stack
                .iter()
                .filter_map(|&i| doc.shared.frames.get(i))
                .map(flamejson::FrameEntry::to_frame)
                .collect();
            // Stored root-first; the in-memory model is leaf-first.
            frames.reverse();
            profile.push_sample(Sample {
                timestamp_ns: elapsed,
                thread_id: thread_index as u64,
                thread_name: Some(thread.name.clone()),
                frames,
            });
            elapsed += weight;
        }
    }
    profile
}
