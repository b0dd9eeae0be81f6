//! Nested flame-graph JSON document (speedscope-compatible).
//!
//! The document has a shared, deduplicated frame table and one
//! `"sampled"`-type profile per thread. Sample stacks are arrays of indices
//! into the shared table in **root→leaf** order; `weights` runs parallel to
//! `samples`.

use serde_derive::{Deserialize, Serialize};

use crate::fast_hash_map::FastHashMap;
use crate::frame::Frame;
use crate::profile::{profile_from_document, Profile};
use crate::EXPORTER_VERSION;

pub const SCHEMA_URL: &str = "https://www.speedscope.app/file-format-schema.json";
pub const FORMAT_VERSION: &str = "1.0.0";

/// One entry in the shared frame table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameEntry {
    pub name: String,
    pub file: String,
    pub line: u32,
}

impl FrameEntry {
    pub fn from_frame(frame: &Frame) -> Self {
        FrameEntry {
            name: frame.function_name.clone(),
            file: frame.filename.clone(),
            line: frame.line,
        }
    }

    pub fn to_frame(&self) -> Frame {
        Frame {
            function_name: self.name.clone(),
            filename: self.file.clone(),
            line: self.line,
            // The document does not carry the native flag.
            is_native: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedFrames {
    pub frames: Vec<FrameEntry>,
}

/// Unit of the sample weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightUnit {
    Nanoseconds,
    Bytes,
}

/// A per-thread weighted sample list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadProfile {
    #[serde(rename = "type")]
    pub profile_type: String,
    pub name: String,
    pub unit: WeightUnit,
    #[serde(rename = "startValue")]
    pub start_value: u64,
    #[serde(rename = "endValue")]
    pub end_value: u64,
    /// Frame indices into [`SharedFrames::frames`], root→leaf.
    pub samples: Vec<Vec<usize>>,
    pub weights: Vec<u64>,
}

/// The complete document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "$schema")]
    pub schema: String,
    pub version: String,
    pub shared: SharedFrames,
    pub profiles: Vec<ThreadProfile>,
    pub name: String,
    pub exporter: String,
}

impl Document {
    pub fn parse(json: &str) -> Result<Document, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Reconstruct an in-memory [`Profile`] from the document. Thread ids
    /// and timestamps are synthesized; stacks and weights are exact.
    pub fn to_profile(&self) -> Profile {
        profile_from_document(self)
    }
}

/// Handle to one thread profile inside a [`DocumentBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadProfileHandle(usize);

/// Incrementally builds a [`Document`], deduplicating frames across all
/// thread profiles.
pub struct DocumentBuilder {
    name: String,
    frames: Vec<FrameEntry>,
    frame_index: FastHashMap<FrameEntry, usize>,
    profiles: Vec<ThreadProfile>,
}

impl DocumentBuilder {
    pub fn new(name: &str) -> Self {
        DocumentBuilder {
            name: name.to_string(),
            frames: Vec::new(),
            frame_index: FastHashMap::default(),
            profiles: Vec::new(),
        }
    }

    pub fn add_profile(
        &mut self,
        name: &str,
        unit: WeightUnit,
        start_value: u64,
        end_value: u64,
    ) -> ThreadProfileHandle {
        let handle = ThreadProfileHandle(self.profiles.len());
        self.profiles.push(ThreadProfile {
            profile_type: "sampled".to_string(),
            name: name.to_string(),
            unit,
            start_value,
            end_value,
            samples: Vec::new(),
            weights: Vec::new(),
        });
        handle
    }

    /// Append one weighted sample. `frames` is leaf-first, as captured; the
    /// stored index array is root→leaf.
    pub fn add_sample(&mut self, handle: ThreadProfileHandle, frames: &[Frame], weight: u64) {
        let mut indices: Vec<usize> = frames
            .iter()
            .rev()
            .map(|f| self.index_for_frame(f))
            .collect();
        indices.shrink_to_fit();
        let profile = &mut self.profiles[handle.0];
        profile.samples.push(indices);
        profile.weights.push(weight);
    }

    fn index_for_frame(&mut self, frame: &Frame) -> usize {
        let entry = FrameEntry::from_frame(frame);
        match self.frame_index.get(&entry) {
            Some(&i) => i,
            None => {
                let i = self.frames.len();
                self.frame_index.insert(entry.clone(), i);
                self.frames.push(entry);
                i
            }
        }
    }

    pub fn finish(self) -> Document {
        Document {
            schema: SCHEMA_URL.to_string(),
            version: FORMAT_VERSION.to_string(),
            shared: SharedFrames {
                frames: self.frames,
            },
            profiles: self.profiles,
            name: self.name,
            exporter: format!("spprof {EXPORTER_VERSION}"),
        }
    }
}
