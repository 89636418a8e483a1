// src/trace/mod.rs

//! Trace representation and compaction.
//!
//! - `model`: raw steps, compacted steps, diffs and metadata
//! - `diff`: structural diff/apply between memory snapshots
//! - `animation`: reversible key shortening of animation metadata
//! - `compactor`: stateful compaction and decompaction
//! - `legacy`: whole-trace payload parsing (flat legacy and canonical)

pub mod animation;
pub mod compactor;
pub mod diff;
pub mod legacy;
pub mod model;

pub use compactor::{
    CompactionStats, Decompactor, FLAG_FULL_STATE, FLAG_UNCHANGED, TraceCompactor,
};
pub use legacy::TracePayload;
pub use model::{CompactedStep, MemoryState, RawStep, StateDiff, TraceMetadata};
