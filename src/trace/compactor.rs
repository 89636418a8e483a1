// src/trace/compactor.rs

//! Raw steps ⇄ compacted steps.
//!
//! The compactor is stateful: each step is diffed against the *reconstructed*
//! state of the step before it. With a keyframe interval of `n`, the state
//! is reset every `n` steps so each run of `n` compacted steps can be decoded
//! without anything that came before it.

use tracing::debug;

use crate::errors::{RelayError, Result};
use crate::trace::animation;
use crate::trace::diff::{DiffOutcome, apply_diff, diff_states};
use crate::trace::model::{COMPACTED_RESERVED_KEYS, CompactedStep, MemoryState, RawStep};

/// Step carries `fullState`.
pub const FLAG_FULL_STATE: u8 = 1;
/// Step carries neither `fullState` nor `stateDiff`.
pub const FLAG_UNCHANGED: u8 = 1 << 1;

/// Size comparison, for diagnostics only.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompactionStats {
    pub raw_bytes: usize,
    pub compacted_bytes: usize,
}

impl CompactionStats {
    /// `compacted / raw`; `0.0` when nothing was compacted.
    pub fn ratio(&self) -> f64 {
        if self.raw_bytes == 0 {
            0.0
        } else {
            self.compacted_bytes as f64 / self.raw_bytes as f64
        }
    }
}

#[derive(Debug, Default)]
pub struct TraceCompactor {
    keyframe_interval: Option<usize>,
    previous: Option<MemoryState>,
    emitted: usize,
    stats: CompactionStats,
}

impl TraceCompactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset to a full state every `interval` steps (`0` disables keyframes).
    pub fn with_keyframe_interval(interval: usize) -> Self {
        Self {
            keyframe_interval: (interval > 0).then_some(interval),
            ..Self::default()
        }
    }

    /// Forget the previous state; the next step carries `fullState`.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub fn stats(&self) -> CompactionStats {
        self.stats
    }

    pub fn push(&mut self, step: &RawStep) -> Result<CompactedStep> {
        if let Some(key) = COMPACTED_RESERVED_KEYS
            .iter()
            .find(|k| step.extra.contains_key(**k))
        {
            return Err(RelayError::MalformedTrace(format!(
                "step {} carries reserved field {key:?}",
                step.id
            )));
        }

        if let Some(n) = self.keyframe_interval {
            if self.emitted % n == 0 {
                self.reset();
            }
        }

        let outcome = match &self.previous {
            None => DiffOutcome::NeedsFullState,
            Some(prev) => diff_states(prev, &step.state),
        };

        let (state_diff, full_state, flags) = match outcome {
            DiffOutcome::NeedsFullState => (None, Some(step.state.clone()), FLAG_FULL_STATE),
            DiffOutcome::Unchanged => (None, None, FLAG_UNCHANGED),
            DiffOutcome::Changed(diff) => (Some(diff), None, 0),
        };

        let compacted = CompactedStep {
            id: step.id,
            step_type: step.step_type.clone(),
            line: step.line,
            explanation: step.explanation.clone(),
            function: step.function.clone(),
            state_diff,
            full_state,
            animation_code: step.animation.as_ref().map(animation::shorten),
            flags,
            extra: step.extra.clone(),
        };

        self.previous = Some(step.state.clone());
        self.emitted += 1;
        self.stats.raw_bytes += encoded_len(step);
        self.stats.compacted_bytes += encoded_len(&compacted);
        Ok(compacted)
    }

    /// Compact a whole trace in one go.
    pub fn compact_all(&mut self, steps: &[RawStep]) -> Result<Vec<CompactedStep>> {
        let out = steps
            .iter()
            .map(|s| self.push(s))
            .collect::<Result<Vec<_>>>()?;
        debug!(
            steps = out.len(),
            raw_bytes = self.stats.raw_bytes,
            compacted_bytes = self.stats.compacted_bytes,
            ratio = self.stats.ratio(),
            "trace compacted"
        );
        Ok(out)
    }
}

/// Rebuilds raw steps from compacted ones.
#[derive(Debug, Default)]
pub struct Decompactor {
    previous: Option<MemoryState>,
}

impl Decompactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: &CompactedStep) -> Result<RawStep> {
        let state = if step.flags & FLAG_FULL_STATE != 0 {
            step.full_state.clone().ok_or_else(|| {
                RelayError::MalformedTrace(format!(
                    "step {} flagged full state but carries none",
                    step.id
                ))
            })?
        } else {
            let prev = self.previous.as_ref().ok_or_else(|| {
                RelayError::MalformedTrace(format!(
                    "step {} is a diff with no prior state",
                    step.id
                ))
            })?;
            let mut state = prev.clone();
            if step.flags & FLAG_UNCHANGED == 0 {
                let diff = step.state_diff.as_ref().ok_or_else(|| {
                    RelayError::MalformedTrace(format!(
                        "step {} carries neither a diff nor the unchanged flag",
                        step.id
                    ))
                })?;
                apply_diff(&mut state, diff);
            }
            state
        };

        self.previous = Some(state.clone());
        Ok(RawStep {
            id: step.id,
            step_type: step.step_type.clone(),
            line: step.line,
            explanation: step.explanation.clone(),
            function: step.function.clone(),
            state,
            animation: step.animation_code.as_ref().map(animation::expand),
            extra: step.extra.clone(),
        })
    }

    pub fn decompact_all(&mut self, steps: &[CompactedStep]) -> Result<Vec<RawStep>> {
        steps.iter().map(|s| self.push(s)).collect()
    }
}

fn encoded_len<T: serde::Serialize>(value: &T) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}
