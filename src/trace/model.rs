// src/trace/model.rs

//! Trace data shapes, as they appear on the wire (camelCase JSON).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Step-level memory snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryState {
    #[serde(default)]
    pub globals: Map<String, Value>,
    #[serde(default)]
    pub stack: Vec<Value>,
    #[serde(default)]
    pub heap: Map<String, Value>,
    #[serde(default)]
    pub call_stack: Vec<Value>,
}

/// One execution step with its full memory snapshot.
///
/// Fields this type does not know about (`name`, `value`, `dataType`,
/// `address`, `className`, ...) are kept verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawStep {
    pub id: u64,
    #[serde(rename = "type")]
    pub step_type: String,
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default)]
    pub state: MemoryState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Structural difference between two consecutive states.
///
/// Map sections carry only added/changed keys, with `null` marking a removed
/// key. Array sections are present only when they changed and then hold the
/// complete new array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDiff {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub globals: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heap: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_stack: Option<Vec<Value>>,
}

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        self.globals.is_none()
            && self.stack.is_none()
            && self.heap.is_none()
            && self.call_stack.is_none()
    }
}

/// Step with its memory expressed relative to the previous step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactedStep {
    pub id: u64,
    #[serde(rename = "type")]
    pub step_type: String,
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_diff: Option<StateDiff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_state: Option<MemoryState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation_code: Option<Value>,
    #[serde(default)]
    pub flags: u8,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Keys a compacted step uses for itself; raw extras may not reuse them.
pub const COMPACTED_RESERVED_KEYS: &[&str] = &["stateDiff", "fullState", "animationCode", "flags"];

/// Trace-level facts shipped once, on chunk 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceMetadata {
    pub total_steps: usize,
    #[serde(default)]
    pub globals: Vec<Value>,
    #[serde(default)]
    pub functions: Vec<Value>,
}
