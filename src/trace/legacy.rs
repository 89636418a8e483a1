// src/trace/legacy.rs

//! Whole-trace payload parsing.
//!
//! Accepted shapes:
//! - a bare JSON array of raw steps
//! - the flat `{ "steps": [...], "totalSteps": N }` payload
//! - the canonical `{ "compactedSteps": [...], "metadata": {...} }` payload
//!
//! A payload carrying both `steps` and `compactedSteps` is refused rather
//! than guessed at.

use serde_json::Value;

use crate::errors::{RelayError, Result};
use crate::trace::compactor::Decompactor;
use crate::trace::model::{CompactedStep, RawStep, TraceMetadata};

#[derive(Debug, Clone, PartialEq)]
pub enum TracePayload {
    Raw(Vec<RawStep>),
    Compacted {
        steps: Vec<CompactedStep>,
        metadata: Option<TraceMetadata>,
    },
}

impl TracePayload {
    pub fn parse(value: Value) -> Result<Self> {
        match value {
            Value::Array(_) => Ok(TracePayload::Raw(serde_json::from_value(value)?)),
            Value::Object(mut obj) => {
                let steps = obj.remove("steps");
                let compacted = obj.remove("compactedSteps");
                match (steps, compacted) {
                    (Some(_), Some(_)) => Err(RelayError::AmbiguousTraceFormat),
                    (Some(steps), None) => {
                        let steps: Vec<RawStep> = serde_json::from_value(steps)?;
                        if let Some(total) = obj.get("totalSteps") {
                            let total = total.as_u64().ok_or_else(|| {
                                RelayError::MalformedTrace("totalSteps is not a count".to_string())
                            })?;
                            if total as usize != steps.len() {
                                return Err(RelayError::MalformedTrace(format!(
                                    "totalSteps is {total} but {} steps present",
                                    steps.len()
                                )));
                            }
                        }
                        Ok(TracePayload::Raw(steps))
                    }
                    (None, Some(compacted)) => {
                        let metadata = match obj.remove("metadata") {
                            Some(Value::Null) | None => None,
                            Some(m) => Some(serde_json::from_value(m)?),
                        };
                        Ok(TracePayload::Compacted {
                            steps: serde_json::from_value(compacted)?,
                            metadata,
                        })
                    }
                    (None, None) => Err(RelayError::MalformedTrace(
                        "payload has neither steps nor compactedSteps".to_string(),
                    )),
                }
            }
            other => Err(RelayError::MalformedTrace(format!(
                "expected a trace object or array, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Raw steps, decompacting if needed.
    pub fn into_raw(self) -> Result<Vec<RawStep>> {
        match self {
            TracePayload::Raw(steps) => Ok(steps),
            TracePayload::Compacted { steps, .. } => Decompactor::new().decompact_all(&steps),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
