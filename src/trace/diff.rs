// src/trace/diff.rs

//! Structural diffing of memory snapshots.

use serde_json::{Map, Value};

use crate::trace::model::{MemoryState, StateDiff};

/// Result of comparing two snapshots.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffOutcome {
    Unchanged,
    Changed(StateDiff),
    /// A map value in the new state is `null`, which a diff would read as a
    /// removal. The step has to be shipped as a full state.
    NeedsFullState,
}

pub fn diff_states(prev: &MemoryState, next: &MemoryState) -> DiffOutcome {
    let has_null = |m: &Map<String, Value>| m.values().any(Value::is_null);
    if has_null(&next.globals) || has_null(&next.heap) {
        return DiffOutcome::NeedsFullState;
    }

    let diff = StateDiff {
        globals: diff_map(&prev.globals, &next.globals),
        stack: diff_array(&prev.stack, &next.stack),
        heap: diff_map(&prev.heap, &next.heap),
        call_stack: diff_array(&prev.call_stack, &next.call_stack),
    };
    if diff.is_empty() {
        DiffOutcome::Unchanged
    } else {
        DiffOutcome::Changed(diff)
    }
}

/// Added/changed keys, plus `null` for every key that disappeared.
fn diff_map(prev: &Map<String, Value>, next: &Map<String, Value>) -> Option<Map<String, Value>> {
    let mut out = Map::new();
    for (key, value) in next {
        if prev.get(key) != Some(value) {
            out.insert(key.clone(), value.clone());
        }
    }
    for key in prev.keys() {
        if !next.contains_key(key) {
            out.insert(key.clone(), Value::Null);
        }
    }
    (!out.is_empty()).then_some(out)
}

fn diff_array(prev: &[Value], next: &[Value]) -> Option<Vec<Value>> {
    (prev != next).then(|| next.to_vec())
}

/// Apply `diff` on top of `state` in place.
pub fn apply_diff(state: &mut MemoryState, diff: &StateDiff) {
    if let Some(globals) = &diff.globals {
        apply_map(&mut state.globals, globals);
    }
    if let Some(stack) = &diff.stack {
        state.stack = stack.clone();
    }
    if let Some(heap) = &diff.heap {
        apply_map(&mut state.heap, heap);
    }
    if let Some(call_stack) = &diff.call_stack {
        state.call_stack = call_stack.clone();
    }
}

fn apply_map(target: &mut Map<String, Value>, diff: &Map<String, Value>) {
    for (key, value) in diff {
        if value.is_null() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(globals: Value, stack: Value) -> MemoryState {
        MemoryState {
            globals: globals.as_object().cloned().unwrap_or_default(),
            stack: stack.as_array().cloned().unwrap_or_default(),
            ..MemoryState::default()
        }
    }

    #[test]
    fn records_changes_and_tombstones() {
        let prev = state(json!({"a": 1, "b": 2}), json!([]));
        let next = state(json!({"a": 1, "c": 3}), json!([]));
        let DiffOutcome::Changed(diff) = diff_states(&prev, &next) else {
            panic!("expected a diff");
        };
        assert_eq!(
            Value::Object(diff.globals.clone().unwrap()),
            json!({"b": null, "c": 3})
        );
        assert!(diff.stack.is_none());

        let mut rebuilt = prev.clone();
        apply_diff(&mut rebuilt, &diff);
        assert_eq!(rebuilt, next);
    }

    #[test]
    fn arrays_are_replaced_wholesale() {
        let prev = state(json!({}), json!([{"function": "main", "line": 1}]));
        let next = state(json!({}), json!([{"function": "main", "line": 2}]));
        let DiffOutcome::Changed(diff) = diff_states(&prev, &next) else {
            panic!("expected a diff");
        };
        assert_eq!(diff.stack.unwrap(), next.stack);
    }

    #[test]
    fn identical_states_are_unchanged() {
        let s = state(json!({"x": [1, 2]}), json!([1]));
        assert_eq!(diff_states(&s, &s.clone()), DiffOutcome::Unchanged);
    }

    #[test]
    fn null_map_value_forces_full_state() {
        let prev = state(json!({}), json!([]));
        let next = state(json!({"p": null}), json!([]));
        assert_eq!(diff_states(&prev, &next), DiffOutcome::NeedsFullState);
    }
}
