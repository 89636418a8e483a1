use proptest::prelude::*;
use serde_json::{Map, Value, json};
use tracerelay::trace::{Decompactor, MemoryState, RawStep, TraceCompactor, animation};

// Small key space so consecutive steps share, change and drop keys.
const KEYS: &[&str] = &["a", "b", "count", "ptr", "node"];
const ANIM_KEYS: &[&str] = &["type", "t", "target", "tg", "~x", "~~", "label", "custom"];

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i32>().prop_map(|n| json!(n)),
        "[a-z0-9]{0,6}".prop_map(Value::String),
        any::<bool>().prop_map(Value::Bool),
    ]
}

fn value() -> impl Strategy<Value = Value> {
    scalar().prop_recursive(2, 12, 4, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..3).prop_map(Value::Array),
            proptest::collection::btree_map("[a-z]{1,3}", inner, 0..3)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn section() -> impl Strategy<Value = Map<String, Value>> {
    proptest::collection::btree_map(proptest::sample::select(KEYS), value(), 0..4)
        .prop_map(|m| m.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
}

fn state() -> impl Strategy<Value = MemoryState> {
    (
        section(),
        proptest::collection::vec(value(), 0..3),
        section(),
        proptest::collection::vec(value(), 0..2),
    )
        .prop_map(|(globals, stack, heap, call_stack)| MemoryState {
            globals,
            stack,
            heap,
            call_stack,
        })
}

fn animation_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        any::<i16>().prop_map(|n| json!(n)),
        "[a-z]{0,4}".prop_map(Value::String),
    ];
    leaf.prop_recursive(2, 10, 3, |inner| {
        proptest::collection::btree_map(proptest::sample::select(ANIM_KEYS), inner, 0..4)
            .prop_map(|m| Value::Object(m.into_iter().map(|(k, v)| (k.to_string(), v)).collect()))
    })
}

fn trace() -> impl Strategy<Value = Vec<RawStep>> {
    proptest::collection::vec(
        (
            state(),
            1u32..200,
            proptest::option::of(animation_value()),
            proptest::option::of("[a-z]{1,5}"),
        ),
        0..12,
    )
    .prop_map(|steps| {
        steps
            .into_iter()
            .enumerate()
            .map(|(i, (state, line, animation, name))| {
                let mut extra = Map::new();
                if let Some(name) = name {
                    extra.insert("name".to_string(), Value::String(name));
                }
                RawStep {
                    id: i as u64,
                    step_type: "line_execution".to_string(),
                    line,
                    explanation: Some(format!("Executing line {line}")),
                    function: Some("main".to_string()),
                    state,
                    animation,
                    extra,
                }
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn decompaction_restores_every_step(steps in trace(), interval in 0usize..5) {
        let compacted = TraceCompactor::with_keyframe_interval(interval)
            .compact_all(&steps)
            .unwrap();
        prop_assert_eq!(compacted.len(), steps.len());

        let restored = Decompactor::new().decompact_all(&compacted).unwrap();
        prop_assert_eq!(restored, steps);
    }

    #[test]
    fn compacted_steps_survive_json(steps in trace()) {
        let compacted = TraceCompactor::new().compact_all(&steps).unwrap();
        let wire = serde_json::to_string(&compacted).unwrap();
        let parsed: Vec<tracerelay::trace::CompactedStep> = serde_json::from_str(&wire).unwrap();
        let restored = Decompactor::new().decompact_all(&parsed).unwrap();
        prop_assert_eq!(restored, steps);
    }

    #[test]
    fn animation_shortening_is_invertible(anim in animation_value()) {
        prop_assert_eq!(animation::expand(&animation::shorten(&anim)), anim);
    }
}
