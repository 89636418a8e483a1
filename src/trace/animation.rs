// src/trace/animation.rs

//! Field-name shortening for animation metadata.
//!
//! Known long keys map to short codes. A key that already looks like a short
//! code, or that starts with `~`, gets one extra `~` in front so expansion
//! can tell the two apart and the mapping stays exactly invertible.

use serde_json::{Map, Value};

const ESCAPE: char = '~';

const KEY_CODES: &[(&str, &str)] = &[
    ("type", "t"),
    ("target", "tg"),
    ("duration", "d"),
    ("from", "f"),
    ("to", "o"),
    ("delay", "dl"),
    ("easing", "e"),
    ("value", "v"),
    ("index", "i"),
    ("variable", "vr"),
    ("color", "c"),
    ("label", "l"),
];

fn short_for(key: &str) -> Option<&'static str> {
    KEY_CODES
        .iter()
        .find(|(long, _)| *long == key)
        .map(|(_, short)| *short)
}

fn long_for(key: &str) -> Option<&'static str> {
    KEY_CODES
        .iter()
        .find(|(_, short)| *short == key)
        .map(|(long, _)| *long)
}

fn shorten_key(key: &str) -> String {
    if let Some(short) = short_for(key) {
        short.to_string()
    } else if long_for(key).is_some() || key.starts_with(ESCAPE) {
        format!("{ESCAPE}{key}")
    } else {
        key.to_string()
    }
}

fn expand_key(key: &str) -> String {
    if let Some(rest) = key.strip_prefix(ESCAPE) {
        rest.to_string()
    } else if let Some(long) = long_for(key) {
        long.to_string()
    } else {
        key.to_string()
    }
}

fn map_keys(value: &Value, f: fn(&str) -> String) -> Value {
    match value {
        Value::Object(obj) => {
            let mut out = Map::with_capacity(obj.len());
            for (k, v) in obj {
                out.insert(f(k), map_keys(v, f));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| map_keys(v, f)).collect()),
        other => other.clone(),
    }
}

/// Shorten every object key in `value`, recursively.
pub fn shorten(value: &Value) -> Value {
    map_keys(value, shorten_key)
}

/// Inverse of [`shorten`].
pub fn expand(value: &Value) -> Value {
    map_keys(value, expand_key)
}
