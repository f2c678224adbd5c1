//! Dotted field-path resolution.
//!
//! `"a.b.c"` traverses nested documents; a missing key (or traversing
//! through a non-document) yields `Value::Null`. Traversing through an
//! array maps the remaining path over each element, matching the
//! MongoDB behavior `$unwind`-free pipelines rely on for array-of-document
//! fields.

use super::Value;

pub fn get_path(root: &Value, path: &str) -> Value {
    if path.is_empty() {
        return root.clone();
    }
    let mut segments = path.split('.');
    let first = segments.next().unwrap_or("");
    let rest: Vec<&str> = segments.collect();
    resolve_segment(root, first, &rest)
}

fn resolve_segment(current: &Value, segment: &str, rest: &[&str]) -> Value {
    let next_value = match current {
        Value::Document(doc) => doc.get(segment).cloned().unwrap_or(Value::Null),
        Value::Array(items) => {
            // Project this segment over every element; arrays of documents
            // resolve field access elementwise.
            let mapped: Vec<Value> = items
                .iter()
                .map(|item| resolve_segment(item, segment, rest))
                .collect();
            return Value::Array(mapped);
        }
        _ => Value::Null,
    };
    if rest.is_empty() {
        next_value
    } else {
        let (next_seg, next_rest) = (rest[0], &rest[1..]);
        resolve_segment(&next_value, next_seg, next_rest)
    }
}

/// Set a value at a dotted path within a document, creating intermediate
/// documents as needed. Used by object-shape projection when a key like
/// `"a.b"` fans a computed value out into a nested result document.
pub fn set_path(doc: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    set_segments(doc, &segments, value);
}

fn set_segments(doc: &mut Value, segments: &[&str], value: Value) {
    if segments.is_empty() {
        return;
    }
    if !matches!(doc, Value::Document(_)) {
        *doc = Value::Document(Default::default());
    }
    let Value::Document(map) = doc else {
        unreachable!()
    };
    if segments.len() == 1 {
        map.insert(segments[0].to_string(), value);
        return;
    }
    let entry = map
        .entry(segments[0].to_string())
        .or_insert_with(|| Value::Document(Default::default()));
    set_segments(entry, &segments[1..], value);
}
