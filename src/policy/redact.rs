//! Field-level redaction over JSON content.

use serde_json::Value;

/// Replacement for masked values.
pub const MASK: &str = "***";

/// Replace the value at `path` with [`MASK`]. Returns whether a value was masked.
pub fn mask_path(content: &mut Value, path: &str) -> bool {
    match lookup_mut(content, path) {
        Some(slot) => {
            *slot = Value::String(MASK.to_string());
            true
        }
        None => false,
    }
}

/// Remove the value at `path`. Returns whether a value was removed.
pub fn drop_path(content: &mut Value, path: &str) -> bool {
    let (parent_path, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (Some(parent), leaf),
        None => (None, path),
    };
    let parent = match parent_path {
        Some(parent) => lookup_mut(content, parent),
        None => Some(content),
    };
    match parent {
        Some(Value::Object(map)) => map.remove(leaf).is_some(),
        Some(Value::Array(items)) => match leaf.parse::<usize>() {
            Ok(idx) if idx < items.len() => {
                items.remove(idx);
                true
            }
            _ => false,
        },
        _ => false,
    }
}

fn lookup_mut<'a>(document: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(document, |current, segment| match current {
            Value::Object(map) => map.get_mut(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
            _ => None,
        })
}
