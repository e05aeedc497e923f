//! Dotted-path access into nested property trees (`nats.port`).

use serde_json::{Map, Value};

use stratus_core::Properties;

pub fn lookup<'a>(tree: &'a Properties, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = tree.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Insert `value` at `path`, creating intermediate objects. A non-object
/// value in the way is replaced.
pub fn insert(tree: &mut Properties, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(last) = segments.pop() else { return };

    let mut current = tree;
    for segment in segments {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else { return };
        current = next;
    }
    current.insert(last.to_string(), value);
}
