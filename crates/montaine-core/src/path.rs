//! Dot-notation paths over JSON trees.
//!
//! A path is a `.`-separated list of segments. Numeric segments index
//! arrays, every other segment is an object key. The empty path names the
//! root.
//!
//! | Function | Purpose |
//! |----------|---------|
//! | [`deep_keys`] | Enumerate every scalar leaf path |
//! | [`get_path`] / [`get_path_mut`] | Resolve a path |
//! | [`set_path`] | Write a value, creating missing intermediates |
//! | [`rewrite_path`] | Re-address a schema template at another array index |

use serde_json::{Map, Value};

use crate::schema::SchemaNode;

/// Append `segment` to `prefix`.
pub fn join(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{}.{}", prefix, segment)
    }
}

/// Every scalar leaf path of `value`, in document order.
///
/// Arrays are traversed by index. Empty objects and arrays hold no leaves and
/// contribute nothing. A scalar root yields the empty path.
pub fn deep_keys(value: &Value) -> Vec<String> {
    let mut keys = Vec::new();
    collect_keys(value, "", &mut keys);
    keys
}

fn collect_keys(value: &Value, prefix: &str, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                collect_keys(child, &join(prefix, key), out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                collect_keys(child, &join(prefix, &i.to_string()), out);
            }
        }
        _ => out.push(prefix.to_string()),
    }
}

/// Resolve `path` inside `value`.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Mutable variant of [`get_path`].
pub fn get_path_mut<'a>(value: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |node, segment| match node {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(move |i| items.get_mut(i)),
        _ => None,
    })
}

/// Write `new_value` at `path`, creating missing intermediates.
///
/// Missing intermediates are always created as objects, even when the next
/// segment is numeric. A numeric segment only indexes a node that is already
/// an array (padding it with nulls). Scalars in the way are replaced.
pub fn set_path(root: &mut Value, path: &str, new_value: Value) {
    if path.is_empty() {
        *root = new_value;
        return;
    }
    let mut node = root;
    for segment in path.split('.') {
        node = child_mut(node, segment);
    }
    *node = new_value;
}

fn child_mut<'a>(node: &'a mut Value, segment: &str) -> &'a mut Value {
    let index = match (&*node, segment.parse::<usize>()) {
        (Value::Array(_), Ok(i)) => Some(i),
        _ => None,
    };
    if index.is_none() && !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Array(items) => {
            let i = index.unwrap_or_default();
            if items.len() <= i {
                items.resize(i + 1, Value::Null);
            }
            &mut items[i]
        }
        Value::Object(map) => map.entry(segment).or_insert(Value::Null),
        _ => unreachable!("node was normalized to an object or array"),
    }
}

/// Replace the leading segments `old` with `new` in a single path.
///
/// Matching is segment-exact: `items.1` is a prefix of `items.1.price` but
/// not of `items.10.price`.
pub fn rewrite_segment(path: &str, old: &str, new: &str) -> String {
    if path == old {
        return new.to_string();
    }
    match path.strip_prefix(old) {
        Some(rest) if rest.starts_with('.') => format!("{}{}", new, rest),
        _ => path.to_string(),
    }
}

/// Copy a schema subtree, re-addressing every path leaf from `old` to `new`.
///
/// Used to replicate a one-element array template: the template is written
/// against `data.items.0`, and element `i` is mapped with
/// `rewrite_path(template, "data.items.0", "data.items.i")`.
pub fn rewrite_path(template: &SchemaNode, old: &str, new: &str) -> SchemaNode {
    match template {
        SchemaNode::Path(path) => SchemaNode::Path(rewrite_segment(path, old, new)),
        SchemaNode::Call(call) => SchemaNode::Call(call.clone()),
        SchemaNode::Object(fields) => SchemaNode::Object(
            fields
                .iter()
                .map(|(key, child)| (key.clone(), rewrite_path(child, old, new)))
                .collect(),
        ),
        SchemaNode::ArrayTemplate(inner) => {
            SchemaNode::ArrayTemplate(Box::new(rewrite_path(inner, old, new)))
        }
    }
}
