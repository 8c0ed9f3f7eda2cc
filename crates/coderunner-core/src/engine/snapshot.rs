//! Snapshot of the top-level bindings a submission leaves behind.

use rhai::{Array, Blob, Dynamic, Map, Scope};
use std::collections::HashSet;

use crate::types::{VariableInfo, VariableMap};

pub const DEFAULT_MAX_VARIABLES: usize = 50;
pub const DEFAULT_PREVIEW_LEN: usize = 100;

/// Names the engine injects into the scope itself.
pub const PLUMBING_NAMES: &[&str] = &["sandbox"];

const RESERVED_PREFIX: &str = "__";

pub fn is_reserved(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX) || PLUMBING_NAMES.contains(&name)
}

/// Collects up to `max_variables` bindings in declaration order. A shadowed
/// name is reported once, with its latest value.
pub fn snapshot_scope(scope: &Scope, max_variables: usize, preview_len: usize) -> VariableMap {
    let mut seen = HashSet::new();
    let mut variables = VariableMap::new();

    for (name, _, _) in scope.iter() {
        if variables.len() >= max_variables {
            break;
        }
        if is_reserved(name) || !seen.insert(name.to_string()) {
            continue;
        }
        if let Some(value) = scope.get(name) {
            variables.insert(name.to_string(), describe(value, preview_len));
        }
    }
    variables
}

pub fn describe(value: &Dynamic, preview_len: usize) -> VariableInfo {
    let type_name = friendly_type_name(value);
    VariableInfo {
        value_preview: preview(value, &type_name, preview_len),
        shape: shape_of(value),
        type_name,
    }
}

fn friendly_type_name(value: &Dynamic) -> String {
    match value.type_name() {
        "i64" | "i32" => "int",
        "f64" | "f32" => "float",
        "string" | "ImmutableString" => "string",
        "()" => "unit",
        "Fn" => "function",
        other => other,
    }
    .to_string()
}

fn preview(value: &Dynamic, type_name: &str, preview_len: usize) -> String {
    if value.is_unit() {
        return "()".to_string();
    }
    if value.is_int() || value.is_float() || value.is_bool() || value.is_char() {
        return value.to_string();
    }
    if value.is_string() {
        let text = value.to_string();
        if text.chars().count() > preview_len {
            return format!("{}...", text.chars().take(preview_len).collect::<String>());
        }
        return text;
    }
    format!("<{} object>", type_name)
}

/// Dimensions of an array-like value.
///
/// Rectangular nested arrays report every dimension, ragged arrays only their
/// length, blobs their byte length. An object map exposing a `shape` member
/// made of non-negative integers reports that member.
pub fn shape_of(value: &Dynamic) -> Option<Vec<i64>> {
    if let Some(array) = value.read_lock::<Array>() {
        return Some(array_shape(&array));
    }
    if let Some(blob) = value.read_lock::<Blob>() {
        return Some(vec![blob.len() as i64]);
    }
    if let Some(map) = value.read_lock::<Map>() {
        return map.get("shape").and_then(int_list);
    }
    None
}

fn array_shape(array: &Array) -> Vec<i64> {
    let mut dims = vec![array.len() as i64];

    let inner: Option<Vec<Vec<i64>>> = array
        .iter()
        .map(|item| item.read_lock::<Array>().map(|nested| array_shape(&nested)))
        .collect();
    if let Some(inner) = inner {
        if let Some(first) = inner.first() {
            if inner.iter().all(|other| other == first) {
                dims.extend(first);
            }
        }
    }
    dims
}

fn int_list(value: &Dynamic) -> Option<Vec<i64>> {
    let array = value.read_lock::<Array>()?;
    let dims = array
        .iter()
        .map(|item| item.as_int().ok().filter(|n| *n >= 0))
        .collect();
    dims
}
