//! Whole-document and sequence transforms used by the store.

use std::cmp::Ordering;
use std::collections::HashSet;
use serde_json::Value;
use crate::engine::query::loose_eq;
use crate::{Document, Error, Result};

/// Expands nested mappings and sequences into dotted paths.
///
/// Sequence indices become path segments. Empty mappings and sequences have
/// no leaves and disappear, so the result cannot be folded back losslessly.
pub fn flatten(data: &Document) -> Document {
    let mut out = Document::new();
    for (key, value) in data {
        flatten_into(value, key.clone(), &mut out);
    }
    out
}

fn flatten_into(value: &Value, path: String, out: &mut Document) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(child, format!("{}.{}", path, key), out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                flatten_into(child, format!("{}.{}", path, i), out);
            }
        }
        leaf => {
            out.insert(path, leaf.clone());
        }
    }
}

/// Swaps keys and values.
///
/// Values must be scalars; their text form becomes the new key. Numbers are
/// keyed by numeric value, so `1` and `1.0` both become `"1"`, matching the
/// equality used by [`dedup_values`] and `doublecheck`. Old keys that are
/// canonical integers come back as numbers. Fails without producing anything
/// on a non-scalar value or on two values sharing a text form.
pub fn invert(data: &Document) -> Result<Document> {
    let mut out = Document::new();
    for (key, value) in data {
        let new_key = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => number_key(n),
            Value::Bool(b) => b.to_string(),
            Value::Null => "null".to_string(),
            Value::Array(_) | Value::Object(_) => return Err(Error::Unhashable(key.clone())),
        };
        if out.contains_key(&new_key) {
            return Err(Error::DuplicateValue(new_key));
        }
        out.insert(new_key, key_to_value(key));
    }
    Ok(out)
}

fn number_key(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => (f as i64).to_string(),
        _ => n.to_string(),
    }
}

fn key_to_value(key: &str) -> Value {
    match key.parse::<i64>() {
        Ok(n) if n.to_string() == key => Value::from(n),
        _ => Value::String(key.to_string()),
    }
}

/// Sorts a sequence ascending.
///
/// Only homogeneous sequences of numbers, strings or booleans have an order;
/// anything else is rejected and `items` is left as it was.
pub fn sort_values(items: &mut [Value], key: &str) -> Result<()> {
    let all = |pred: fn(&Value) -> bool| items.iter().all(pred);
    let cmp: fn(&Value, &Value) -> Ordering = if all(Value::is_number) {
        |a, b| {
            let (a, b) = (a.as_f64().unwrap_or_default(), b.as_f64().unwrap_or_default());
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
    } else if all(Value::is_string) {
        |a, b| a.as_str().cmp(&b.as_str())
    } else if all(Value::is_boolean) {
        |a, b| a.as_bool().cmp(&b.as_bool())
    } else {
        return Err(Error::Unorderable(key.to_string()));
    };
    items.sort_by(cmp);
    Ok(())
}

/// Drops repeated values, keeping the first occurrence.
pub fn dedup_values(items: Vec<Value>) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut out: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        let fresh = match &item {
            Value::String(s) => seen.insert(s.clone()),
            _ => !out.iter().any(|kept| loose_eq(kept, &item)),
        };
        if fresh {
            out.push(item);
        }
    }
    out
}

/// Removes every value found in `remove`, then collapses duplicates.
pub fn difference(items: Vec<Value>, remove: &[Value]) -> Vec<Value> {
    let kept = items
        .into_iter()
        .filter(|item| !remove.iter().any(|r| loose_eq(r, item)))
        .collect();
    dedup_values(kept)
}
