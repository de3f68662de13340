//! Patch application over `serde_json::Value`.

use serde_json::{Map, Value};
use vmfleet_reconcile::{PatchOp, StoreError};

/// Apply an RFC 7386 merge patch in place.
pub fn apply_merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                apply_merge(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn split_pointer(path: &str) -> Result<(String, String), StoreError> {
    let idx = path
        .rfind('/')
        .ok_or_else(|| StoreError::Invalid(format!("bad json pointer {path:?}")))?;
    Ok((path[..idx].to_string(), unescape(&path[idx + 1..])))
}

fn parent_mut<'a>(doc: &'a mut Value, parent: &str) -> Result<&'a mut Value, StoreError> {
    doc.pointer_mut(parent)
        .ok_or_else(|| StoreError::Invalid(format!("path {parent:?} does not exist")))
}

fn set(doc: &mut Value, path: &str, value: Value, must_exist: bool) -> Result<(), StoreError> {
    let (parent, last) = split_pointer(path)?;
    match parent_mut(doc, &parent)? {
        Value::Object(map) => {
            if must_exist && !map.contains_key(&last) {
                return Err(StoreError::Invalid(format!("path {path:?} does not exist")));
            }
            map.insert(last, value);
            Ok(())
        }
        Value::Array(items) => {
            if last == "-" && !must_exist {
                items.push(value);
                return Ok(());
            }
            let idx: usize = last
                .parse()
                .map_err(|_| StoreError::Invalid(format!("bad array index in {path:?}")))?;
            if must_exist {
                let slot = items
                    .get_mut(idx)
                    .ok_or_else(|| StoreError::Invalid(format!("path {path:?} does not exist")))?;
                *slot = value;
            } else if idx <= items.len() {
                items.insert(idx, value);
            } else {
                return Err(StoreError::Invalid(format!("index out of range in {path:?}")));
            }
            Ok(())
        }
        _ => Err(StoreError::Invalid(format!("parent of {path:?} is not a container"))),
    }
}

fn remove(doc: &mut Value, path: &str) -> Result<(), StoreError> {
    let (parent, last) = split_pointer(path)?;
    let removed = match parent_mut(doc, &parent)? {
        Value::Object(map) => map.remove(&last).is_some(),
        Value::Array(items) => match last.parse::<usize>() {
            Ok(idx) if idx < items.len() => {
                items.remove(idx);
                true
            }
            _ => false,
        },
        _ => false,
    };
    if removed {
        Ok(())
    } else {
        Err(StoreError::Invalid(format!("path {path:?} does not exist")))
    }
}

/// Apply RFC 6902 operations atomically: on any failure `target` is untouched.
///
/// A `test` against a missing path compares with `null`. A failed `test`
/// is reported as a conflict.
pub fn apply_json(target: &mut Value, ops: &[PatchOp]) -> Result<(), StoreError> {
    let mut doc = target.clone();
    for op in ops {
        match op {
            PatchOp::Test { path, value } => {
                let current = doc.pointer(path).cloned().unwrap_or(Value::Null);
                if &current != value {
                    return Err(StoreError::Conflict(format!(
                        "test operation on {path:?} failed: found {current}, expected {value}"
                    )));
                }
            }
            PatchOp::Replace { path, value } => set(&mut doc, path, value.clone(), true)?,
            PatchOp::Add { path, value } => set(&mut doc, path, value.clone(), false)?,
            PatchOp::Remove { path } => remove(&mut doc, path)?,
        }
    }
    *target = doc;
    Ok(())
}
