//! Structural JSON diff.
//!
//! Patches are JSON themselves so they travel in a normal JSON body:
//!
//! * `[0, value]` replace the whole node
//! * `[1, {key: patch, ..}, [removed, ..]]` edit object members
//! * `[2, new_len, [[index, patch], ..]]` truncate or extend an array to
//!   `new_len` and patch the listed indices; indices past the old length must
//!   carry a replace patch
//!
//! `apply_patch(old, &diff(old, new)) == new` for every pair of values.

use serde_json::{json, Map, Value};

use crate::error::{WireError, WireResult};

const OP_REPLACE: u64 = 0;
const OP_OBJECT: u64 = 1;
const OP_ARRAY: u64 = 2;

/// Patch turning `old` into `new`. Equal values produce a replace of `new`.
pub fn diff(old: &Value, new: &Value) -> Value {
    node_diff(old, new).unwrap_or_else(|| json!([OP_REPLACE, new]))
}

/// `None` when the nodes are equal.
fn node_diff(old: &Value, new: &Value) -> Option<Value> {
    if old == new {
        return None;
    }
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            let mut changed = Map::new();
            for (key, new_member) in b {
                match a.get(key) {
                    Some(old_member) => {
                        if let Some(p) = node_diff(old_member, new_member) {
                            changed.insert(key.clone(), p);
                        }
                    }
                    None => {
                        changed.insert(key.clone(), json!([OP_REPLACE, new_member]));
                    }
                }
            }
            let removed: Vec<&String> = a.keys().filter(|k| !b.contains_key(*k)).collect();
            Some(json!([OP_OBJECT, changed, removed]))
        }
        (Value::Array(a), Value::Array(b)) => {
            let edits: Vec<Value> = b
                .iter()
                .enumerate()
                .filter_map(|(i, item)| match a.get(i) {
                    Some(prev) => node_diff(prev, item).map(|p| json!([i, p])),
                    None => Some(json!([i, [OP_REPLACE, item]])),
                })
                .collect();
            Some(json!([OP_ARRAY, b.len(), edits]))
        }
        _ => Some(json!([OP_REPLACE, new])),
    }
}

fn invalid(msg: impl Into<String>) -> WireError {
    WireError::InvalidPatch(msg.into())
}

/// Apply a patch produced by [`diff`].
pub fn apply_patch(old: &Value, patch: &Value) -> WireResult<Value> {
    let mut target = old.clone();
    apply_in_place(&mut target, patch)?;
    Ok(target)
}

fn apply_in_place(target: &mut Value, patch: &Value) -> WireResult<()> {
    let parts = patch.as_array().ok_or_else(|| invalid("patch is not an array"))?;
    let op = parts
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| invalid("missing op code"))?;

    match op {
        OP_REPLACE => {
            *target = parts.get(1).cloned().ok_or_else(|| invalid("replace without value"))?;
        }
        OP_OBJECT => {
            let map = target
                .as_object_mut()
                .ok_or_else(|| invalid("object edit on non-object"))?;
            let changed = parts
                .get(1)
                .and_then(Value::as_object)
                .ok_or_else(|| invalid("object edit without members"))?;
            for (key, member_patch) in changed {
                let slot = map.entry(key.clone()).or_insert(Value::Null);
                apply_in_place(slot, member_patch)?;
            }
            if let Some(removed) = parts.get(2).and_then(Value::as_array) {
                for key in removed {
                    let key = key.as_str().ok_or_else(|| invalid("removed key is not a string"))?;
                    map.remove(key);
                }
            }
        }
        OP_ARRAY => {
            let items = target
                .as_array_mut()
                .ok_or_else(|| invalid("array edit on non-array"))?;
            let new_len = parts
                .get(1)
                .and_then(Value::as_u64)
                .ok_or_else(|| invalid("array edit without length"))? as usize;
            items.resize(new_len, Value::Null);
            let edits = parts
                .get(2)
                .and_then(Value::as_array)
                .ok_or_else(|| invalid("array edit without edits"))?;
            for edit in edits {
                let (index, item_patch) = match edit.as_array().map(Vec::as_slice) {
                    Some([index, item_patch]) => (index, item_patch),
                    _ => return Err(invalid("array edit entry is not a pair")),
                };
                let index = index
                    .as_u64()
                    .ok_or_else(|| invalid("array index is not a number"))? as usize;
                let slot = items
                    .get_mut(index)
                    .ok_or_else(|| invalid(format!("array index {} out of range", index)))?;
                apply_in_place(slot, item_patch)?;
            }
        }
        other => return Err(invalid(format!("unknown op code {}", other))),
    }
    Ok(())
}
