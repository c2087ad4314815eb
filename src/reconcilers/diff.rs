//! Field-level diff between two observed object states

use std::fmt;

use serde_json::Value;

use super::ACTION_LABEL;

/// Kind of change at a path
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffOp {
    Add,
    Change,
    Remove,
}

/// One changed field
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffEntry {
    pub op: DiffOp,
    pub path: Vec<String>,
}

impl DiffEntry {
    fn new(op: DiffOp, path: &[String]) -> Self {
        Self {
            op,
            path: path.to_vec(),
        }
    }
}

impl fmt::Display for DiffEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            DiffOp::Add => "add",
            DiffOp::Change => "change",
            DiffOp::Remove => "remove",
        };
        write!(f, "{} {}", op, self.path.join("."))
    }
}

/// Diff `old` against `new`; `Null` on either side counts as an empty object
pub fn compute(old: &Value, new: &Value) -> Vec<DiffEntry> {
    let empty = Value::Object(Default::default());
    let old = if old.is_null() { &empty } else { old };
    let new = if new.is_null() { &empty } else { new };

    let mut entries = Vec::new();
    walk(old, new, &mut Vec::new(), &mut entries);
    entries
}

fn walk(old: &Value, new: &Value, path: &mut Vec<String>, entries: &mut Vec<DiffEntry>) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for (key, old_value) in old_map {
                path.push(key.clone());
                match new_map.get(key) {
                    Some(new_value) => walk(old_value, new_value, path, entries),
                    None if !old_value.is_null() => entries.push(DiffEntry::new(DiffOp::Remove, path)),
                    None => {}
                }
                path.pop();
            }
            for (key, new_value) in new_map {
                if !old_map.contains_key(key) && !new_value.is_null() {
                    path.push(key.clone());
                    entries.push(DiffEntry::new(DiffOp::Add, path));
                    path.pop();
                }
            }
        }
        (Value::Null, value) if !value.is_null() => entries.push(DiffEntry::new(DiffOp::Add, path)),
        (value, Value::Null) if !value.is_null() => entries.push(DiffEntry::new(DiffOp::Remove, path)),
        (a, b) if a != b => entries.push(DiffEntry::new(DiffOp::Change, path)),
        _ => {}
    }
}

/// True when every change is the removal of the action label
pub fn only_action_label_removed(diff: &[DiffEntry]) -> bool {
    !diff.is_empty()
        && diff.iter().all(|entry| {
            entry.op == DiffOp::Remove
                && entry.path.len() == 3
                && entry.path[0] == "metadata"
                && entry.path[1] == "labels"
                && entry.path[2] == ACTION_LABEL
        })
}
