//! JSON-Patch shaped structural diffs.
//!
//! [`diff`] walks two JSON documents and emits the operations that turn the
//! first into the second. Object keys are visited in sorted order and arrays
//! of equal length are compared element-wise, so the same pair of documents
//! always produces the same patch. Arrays whose length changed are replaced
//! whole.
//!
//! [`apply`] works on a copy and returns it only if every operation
//! succeeded; a failing operation leaves the caller's document untouched.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Add,
    Replace,
    Remove,
}

/// One structural edit addressed by a JSON pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub op: OpKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Operation {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: OpKind::Add,
            path: path.into(),
            value: Some(value),
        }
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: OpKind::Replace,
            path: path.into(),
            value: Some(value),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: OpKind::Remove,
            path: path.into(),
            value: None,
        }
    }
}

/// Ordered list of operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(pub Vec<Operation>);

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.0.iter()
    }
}

impl From<Vec<Operation>> for Patch {
    fn from(ops: Vec<Operation>) -> Self {
        Patch(ops)
    }
}

/// Operations turning `before` into `after`.
pub fn diff(before: &Value, after: &Value) -> Patch {
    let mut ops = Vec::new();
    diff_into("", before, after, &mut ops);
    Patch(ops)
}

fn diff_into(path: &str, before: &Value, after: &Value, ops: &mut Vec<Operation>) {
    if before == after {
        return;
    }
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
            for key in keys {
                let child = format!("{}/{}", path, escape(key));
                match (old.get(key), new.get(key)) {
                    (Some(a), Some(b)) => diff_into(&child, a, b, ops),
                    (Some(_), None) => ops.push(Operation::remove(child)),
                    (None, Some(b)) => ops.push(Operation::add(child, b.clone())),
                    (None, None) => {}
                }
            }
        }
        (Value::Array(old), Value::Array(new)) if old.len() == new.len() => {
            for (i, (a, b)) in old.iter().zip(new.iter()).enumerate() {
                diff_into(&format!("{}/{}", path, i), a, b, ops);
            }
        }
        _ => ops.push(Operation::replace(path, after.clone())),
    }
}

/// Apply `patch` to a copy of `doc`.
pub fn apply(doc: &Value, patch: &Patch) -> Result<Value, PatchError> {
    let mut working = doc.clone();
    for op in patch.iter() {
        apply_op(&mut working, op)?;
    }
    Ok(working)
}

fn apply_op(doc: &mut Value, op: &Operation) -> Result<(), PatchError> {
    let tokens = parse_pointer(&op.path)?;
    let value = || {
        op.value
            .clone()
            .ok_or_else(|| PatchError::MissingValue(op.path.clone()))
    };

    let Some((last, parents)) = tokens.split_last() else {
        return match op.op {
            OpKind::Remove => Err(PatchError::RemoveRoot),
            OpKind::Add | OpKind::Replace => {
                *doc = value()?;
                Ok(())
            }
        };
    };

    let not_found = || PatchError::PathNotFound(op.path.clone());
    match resolve_mut(doc, parents, &op.path)? {
        Value::Object(map) => match op.op {
            OpKind::Add => {
                map.insert(last.clone(), value()?);
            }
            OpKind::Replace => {
                let slot = map.get_mut(last.as_str()).ok_or_else(not_found)?;
                *slot = value()?;
            }
            OpKind::Remove => {
                map.remove(last.as_str()).ok_or_else(not_found)?;
            }
        },
        Value::Array(items) => {
            let len = items.len();
            let index = if op.op == OpKind::Add && last == "-" {
                len
            } else {
                parse_index(last).ok_or_else(not_found)?
            };
            let out_of_bounds = PatchError::IndexOutOfBounds {
                path: op.path.clone(),
                index,
            };
            match op.op {
                OpKind::Add if index <= len => items.insert(index, value()?),
                OpKind::Replace if index < len => items[index] = value()?,
                OpKind::Remove if index < len => {
                    items.remove(index);
                }
                _ => return Err(out_of_bounds),
            }
        }
        _ => return Err(PatchError::NotAContainer(op.path.clone())),
    }
    Ok(())
}

fn resolve_mut<'a>(doc: &'a mut Value, tokens: &[String], path: &str) -> Result<&'a mut Value, PatchError> {
    let mut current = doc;
    for token in tokens {
        current = match current {
            Value::Object(map) => map
                .get_mut(token.as_str())
                .ok_or_else(|| PatchError::PathNotFound(path.to_string()))?,
            Value::Array(items) => parse_index(token)
                .and_then(|i| items.get_mut(i))
                .ok_or_else(|| PatchError::PathNotFound(path.to_string()))?,
            _ => return Err(PatchError::NotAContainer(path.to_string())),
        };
    }
    Ok(current)
}

fn parse_pointer(path: &str) -> Result<Vec<String>, PatchError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| PatchError::InvalidPointer(path.to_string()))?;
    Ok(rest.split('/').map(unescape).collect())
}

fn parse_index(token: &str) -> Option<usize> {
    // No signs or leading zeros, per RFC 6901.
    if token.is_empty() || (token.len() > 1 && token.starts_with('0')) {
        return None;
    }
    if !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

fn escape(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}
