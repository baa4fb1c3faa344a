//! JSON patches (RFC 6902 `add`, `remove`, `replace`).
//!
//! Patches describe how an instance changed. A create carries a single `add`
//! at the root, a save carries the structural difference between the stored
//! and the new instance.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    /// Insert or overwrite the value at `path`.
    Add {
        /// JSON pointer.
        path: String,
        /// New value.
        value: Value,
    },
    /// Remove the value at `path`.
    Remove {
        /// JSON pointer.
        path: String,
    },
    /// Overwrite an existing value at `path`.
    Replace {
        /// JSON pointer.
        path: String,
        /// New value.
        value: Value,
    },
}

impl PatchOp {
    /// Returns the JSON pointer this op targets.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. } | PatchOp::Remove { path } | PatchOp::Replace { path, .. } => {
                path
            }
        }
    }
}

/// An ordered list of patch operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(Vec<PatchOp>);

impl Patch {
    /// Creates a patch from operations.
    #[must_use]
    pub fn new(ops: Vec<PatchOp>) -> Self {
        Self(ops)
    }

    /// Creates a patch that sets the whole document to `value`.
    #[must_use]
    pub fn root(value: Value) -> Self {
        Self(vec![PatchOp::Add {
            path: String::new(),
            value,
        }])
    }

    /// Computes the patch that turns `old` into `new`.
    ///
    /// Objects are compared key by key; arrays and scalars are replaced
    /// whole when they differ.
    #[must_use]
    pub fn diff(old: &Value, new: &Value) -> Self {
        let mut ops = Vec::new();
        diff_into(old, new, String::new(), &mut ops);
        Self(ops)
    }

    /// Returns the operations.
    #[must_use]
    pub fn ops(&self) -> &[PatchOp] {
        &self.0
    }

    /// Returns true if the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Applies the patch to `target` in place.
    ///
    /// On error `target` may be partially patched; callers apply to a copy.
    pub fn apply(&self, target: &mut Value) -> CoreResult<()> {
        for op in &self.0 {
            apply_op(target, op)?;
        }
        Ok(())
    }

    /// Applies the patch to a copy of `target`.
    pub fn applied(&self, target: &Value) -> CoreResult<Value> {
        let mut out = target.clone();
        self.apply(&mut out)?;
        Ok(out)
    }
}

fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn diff_into(old: &Value, new: &Value, path: String, ops: &mut Vec<PatchOp>) {
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            for key in a.keys().filter(|k| !b.contains_key(*k)) {
                ops.push(PatchOp::Remove {
                    path: format!("{path}/{}", escape(key)),
                });
            }
            for (key, value) in b {
                let child = format!("{path}/{}", escape(key));
                match a.get(key) {
                    None => ops.push(PatchOp::Add {
                        path: child,
                        value: value.clone(),
                    }),
                    Some(previous) => diff_into(previous, value, child, ops),
                }
            }
        }
        _ if old != new => ops.push(PatchOp::Replace {
            path,
            value: new.clone(),
        }),
        _ => {}
    }
}

fn parse_pointer(path: &str) -> CoreResult<Vec<String>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| CoreError::invalid_patch(format!("pointer must start with '/': {path}")))?;
    Ok(rest.split('/').map(unescape).collect())
}

fn array_index(token: &str, len: usize, allow_end: bool) -> CoreResult<usize> {
    if allow_end && token == "-" {
        return Ok(len);
    }
    let index: usize = token
        .parse()
        .map_err(|_| CoreError::invalid_patch(format!("invalid array index: {token}")))?;
    let bound = if allow_end { len } else { len.saturating_sub(1) };
    if index > bound || (!allow_end && len == 0) {
        return Err(CoreError::invalid_patch(format!(
            "array index {index} out of bounds"
        )));
    }
    Ok(index)
}

fn apply_op(target: &mut Value, op: &PatchOp) -> CoreResult<()> {
    let tokens = parse_pointer(op.path())?;
    let Some((last, parents)) = tokens.split_last() else {
        *target = match op {
            PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => value.clone(),
            PatchOp::Remove { .. } => Value::Null,
        };
        return Ok(());
    };

    let mut parent = target;
    for token in parents {
        parent = match parent {
            Value::Object(map) => map.get_mut(token),
            Value::Array(items) => {
                let index = array_index(token, items.len(), false)?;
                items.get_mut(index)
            }
            _ => None,
        }
        .ok_or_else(|| CoreError::invalid_patch(format!("path not found: {}", op.path())))?;
    }

    match parent {
        Value::Object(map) => apply_to_object(map, last, op),
        Value::Array(items) => {
            let allow_end = matches!(op, PatchOp::Add { .. });
            let index = array_index(last, items.len(), allow_end)?;
            match op {
                PatchOp::Add { value, .. } => items.insert(index, value.clone()),
                PatchOp::Replace { value, .. } => items[index] = value.clone(),
                PatchOp::Remove { .. } => {
                    items.remove(index);
                }
            }
            Ok(())
        }
        _ => Err(CoreError::invalid_patch(format!(
            "cannot index into scalar at {}",
            op.path()
        ))),
    }
}

fn apply_to_object(map: &mut Map<String, Value>, key: &str, op: &PatchOp) -> CoreResult<()> {
    match op {
        PatchOp::Add { value, .. } => {
            map.insert(key.to_owned(), value.clone());
        }
        PatchOp::Replace { value, .. } => {
            let slot = map
                .get_mut(key)
                .ok_or_else(|| CoreError::invalid_patch(format!("path not found: {}", op.path())))?;
            *slot = value.clone();
        }
        PatchOp::Remove { .. } => {
            map.remove(key)
                .ok_or_else(|| CoreError::invalid_patch(format!("path not found: {}", op.path())))?;
        }
    }
    Ok(())
}
