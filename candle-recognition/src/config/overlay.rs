//! Layered experiment records.
//!
//! A record may name one or more parents under `_base_`. Parents are loaded first and the
//! record's own keys are deep-merged on top, so an experiment variant only has to spell out
//! the nested keys it changes:
//!
//! ```json
//! {
//!   "_base_": ["./i3d_nl_dot_product_r_tiny_32x2x1_100e_8xb8_kinetics400_rgb.json"],
//!   "model": {"backbone": {"non_local_cfg": {"mode": "embedded_gaussian"}}}
//! }
//! ```
//!
//! An object carrying `"_delete_": true` replaces its parent's object instead of merging
//! into it.

use crate::{Error, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

pub const BASE_KEY: &str = "_base_";
pub const DELETE_KEY: &str = "_delete_";

/// Loads a JSON record and resolves its `_base_` chain.
pub fn load(path: impl AsRef<Path>) -> Result<Value> {
    let mut stack = Vec::new();
    load_map(path.as_ref(), &mut stack).map(Value::Object)
}

fn load_map(path: &Path, stack: &mut Vec<PathBuf>) -> Result<Map<String, Value>> {
    let canonical = path.canonicalize()?;
    if stack.contains(&canonical) {
        return Err(Error::Config(format!(
            "cyclic {BASE_KEY} reference through {}",
            path.display()
        )));
    }
    let text = std::fs::read_to_string(&canonical)?;
    let mut own = match serde_json::from_str(&text)? {
        Value::Object(map) => map,
        _ => {
            return Err(Error::Config(format!(
                "{} does not hold a JSON object",
                path.display()
            )))
        }
    };

    let bases = match own.remove(BASE_KEY) {
        None => Vec::new(),
        Some(Value::String(base)) => vec![base],
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(base) => Ok(base),
                other => Err(Error::Config(format!(
                    "{BASE_KEY} entries must be paths, got {other}"
                ))),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(other) => {
            return Err(Error::Config(format!(
                "{BASE_KEY} must be a path or a list of paths, got {other}"
            )))
        }
    };
    if bases.is_empty() {
        return Ok(own);
    }

    stack.push(canonical.clone());
    let dir = canonical.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut merged = Map::new();
    for base in &bases {
        for (key, value) in load_map(&dir.join(base), stack)? {
            if merged.contains_key(&key) {
                return Err(Error::Config(format!(
                    "duplicate key \"{key}\" among the bases of {}",
                    path.display()
                )));
            }
            merged.insert(key, value);
        }
    }
    stack.pop();

    merge_maps(&mut merged, own);
    tracing::debug!(path = %path.display(), bases = bases.len(), "resolved config");
    Ok(merged)
}

/// Deep-merges `overlay` into `base`.
///
/// Objects merge key by key; any other overlay value replaces the base value.
pub fn merge(base: &mut Value, overlay: Value) {
    let mut overlay = match overlay {
        Value::Object(map) => map,
        other => {
            *base = strip_markers(other);
            return;
        }
    };
    let replace = matches!(overlay.remove(DELETE_KEY), Some(Value::Bool(true)));
    if !replace {
        if let Value::Object(base_map) = &mut *base {
            merge_maps(base_map, overlay);
            return;
        }
    }
    *base = strip_markers(Value::Object(overlay));
}

fn merge_maps(base: &mut Map<String, Value>, overlay: Map<String, Value>) {
    for (key, value) in overlay {
        match base.get_mut(&key) {
            Some(existing) => merge(existing, value),
            None => {
                base.insert(key, strip_markers(value));
            }
        }
    }
}

fn strip_markers(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| key != DELETE_KEY)
                .map(|(key, value)| (key, strip_markers(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_markers).collect()),
        other => other,
    }
}

/// Replaces the value at a dotted path such as `model.backbone.non_local_cfg.mode`,
/// creating intermediate objects on the way.
pub fn apply_override(cfg: &mut Value, path: &str, value: Value) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(Error::Config(format!("invalid override path \"{path}\"")));
    }
    let Some((last, parents)) = segments.split_last() else {
        return Err(Error::Config(format!("invalid override path \"{path}\"")));
    };

    let not_an_object =
        |key: &str| Error::Config(format!("cannot override \"{path}\": \"{key}\" is not an object"));
    let mut node = cfg;
    for key in parents {
        node = node
            .as_object_mut()
            .ok_or_else(|| not_an_object(key))?
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    node.as_object_mut()
        .ok_or_else(|| not_an_object(last))?
        .insert(last.to_string(), value);
    Ok(())
}

pub fn apply_overrides<I, K>(cfg: &mut Value, overrides: I) -> Result<()>
where
    I: IntoIterator<Item = (K, Value)>,
    K: AsRef<str>,
{
    for (path, value) in overrides {
        apply_override(cfg, path.as_ref(), value)?;
    }
    Ok(())
}

/// Parses a `key.path=value` command line override. The value is read as JSON and falls
/// back to a plain string, so `mode=dot_product` and `sub_sample=false` both work.
pub fn parse_override(arg: &str) -> Result<(String, Value)> {
    let (path, raw) = arg
        .split_once('=')
        .ok_or_else(|| Error::Config(format!("override \"{arg}\" is not of the form key=value")))?;
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((path.trim().to_string(), value))
}
