//! Payload extension engine.
//!
//! Provider manifests may declare typed injection points that move
//! pass-through settings from the extras partition into the compat-built
//! payload. Each extension consumes exactly one extras key; whatever
//! remains in extras flows on to the compat's own
//! `apply_provider_extensions`.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{CoordResult, CoordinatorError};
use crate::registry::{ExtensionValueType, MergeStrategy, PayloadExtension};
use crate::settings::merge_objects;

/// Apply `extensions` to `payload`, consuming keys from `extras`.
///
/// Per extension: the extras value is used when present, else the declared
/// default; a `required` extension with neither fails the call. Values are
/// validated against the declared type. Object defaults are deep-merged
/// under the supplied value before injection.
pub fn apply_extensions(
    payload: &mut Value,
    extensions: &[PayloadExtension],
    extras: &mut BTreeMap<String, Value>,
) -> CoordResult<()> {
    for extension in extensions {
        let supplied = extras.remove(&extension.settings_key);
        let value = match (supplied, &extension.default) {
            (Some(supplied), Some(default)) => merged_with_default(supplied, default),
            (Some(supplied), None) => supplied,
            (None, Some(default)) => default.clone(),
            (None, None) => {
                if extension.required {
                    return Err(CoordinatorError::validation(format!(
                        "required setting {} (extension {}) is missing",
                        extension.settings_key, extension.name
                    )));
                }
                continue;
            }
        };

        check_type(&value, extension)?;
        inject(payload, &extension.target_path, value, extension.merge_strategy);
    }
    Ok(())
}

/// Deep-merge a supplied object onto an object default; any other shape
/// keeps the supplied value as-is.
fn merged_with_default(supplied: Value, default: &Value) -> Value {
    match (default, supplied) {
        (Value::Object(default_map), Value::Object(supplied_map)) => {
            let mut merged = default_map.clone();
            merge_objects(&mut merged, &supplied_map);
            Value::Object(merged)
        }
        (_, supplied) => supplied,
    }
}

fn check_type(value: &Value, extension: &PayloadExtension) -> CoordResult<()> {
    let ok = match extension.value_type {
        ExtensionValueType::Object => value.is_object(),
        ExtensionValueType::Array => value.is_array(),
        ExtensionValueType::String => value.is_string(),
        ExtensionValueType::Number => value.is_number(),
        ExtensionValueType::Boolean => value.is_boolean(),
        ExtensionValueType::Any => true,
    };
    if ok {
        Ok(())
    } else {
        Err(CoordinatorError::validation(format!(
            "setting {} (extension {}) must be of type {:?}",
            extension.settings_key, extension.name, extension.value_type
        )))
    }
}

/// Write `value` at `path` inside `payload`, creating intermediate objects.
fn inject(payload: &mut Value, path: &[String], value: Value, strategy: MergeStrategy) {
    if path.is_empty() {
        // Whole-payload target: only object-into-object merge makes sense.
        if let (Value::Object(base), Value::Object(incoming)) = (&mut *payload, &value) {
            if strategy == MergeStrategy::Merge {
                merge_objects(base, incoming);
                return;
            }
        }
        *payload = value;
        return;
    }

    let mut cursor = payload;
    for segment in &path[..path.len() - 1] {
        if !cursor.is_object() {
            *cursor = Value::Object(serde_json::Map::new());
        }
        cursor = cursor
            .as_object_mut()
            .expect("cursor coerced to object above")
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }

    if !cursor.is_object() {
        *cursor = Value::Object(serde_json::Map::new());
    }
    let map = cursor.as_object_mut().expect("cursor coerced to object above");
    let leaf = path.last().expect("path checked non-empty");

    match (map.get_mut(leaf), &value, strategy) {
        (Some(Value::Object(existing)), Value::Object(incoming), MergeStrategy::Merge) => {
            merge_objects(existing, incoming);
        }
        _ => {
            map.insert(leaf.clone(), value);
        }
    }
}
