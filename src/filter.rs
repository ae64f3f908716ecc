//! Filter a module's output with declarative regex rules.
//!
//! The filter config is a JSON object mapping result keys to rules:
//!
//! ```json
//! {
//!     "files": {
//!         "action": "exclude",
//!         "data": ["/var/log/", "/var/cache/"],
//!         "keys": ["added", "removed", "modified"]
//!     }
//! }
//! ```
//!
//! A rule either applies to a list directly or, with `keys`, recurses into
//! the named sub-keys of an object. Filtering is deliberately forgiving: a
//! malformed rule or a type mismatch logs an error and leaves the value
//! untouched, so a bad config never drops diff data.

use anyhow::{Context, Result};
use log::{error, info, warn};
use regex::Regex;
use serde_json::Value;
use std::fs;
use std::path::Path;

/// The config shipped in the binary, used when `-f` is given without a path.
pub fn default_config() -> Value {
    serde_json::from_str(include_str!("default_filter.json"))
        .expect("embedded default filter config is valid JSON")
}

/// Load a filter config from disk.
pub fn load_config(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read filter config {:?}", path))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse filter config {:?}", path))
}

/// Apply every rule in `config` whose key exists in `result`.
pub fn apply_config(result: &mut serde_json::Map<String, Value>, config: &Value) {
    let rules = match config.as_object() {
        Some(rules) => rules,
        None => {
            error!("Filter: config is not a JSON object");
            return;
        }
    };
    for (key, rule) in rules {
        if let Some(value) = result.get_mut(key) {
            info!("Filtering '{}' key in output", key);
            let filtered = filter_output(value.take(), rule);
            *value = filtered;
        }
    }
}

/// Filter one module value with one rule. On any validation failure the
/// value is returned unchanged.
pub fn filter_output(data: Value, options: &Value) -> Value {
    let action = match options.get("action").and_then(Value::as_str) {
        Some(action @ ("include" | "exclude")) => action,
        _ => {
            error!("Filter: wrong or missing \"action\" key in filter options");
            return data;
        }
    };

    let patterns: Vec<&str> = match options.get("data").and_then(Value::as_array) {
        Some(list) if !list.is_empty() => {
            match list.iter().map(Value::as_str).collect::<Option<Vec<_>>>() {
                Some(patterns) => patterns,
                None => {
                    error!("Filter: \"data\" filter option must be a list of strings");
                    return data;
                }
            }
        }
        _ => {
            error!("Filter: wrong or missing \"data\" key in filter options");
            return data;
        }
    };

    let pattern = match Regex::new(&patterns.join("|")) {
        Ok(pattern) => pattern,
        Err(err) => {
            error!("Filter: invalid regular expression: {}", err);
            return data;
        }
    };

    match options.get("keys").and_then(Value::as_array) {
        Some(keys) => {
            let mut map = match data {
                Value::Object(map) => map,
                other => {
                    error!("Filter: \"keys\" filter option specified but filtered data is not an object");
                    return other;
                }
            };
            for key in keys.iter().filter_map(Value::as_str) {
                match map.get_mut(key) {
                    Some(value) => {
                        let filtered = filter_list(value.take(), action, &pattern);
                        *value = filtered;
                    }
                    None => {
                        warn!("Filter: in filtered data there is no key {}", key);
                        continue;
                    }
                }
            }
            Value::Object(map)
        }
        None => filter_list(data, action, &pattern),
    }
}

fn filter_list(data: Value, action: &str, pattern: &Regex) -> Value {
    let items = match data {
        Value::Array(items) => items,
        other => {
            error!("Filter: output of the module is not a list");
            return other;
        }
    };

    let keep = |item: &Value| {
        let matched = pattern.is_match(&item_repr(item));
        match action {
            "include" => matched,
            _ => !matched,
        }
    };

    Value::Array(items.into_iter().filter(keep).collect())
}

/// The string a filter regex is tested against: bare contents for JSON
/// strings, compact JSON encoding for everything else.
fn item_repr(item: &Value) -> String {
    match item {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
