//! Diff of the engine's image metadata.
//!
//! The inspect dump is opaque JSON; comparing two of them directly produces
//! an unreadable blob. Instead both are flattened with [`expand`] into
//! `path = value` lines and the line lists are diffed with zero context.

use anyhow::Result;
use log::info;
use serde_json::Value;

use crate::diffutil;
use crate::extractor::ExtractedImage;
use crate::modules::{Context, DiffModule, ModuleResult};

pub struct Metadata;

impl DiffModule for Metadata {
    fn name(&self) -> &'static str {
        "metadata"
    }

    /// Adds the `metadata` key: the changed lines between the flattened
    /// inspect dumps of the two images.
    fn run(
        &self,
        image1: &ExtractedImage,
        image2: &ExtractedImage,
        ctx: &Context<'_>,
    ) -> Result<ModuleResult> {
        info!("Testing metadata of the image");

        let inspect1 = ctx.engine.inspect(&image1.id)?;
        let inspect2 = ctx.engine.inspect(&image2.id)?;

        let expanded1 = expand(&inspect1, "");
        let expanded2 = expand(&inspect2, "");
        let diff = diffutil::changed_lines(&expanded1, &expanded2);

        let mut result = ModuleResult::new();
        result.insert("metadata".to_string(), diff.into());
        Ok(result)
    }
}

/// Flatten a JSON value into `"<colon-joined-path> = <value>"` lines.
///
/// Object keys extend the path; list elements repeat the path without an
/// index, so `{"a": [1, 2]}` becomes `["a = 1", "a = 2"]`.
pub fn expand(data: &Value, path: &str) -> Vec<String> {
    match data {
        Value::Array(items) => items.iter().flat_map(|item| expand(item, path)).collect(),
        Value::Object(map) => map
            .iter()
            .flat_map(|(key, value)| expand(value, &format!("{}{}:", path, key)))
            .collect(),
        leaf => {
            let label = path.strip_suffix(':').unwrap_or(path);
            vec![format!("{} = {}", label, scalar_repr(leaf))]
        }
    }
}

fn scalar_repr(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expand_flattens_nested_objects_and_lists() {
        let value = json!({"a": 1, "b": {"c": [2, 3]}});
        assert_eq!(expand(&value, ""), vec!["a = 1", "b:c = 2", "b:c = 3"]);
    }

    #[test]
    fn expand_renders_scalars() {
        let value = json!({"s": "x=1", "t": true, "n": null});
        let lines = expand(&value, "");
        assert!(lines.contains(&"s = x=1".to_string()));
        assert!(lines.contains(&"t = true".to_string()));
        assert!(lines.contains(&"n = null".to_string()));
    }

    #[test]
    fn expand_accepts_a_prefix() {
        let value = json!({"a": 1});
        assert_eq!(expand(&value, "root:"), vec!["root:a = 1"]);
    }

    #[test]
    fn list_of_objects_repeats_the_path() {
        let value = json!({"mounts": [{"dst": "/a"}, {"dst": "/b"}]});
        assert_eq!(
            expand(&value, ""),
            vec!["mounts:dst = /a", "mounts:dst = /b"]
        );
    }
}
