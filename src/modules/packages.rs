//! Diff of installed packages.

use anyhow::Result;
use log::info;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::extractor::ExtractedImage;
use crate::modules::{Context, DiffModule, ModuleResult};
use crate::package_manager::{self, Package};

pub struct Packages;

impl DiffModule for Packages {
    fn name(&self) -> &'static str {
        "packages"
    }

    /// Adds the `packages` key: `{added, removed, modified}` package lists
    /// keyed on package name.
    fn run(
        &self,
        image1: &ExtractedImage,
        image2: &ExtractedImage,
        ctx: &Context<'_>,
    ) -> Result<ModuleResult> {
        info!("Testing packages in the image");

        let pm1 = package_manager::detect(image1);
        let pm2 = package_manager::detect(image2);
        let packages1 = pm1.installed_packages(ctx.engine, &image1.id)?;
        let packages2 = pm2.installed_packages(ctx.engine, &image2.id)?;

        let mut result = ModuleResult::new();
        result.insert("packages".to_string(), packages_diff(&packages1, &packages2));
        Ok(result)
    }
}

/// Name-set comparison of two package lists.
///
/// Added and removed entries are `(name, version)`; modified entries are
/// `(name, version_old, version_new)` for names present on both sides with
/// differing versions.
pub fn packages_diff(packages1: &[Package], packages2: &[Package]) -> Value {
    let by_name1: BTreeMap<&str, &str> = packages1
        .iter()
        .map(|p| (p.name.as_str(), p.version.as_str()))
        .collect();
    let by_name2: BTreeMap<&str, &str> = packages2
        .iter()
        .map(|p| (p.name.as_str(), p.version.as_str()))
        .collect();

    let added: Vec<Value> = by_name2
        .iter()
        .filter(|(name, _)| !by_name1.contains_key(*name))
        .map(|(name, version)| json!([name, version]))
        .collect();

    let removed: Vec<Value> = by_name1
        .iter()
        .filter(|(name, _)| !by_name2.contains_key(*name))
        .map(|(name, version)| json!([name, version]))
        .collect();

    let modified: Vec<Value> = by_name1
        .iter()
        .filter_map(|(name, old_version)| {
            by_name2
                .get(name)
                .filter(|new_version| new_version != &old_version)
                .map(|new_version| json!([name, old_version, new_version]))
        })
        .collect();

    json!({
        "added": added,
        "removed": removed,
        "modified": modified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package_manager::parse_nvr;

    fn packages(tokens: &[&str]) -> Vec<Package> {
        tokens.iter().map(|t| parse_nvr(t)).collect()
    }

    #[test]
    fn identical_lists_diff_empty() {
        let list = packages(&["bash-5.1.8-1.fc35", "glibc-common-2.28-42.el8"]);
        let diff = packages_diff(&list, &list);
        assert_eq!(diff["added"], json!([]));
        assert_eq!(diff["removed"], json!([]));
        assert_eq!(diff["modified"], json!([]));
    }

    #[test]
    fn upgrade_appears_as_modified() {
        let old = packages(&["foo-1.0-1", "bash-5.1.8-1.fc35"]);
        let new = packages(&["foo-1.1-1", "bash-5.1.8-1.fc35"]);
        let diff = packages_diff(&old, &new);
        assert_eq!(diff["modified"], json!([["foo", "1.0-1", "1.1-1"]]));
        assert_eq!(diff["added"], json!([]));
        assert_eq!(diff["removed"], json!([]));
    }

    #[test]
    fn installs_and_removals_split_by_name() {
        let old = packages(&["gone-1.0-1"]);
        let new = packages(&["fresh-2.0-1"]);
        let diff = packages_diff(&old, &new);
        assert_eq!(diff["added"], json!([["fresh", "2.0-1"]]));
        assert_eq!(diff["removed"], json!([["gone", "1.0-1"]]));
        assert_eq!(diff["modified"], json!([]));
    }

    #[test]
    fn empty_package_lists_are_fine() {
        let diff = packages_diff(&[], &[]);
        assert_eq!(diff["added"], json!([]));
        assert_eq!(diff["removed"], json!([]));
        assert_eq!(diff["modified"], json!([]));
    }
}
