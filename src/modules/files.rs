//! Diff of files not owned by the package manager.
//!
//! Owned files change with every package update and are already covered by
//! the `packages` module; the interesting signal is what was added, removed
//! or modified outside the package manager's control.

use anyhow::Result;
use log::info;
use serde_json::{json, Value};
use std::fs;

use crate::diffutil;
use crate::extractor::{ExtractedImage, FileAttrs};
use crate::mime;
use crate::modules::{Context, DiffModule, ModuleResult};
use crate::package_manager;

pub struct Files;

impl DiffModule for Files {
    fn name(&self) -> &'static str {
        "files"
    }

    /// Adds the `files` key: `{added, removed, modified}` over unowned
    /// paths. Added and removed entries are `(path, mime)`; modified entries
    /// carry the content and metadata diffs unless the run is silent.
    fn run(
        &self,
        image1: &ExtractedImage,
        image2: &ExtractedImage,
        ctx: &Context<'_>,
    ) -> Result<ModuleResult> {
        info!("Testing files in the image");

        let pm1 = package_manager::detect(image1);
        let pm2 = package_manager::detect(image2);
        let unowned1 = pm1.unowned_files(ctx.engine, image1)?;
        let unowned2 = pm2.unowned_files(ctx.engine, image2)?;

        let added: Vec<Value> = unowned2
            .difference(&unowned1)
            .map(|path| json!([path, mime_of(image2, path)]))
            .collect();

        let removed: Vec<Value> = unowned1
            .difference(&unowned2)
            .map(|path| json!([path, mime_of(image1, path)]))
            .collect();

        let mut modified = Vec::new();
        for path in unowned1.intersection(&unowned2) {
            let attr_changes = metadata_diff(&image1.metadata[path], &image2.metadata[path]);
            let content_changes = content_diff(path, image1, image2);
            if attr_changes.is_empty() && content_changes.is_empty() {
                continue;
            }
            let mime_new = mime_of(image2, path);
            if ctx.silent {
                modified.push(json!([path, mime_new]));
            } else {
                modified.push(json!([path, mime_new, content_changes, attr_changes]));
            }
        }

        let mut result = ModuleResult::new();
        result.insert(
            "files".to_string(),
            json!({
                "added": added,
                "removed": removed,
                "modified": modified,
            }),
        );
        Ok(result)
    }
}

fn mime_of(image: &ExtractedImage, path: &str) -> String {
    match mime::from_attrs(&image.metadata[path]) {
        Some(synthesized) => synthesized.to_string(),
        None => mime::from_path(&image.host_path(path)),
    }
}

/// Attribute differences between the two images' records of a path, as
/// `{field: (old, new)}`. `mtime` and `chksum` are expected to differ and
/// are ignored.
pub fn metadata_diff(old: &FileAttrs, new: &FileAttrs) -> serde_json::Map<String, Value> {
    const IGNORED: [&str; 2] = ["mtime", "chksum"];

    let mut result = serde_json::Map::new();
    for ((field, old_value), (_, new_value)) in old.to_pairs().into_iter().zip(new.to_pairs()) {
        if IGNORED.contains(&field) || old_value == new_value {
            continue;
        }
        result.insert(field.to_string(), json!([old_value, new_value]));
    }
    result
}

/// Unified diff of a file's contents in the two trees. Empty when either
/// side is not a regular file or is not valid UTF-8.
pub fn content_diff(path: &str, image1: &ExtractedImage, image2: &ExtractedImage) -> Vec<String> {
    let file1 = image1.host_path(path);
    let file2 = image2.host_path(path);
    if !file1.is_file() || !file2.is_file() {
        return Vec::new();
    }

    let old = match fs::read(&file1).ok().and_then(|b| String::from_utf8(b).ok()) {
        Some(text) => text,
        None => return Vec::new(),
    };
    let new = match fs::read(&file2).ok().and_then(|b| String::from_utf8(b).ok()) {
        Some(text) => text,
        None => return Vec::new(),
    };

    diffutil::unified_diff(
        &old,
        &new,
        &file1.to_string_lossy(),
        &file2.to_string_lossy(),
    )
}
