//! End-to-end diff pipeline orchestrator.
//!
//! [`DiffRunner`] resolves both image references, extracts the two images in
//! parallel into temporary trees, runs every registered diff module, filters
//! matching result keys, and merges the fragments into the final document.
//! The extraction trees live exactly as long as the run unless the caller
//! asked for them to be preserved.

use anyhow::{anyhow, Context as AnyhowContext, Result};
use log::{debug, info};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;

use crate::engine::EngineClient;
use crate::extractor::{ExtractOptions, ExtractedImage};
use crate::filter;
use crate::modules::{self, Context};

/// Where filter rules come from when filtering is enabled.
pub enum FilterSource {
    /// The config embedded in the binary.
    Builtin,
    /// A user-supplied config file.
    File(PathBuf),
}

/// Run configuration, fixed before any parallel work starts.
#[derive(Default)]
pub struct DiffOptions {
    /// Abbreviated `modified` entries in module output.
    pub silent: bool,
    /// Filtering of the result document, off by default.
    pub filter: Option<FilterSource>,
    /// Keep the extraction trees and print their locations.
    pub preserve: bool,
    /// Parent directory for the extraction trees; the system temp directory
    /// when unset.
    pub extract_root: Option<PathBuf>,
}

/// Orchestrates the diff pipeline for a concrete [`EngineClient`].
pub struct DiffRunner<E: EngineClient> {
    engine: E,
}

impl<E: EngineClient> DiffRunner<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    /// Compare two images and return the merged result document.
    pub fn diff(
        &self,
        reference1: &str,
        reference2: &str,
        options: &DiffOptions,
    ) -> Result<serde_json::Map<String, Value>> {
        // Fail fast on unknown references before any extraction work.
        let id1 = self.engine.resolve(reference1)?;
        let id2 = self.engine.resolve(reference2)?;
        info!("ID1 - {}", id1);
        info!("ID2 - {}", id2);

        let filter_config = match &options.filter {
            Some(FilterSource::Builtin) => {
                debug!("Using built-in filter config");
                Some(filter::default_config())
            }
            Some(FilterSource::File(path)) => {
                debug!("Using {:?} to get filter options", path);
                Some(filter::load_config(path)?)
            }
            None => None,
        };

        let extract_root = options
            .extract_root
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        fs::create_dir_all(&extract_root)
            .with_context(|| format!("Failed to create extraction root {:?}", extract_root))?;
        let dir1 = tempfile::Builder::new()
            .prefix("ocidiff-")
            .tempdir_in(&extract_root)
            .context("Failed to create extraction directory")?;
        let dir2 = tempfile::Builder::new()
            .prefix("ocidiff-")
            .tempdir_in(&extract_root)
            .context("Failed to create extraction directory")?;

        // The two extractions are independent; run them side by side. Any
        // failure unwinds through the scope and the temp dirs clean up on
        // drop.
        let extract_opts = ExtractOptions::default();
        let (result1, result2) = thread::scope(|scope| {
            let handle1 = scope
                .spawn(|| ExtractedImage::extract(&self.engine, &id1, dir1.path(), extract_opts));
            let handle2 = scope
                .spawn(|| ExtractedImage::extract(&self.engine, &id2, dir2.path(), extract_opts));
            (handle1.join(), handle2.join())
        });
        let image1 = result1.map_err(|_| anyhow!("Extraction of image {} panicked", id1))??;
        let image2 = result2.map_err(|_| anyhow!("Extraction of image {} panicked", id2))??;

        let ctx = Context {
            engine: &self.engine,
            silent: options.silent,
        };

        let mut result = serde_json::Map::new();
        for module in modules::builtin() {
            info!("Going to run module {}", module.name());
            let mut fragment = module.run(&image1, &image2, &ctx)?;
            if let Some(config) = &filter_config {
                filter::apply_config(&mut fragment, config);
            }
            result.append(&mut fragment);
        }
        info!("All modules finished");

        if options.preserve {
            let kept1 = dir1.keep();
            let kept2 = dir2.keep();
            println!("Image {} extracted to {}.", reference1, kept1.display());
            println!("Image {} extracted to {}.", reference2, kept2.display());
        } else {
            debug!("Removing temporary directories");
            for dir in [dir1, dir2] {
                if let Err(err) = dir.close() {
                    debug!("Failed to remove temporary directory: {}", err);
                }
            }
        }

        Ok(result)
    }
}

/// Serialize the result document to `output`, or stdout when absent.
pub fn write_result(result: &serde_json::Map<String, Value>, output: Option<&Path>) -> Result<()> {
    let serialized =
        serde_json::to_string(result).context("Failed to serialize result document")?;
    match output {
        Some(path) => {
            info!("Writing output to {:?}", path);
            fs::write(path, serialized)
                .with_context(|| format!("Failed to write output file {:?}", path))?;
        }
        None => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(serialized.as_bytes())
                .and_then(|_| handle.write_all(b"\n"))
                .context("Failed to write result to stdout")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ImageBuilder, LayerTar, MockEngine};
    use serde_json::json;
    use tempfile::tempdir;

    /// Two images identical except for a modified `/etc/hosts` and a `foo`
    /// package upgrade.
    fn scenario_engine() -> MockEngine {
        let mut engine = MockEngine::new();

        let mut base1 = LayerTar::new();
        base1.dir("etc");
        base1.file_with_mtime("etc/hosts", b"127.0.0.1 localhost\n", 0o644, 100);
        let image1 =
            engine.add_image("first:latest", ImageBuilder::new().with_seed(1).layer(base1));
        image1.set_packages(&["foo-1.0-1", "bash-5.1.8-1.fc35"]);
        image1.set_owned_files(&["/etc/owned"]);
        image1.set_inspect(json!({"Architecture": "amd64", "Os": "linux"}));
        image1.set_history(&[
            "/bin/sh -c #(nop) ADD file:base in /",
            "/bin/sh -c dnf install -y foo",
        ]);

        let mut base2 = LayerTar::new();
        base2.dir("etc");
        base2.file_with_mtime("etc/hosts", b"127.0.0.2 localhost\n", 0o644, 200);
        let image2 =
            engine.add_image("second:latest", ImageBuilder::new().with_seed(2).layer(base2));
        image2.set_packages(&["foo-1.1-1", "bash-5.1.8-1.fc35"]);
        image2.set_owned_files(&["/etc/owned"]);
        image2.set_inspect(json!({"Architecture": "amd64", "Os": "linux"}));
        image2.set_history(&[
            "/bin/sh -c #(nop) ADD file:base in /",
            "/bin/sh -c dnf install -y foo",
        ]);

        engine
    }

    #[test]
    fn end_to_end_scenario() {
        let runner = DiffRunner::new(scenario_engine());
        let result = runner
            .diff("first:latest", "second:latest", &DiffOptions::default())
            .unwrap();

        let files = &result["files"];
        assert_eq!(files["added"], json!([]));
        assert_eq!(files["removed"], json!([]));
        let modified = files["modified"].as_array().unwrap();
        assert_eq!(modified.len(), 1);
        let entry = modified[0].as_array().unwrap();
        assert_eq!(entry[0], json!("/etc/hosts"));
        assert_eq!(entry[1], json!("text/plain; charset=utf-8"));
        let content_diff = entry[2].as_array().unwrap();
        assert!(content_diff
            .iter()
            .any(|line| line.as_str().unwrap() == "+127.0.0.2 localhost"));
        // mtime is the only attribute change, so the metadata diff is empty.
        assert_eq!(entry[3], json!({}));

        assert_eq!(
            result["packages"],
            json!({"added": [], "removed": [], "modified": [["foo", "1.0-1", "1.1-1"]]})
        );
        assert_eq!(result["metadata"], json!([]));
        assert_eq!(result["history"], json!([]));
    }

    #[test]
    fn silent_mode_abbreviates_modified_entries() {
        let runner = DiffRunner::new(scenario_engine());
        let options = DiffOptions {
            silent: true,
            ..Default::default()
        };
        let result = runner
            .diff("first:latest", "second:latest", &options)
            .unwrap();

        let modified = result["files"]["modified"].as_array().unwrap();
        assert_eq!(modified.len(), 1);
        assert_eq!(
            modified[0],
            json!(["/etc/hosts", "text/plain; charset=utf-8"])
        );
    }

    #[test]
    fn unknown_reference_fails_fast() {
        let runner = DiffRunner::new(scenario_engine());
        let err = runner
            .diff("first:latest", "missing:latest", &DiffOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("missing:latest"));
    }

    #[test]
    fn temp_trees_removed_on_module_failure() {
        let mut engine = scenario_engine();
        // Break the metadata module: no inspect data for the second image.
        let mut layer = LayerTar::new();
        layer.file("etc/os-release", b"ID=broken\n", 0o644);
        engine
            .add_image(
                "broken:latest",
                ImageBuilder::new().with_seed(3).layer(layer),
            )
            .inspect = None;

        let root = tempdir().unwrap();
        let options = DiffOptions {
            extract_root: Some(root.path().to_path_buf()),
            ..Default::default()
        };
        let runner = DiffRunner::new(engine);
        let result = runner.diff("first:latest", "broken:latest", &options);
        assert!(result.is_err());

        let leftovers: Vec<_> = fs::read_dir(root.path()).unwrap().collect();
        assert!(
            leftovers.is_empty(),
            "extraction trees must not survive a failed run"
        );
    }

    #[test]
    fn temp_trees_removed_on_success() {
        let root = tempdir().unwrap();
        let options = DiffOptions {
            extract_root: Some(root.path().to_path_buf()),
            ..Default::default()
        };
        let runner = DiffRunner::new(scenario_engine());
        runner
            .diff("first:latest", "second:latest", &options)
            .unwrap();

        let leftovers: Vec<_> = fs::read_dir(root.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn preserve_keeps_extraction_trees() {
        let root = tempdir().unwrap();
        let options = DiffOptions {
            preserve: true,
            extract_root: Some(root.path().to_path_buf()),
            ..Default::default()
        };
        let runner = DiffRunner::new(scenario_engine());
        runner
            .diff("first:latest", "second:latest", &options)
            .unwrap();

        let kept: Vec<_> = fs::read_dir(root.path()).unwrap().collect();
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn filter_config_applies_to_matching_keys() {
        let mut engine = scenario_engine();
        // A third image carrying an extra unowned log file.
        let mut layer = LayerTar::new();
        layer.dir("etc");
        layer.file_with_mtime("etc/hosts", b"127.0.0.1 localhost\n", 0o644, 100);
        layer.dir("var");
        layer.dir("var/log");
        layer.file("var/log/build.log", b"log\n", 0o644);
        let image = engine.add_image(
            "logs:latest",
            ImageBuilder::new().with_seed(4).layer(layer),
        );
        image.set_packages(&["foo-1.0-1", "bash-5.1.8-1.fc35"]);
        image.set_owned_files(&["/etc/owned"]);
        image.set_inspect(json!({"Architecture": "amd64", "Os": "linux"}));

        let config_dir = tempdir().unwrap();
        let config_path = config_dir.path().join("filter.json");
        fs::write(
            &config_path,
            serde_json::to_vec(&json!({
                "files": {
                    "action": "exclude",
                    "data": ["/var/log/"],
                    "keys": ["added", "removed", "modified"]
                }
            }))
            .unwrap(),
        )
        .unwrap();

        let options = DiffOptions {
            filter: Some(FilterSource::File(config_path)),
            ..Default::default()
        };
        let runner = DiffRunner::new(engine);
        let result = runner
            .diff("logs:latest", "second:latest", &options)
            .unwrap();

        let removed = result["files"]["removed"].as_array().unwrap();
        assert!(removed
            .iter()
            .all(|item| !item.to_string().contains("/var/log/")));
    }
}
