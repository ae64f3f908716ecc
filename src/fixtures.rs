//! Test fixtures: synthetic image archives and a mock engine.
//!
//! [`LayerTar`] builds a single layer tarball in memory, [`ImageBuilder`]
//! assembles layers into a `docker save`-shaped archive (with or without
//! `manifest.json`), and [`MockEngine`] serves those archives plus canned
//! inspect/history/capture answers through the [`EngineClient`] capability.

use chrono::{DateTime, TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use tar_rs as tar;
use tempfile::TempDir;

use crate::engine::{EngineClient, HistoryEntry};

fn hex_id(seed: u64) -> String {
    format!("{:064x}", seed)
}

fn base_header(entry_type: tar::EntryType, size: u64, mode: u32) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mode(mode);
    header.set_mtime(1_600_000_000);
    header.set_uid(0);
    header.set_gid(0);
    header
}

/// One layer tarball under construction.
pub struct LayerTar {
    builder: tar::Builder<Vec<u8>>,
}

impl LayerTar {
    pub fn new() -> Self {
        Self {
            builder: tar::Builder::new(Vec::new()),
        }
    }

    pub fn file(&mut self, path: &str, content: &[u8], mode: u32) {
        let mut header = base_header(tar::EntryType::Regular, content.len() as u64, mode);
        self.builder
            .append_data(&mut header, path, content)
            .expect("append file entry");
    }

    pub fn file_with_mtime(&mut self, path: &str, content: &[u8], mode: u32, mtime: u64) {
        let mut header = base_header(tar::EntryType::Regular, content.len() as u64, mode);
        header.set_mtime(mtime);
        self.builder
            .append_data(&mut header, path, content)
            .expect("append file entry");
    }

    pub fn dir(&mut self, path: &str) {
        let mut header = base_header(tar::EntryType::Directory, 0, 0o755);
        self.builder
            .append_data(&mut header, format!("{}/", path), std::io::empty())
            .expect("append directory entry");
    }

    pub fn symlink(&mut self, path: &str, target: &str) {
        let mut header = base_header(tar::EntryType::Symlink, 0, 0o777);
        header.set_link_name(target).expect("symlink target");
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .expect("append symlink entry");
    }

    pub fn hardlink(&mut self, path: &str, target: &str) {
        let mut header = base_header(tar::EntryType::Link, 0, 0o644);
        header.set_link_name(target).expect("hardlink target");
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .expect("append hardlink entry");
    }

    pub fn block_device(&mut self, path: &str, major: u32, minor: u32) {
        let mut header = base_header(tar::EntryType::Block, 0, 0o660);
        header.set_device_major(major).expect("device major");
        header.set_device_minor(minor).expect("device minor");
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .expect("append block device entry");
    }

    pub fn char_device(&mut self, path: &str, major: u32, minor: u32) {
        let mut header = base_header(tar::EntryType::Char, 0, 0o666);
        header.set_device_major(major).expect("device major");
        header.set_device_minor(minor).expect("device minor");
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .expect("append char device entry");
    }

    pub fn fifo(&mut self, path: &str) {
        let mut header = base_header(tar::EntryType::Fifo, 0, 0o644);
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .expect("append fifo entry");
    }

    /// A `.wh.<name>` deletion marker for `path`.
    pub fn whiteout(&mut self, path: &str) {
        let marker = match path.rsplit_once('/') {
            Some((dir, base)) => format!("{}/.wh.{}", dir, base),
            None => format!(".wh.{}", path),
        };
        self.file(&marker, b"", 0o644);
    }

    /// The `.wh..wh..opq` opaque marker inside `dir`.
    pub fn opaque(&mut self, dir: &str) {
        self.file(&format!("{}/.wh..wh..opq", dir), b"", 0o644);
    }

    pub fn finish(self) -> Vec<u8> {
        self.builder.into_inner().expect("finish layer tarball")
    }
}

impl Default for LayerTar {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a `docker save`-shaped archive from a stack of layers,
/// oldest first.
pub struct ImageBuilder {
    layers: Vec<Vec<u8>>,
    compress: Vec<bool>,
    manifest: bool,
    seed: u64,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            layers: Vec::new(),
            compress: Vec::new(),
            manifest: true,
            seed: 1,
        }
    }

    /// Distinguishes layer and image ids when several images coexist in one
    /// mock engine.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn layer(mut self, layer: LayerTar) -> Self {
        self.layers.push(layer.finish());
        self.compress.push(false);
        self
    }

    pub fn layer_gz(mut self, layer: LayerTar) -> Self {
        self.layers.push(layer.finish());
        self.compress.push(true);
        self
    }

    /// Legacy layout: no `manifest.json`, the image id names the top layer.
    pub fn without_manifest(mut self) -> Self {
        self.manifest = false;
        self
    }

    fn layer_id(&self, index: usize) -> String {
        hex_id(self.seed * 1_000 + index as u64 + 1)
    }

    /// The id [`MockEngine::resolve`] hands out for this image.
    pub fn image_id(&self) -> String {
        if self.manifest {
            hex_id(self.seed * 1_000 + 999)
        } else {
            // Legacy discovery starts the chain at the image id itself.
            self.layer_id(self.layers.len() - 1)
        }
    }

    /// Write the archive under `dir` and return its path.
    pub fn build(&self, dir: &std::path::Path) -> PathBuf {
        let archive_path = dir.join(format!("{}.tar", self.image_id()));
        let file = File::create(&archive_path).expect("create image archive");
        let mut builder = tar::Builder::new(file);

        let mut layer_paths = Vec::new();
        for (index, bytes) in self.layers.iter().enumerate() {
            let id = self.layer_id(index);
            let parent = if index == 0 {
                None
            } else {
                Some(self.layer_id(index - 1))
            };

            let descriptor = match parent {
                Some(parent) => {
                    serde_json::json!({"id": id, "parent": parent})
                }
                None => serde_json::json!({"id": id}),
            };
            let descriptor = serde_json::to_vec(&descriptor).expect("serialize layer descriptor");
            let mut header = base_header(tar::EntryType::Regular, descriptor.len() as u64, 0o644);
            builder
                .append_data(&mut header, format!("{}/json", id), &descriptor[..])
                .expect("append layer descriptor");

            let payload = if self.compress[index] {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
                encoder.write_all(bytes).expect("compress layer");
                encoder.finish().expect("finish gzip stream")
            } else {
                bytes.clone()
            };
            let mut header = base_header(tar::EntryType::Regular, payload.len() as u64, 0o644);
            builder
                .append_data(&mut header, format!("{}/layer.tar", id), &payload[..])
                .expect("append layer tarball");

            layer_paths.push(format!("{}/layer.tar", id));
        }

        if self.manifest {
            let manifest = serde_json::json!([{
                "Config": format!("{}.json", self.image_id()),
                "RepoTags": [],
                "Layers": layer_paths,
            }]);
            let manifest = serde_json::to_vec(&manifest).expect("serialize manifest");
            let mut header = base_header(tar::EntryType::Regular, manifest.len() as u64, 0o644);
            builder
                .append_data(&mut header, "manifest.json", &manifest[..])
                .expect("append manifest");
        }

        builder.finish().expect("finish image archive");
        archive_path
    }
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One image the mock engine can serve.
pub struct MockImage {
    pub id: String,
    pub archive: PathBuf,
    pub inspect: Option<serde_json::Value>,
    pub history: Vec<HistoryEntry>,
    pub captures: HashMap<String, String>,
}

impl MockImage {
    pub fn set_inspect(&mut self, value: serde_json::Value) {
        self.inspect = Some(value);
    }

    /// Build history, oldest command first.
    pub fn set_history(&mut self, commands: &[&str]) {
        self.history = commands
            .iter()
            .enumerate()
            .map(|(i, cmd)| HistoryEntry {
                created: fixed_time(i as u32),
                created_by: cmd.to_string(),
            })
            .collect();
    }

    /// Canned `rpm -qa` output.
    pub fn set_packages(&mut self, nvrs: &[&str]) {
        self.captures
            .insert("rpm -qa".to_string(), format!("{}\n", nvrs.join("\n")));
    }

    /// Canned `rpm -qal` output.
    pub fn set_owned_files(&mut self, paths: &[&str]) {
        self.captures.insert(
            "rpm -qal | grep -v '(contains no files)'".to_string(),
            format!("{}\n", paths.join("\n")),
        );
    }
}

fn fixed_time(offset: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(offset as i64)
}

/// Mock implementation of [`EngineClient`] backed by prebuilt archives.
pub struct MockEngine {
    images: Vec<(String, MockImage)>,
    dir: TempDir,
}

impl MockEngine {
    pub const DEFAULT_REF: &'static str = "mock:latest";

    pub fn new() -> Self {
        Self {
            images: Vec::new(),
            dir: tempfile::tempdir().expect("create mock engine directory"),
        }
    }

    /// Single-image engine answering for [`Self::DEFAULT_REF`].
    pub fn from_builder(builder: ImageBuilder) -> Self {
        let mut engine = Self::new();
        engine.add_image(Self::DEFAULT_REF, builder);
        engine
    }

    /// Register an image under `reference` and return it for customization.
    pub fn add_image(&mut self, reference: &str, builder: ImageBuilder) -> &mut MockImage {
        let archive = builder.build(self.dir.path());
        let image = MockImage {
            id: builder.image_id(),
            archive,
            inspect: Some(serde_json::json!({})),
            history: Vec::new(),
            captures: HashMap::new(),
        };
        self.images.push((reference.to_string(), image));
        &mut self.images.last_mut().unwrap().1
    }

    fn find(&self, id_or_ref: &str) -> Option<&MockImage> {
        self.images
            .iter()
            .find(|(reference, image)| reference.as_str() == id_or_ref || image.id == id_or_ref)
            .map(|(_, image)| image)
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineClient for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn resolve(&self, reference: &str) -> anyhow::Result<String> {
        self.find(reference)
            .map(|image| image.id.clone())
            .ok_or_else(|| anyhow::anyhow!("Can't find image {}", reference))
    }

    fn export_image(&self, id: &str) -> anyhow::Result<(PathBuf, Option<TempDir>)> {
        let image = self
            .find(id)
            .ok_or_else(|| anyhow::anyhow!("Can't find image {}", id))?;
        // Copy so the caller may consume the archive independently.
        let temp = tempfile::tempdir()?;
        let copy = temp.path().join("image.tar");
        fs::copy(&image.archive, &copy)?;
        Ok((copy, Some(temp)))
    }

    fn history(&self, id: &str) -> anyhow::Result<Vec<HistoryEntry>> {
        let image = self
            .find(id)
            .ok_or_else(|| anyhow::anyhow!("Can't find image {}", id))?;
        Ok(image.history.clone())
    }

    fn inspect(&self, id: &str) -> anyhow::Result<serde_json::Value> {
        let image = self
            .find(id)
            .ok_or_else(|| anyhow::anyhow!("Can't find image {}", id))?;
        image
            .inspect
            .clone()
            .ok_or_else(|| anyhow::anyhow!("No inspect data for image {}", id))
    }

    fn run_capture(&self, id: &str, command: &str) -> anyhow::Result<String> {
        let image = self
            .find(id)
            .ok_or_else(|| anyhow::anyhow!("Can't find image {}", id))?;
        Ok(image.captures.get(command).cloned().unwrap_or_default())
    }
}
