//! Materialize a container image's merged root filesystem.
//!
//! [`ExtractedImage::extract`] resolves an image reference, exports the image
//! archive from the engine, walks the layer chain oldest to newest and
//! replays every layer tarball into an output directory, honoring overlay
//! whiteouts. Alongside the tree it builds a side-band map of per-path
//! [`FileAttrs`], keyed by the absolute in-image path (`/etc/hosts`), which
//! preserves the attribute fidelity the on-disk tree deliberately drops:
//! ownership and timestamps are never applied, and device/FIFO nodes are
//! recorded but never materialized.
//!
//! Two archive layouts are understood:
//! - the `manifest.json`-rooted layout, where `manifest[0].Layers[-1]` names
//!   the top layer,
//! - the legacy layout, where each `<layer>/json` descriptor links to its
//!   `parent` and the image id itself is the top layer.

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tar_rs as tar;

use crate::engine::EngineClient;

/// Entry kind as recorded in the layer archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    #[serde(rename = "regular")]
    Regular,
    #[serde(rename = "directory")]
    Directory,
    #[serde(rename = "symlink")]
    Symlink,
    #[serde(rename = "hardlink")]
    Hardlink,
    #[serde(rename = "blockdev")]
    BlockDevice,
    #[serde(rename = "chardev")]
    CharDevice,
    #[serde(rename = "fifo")]
    Fifo,
    #[serde(rename = "other")]
    Other,
}

impl EntryKind {
    /// Device and FIFO entries are recorded in metadata but never written to
    /// the output tree.
    pub fn is_special(self) -> bool {
        matches!(self, EntryKind::BlockDevice | EntryKind::CharDevice | EntryKind::Fifo)
    }
}

/// Attributes of one filesystem entry, captured from its tar header.
///
/// `mtime` and `chksum` are carried for completeness but excluded from
/// comparisons.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileAttrs {
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
    pub mtime: u64,
    pub chksum: Option<u64>,
    pub linkname: Option<String>,
    pub uname: Option<String>,
    pub gname: Option<String>,
    pub devmajor: Option<u32>,
    pub devminor: Option<u32>,
}

impl FileAttrs {
    /// Flattens the record into `(field, value)` pairs for comparison and
    /// export.
    pub fn to_pairs(&self) -> Vec<(&'static str, serde_json::Value)> {
        use serde_json::json;
        vec![
            ("kind", serde_json::to_value(self.kind).unwrap_or_default()),
            ("mode", json!(self.mode)),
            ("uid", json!(self.uid)),
            ("gid", json!(self.gid)),
            ("size", json!(self.size)),
            ("mtime", json!(self.mtime)),
            ("chksum", json!(self.chksum)),
            ("linkname", json!(self.linkname)),
            ("uname", json!(self.uname)),
            ("gname", json!(self.gname)),
            ("devmajor", json!(self.devmajor)),
            ("devminor", json!(self.devminor)),
        ]
    }
}

/// Path → attributes map for everything that survived layer replay.
pub type Metadata = BTreeMap<String, FileAttrs>;

/// Knobs for [`ExtractedImage::extract`].
#[derive(Debug, Clone, Copy)]
pub struct ExtractOptions {
    /// Extract only the top layer instead of the whole chain.
    pub one_layer: bool,
    /// Interpret `.wh.` whiteout markers. Off means markers are treated as
    /// ordinary files.
    pub whiteouts: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            one_layer: false,
            whiteouts: true,
        }
    }
}

/// A materialized image: canonical id, merged tree on disk, and the
/// side-band attribute map.
pub struct ExtractedImage {
    pub id: String,
    pub tree_root: PathBuf,
    pub metadata: Metadata,
}

impl ExtractedImage {
    /// Resolve `reference` and replay its layers into `out_dir`.
    ///
    /// `out_dir` is created if missing; the caller owns its lifetime and is
    /// responsible for removing it.
    pub fn extract(
        engine: &dyn EngineClient,
        reference: &str,
        out_dir: &Path,
        options: ExtractOptions,
    ) -> Result<Self> {
        let id = engine.resolve(reference)?;
        let (archive_path, _archive_dir) = engine.export_image(&id)?;

        // Unpack the outer archive so layer descriptors and tarballs can be
        // addressed as plain files.
        let scratch = tempfile::tempdir().context("Failed to create scratch directory")?;
        let mut outer = tar::Archive::new(
            File::open(&archive_path)
                .with_context(|| format!("Failed to open image archive {:?}", archive_path))?,
        );
        outer
            .unpack(scratch.path())
            .with_context(|| format!("Failed to unpack image archive {:?}", archive_path))?;

        info!("Extracting image {}", id);
        let top = top_layer_id(scratch.path(), &id)?;
        let layers = if options.one_layer {
            vec![top]
        } else {
            let mut chain = find_layers(scratch.path(), &top)?;
            chain.reverse();
            chain
        };

        fs::create_dir_all(out_dir)
            .with_context(|| format!("Failed to create output directory {:?}", out_dir))?;

        let mut metadata = Metadata::new();
        for layer_id in &layers {
            info!("Extracting layer {}", layer_id);
            let layer_tar = scratch.path().join(layer_id).join("layer.tar");
            apply_layer(&layer_tar, out_dir, &mut metadata, options.whiteouts)
                .with_context(|| format!("Failed to apply layer {}", layer_id))?;
            debug!("Actual metadata size - {}", metadata.len());
        }

        Ok(Self {
            id,
            tree_root: out_dir.to_path_buf(),
            metadata,
        })
    }

    /// Host path of an in-image absolute path.
    pub fn host_path(&self, abs_path: &str) -> PathBuf {
        self.tree_root.join(abs_path.trim_start_matches('/'))
    }
}

#[derive(Deserialize)]
struct ManifestEntry {
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Determine the id of the top layer: from `manifest.json` when the archive
/// carries one, otherwise the image id itself.
fn top_layer_id(archive_dir: &Path, id: &str) -> Result<String> {
    let manifest_path = archive_dir.join("manifest.json");
    if !manifest_path.exists() {
        return Ok(id.to_string());
    }

    let content = fs::read_to_string(&manifest_path).context("Failed to read manifest.json")?;
    let manifest: Vec<ManifestEntry> =
        serde_json::from_str(&content).context("Failed to parse manifest.json")?;
    let entry = manifest
        .first()
        .ok_or_else(|| anyhow!("Empty manifest.json"))?;
    let last = entry
        .layers
        .last()
        .ok_or_else(|| anyhow!("manifest.json lists no layers"))?;
    let top = last
        .split('/')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("Malformed layer path in manifest.json: {}", last))?;
    Ok(top.to_string())
}

#[derive(Deserialize)]
struct LayerDescriptor {
    #[serde(default)]
    parent: Option<String>,
}

/// Walk the `parent` chain starting at `top`, returning layer ids top-first.
///
/// The chain is followed iteratively; a repeated id in a corrupt archive is
/// an error rather than a loop.
fn find_layers(archive_dir: &Path, top: &str) -> Result<Vec<String>> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = Some(top.to_string());

    while let Some(id) = current {
        if id.len() != 64 {
            break;
        }
        if !seen.insert(id.clone()) {
            bail!("Layer chain cycle at {}", id);
        }

        let json_path = archive_dir.join(&id).join("json");
        let content = fs::read_to_string(&json_path)
            .with_context(|| format!("Failed to read layer descriptor {:?}", json_path))?;
        let descriptor: LayerDescriptor = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse layer descriptor {:?}", json_path))?;

        debug!("layer = {}", id);
        chain.push(id);
        current = descriptor.parent;
    }

    Ok(chain)
}

/// Normalizes a path from a tar archive to be safe for extraction.
/// Removes any attempts to escape the root directory.
fn normalize_tar_path(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(c) => out.push(c),
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    out
}

/// The map key for a tar member path: leading `/`, no `./` prefix, no
/// trailing slash.
fn metadata_key(raw: &str) -> String {
    let trimmed = raw
        .trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/');
    format!("/{}", trimmed)
}

fn attrs_from_header(header: &tar::Header) -> FileAttrs {
    use tar::EntryType;

    let kind = match header.entry_type() {
        EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => EntryKind::Regular,
        EntryType::Directory => EntryKind::Directory,
        EntryType::Symlink => EntryKind::Symlink,
        EntryType::Link => EntryKind::Hardlink,
        EntryType::Block => EntryKind::BlockDevice,
        EntryType::Char => EntryKind::CharDevice,
        EntryType::Fifo => EntryKind::Fifo,
        _ => EntryKind::Other,
    };

    let linkname = header
        .link_name_bytes()
        .map(|b| String::from_utf8_lossy(&b).into_owned());

    FileAttrs {
        kind,
        mode: header.mode().unwrap_or(0),
        uid: header.uid().unwrap_or(0),
        gid: header.gid().unwrap_or(0),
        size: header.size().unwrap_or(0),
        mtime: header.mtime().unwrap_or(0),
        chksum: header.cksum().ok().map(|c| c as u64),
        linkname,
        uname: header
            .username()
            .ok()
            .flatten()
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        gname: header
            .groupname()
            .ok()
            .flatten()
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        devmajor: header.device_major().ok().flatten(),
        devminor: header.device_minor().ok().flatten(),
    }
}

/// Hardlinks whose target has not been written yet are retried once all
/// members of the layer have been applied.
struct PendingHardlink {
    dest: PathBuf,
    target: PathBuf,
}

fn try_link_or_copy(target: &Path, dest: &Path) -> Result<()> {
    if !target.exists() {
        return Err(anyhow!("hardlink target missing: {}", target.display()));
    }
    if dest.symlink_metadata().is_ok() {
        fs::remove_file(dest)
            .with_context(|| format!("Failed to remove existing file: {}", dest.display()))?;
    }
    if let Err(e) = fs::hard_link(target, dest) {
        debug!(
            "hardlink failed ({}), falling back to copy: {} -> {}",
            e,
            target.display(),
            dest.display()
        );
        fs::copy(target, dest)
            .with_context(|| format!("Failed to copy {} to {}", target.display(), dest.display()))?;
    }
    Ok(())
}

fn remove_tree_entry(path: &Path) {
    match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() && !meta.is_symlink() => {
            if let Err(e) = fs::remove_dir_all(path) {
                debug!("Failed to remove directory {}: {}", path.display(), e);
            }
        }
        Ok(_) => {
            if let Err(e) = fs::remove_file(path) {
                debug!("Failed to remove file {}: {}", path.display(), e);
            }
        }
        Err(_) => debug!("Whiteout target {} not present in tree", path.display()),
    }
}

/// Drop `key` and everything below it from the metadata map.
fn remove_metadata_subtree(metadata: &mut Metadata, key: &str) {
    metadata.remove(key);
    let prefix = format!("{}/", key.trim_end_matches('/'));
    let doomed: Vec<String> = metadata
        .range(prefix.clone()..)
        .take_while(|(k, _)| k.starts_with(&prefix))
        .map(|(k, _)| k.clone())
        .collect();
    for k in doomed {
        metadata.remove(&k);
    }
}

/// Replay one layer tarball into `out_dir`, updating `metadata` as members
/// are applied in archive order.
fn apply_layer(
    layer_tar: &Path,
    out_dir: &Path,
    metadata: &mut Metadata,
    whiteouts: bool,
) -> Result<()> {
    // Layers may be gzip-compressed; sniff the magic bytes.
    let file = File::open(layer_tar)
        .with_context(|| format!("Failed to open layer tarball {:?}", layer_tar))?;
    let mut buf_reader = BufReader::new(file);
    let mut magic = [0u8; 2];
    let compressed = match buf_reader.read_exact(&mut magic) {
        Ok(()) => magic == [0x1f, 0x8b],
        Err(_) => false,
    };

    let file = File::open(layer_tar)?;
    let mut archive: tar::Archive<Box<dyn Read>> = if compressed {
        tar::Archive::new(Box::new(GzDecoder::new(file)))
    } else {
        tar::Archive::new(Box::new(file))
    };

    let mut pending_hardlinks = Vec::new();

    for entry_result in archive.entries().context("Failed to read layer tarball")? {
        let mut entry = entry_result.context("Failed to read tar entry")?;
        let raw_path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let key = metadata_key(&raw_path);
        if key == "/" {
            continue;
        }

        let rel_path = normalize_tar_path(Path::new(raw_path.as_str()));
        let basename = key.rsplit('/').next().unwrap_or("");

        if whiteouts && basename.starts_with(".wh.") {
            if basename == ".wh..wh..opq" {
                apply_opaque_whiteout(&key, &rel_path, out_dir, metadata);
            } else {
                apply_whiteout(&raw_path, out_dir, metadata);
            }
            continue;
        }

        let attrs = attrs_from_header(entry.header());
        let kind = attrs.kind;
        metadata.insert(key, attrs.clone());

        if kind.is_special() {
            debug!("Not materializing special entry {}", raw_path);
            continue;
        }

        let dest = out_dir.join(&rel_path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        match kind {
            EntryKind::Directory => {
                if dest.symlink_metadata().map(|m| !m.is_dir()).unwrap_or(false) {
                    remove_tree_entry(&dest);
                }
                fs::create_dir_all(&dest)
                    .with_context(|| format!("Failed to create directory: {}", dest.display()))?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    // Keep the directory enterable for later members.
                    let mode = attrs.mode | 0o700;
                    let _ = fs::set_permissions(&dest, fs::Permissions::from_mode(mode));
                }
            }
            EntryKind::Regular => {
                if dest.symlink_metadata().is_ok() {
                    remove_tree_entry(&dest);
                }
                let mut out_file = File::create(&dest)
                    .with_context(|| format!("Failed to create file: {}", dest.display()))?;
                std::io::copy(&mut entry, &mut out_file)
                    .with_context(|| format!("Failed to write file: {}", dest.display()))?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    // Owner-readable at minimum so the diff pass can open it.
                    let mode = attrs.mode | 0o400;
                    let _ = fs::set_permissions(&dest, fs::Permissions::from_mode(mode));
                }
            }
            EntryKind::Symlink => {
                let target = attrs
                    .linkname
                    .clone()
                    .ok_or_else(|| anyhow!("Symlink without target: {}", raw_path))?;
                if dest.symlink_metadata().is_ok() {
                    remove_tree_entry(&dest);
                }
                #[cfg(unix)]
                std::os::unix::fs::symlink(&target, &dest).with_context(|| {
                    format!("Failed to create symlink {} -> {}", dest.display(), target)
                })?;
            }
            EntryKind::Hardlink => {
                let target = attrs
                    .linkname
                    .clone()
                    .ok_or_else(|| anyhow!("Hardlink without target: {}", raw_path))?;
                let target = out_dir.join(normalize_tar_path(Path::new(target.as_str())));
                pending_hardlinks.push(PendingHardlink { dest, target });
            }
            _ => {
                debug!("Skipping unsupported entry type for {}", raw_path);
            }
        }
    }

    for hardlink in pending_hardlinks {
        if let Err(e) = try_link_or_copy(&hardlink.target, &hardlink.dest) {
            debug!(
                "Skipping broken hardlink: {} -> {}: {}",
                hardlink.dest.display(),
                hardlink.target.display(),
                e
            );
        }
    }

    Ok(())
}

/// Handle a `.wh.<name>` deletion marker.
fn apply_whiteout(raw_path: &str, out_dir: &Path, metadata: &mut Metadata) {
    let path = raw_path.trim_start_matches("./").trim_start_matches('/');
    let newpath = if let Some(stripped) = path.strip_prefix(".wh.") {
        stripped.to_string()
    } else {
        path.replace("/.wh.", "/")
    };

    debug!("Removing path /{}", newpath);
    remove_metadata_subtree(metadata, &metadata_key(&newpath));
    remove_tree_entry(&out_dir.join(normalize_tar_path(Path::new(newpath.as_str()))));
}

/// Handle the `.wh..wh..opq` opaque-directory marker: discard everything
/// accumulated inside the containing directory before this layer's members
/// apply. The directory itself survives.
fn apply_opaque_whiteout(key: &str, rel_path: &Path, out_dir: &Path, metadata: &mut Metadata) {
    let dir_key = match key.rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((dir, _)) => dir.to_string(),
    };
    debug!("Clearing opaque directory {}", dir_key);

    let prefix = if dir_key == "/" {
        "/".to_string()
    } else {
        format!("{}/", dir_key)
    };
    let doomed: Vec<String> = metadata
        .keys()
        .filter(|k| k.starts_with(&prefix) && k.as_str() != dir_key)
        .cloned()
        .collect();
    for k in doomed {
        metadata.remove(&k);
    }

    let host_dir = match rel_path.parent() {
        Some(parent) => out_dir.join(parent),
        None => out_dir.to_path_buf(),
    };
    if host_dir.is_dir() {
        if let Ok(entries) = fs::read_dir(&host_dir) {
            for entry in entries.flatten() {
                remove_tree_entry(&entry.path());
            }
        }
    }
}
