//! Package-manager backends.
//!
//! A [`PackageManager`] answers two questions about an image: which packages
//! are installed, and which paths in the extracted tree no package claims.
//! Queries run inside a throwaway container via
//! [`EngineClient::run_capture`], so the image's own package database and
//! tooling do the work. [`Rpm`] is the default backend; others plug in by
//! implementing the same two operations.

use anyhow::Result;
use log::debug;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::engine::EngineClient;
use crate::extractor::ExtractedImage;

/// An installed package, split out of the manager's NVR string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Package {
    pub name: String,
    pub version: String,
}

/// Splits a name-version-release token: the last two `-`-separated
/// components joined back together are the version, the rest is the name.
///
/// `glibc-common-2.28-42.el8` → (`glibc-common`, `2.28-42.el8`).
pub fn parse_nvr(token: &str) -> Package {
    let elements: Vec<&str> = token.split('-').collect();
    let split = elements.len().saturating_sub(2);
    Package {
        name: elements[..split].join("-"),
        version: elements[split..].join("-"),
    }
}

/// Capability interface of a package manager, queried per image.
pub trait PackageManager {
    /// Returns the name of the backend for identification purposes.
    fn name(&self) -> &str;

    /// Packages installed in the image.
    fn installed_packages(&self, engine: &dyn EngineClient, id: &str) -> Result<Vec<Package>>;

    /// Paths present in the extracted metadata that no installed package
    /// claims.
    fn unowned_files(
        &self,
        engine: &dyn EngineClient,
        image: &ExtractedImage,
    ) -> Result<BTreeSet<String>>;
}

/// Picks a backend from the package database present in the extracted image.
/// RPM is the only built-in backend and the fallback.
pub fn detect(image: &ExtractedImage) -> Box<dyn PackageManager> {
    if !image.metadata.contains_key("/var/lib/rpm") {
        debug!(
            "No known package database found in image {}, assuming rpm",
            image.id
        );
    }
    Box::new(Rpm)
}

/// The RPM backend.
pub struct Rpm;

impl Rpm {
    /// Paths claimed by installed rpms, canonicalized against the extracted
    /// tree.
    ///
    /// Packages disagree about symlinked directories: with `/lib → usr/lib`
    /// one package lists `/lib/foo` and another `/usr/lib/foo` for the same
    /// file. Resolving the directory portion host-side against the tree and
    /// reattaching the basename makes the set operations line up.
    fn owned_files(
        &self,
        engine: &dyn EngineClient,
        image: &ExtractedImage,
    ) -> Result<BTreeSet<String>> {
        // Packages without files make rpm print "(contains no files)".
        let output = engine.run_capture(
            &image.id,
            "rpm -qal | grep -v '(contains no files)'",
        )?;

        let root = fs::canonicalize(&image.tree_root).unwrap_or_else(|_| image.tree_root.clone());
        Ok(output
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| canonicalize_claimed_path(&root, line))
            .collect())
    }
}

impl PackageManager for Rpm {
    fn name(&self) -> &str {
        "rpm"
    }

    fn installed_packages(&self, engine: &dyn EngineClient, id: &str) -> Result<Vec<Package>> {
        let output = engine.run_capture(id, "rpm -qa")?;
        Ok(output.split_whitespace().map(parse_nvr).collect())
    }

    fn unowned_files(
        &self,
        engine: &dyn EngineClient,
        image: &ExtractedImage,
    ) -> Result<BTreeSet<String>> {
        let owned = self.owned_files(engine, image)?;
        Ok(image
            .metadata
            .keys()
            .filter(|path| !owned.contains(*path))
            .cloned()
            .collect())
    }
}

/// Resolve the directory portion of a claimed path against the tree and
/// re-express it image-absolute with the basename reattached. Paths whose
/// directory cannot be resolved inside the tree pass through unchanged.
fn canonicalize_claimed_path(root: &Path, claimed: &str) -> String {
    let trimmed = claimed.trim_start_matches('/');
    let (dir, base) = match trimmed.rsplit_once('/') {
        Some((dir, base)) => (dir, base),
        None => ("", trimmed),
    };

    let host_dir = root.join(dir);
    let resolved = match fs::canonicalize(&host_dir) {
        Ok(resolved) => resolved,
        Err(_) => {
            debug!("Claimed directory {} does not resolve in tree", claimed);
            return format!("/{}", trimmed);
        }
    };

    match resolved.strip_prefix(root) {
        Ok(rel) => {
            let mut path = PathBuf::from("/");
            path.push(rel);
            path.push(base);
            path.to_string_lossy().into_owned()
        }
        Err(_) => {
            // Absolute symlink pointing outside the tree; keep the claim
            // as reported.
            debug!("Claimed path {} escapes the tree after resolution", claimed);
            format!("/{}", trimmed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    #[test]
    fn nvr_splits_on_last_two_dashes() {
        let pkg = parse_nvr("glibc-common-2.28-42.el8");
        assert_eq!(pkg.name, "glibc-common");
        assert_eq!(pkg.version, "2.28-42.el8");

        let pkg = parse_nvr("bash-5.1.8-1.fc35");
        assert_eq!(pkg.name, "bash");
        assert_eq!(pkg.version, "5.1.8-1.fc35");
    }

    #[test]
    fn nvr_short_tokens_follow_the_same_rule() {
        let pkg = parse_nvr("foo");
        assert_eq!(pkg.name, "");
        assert_eq!(pkg.version, "foo");

        let pkg = parse_nvr("a-b");
        assert_eq!(pkg.name, "");
        assert_eq!(pkg.version, "a-b");
    }

    #[test]
    fn claimed_paths_resolve_directory_symlinks() {
        let dir = tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        fs::create_dir_all(root.join("usr/lib")).unwrap();
        fs::write(root.join("usr/lib/libc.so.6"), b"elf").unwrap();
        symlink("usr/lib", root.join("lib")).unwrap();

        assert_eq!(
            canonicalize_claimed_path(&root, "/lib/libc.so.6"),
            "/usr/lib/libc.so.6"
        );
        assert_eq!(
            canonicalize_claimed_path(&root, "/usr/lib/libc.so.6"),
            "/usr/lib/libc.so.6"
        );
    }

    #[test]
    fn unresolvable_claims_pass_through() {
        let dir = tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        assert_eq!(
            canonicalize_claimed_path(&root, "/no/such/dir/file"),
            "/no/such/dir/file"
        );
    }

    #[test]
    fn unowned_files_sees_through_directory_symlinks() {
        use crate::extractor::{ExtractOptions, ExtractedImage};
        use crate::fixtures::{ImageBuilder, LayerTar, MockEngine};

        // The image has /lib -> usr/lib; rpm claims the library via /lib.
        let mut layer = LayerTar::new();
        layer.dir("usr");
        layer.dir("usr/lib");
        layer.file("usr/lib/libc.so.6", b"\x7fELF", 0o755);
        layer.symlink("lib", "usr/lib");

        let mut engine = MockEngine::new();
        engine
            .add_image(MockEngine::DEFAULT_REF, ImageBuilder::new().layer(layer))
            .set_owned_files(&["/lib/libc.so.6"]);

        let out = tempdir().unwrap();
        let image = ExtractedImage::extract(
            &engine,
            MockEngine::DEFAULT_REF,
            out.path(),
            ExtractOptions::default(),
        )
        .unwrap();

        let unowned = Rpm.unowned_files(&engine, &image).unwrap();
        assert!(!unowned.contains("/usr/lib/libc.so.6"));
        assert!(unowned.contains("/lib"));
    }
}
