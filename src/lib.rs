//! This crate computes a structured difference between two container images.
//! Both images are materialized by replaying their layers (whiteout deletions
//! honored) into temporary trees, per-path attributes are captured side-band
//! from the layer archives, and a set of diff modules each contribute one
//! keyed fragment to a single JSON result document:
//!
//! - `files` — added/removed/modified files not owned by the package manager,
//!   with MIME types, content diffs and attribute diffs.
//! - `packages` — installed-package delta, queried by running the image's
//!   package manager inside a throwaway container.
//! - `metadata` — changed lines between the flattened engine inspect dumps.
//! - `history` — changed build commands between the two images.
//!
//! # Usage
//!
//! `ocidiff [OPTIONS] <IMAGE1> <IMAGE2>`
//!
//! Arguments:
//! - `<IMAGE1>`, `<IMAGE2>` Image references or IDs to compare
//! - Options:
//!     - `-s` `--silent`  Abbreviated `modified` entries in the `files` output
//!     - `-f` `--filter [FILE]`  Enable output filtering; built-in rules when no file is given
//!     - `-o` `--output <FILE>`  Write the result JSON to a file instead of stdout
//!     - `-p` `--preserve [DIR]`  Keep the extracted trees; `DIR` is the extraction parent (`/tmp` by default)
//!     - `--host <SOCKET>`  Engine daemon socket `[default: unix:///var/run/docker.sock]`
//!     - `-l` `--logging <LEVEL>`  Log verbosity: 10, 20, 30, 40 or 50 `[default: 30]`
//!     - `-d` `--debug`  Same as `-l 10`
//!     - `-V` `--version` Print version information
//!
//! # Example
//!
//! ```ocidiff fedora:41 fedora:42```
//!
//! prints a single JSON object of the form:
//!
//! ```text
//! {
//!   "files":    {"added": [...], "removed": [...], "modified": [...]},
//!   "packages": {"added": [...], "removed": [...], "modified": [...]},
//!   "metadata": ["-...", "+..."],
//!   "history":  ["-...", "+..."]
//! }
//! ```

pub mod diffutil;
pub mod engine;
pub mod extractor;
pub mod filter;
pub mod mime;
pub mod modules;
pub mod package_manager;
pub mod processor;

#[cfg(any(test, feature = "test-utils"))]
pub mod fixtures;

// Re-exports for easy access
pub use engine::{DockerCli, EngineClient, HistoryEntry};
pub use extractor::{ExtractOptions, ExtractedImage, FileAttrs, Metadata};
pub use package_manager::{Package, PackageManager};
pub use processor::{DiffOptions, DiffRunner, FilterSource};
