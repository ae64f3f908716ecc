//! Diff modules.
//!
//! Each module compares one facet of the two extracted images and
//! contributes a keyed fragment to the result document. The built-ins are
//! registered statically in [`builtin`]; their top-level keys are disjoint
//! by contract, so merging the fragments is a plain map union.

pub mod files;
pub mod history;
pub mod metadata;
pub mod packages;

use anyhow::Result;

use crate::engine::EngineClient;
use crate::extractor::ExtractedImage;

/// State shared with every module run: the engine the images came from and
/// the output verbosity. Immutable for the lifetime of the run.
pub struct Context<'a> {
    pub engine: &'a dyn EngineClient,
    pub silent: bool,
}

/// A module's contribution to the result document.
pub type ModuleResult = serde_json::Map<String, serde_json::Value>;

/// One facet comparator. Failures fail the whole run; a diff tool that
/// silently drops a facet produces worse data than one that crashes.
pub trait DiffModule {
    /// The result key this module owns.
    fn name(&self) -> &'static str;

    fn run(
        &self,
        image1: &ExtractedImage,
        image2: &ExtractedImage,
        ctx: &Context<'_>,
    ) -> Result<ModuleResult>;
}

/// The built-in modules, in execution order.
pub fn builtin() -> Vec<Box<dyn DiffModule>> {
    vec![
        Box::new(files::Files),
        Box::new(packages::Packages),
        Box::new(metadata::Metadata),
        Box::new(history::History),
    ]
}
