//! Diff of image build history.
//!
//! The history commands of both images are normalized to look like
//! Dockerfile instructions and compared chronologically.

use anyhow::Result;
use log::info;

use crate::diffutil;
use crate::engine::{EngineClient, HistoryEntry};
use crate::extractor::ExtractedImage;
use crate::modules::{Context, DiffModule, ModuleResult};

/// Metadata instructions are recorded with this shell prefix even though no
/// shell ever ran them.
const NOP_PREFIX: &str = "/bin/sh -c #(nop) ";

pub struct History;

impl DiffModule for History {
    fn name(&self) -> &'static str {
        "history"
    }

    /// Adds the `history` key: changed build commands between the two
    /// images, oldest first.
    fn run(
        &self,
        image1: &ExtractedImage,
        image2: &ExtractedImage,
        ctx: &Context<'_>,
    ) -> Result<ModuleResult> {
        info!("Testing history of the image");

        let commands1 = build_commands(ctx.engine, &image1.id)?;
        let commands2 = build_commands(ctx.engine, &image2.id)?;
        let diff = diffutil::changed_lines(&commands1, &commands2);

        let mut result = ModuleResult::new();
        result.insert("history".to_string(), diff.into());
        Ok(result)
    }
}

/// The commands used to create an image, in build order.
fn build_commands(engine: &dyn EngineClient, id: &str) -> Result<Vec<String>> {
    Ok(engine
        .history(id)?
        .iter()
        .map(normalize_command)
        .collect())
}

fn normalize_command(entry: &HistoryEntry) -> String {
    entry
        .created_by
        .strip_prefix(NOP_PREFIX)
        .unwrap_or(&entry.created_by)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(created_by: &str) -> HistoryEntry {
        HistoryEntry {
            created: Utc::now(),
            created_by: created_by.to_string(),
        }
    }

    #[test]
    fn nop_prefix_is_stripped() {
        assert_eq!(
            normalize_command(&entry("/bin/sh -c #(nop) ENV FOO=bar")),
            "ENV FOO=bar"
        );
    }

    #[test]
    fn run_commands_keep_their_shell() {
        assert_eq!(
            normalize_command(&entry("/bin/sh -c dnf install -y vim")),
            "/bin/sh -c dnf install -y vim"
        );
        assert_eq!(normalize_command(&entry("CMD [\"bash\"]")), "CMD [\"bash\"]");
    }
}
