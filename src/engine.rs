//! Container-engine access.
//!
//! [`EngineClient`] is the capability the rest of the crate consumes: resolve
//! a reference to a canonical image id, export the image archive, read build
//! history and raw inspect metadata, and run a short-lived capture container.
//! [`DockerCli`] implements it by shelling out to the `docker` binary, the
//! same way it talks to every other daemon endpoint: one subprocess per
//! operation, stderr surfaced through the logger.

use anyhow::{anyhow, Context as AnyhowContext, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;

/// One entry of an image's build history.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub created: DateTime<Utc>,
    pub created_by: String,
}

/// Operations the diff pipeline needs from a container engine.
///
/// Implementations must be shareable across the two parallel extractions,
/// hence the `Sync` bound.
pub trait EngineClient: Sync {
    /// Returns the name of the engine for identification purposes.
    fn name(&self) -> &str;

    /// Resolve a user-supplied image reference (tag, short id, digest) to the
    /// canonical 64-hex content id. Shortened or tagged forms never leave
    /// this method.
    fn resolve(&self, reference: &str) -> Result<String>;

    /// Export the image identified by `id` as a tar archive on disk.
    ///
    /// Returns the archive path plus an optional [`TempDir`] that must be
    /// kept alive for as long as the archive is used.
    fn export_image(&self, id: &str) -> Result<(PathBuf, Option<TempDir>)>;

    /// Build history of the image, oldest entry first.
    fn history(&self, id: &str) -> Result<Vec<HistoryEntry>>;

    /// The engine's raw metadata dump for the image, treated as opaque JSON.
    fn inspect(&self, id: &str) -> Result<serde_json::Value>;

    /// Run `command` under `/bin/sh -c` in a throwaway container created from
    /// `id` and return its stdout, smuggled back through a bind-mounted file.
    ///
    /// Engine failures along the way are logged and do not fail the call;
    /// the caller gets whatever output was captured, possibly nothing.
    /// Only trusted, static command strings may be passed here.
    fn run_capture(&self, id: &str, command: &str) -> Result<String>;
}

/// In-container mount point for the capture volume.
const CAPTURE_MOUNT: &str = "/mnt/ocidiff-volume";

/// Docker implementation of [`EngineClient`], driving the `docker` CLI.
pub struct DockerCli {
    host: String,
}

impl DockerCli {
    /// Creates a client talking to the daemon at `host`
    /// (e.g. `unix:///var/run/docker.sock`). The endpoint is fixed for the
    /// lifetime of the client.
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    fn run_command(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("docker")
            .arg("-H")
            .arg(&self.host)
            .args(args)
            .output()
            .with_context(|| format!("Failed to execute docker command: {:?}", args))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("Docker command {:?} failed: {}", args, stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Same as [`run_command`](Self::run_command) but demoted to a log line on
    /// failure; used for the permissive parts of the capture lifecycle.
    fn run_command_logged(&self, args: &[&str]) -> Option<String> {
        match self.run_command(args) {
            Ok(out) => Some(out),
            Err(err) => {
                error!("{:#}", err);
                None
            }
        }
    }
}

/// Removes the capture container even when the caller bails out early.
struct CaptureContainer<'a> {
    cli: &'a DockerCli,
    id: String,
    removed: bool,
}

impl CaptureContainer<'_> {
    fn remove(&mut self) {
        if self.removed {
            return;
        }
        self.cli.run_command_logged(&["stop", &self.id]);
        self.cli.run_command_logged(&["rm", &self.id]);
        self.removed = true;
    }
}

impl Drop for CaptureContainer<'_> {
    fn drop(&mut self) {
        if !self.removed {
            self.cli.run_command_logged(&["rm", "-f", &self.id]);
        }
    }
}

fn is_hex_id(id: &str) -> bool {
    id.len() == 64 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

impl EngineClient for DockerCli {
    fn name(&self) -> &str {
        "docker"
    }

    fn resolve(&self, reference: &str) -> Result<String> {
        let stdout = self
            .run_command(&["inspect", "--type", "image", "--format", "{{.Id}}", reference])
            .with_context(|| format!("Can't find image {}", reference))?;

        let id = stdout.trim();
        let id = id.strip_prefix("sha256:").unwrap_or(id);
        if !is_hex_id(id) {
            return Err(anyhow!("Engine returned malformed image id {:?} for {}", id, reference));
        }
        debug!("Resolved {} to {}", reference, id);
        Ok(id.to_string())
    }

    fn export_image(&self, id: &str) -> Result<(PathBuf, Option<TempDir>)> {
        let temp_dir = TempDir::new().context("Failed to create temporary directory")?;
        let tarball_path = temp_dir.path().join("image.tar");

        info!("Saving image {}", id);
        self.run_command(&["save", "-o", &tarball_path.to_string_lossy(), id])
            .with_context(|| format!("Failed to export image {}", id))?;

        Ok((tarball_path, Some(temp_dir)))
    }

    fn history(&self, id: &str) -> Result<Vec<HistoryEntry>> {
        #[derive(Deserialize)]
        struct RawEntry {
            #[serde(rename = "CreatedAt", default)]
            created_at: String,
            #[serde(rename = "CreatedBy", default)]
            created_by: String,
        }

        let stdout = self
            .run_command(&["history", "--no-trunc", "--format", "{{json .}}", id])
            .with_context(|| format!("Failed to read history of image {}", id))?;

        // The CLI prints newest first, one JSON object per line.
        let mut entries = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let raw: RawEntry = serde_json::from_str(line)
                .with_context(|| format!("Failed to parse history entry: {}", line))?;
            let created = DateTime::parse_from_rfc3339(&raw.created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_default();
            entries.push(HistoryEntry {
                created,
                created_by: raw.created_by,
            });
        }
        entries.reverse();
        Ok(entries)
    }

    fn inspect(&self, id: &str) -> Result<serde_json::Value> {
        let stdout = self
            .run_command(&["inspect", "--type", "image", id])
            .with_context(|| format!("Failed to inspect image {}", id))?;

        let parsed: Vec<serde_json::Value> =
            serde_json::from_str(&stdout).context("Failed to parse docker inspect output")?;
        parsed
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Empty inspect output for image {}", id))
    }

    fn run_capture(&self, id: &str, command: &str) -> Result<String> {
        info!("Running '{}' in image {}", command, id);

        let volume_dir = tempfile::Builder::new()
            .prefix("ocidiff-volume-")
            .tempdir()
            .context("Failed to create capture volume directory")?;
        debug!("Container output volume: {}", volume_dir.path().display());

        // The prologue creates a world-writable output file inside the mount
        // and redirects the command's stdout into it.
        let script = format!(
            "set -m; touch {mount}/output; chmod a+rw {mount}/output; exec 1>{mount}/output; {command}",
            mount = CAPTURE_MOUNT,
            command = command,
        );
        let bind = format!("{}:{}:Z", volume_dir.path().display(), CAPTURE_MOUNT);
        let uid = rustix::process::geteuid().as_raw().to_string();

        let created = match self.run_command(&[
            "create", "--user", &uid, "-v", &bind, id, "/bin/sh", "-c", &script,
        ]) {
            Ok(out) => out,
            Err(err) => {
                // Downstream parsers treat empty output as "nothing
                // installed"; a broken engine should not kill the diff.
                error!("{:#}", err);
                return Ok(String::new());
            }
        };
        let mut container = CaptureContainer {
            cli: self,
            id: created.trim().to_string(),
            removed: false,
        };

        self.run_command_logged(&["start", &container.id]);
        // Block until the container exits; the output file is undefined
        // before that.
        self.run_command_logged(&["wait", &container.id]);
        // `docker logs` replays container stdout and stderr on the matching
        // host streams; surface both.
        if let Ok(out) = Command::new("docker")
            .arg("-H")
            .arg(&self.host)
            .args(["logs", &container.id])
            .output()
        {
            for stream in [&out.stdout, &out.stderr] {
                let logs = String::from_utf8_lossy(stream);
                if !logs.trim().is_empty() {
                    error!("{}", logs.trim_end());
                }
            }
        }
        container.remove();

        let output_file = volume_dir.path().join("output");
        let output = match fs::read_to_string(&output_file) {
            Ok(content) => content,
            Err(err) => {
                error!("No output captured from container {}: {}", container.id, err);
                String::new()
            }
        };
        Ok(output)
    }
}
