//! The vector-tile publisher collaborator.
//!
//! Vector basemaps ship as tile packages through an external publisher;
//! this module only drives the configured command.

use anyhow::{bail, Context};
use tokio::process::Command;
use tracing::info;

/// Runs the configured vector-tile publish command per basemap.
#[derive(Debug, Clone)]
pub struct VectorPublisher {
    command: Vec<String>,
}

impl VectorPublisher {
    /// `command` is the program followed by its base arguments.
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    /// Build and publish one vector basemap.
    pub async fn publish(&self, name: &str) -> anyhow::Result<()> {
        let (program, base_args) = self
            .command
            .split_first()
            .context("no vector publish command configured")?;

        info!("building tiles for: {}", name);
        let output = Command::new(program)
            .args(base_args)
            .arg("--name")
            .arg(name)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "vector publish for {} exited with {}: {}",
                name,
                output.status,
                stderr.trim()
            );
        }

        info!("vector tile package for {} published", name);
        Ok(())
    }
}
