//! The source-data refresh collaborator.
//!
//! The refresh itself is an external geospatial ETL; the pipeline only
//! invokes it and optionally holds the run until the configured nightly
//! hour so the rewrite does not compete with daytime edits.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, Timelike};
use tokio::process::Command;
use tracing::info;

use crate::error::PipelineError;
use crate::types::RefreshOptions;

/// Refreshes the local feature classes the basemaps render from.
#[async_trait]
pub trait DataRefresher: Send + Sync {
    async fn refresh(&self, options: &RefreshOptions) -> Result<(), PipelineError>;
}

/// Runs the configured ETL command as a child process.
#[derive(Debug, Clone)]
pub struct ProcessRefresher {
    command: Vec<String>,
}

impl ProcessRefresher {
    /// `command` is the program followed by its base arguments.
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl DataRefresher for ProcessRefresher {
    async fn refresh(&self, options: &RefreshOptions) -> Result<(), PipelineError> {
        let (program, base_args) = self
            .command
            .split_first()
            .ok_or_else(|| PipelineError::config("no data-refresh command configured"))?;

        let mut command = Command::new(program);
        command.args(base_args);
        if options.static_only {
            command.arg("--static-only");
        }
        if options.sgid_only {
            command.arg("--sgid-only");
        }
        if options.external_only {
            command.arg("--external-only");
        }

        info!("running data refresh: {}", program);
        let output = command.output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::internal(format!(
                "data refresh exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(())
    }
}

/// Sleep until the next occurrence of `hour` (local time, 0-23). Returns
/// immediately when the clock is already inside that hour.
pub async fn wait_until_hour(hour: u32) {
    let now = Local::now();
    if now.hour() == hour {
        return;
    }

    let hours_ahead = (24 + hour - now.hour() - 1) % 24;
    let minutes = 60 - now.minute();
    let wait = Duration::from_secs((hours_ahead * 60 + minutes) as u64 * 60);

    info!("waiting {:?} until the nightly window (hour {})", wait, hour);
    tokio::time::sleep(wait).await;
}
