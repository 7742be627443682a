//! The operator journal: the changelog and basemap-status records kept
//! outside the pipeline.
//!
//! Only the contract lives here; the production implementation posts rows
//! to the journal service and the orchestrator treats every failure as
//! log-worthy but never fatal.

use async_trait::async_trait;
use chrono::Local;
use serde_json::json;
use tracing::debug;

use crate::error::PipelineError;

/// Records completed rebuilds where operators look for them.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Append a rebuild row to the changelog.
    async fn append_changelog(&self, basemap: &str) -> Result<(), PipelineError>;

    /// Update the basemap's "last updated" marker.
    async fn touch_last_updated(&self, basemap: &str) -> Result<(), PipelineError>;
}

/// HTTP journal posting JSON rows to configured endpoints. Endpoints left
/// unset are skipped, so a dev setup needs no journal service at all.
#[derive(Debug, Clone)]
pub struct HttpJournal {
    client: reqwest::Client,
    changelog_url: Option<String>,
    status_url: Option<String>,
}

impl HttpJournal {
    pub fn new(changelog_url: Option<String>, status_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            changelog_url,
            status_url,
        }
    }
}

#[async_trait]
impl Journal for HttpJournal {
    async fn append_changelog(&self, basemap: &str) -> Result<(), PipelineError> {
        let Some(url) = &self.changelog_url else {
            debug!("no changelog endpoint configured; skipping");
            return Ok(());
        };

        let row = json!({
            "date": Local::now().format("%m/%d/%Y").to_string(),
            "status": "Complete",
            "name": basemap,
            "action": "Recache",
            "description": "Statewide cache rebuild and upload",
        });

        let response = self.client.post(url).json(&row).send().await?;
        if !response.status().is_success() {
            return Err(PipelineError::http(format!(
                "changelog endpoint returned {}",
                response.status()
            )));
        }

        Ok(())
    }

    async fn touch_last_updated(&self, basemap: &str) -> Result<(), PipelineError> {
        let Some(url) = &self.status_url else {
            debug!("no status endpoint configured; skipping");
            return Ok(());
        };

        let row = json!({
            "name": basemap,
            "lastUpdated": Local::now().format("%b %Y").to_string(),
        });

        let response = self.client.post(url).json(&row).send().await?;
        if !response.status().is_success() {
            return Err(PipelineError::http(format!(
                "status endpoint returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}
