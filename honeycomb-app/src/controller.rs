//! Top-level dispatch: wires the pipeline's components from configuration
//! and maps each CLI command onto them.

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::{info, warn};

use honeycomb_pipeline::{
    wait_until_hour, CacheOptions, DataRefresher, HttpJournal, HttpObjectStore, JobStore,
    Orchestrator, OrchestratorSettings, ProcessRefresher, ProcessRenderer, RefreshOptions,
    RendererConfig, SmtpNotifier, StatsStore, TileCatalog, UploadConfig, Uploader,
};

use crate::config::AppConfig;
use crate::vector::VectorPublisher;

/// Owns the loaded configuration and builds pipeline components on demand.
pub struct Controller {
    config_dir: PathBuf,
    config: AppConfig,
}

impl Controller {
    pub fn load(config_dir: PathBuf) -> anyhow::Result<Self> {
        let config = AppConfig::load(&config_dir)?;
        Ok(Self { config_dir, config })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn orchestrator(&self) -> anyhow::Result<Orchestrator> {
        let caches_dir = self.config.resolve_caches_dir()?;
        let extents_db = self
            .config
            .extents_db
            .clone()
            .context("extents_db is not configured")?;

        let catalog = TileCatalog::new(&caches_dir);
        let store = Arc::new(HttpObjectStore::new()?);
        let notifier = Arc::new(SmtpNotifier::new(
            self.config.notify.clone(),
            self.config.send_emails,
        ));

        let uploader = Uploader::new(
            store,
            notifier.clone(),
            catalog.clone(),
            UploadConfig {
                pool_size: self.config.upload_pool_size,
                discover_url: self.config.discover_url.clone(),
                ..UploadConfig::default()
            },
        );

        let renderer = Arc::new(ProcessRenderer::new(RendererConfig {
            toolbox: self.config.renderer_command.clone(),
            project: self
                .config
                .project_path
                .clone()
                .context("project_path is not configured")?,
            caches_dir,
            extents_db: extents_db.clone(),
            parallel_factor: self.config.parallel_factor.clone(),
        }));

        Ok(Orchestrator::new(
            renderer,
            Arc::new(ProcessRefresher::new(self.config.etl_command.clone())),
            notifier,
            Arc::new(HttpJournal::new(
                self.config.changelog_url.clone(),
                self.config.status_url.clone(),
            )),
            uploader,
            JobStore::new(&self.config_dir),
            StatsStore::new(&self.config_dir),
            TileCatalog::new(self.config.resolve_caches_dir()?),
            self.config.scheme.clone().unwrap_or_default(),
            OrchestratorSettings {
                extents_db,
                preview_url: self.config.preview_url.clone(),
                nightly_hour: self.config.nightly_hour,
            },
        ))
    }

    /// Full cache and upload for one basemap.
    pub async fn cache(&self, name: &str, options: CacheOptions) -> anyhow::Result<()> {
        let basemap = self.config.basemap(name)?;
        self.orchestrator()?.cache(&basemap, options).await?;
        Ok(())
    }

    /// Continue the persisted job.
    pub async fn resume(&self) -> anyhow::Result<()> {
        let orchestrator = self.orchestrator()?;
        let job = orchestrator
            .pending_job()
            .context("there is no job to resume")?;
        let basemap = self.config.basemap(&job.cache_args.basemap)?;
        orchestrator.resume(&basemap).await?;
        Ok(())
    }

    /// Upload-only for an already-exploded cache.
    pub async fn upload(&self, name: &str) -> anyhow::Result<()> {
        let basemap = self.config.basemap(name)?;
        let report = self.orchestrator()?.upload_only(&basemap).await?;
        info!(
            "{}: {} uploaded, {} skipped, {} errors",
            name,
            report.uploaded,
            report.skipped,
            report.errors.len()
        );
        Ok(())
    }

    /// Interactive walk over the loop-eligible basemaps.
    pub async fn run_loop(&self) -> anyhow::Result<()> {
        let basemaps = self.config.loop_basemaps();
        if basemaps.is_empty() {
            bail!("no basemaps are flagged for the loop command");
        }

        let stdin = io::stdin();
        for basemap in basemaps {
            print!("cache {}? (Y/n): ", basemap.name);
            io::stdout().flush()?;

            let mut answer = String::new();
            stdin.lock().read_line(&mut answer)?;
            if answer.trim().eq_ignore_ascii_case("n") {
                continue;
            }

            self.orchestrator()?
                .cache(&basemap, CacheOptions::default())
                .await?;
        }

        Ok(())
    }

    /// Remove the live job file and every basemap's compact-cache level
    /// directories.
    pub fn cleanup(&self) -> anyhow::Result<()> {
        info!("cleaning up current job data...");
        let job_path = JobStore::new(&self.config_dir).path().to_path_buf();
        if job_path.exists() {
            fs::remove_file(&job_path)?;
        }

        let catalog = TileCatalog::new(self.config.resolve_caches_dir()?);
        for name in self.config.basemap_names() {
            info!("cleaning up {} tiles...", name);
            for level_dir in catalog.compact_level_dirs(&name)? {
                info!("deleting {}...", level_dir.display());
                fs::remove_dir_all(&level_dir)?;
            }
        }

        Ok(())
    }

    /// Print average durations per basemap and task.
    pub fn print_stats(&self) {
        let summary = StatsStore::new(&self.config_dir).summary();

        println!("Average processing times:");
        println!("{:<24} {:<20} {:<20}", "basemap", "cache", "upload");
        for row in summary {
            println!(
                "{:<24} {:<20} {:<20}",
                row.basemap,
                describe_duration(row.cache_average),
                describe_duration(row.upload_average)
            );
        }
    }

    /// Run the external data refresh on its own.
    pub async fn update_data(
        &self,
        options: RefreshOptions,
        dont_wait: bool,
    ) -> anyhow::Result<()> {
        if !dont_wait {
            if let Some(hour) = self.config.nightly_hour {
                wait_until_hour(hour).await;
            }
        }

        ProcessRefresher::new(self.config.etl_command.clone())
            .refresh(&options)
            .await?;
        Ok(())
    }

    /// Publish one vector basemap.
    pub async fn vector(&self, name: &str) -> anyhow::Result<()> {
        VectorPublisher::new(self.config.vector_command.clone())
            .publish(name)
            .await
    }

    /// Publish every registered vector basemap, continuing past failures.
    pub async fn vector_all(&self) -> anyhow::Result<()> {
        if self.config.vector_basemaps.is_empty() {
            bail!("no vector basemaps are configured");
        }

        let publisher = VectorPublisher::new(self.config.vector_command.clone());
        for name in &self.config.vector_basemaps {
            if let Err(err) = publisher.publish(name).await {
                warn!("vector publish failed for {}: {}", name, err);
            }
        }
        Ok(())
    }
}

/// Rough humanized duration for the stats table.
fn describe_duration(duration: Option<Duration>) -> String {
    let Some(duration) = duration else {
        return "no runs recorded".to_string();
    };

    let secs = duration.as_secs();
    if secs < 60 {
        format!("{} seconds", secs)
    } else if secs < 3600 {
        format!("{} minutes", secs / 60)
    } else {
        let hours = secs / 3600;
        let minutes = (secs % 3600) / 60;
        if minutes == 0 {
            format!("{} hours", hours)
        } else {
            format!("{} hours {} minutes", hours, minutes)
        }
    }
}
