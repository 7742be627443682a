//! Drives a basemap through its full lifecycle: data refresh, test cache,
//! phase-keyed production build, explode, upload, journal, cleanup.
//!
//! Every phase transition is persisted to the job file before the next
//! external action, so a crash at any point resumes from the last finished
//! phase. Render failures never abort the run; they queue on an in-memory
//! error list and a retry pass drains the list once the main loops finish.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::catalog::TileCatalog;
use crate::error::PipelineError;
use crate::job::{CacheArgs, Job, JobStore};
use crate::journal::Journal;
use crate::notify::Notifier;
use crate::refresh::{wait_until_hour, DataRefresher};
use crate::renderer::{Renderer, JOB_STATUS_LOST};
use crate::scheme::{intersect_levels, LevelRange, TileScheme};
use crate::stats::{StatsStore, Task};
use crate::types::{Basemap, BuildMode, RefreshOptions, UploadReport};
use crate::uploader::Uploader;

/// Upper bound on completeness-driven production rebuilds.
const COMPLETENESS_RETRY_CAP: u32 = 3;

/// Options for one cache run.
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// Preserve existing tiles and only fill gaps.
    pub missing_only: bool,
    /// Skip the source-data refresh.
    pub skip_update: bool,
    /// Skip the test cache.
    pub skip_test: bool,
    /// Bound the build to this polygon instead of the scheme's phases.
    pub spot: Option<PathBuf>,
    /// Restrict every build to these levels.
    pub levels: Option<LevelRange>,
    /// Refresh data immediately instead of waiting for the nightly window.
    pub dont_wait: bool,
}

impl CacheOptions {
    /// Reconstruct the options persisted in a job's cache args.
    pub fn from_args(args: &CacheArgs) -> Self {
        Self {
            missing_only: args.missing_only,
            skip_update: args.skip_update,
            skip_test: args.skip_test,
            spot: args.spot.clone(),
            levels: args.levels,
            dont_wait: false,
        }
    }

    fn to_args(&self, basemap: &str) -> CacheArgs {
        CacheArgs {
            basemap: basemap.to_string(),
            missing_only: self.missing_only,
            skip_update: self.skip_update,
            skip_test: self.skip_test,
            spot: self.spot.clone(),
            levels: self.levels,
        }
    }
}

/// Deployment-level settings the orchestrator needs beyond its collaborators.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Geodatabase holding the extent and grid feature classes.
    pub extents_db: PathBuf,
    /// Base URL for preview links embedded in notifications.
    pub preview_url: Option<String>,
    /// Local hour (0-23) the data refresh waits for, unless `dont_wait`.
    pub nightly_hour: Option<u32>,
}

/// A failed phase queued for the retry pass.
struct PhaseFailure {
    levels: Vec<usize>,
    aoi: PathBuf,
    name: String,
    key: Option<String>,
    mode: BuildMode,
}

/// Mutable state threaded through one cache run.
struct RunState {
    job: Job,
    restrict: Option<Vec<usize>>,
    errors: Vec<PhaseFailure>,
    start_bundles: u64,
    started: Instant,
    subject: String,
    preview: Option<String>,
}

/// Coordinates a basemap's cache build and upload.
pub struct Orchestrator {
    renderer: Arc<dyn Renderer>,
    refresher: Arc<dyn DataRefresher>,
    notifier: Arc<dyn Notifier>,
    journal: Arc<dyn Journal>,
    uploader: Uploader,
    jobs: JobStore,
    stats: StatsStore,
    catalog: TileCatalog,
    scheme: TileScheme,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        renderer: Arc<dyn Renderer>,
        refresher: Arc<dyn DataRefresher>,
        notifier: Arc<dyn Notifier>,
        journal: Arc<dyn Journal>,
        uploader: Uploader,
        jobs: JobStore,
        stats: StatsStore,
        catalog: TileCatalog,
        scheme: TileScheme,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            renderer,
            refresher,
            notifier,
            journal,
            uploader,
            jobs,
            stats,
            catalog,
            scheme,
            settings,
        }
    }

    /// The persisted job, if a run is in flight.
    pub fn pending_job(&self) -> Option<Job> {
        self.jobs.load()
    }

    /// Build and upload a basemap from scratch. Fails immediately if a job
    /// is already in flight.
    pub async fn cache(
        &self,
        basemap: &Basemap,
        options: CacheOptions,
    ) -> Result<(), PipelineError> {
        info!("caching {}", basemap.name);
        let job = self.jobs.start(options.to_args(&basemap.name))?;
        self.run(basemap, options, job).await
    }

    /// Continue the persisted job from its last checkpoint. Finished tiles
    /// are preserved, so the build switches to missing-only regardless of
    /// the original arguments.
    pub async fn resume(&self, basemap: &Basemap) -> Result<(), PipelineError> {
        let mut job = self
            .jobs
            .load()
            .ok_or_else(|| PipelineError::job_state("no job to resume"))?;

        if job.cache_args.basemap != basemap.name {
            return Err(PipelineError::job_state(format!(
                "the persisted job is for {}, not {}",
                job.cache_args.basemap, basemap.name
            )));
        }

        self.jobs
            .update(&mut job, |j| j.restart_times.push(Utc::now()))?;

        let mut options = CacheOptions::from_args(&job.cache_args);
        options.missing_only = true;

        info!(
            "resuming {} (restart #{})",
            basemap.name,
            job.restart_times.len()
        );
        self.run(basemap, options, job).await
    }

    /// Run only the upload for a basemap whose exploded tree is on disk.
    pub async fn upload_only(&self, basemap: &Basemap) -> Result<UploadReport, PipelineError> {
        self.stats.record_start(&basemap.name, Task::Upload)?;
        let report = self
            .uploader
            .upload(basemap, false, self.preview_url(&basemap.name).as_deref())
            .await?;
        self.stats.record_finish(&basemap.name, Task::Upload)?;
        Ok(report)
    }

    async fn run(
        &self,
        basemap: &Basemap,
        options: CacheOptions,
        job: Job,
    ) -> Result<(), PipelineError> {
        self.stats.record_start(&basemap.name, Task::Cache)?;

        let result = self.build(basemap, &options, job).await;

        if let Err(err) = &result {
            // The job file stays in place so a later resume can continue;
            // stats finalization is the only cleanup that runs on failure.
            warn!("cache run for {} failed: {}", basemap.name, err);
            let _ = self.stats.record_finish(&basemap.name, Task::Cache);
        }

        result
    }

    async fn build(
        &self,
        basemap: &Basemap,
        options: &CacheOptions,
        job: Job,
    ) -> Result<(), PipelineError> {
        let mut state = RunState {
            restrict: options.levels.map(|range| range.levels()),
            errors: Vec::new(),
            start_bundles: 0,
            started: Instant::now(),
            subject: format!("Cache Update ({})", basemap.name),
            preview: self.preview_url(&basemap.name),
            job,
        };

        if !state.job.caching_complete {
            self.renderer.validate_layers(basemap).await?;
            self.update_data(options, &mut state).await?;
            self.test_cache(basemap, options, &mut state).await?;

            if !options.missing_only {
                self.catalog.delete_compact(&basemap.name)?;
                self.catalog.delete_exploded(&basemap.name)?;
            }
            state.start_bundles = self.catalog.count_bundles(&basemap.name)?;
            state.started = Instant::now();

            if let Some(spot) = options.spot.clone() {
                self.spot_build(basemap, options, &mut state, &spot).await?;
            } else {
                self.production_build(basemap, &mut state).await?;
            }

            self.jobs
                .update(&mut state.job, |j| j.caching_complete = true)?;
        }

        self.stats.record_finish(&basemap.name, Task::Cache)?;

        if !state.job.exploding_complete {
            self.renderer.explode(basemap).await?;
            self.jobs
                .update(&mut state.job, |j| j.exploding_complete = true)?;
        }

        let body = match &state.preview {
            Some(url) => format!("Caching complete!\n\n{}", url),
            None => "Caching complete!".to_string(),
        };
        self.notifier
            .notify(&format!("{} Finished", state.subject), &body)
            .await;

        self.stats.record_start(&basemap.name, Task::Upload)?;
        self.uploader
            .upload(basemap, false, state.preview.as_deref())
            .await?;
        self.stats.record_finish(&basemap.name, Task::Upload)?;

        if let Err(err) = self.journal.append_changelog(&basemap.name).await {
            warn!("could not append changelog row: {}", err);
        }
        if let Err(err) = self.journal.touch_last_updated(&basemap.name).await {
            warn!("could not update basemap status: {}", err);
        }

        self.jobs.finish()?;
        info!("{} complete", basemap.name);
        Ok(())
    }

    async fn update_data(
        &self,
        options: &CacheOptions,
        state: &mut RunState,
    ) -> Result<(), PipelineError> {
        if options.skip_update {
            info!("skipping data update");
            return Ok(());
        }
        if state.job.data_updated {
            debug!("data already updated this job");
            return Ok(());
        }

        if !options.dont_wait {
            if let Some(hour) = self.settings.nightly_hour {
                wait_until_hour(hour).await;
            }
        }

        self.refresher.refresh(&RefreshOptions::default()).await?;
        self.jobs.update(&mut state.job, |j| j.data_updated = true)?;
        self.notifier
            .notify(
                &state.subject,
                "Data update complete. Proceeding with caching...",
            )
            .await;
        Ok(())
    }

    async fn test_cache(
        &self,
        basemap: &Basemap,
        options: &CacheOptions,
        state: &mut RunState,
    ) -> Result<(), PipelineError> {
        if options.skip_test || state.job.test_cache_complete || options.spot.is_some() {
            info!("skipping test cache");
            return Ok(());
        }

        // The test cache is a full rebuild over the small test polygon; any
        // failure here is fatal since the real build would fail the same way.
        self.catalog.delete_compact(&basemap.name)?;
        self.catalog.delete_exploded(&basemap.name)?;

        let levels = intersect_levels(&self.scheme.all_levels(), state.restrict.as_deref());
        if !levels.is_empty() {
            let scales = self.scheme.scale_values(&levels);
            self.renderer
                .build_tiles(
                    basemap,
                    &scales,
                    &self.extent_path(&self.scheme.test_extent),
                    BuildMode::RecreateAll,
                )
                .await?;
        }

        self.renderer.explode(basemap).await?;
        self.uploader
            .upload(basemap, true, state.preview.as_deref())
            .await?;

        self.jobs
            .update(&mut state.job, |j| j.test_cache_complete = true)?;
        Ok(())
    }

    /// A bounded build covering only the supplied polygon: the statewide
    /// levels against the polygon itself, the grid levels against its
    /// intersection with the high-level cache extent.
    async fn spot_build(
        &self,
        basemap: &Basemap,
        options: &CacheOptions,
        state: &mut RunState,
        spot: &Path,
    ) -> Result<(), PipelineError> {
        let mode = if options.missing_only {
            BuildMode::RecreateEmpty
        } else {
            BuildMode::RecreateAll
        };

        let mut statewide: Vec<usize> = Vec::new();
        for extent in &self.scheme.extents {
            statewide.extend(extent.levels.0..=extent.levels.1);
        }
        let statewide = intersect_levels(&statewide, state.restrict.as_deref());
        if !statewide.is_empty() {
            info!("spot caching levels {:?}", statewide);
            self.build_phase(
                basemap,
                state,
                statewide,
                spot.to_path_buf(),
                "spot cache".to_string(),
                None,
                mode,
            )
            .await?;
        }

        let grid_levels: Vec<usize> = self.scheme.grids.iter().map(|grid| grid.level).collect();
        let grid_levels = intersect_levels(&grid_levels, state.restrict.as_deref());
        if !grid_levels.is_empty() {
            let aoi = self
                .renderer
                .intersect(spot, &self.extent_path(&self.scheme.high_level_extent))
                .await?;
            info!("spot caching levels {:?}", grid_levels);
            self.build_phase(
                basemap,
                state,
                grid_levels,
                aoi,
                "spot cache".to_string(),
                None,
                mode,
            )
            .await?;
        }

        self.drain_errors(basemap, state).await
    }

    async fn production_build(
        &self,
        basemap: &Basemap,
        state: &mut RunState,
    ) -> Result<(), PipelineError> {
        let mut skip_completed = true;
        let mut attempts = 0;

        loop {
            self.production_pass(basemap, state, skip_completed).await?;
            self.drain_errors(basemap, state).await?;

            // A shortfall against the expected bundle count means some
            // phases silently produced nothing; revisit everything in
            // recreate-empty mode, a bounded number of times.
            let bundles = self.catalog.count_bundles(&basemap.name)?;
            match self.scheme.expected_bundles(&basemap.name) {
                Some(expected)
                    if state.restrict.is_none()
                        && bundles < expected
                        && attempts < COMPLETENESS_RETRY_CAP =>
                {
                    attempts += 1;
                    skip_completed = false;
                    let message = format!(
                        "Only {} out of {} bundles completed. Recaching...",
                        bundles, expected
                    );
                    warn!("{}", message);
                    self.notifier.notify(&state.subject, &message).await;
                }
                _ => break,
            }
        }

        Ok(())
    }

    async fn production_pass(
        &self,
        basemap: &Basemap,
        state: &mut RunState,
        skip_completed: bool,
    ) -> Result<(), PipelineError> {
        for extent in &self.scheme.extents {
            let declared: Vec<usize> = (extent.levels.0..=extent.levels.1).collect();
            let levels = intersect_levels(&declared, state.restrict.as_deref());
            if levels.is_empty() {
                continue;
            }

            let key = extent_phase_key(&extent.name, &levels);
            if skip_completed && state.job.phase_complete(&key) {
                debug!("skipping completed phase: {}", key);
                continue;
            }

            let aoi = self.extent_path(&extent.name);
            self.build_phase(
                basemap,
                state,
                levels,
                aoi,
                extent.name.clone(),
                Some(key),
                BuildMode::RecreateEmpty,
            )
            .await?;
            info!("{}", self.progress(basemap, state));
        }

        let milestone = format!(
            "Levels {}-{} completed.\n{}{}",
            self.scheme.extents.first().map(|e| e.levels.0).unwrap_or(0),
            self.scheme.extents.last().map(|e| e.levels.1).unwrap_or(0),
            self.progress(basemap, state),
            preview_suffix(&state.preview),
        );
        self.notifier.notify(&state.subject, &milestone).await;

        for grid in &self.scheme.grids {
            let levels = intersect_levels(&[grid.level], state.restrict.as_deref());
            if levels.is_empty() {
                continue;
            }

            let cells = self.renderer.grid_cells(&grid.name).await?;
            let total = cells.len();
            for (index, cell) in cells.into_iter().enumerate() {
                let key = grid_phase_key(&grid.name, cell.oid, grid.level);
                if skip_completed && state.job.phase_complete(&key) {
                    continue;
                }

                let name = format!("{}: OBJECTID: {}", grid.name, cell.oid);
                self.build_phase(
                    basemap,
                    state,
                    levels.clone(),
                    cell.aoi,
                    name,
                    Some(key),
                    BuildMode::RecreateEmpty,
                )
                .await?;
                debug!("{}: {}/{} cells", grid.name, index + 1, total);
            }

            let message = format!(
                "Level {} completed.\n{}{}\nNumber of errors: {}",
                grid.name,
                self.progress(basemap, state),
                preview_suffix(&state.preview),
                state.errors.len()
            );
            self.notifier.notify(&state.subject, &message).await;
        }

        Ok(())
    }

    /// Run one build phase. Render failures queue on the error list; a
    /// success (or the tool's lost-job-status hiccup) checkpoints the key.
    async fn build_phase(
        &self,
        basemap: &Basemap,
        state: &mut RunState,
        levels: Vec<usize>,
        aoi: PathBuf,
        name: String,
        key: Option<String>,
        mode: BuildMode,
    ) -> Result<(), PipelineError> {
        let scales = self.scheme.scale_values(&levels);
        info!("caching {} at {:?}", name, scales);

        match self.renderer.build_tiles(basemap, &scales, &aoi, mode).await {
            Ok(()) => {
                if let Some(key) = key {
                    self.jobs.append_phase(&mut state.job, &key)?;
                }
                Ok(())
            }
            Err(PipelineError::Render(messages)) => {
                if messages.iter().any(|message| message.contains(JOB_STATUS_LOST)) {
                    // The job is still running on the server; trust it.
                    warn!("{} thrown while caching {}; moving on", JOB_STATUS_LOST, name);
                    self.notifier
                        .notify(
                            &format!("Cache Warning ({})", JOB_STATUS_LOST),
                            &messages.join("\n"),
                        )
                        .await;
                    if let Some(key) = key {
                        self.jobs.append_phase(&mut state.job, &key)?;
                    }
                } else {
                    warn!("render error while caching {}: {}", name, messages.join("; "));
                    self.notifier
                        .notify(
                            &format!("{} - render error", state.subject),
                            &messages.join("\n"),
                        )
                        .await;
                    state.errors.push(PhaseFailure {
                        levels,
                        aoi,
                        name,
                        key,
                        mode,
                    });
                }
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    async fn drain_errors(
        &self,
        basemap: &Basemap,
        state: &mut RunState,
    ) -> Result<(), PipelineError> {
        while let Some(failure) = state.errors.pop() {
            let message = format!("Recaching errors. Errors left: {}", state.errors.len() + 1);
            info!("{}", message);
            self.notifier.notify(&state.subject, &message).await;

            self.build_phase(
                basemap,
                state,
                failure.levels,
                failure.aoi,
                failure.name,
                failure.key,
                failure.mode,
            )
            .await?;
        }
        Ok(())
    }

    fn progress(&self, basemap: &Basemap, state: &RunState) -> String {
        let bundles = self.catalog.count_bundles(&basemap.name).unwrap_or(0);
        let Some(expected) = self.scheme.expected_bundles(&basemap.name) else {
            return format!("{} bundle files created.", bundles);
        };

        let created = bundles.saturating_sub(state.start_bundles);
        let elapsed_hours = state.started.elapsed().as_secs_f64() / 3600.0;
        let remaining = if created > 0 && elapsed_hours > 0.0 {
            let per_hour = created as f64 / elapsed_hours;
            format!("{:.1}", expected.saturating_sub(bundles) as f64 / per_hour)
        } else {
            "??".to_string()
        };

        let percent = (bundles as f64 / expected as f64 * 100.0).round() as u64;
        format!(
            "{} of {} ({}%) bundle files created.\nEstimated hours remaining: {}",
            bundles, expected, percent, remaining
        )
    }

    fn extent_path(&self, name: &str) -> PathBuf {
        self.settings.extents_db.join(name)
    }

    fn preview_url(&self, basemap: &str) -> Option<String> {
        self.settings
            .preview_url
            .as_ref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), basemap))
    }
}

/// Trailing preview link for notification bodies, when one is configured.
fn preview_suffix(preview: &Option<String>) -> String {
    match preview {
        Some(url) => format!("\n{}", url),
        None => String::new(),
    }
}

/// Phase key for an extent phase, embedding the post-restriction levels.
fn extent_phase_key(name: &str, levels: &[usize]) -> String {
    format!("{}-{:?}", name, levels)
}

/// Phase key for one grid cell at one level.
fn grid_phase_key(grid: &str, oid: i64, level: usize) -> String {
    format!("{}: OBJECTID: {}-[{}]", grid, oid, level)
}
