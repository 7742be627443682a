//! Adapter over the external tile-building toolbox.
//!
//! The underlying tool mutates process-wide state (workspace, parallelism
//! factor, overwrite flag), so the adapter owns a single lock and every
//! call runs through it. Opening a map document takes a throwaway copy of
//! the project file per basemap; holding the original open would keep a
//! schema lock that blocks the data refresh later in the run.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::types::{Basemap, BuildMode, GridCell, MapHandle};

/// Message prefix of the tool's known "job status lost" failure. The job
/// keeps running on the server when this surfaces, so callers treat it as
/// a warning rather than a failed phase.
pub const JOB_STATUS_LOST: &str = "ERROR 001470";

/// The tile-rendering toolbox, behind one owner.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Open the basemap's map document and return a reusable handle.
    async fn get_map(&self, basemap: &Basemap) -> Result<MapHandle, PipelineError>;

    /// Fail with a configuration error if any layer's data source is broken.
    async fn validate_layers(&self, basemap: &Basemap) -> Result<(), PipelineError>;

    /// Generate tiles for the given scales inside the area of interest.
    async fn build_tiles(
        &self,
        basemap: &Basemap,
        scales: &[f64],
        aoi: &Path,
        mode: BuildMode,
    ) -> Result<(), PipelineError>;

    /// Convert the compact cache to the flat one-file-per-tile tree,
    /// removing any prior exploded tree first.
    async fn explode(&self, basemap: &Basemap) -> Result<(), PipelineError>;

    /// The polygon features of a grid collection, object id ascending.
    async fn grid_cells(&self, grid: &str) -> Result<Vec<GridCell>, PipelineError>;

    /// Intersect two polygon geometries, returning the result's path.
    async fn intersect(&self, a: &Path, b: &Path) -> Result<PathBuf, PipelineError>;
}

/// Configuration for the external toolbox.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Program and base arguments of the toolbox command.
    pub toolbox: Vec<String>,
    /// The shared map project file.
    pub project: PathBuf,
    /// Directory caches are written to; also hosts the project copies.
    pub caches_dir: PathBuf,
    /// Geodatabase holding the extent and grid feature classes.
    pub extents_db: PathBuf,
    /// Parallel-processing factor handed to the tool.
    pub parallel_factor: String,
}

/// Drives the toolbox as a child process, serialized through one lock.
pub struct ProcessRenderer {
    config: RendererConfig,
    lock: Mutex<()>,
}

impl ProcessRenderer {
    pub fn new(config: RendererConfig) -> Self {
        Self {
            config,
            lock: Mutex::new(()),
        }
    }

    fn command(&self) -> Result<Command, PipelineError> {
        let (program, args) = self
            .config
            .toolbox
            .split_first()
            .ok_or_else(|| PipelineError::config("no renderer toolbox command configured"))?;

        let mut command = Command::new(program);
        command.args(args);
        Ok(command)
    }

    async fn run(&self, command: &mut Command) -> Result<String, PipelineError> {
        let output = command.output().await?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let messages: Vec<String> = String::from_utf8_lossy(&output.stderr)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        if messages.is_empty() {
            Err(PipelineError::render(vec![format!(
                "toolbox exited with {}",
                output.status
            )]))
        } else {
            Err(PipelineError::render(messages))
        }
    }
}

#[async_trait]
impl Renderer for ProcessRenderer {
    async fn get_map(&self, basemap: &Basemap) -> Result<MapHandle, PipelineError> {
        // Copy the project so we never hold a lock on the original. One copy
        // per basemap also lets several hosts cache different maps at once.
        let copy = self
            .config
            .caches_dir
            .join("TempProjects")
            .join(format!("Maps_{}.aprx", basemap.name));

        if copy.exists() {
            fs::remove_file(&copy)?;
        }
        if let Some(parent) = copy.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&self.config.project, &copy)?;

        debug!("project copy for {}: {}", basemap.name, copy.display());
        Ok(MapHandle { path: copy })
    }

    async fn validate_layers(&self, basemap: &Basemap) -> Result<(), PipelineError> {
        let _guard = self.lock.lock().await;
        let handle = self.get_map(basemap).await?;

        let mut command = self.command()?;
        command
            .arg("validate-layers")
            .arg("--project")
            .arg(&handle.path)
            .arg("--map")
            .arg(basemap.map_name());

        match self.run(&mut command).await {
            Ok(_) => {
                info!("all layers in the \"{}\" map are valid", basemap.map_name());
                Ok(())
            }
            Err(PipelineError::Render(messages)) => Err(PipelineError::config(format!(
                "broken layers in the \"{}\" map: {}",
                basemap.map_name(),
                messages.join("; ")
            ))),
            Err(other) => Err(other),
        }
    }

    async fn build_tiles(
        &self,
        basemap: &Basemap,
        scales: &[f64],
        aoi: &Path,
        mode: BuildMode,
    ) -> Result<(), PipelineError> {
        let _guard = self.lock.lock().await;
        let handle = self.get_map(basemap).await?;

        let scales_arg = scales
            .iter()
            .map(|scale| scale.to_string())
            .collect::<Vec<_>>()
            .join(";");

        let mut command = self.command()?;
        command
            .arg("build-tiles")
            .arg("--project")
            .arg(&handle.path)
            .arg("--map")
            .arg(basemap.map_name())
            .arg("--cache-dir")
            .arg(&self.config.caches_dir)
            .arg("--mode")
            .arg(mode.as_tool_arg())
            .arg("--aoi")
            .arg(aoi)
            .arg("--scales")
            .arg(&scales_arg)
            .arg("--parallel-factor")
            .arg(&self.config.parallel_factor);
        for layer in &basemap.group_layers {
            command.arg("--group-layer").arg(layer);
        }

        self.run(&mut command).await.map(|_| ())
    }

    async fn explode(&self, basemap: &Basemap) -> Result<(), PipelineError> {
        let _guard = self.lock.lock().await;

        let exploded = self.config.caches_dir.join(format!("{}_Exploded", basemap.name));
        if exploded.exists() {
            info!("removing previous exploded tree: {}", exploded.display());
            fs::remove_dir_all(&exploded)?;
        }

        let mut command = self.command()?;
        command
            .arg("explode")
            .arg("--cache-dir")
            .arg(&self.config.caches_dir)
            .arg("--name")
            .arg(&basemap.name)
            .arg("--out")
            .arg(&exploded);

        self.run(&mut command).await.map(|_| ())
    }

    async fn grid_cells(&self, grid: &str) -> Result<Vec<GridCell>, PipelineError> {
        let _guard = self.lock.lock().await;

        let mut command = self.command()?;
        command
            .arg("list-cells")
            .arg("--workspace")
            .arg(&self.config.extents_db)
            .arg("--grid")
            .arg(grid);

        let stdout = self.run(&mut command).await?;

        // One cell per line: "<oid>\t<geometry path>".
        let mut cells = Vec::new();
        for line in stdout.lines().filter(|line| !line.trim().is_empty()) {
            let (oid, path) = line.split_once('\t').ok_or_else(|| {
                PipelineError::internal(format!("unexpected list-cells output: {}", line))
            })?;
            let oid = oid.trim().parse().map_err(|_| {
                PipelineError::internal(format!("unexpected object id: {}", oid))
            })?;
            cells.push(GridCell {
                oid,
                aoi: PathBuf::from(path.trim()),
            });
        }

        cells.sort_by_key(|cell| cell.oid);
        Ok(cells)
    }

    async fn intersect(&self, a: &Path, b: &Path) -> Result<PathBuf, PipelineError> {
        let _guard = self.lock.lock().await;

        let out = self.config.caches_dir.join("TempProjects").join("intersect.geojson");
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut command = self.command()?;
        command
            .arg("intersect")
            .arg(a)
            .arg(b)
            .arg("--out")
            .arg(&out);

        self.run(&mut command).await?;
        Ok(out)
    }
}
