//! Durable per-run job state for crash-safe resume.
//!
//! One `current_job.json` file records the in-flight cache build. Every
//! mutation is written to a temporary file in the same directory and
//! atomically renamed over the live file, so a crash at any point leaves
//! either the old state or the new state on disk, never a torn write.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PipelineError;
use crate::scheme::LevelRange;

/// The arguments that reproduce a cache call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheArgs {
    pub basemap: String,
    pub missing_only: bool,
    pub skip_update: bool,
    pub skip_test: bool,
    #[serde(default)]
    pub spot: Option<PathBuf>,
    #[serde(default)]
    pub levels: Option<LevelRange>,
}

/// The durable record of one in-flight cache build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub cache_args: CacheArgs,
    pub data_updated: bool,
    pub test_cache_complete: bool,
    /// Phase keys already finished, append-only.
    pub cache_extents_completed: Vec<String>,
    pub caching_complete: bool,
    pub exploding_complete: bool,
    /// Timestamps of every resume, append-only.
    pub restart_times: Vec<DateTime<Utc>>,
}

impl Job {
    fn new(cache_args: CacheArgs) -> Self {
        Self {
            cache_args,
            data_updated: false,
            test_cache_complete: false,
            cache_extents_completed: Vec::new(),
            caching_complete: false,
            exploding_complete: false,
            restart_times: Vec::new(),
        }
    }

    /// Whether a phase key has already been completed.
    pub fn phase_complete(&self, key: &str) -> bool {
        self.cache_extents_completed.iter().any(|k| k == key)
    }
}

/// Store for the single live job file.
#[derive(Debug, Clone)]
pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    /// Create a store writing `current_job.json` inside `dir`.
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join("current_job.json"),
        }
    }

    /// Path of the live job file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the current job, if one exists and parses.
    pub fn load(&self) -> Option<Job> {
        let contents = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(job) => Some(job),
            Err(err) => {
                tracing::warn!("unreadable job file {}: {}", self.path.display(), err);
                None
            }
        }
    }

    /// Start a new job. Fails if a job already exists; the resume path loads
    /// the existing job instead of starting over.
    pub fn start(&self, cache_args: CacheArgs) -> Result<Job, PipelineError> {
        if self.path.exists() {
            return Err(PipelineError::job_state(format!(
                "a job already exists at {}; resume it or run cleanup first",
                self.path.display()
            )));
        }

        let job = Job::new(cache_args);
        self.save(&job)?;
        Ok(job)
    }

    /// Apply a mutation and durably persist the result before returning.
    pub fn update<F>(&self, job: &mut Job, mutate: F) -> Result<(), PipelineError>
    where
        F: FnOnce(&mut Job),
    {
        mutate(job);
        self.save(job)
    }

    /// Append a finished phase key, once, and persist.
    pub fn append_phase(&self, job: &mut Job, key: &str) -> Result<(), PipelineError> {
        if job.phase_complete(key) {
            return Ok(());
        }

        job.cache_extents_completed.push(key.to_string());
        debug!("phase complete: {}", key);
        self.save(job)
    }

    /// Delete the job file after a successful run.
    pub fn finish(&self) -> Result<(), PipelineError> {
        fs::remove_file(&self.path)?;
        Ok(())
    }

    fn save(&self, job: &Job) -> Result<(), PipelineError> {
        let contents = serde_json::to_string_pretty(job)?;

        // Write-then-rename so a crash mid-write never corrupts the live file.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
