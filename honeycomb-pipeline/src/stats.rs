//! Per-basemap timing history for the cache and upload tasks.
//!
//! Durations land in `stats.json` next to the job file. Runs shorter than
//! a minute are treated as non-runs (aborted starts, dev smoke tests) and
//! discarded.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PipelineError;

/// Runs below this length are discarded as non-runs.
const MIN_RUN_SECS: i64 = 60;

/// The two tracked tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Cache,
    Upload,
}

impl Task {
    pub fn as_str(&self) -> &'static str {
        match self {
            Task::Cache => "cache",
            Task::Upload => "upload",
        }
    }
}

/// One completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Seconds from start to finish.
    pub duration: i64,
    #[serde(rename = "completionDate")]
    pub completion_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct TaskStats {
    /// Unix seconds of the pending start, 0 when no run is in flight.
    start: i64,
    runs: Vec<RunRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct BasemapStats {
    cache: TaskStats,
    upload: TaskStats,
}

impl BasemapStats {
    fn task(&self, task: Task) -> &TaskStats {
        match task {
            Task::Cache => &self.cache,
            Task::Upload => &self.upload,
        }
    }

    fn task_mut(&mut self, task: Task) -> &mut TaskStats {
        match task {
            Task::Cache => &mut self.cache,
            Task::Upload => &mut self.upload,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StatsDoc {
    basemaps: BTreeMap<String, BasemapStats>,
}

/// Average durations for one basemap.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSummary {
    pub basemap: String,
    pub cache_average: Option<Duration>,
    pub upload_average: Option<Duration>,
}

/// Store for the stats file.
#[derive(Debug, Clone)]
pub struct StatsStore {
    path: PathBuf,
}

impl StatsStore {
    /// Create a store writing `stats.json` inside `dir`.
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join("stats.json"),
        }
    }

    /// Record the start of a task run.
    pub fn record_start(&self, basemap: &str, task: Task) -> Result<(), PipelineError> {
        let mut doc = self.load();
        let stats = doc.basemaps.entry(basemap.to_string()).or_default();
        stats.task_mut(task).start = Utc::now().timestamp();
        self.save(&doc)
    }

    /// Record the finish of a task run. With no matching start this logs a
    /// warning and changes nothing.
    pub fn record_finish(&self, basemap: &str, task: Task) -> Result<(), PipelineError> {
        let mut doc = self.load();
        let stats = doc.basemaps.entry(basemap.to_string()).or_default();
        let task_stats = stats.task_mut(task);

        if task_stats.start == 0 {
            warn!("no start time has been recorded for task: {}", task.as_str());
            return Ok(());
        }

        let duration = Utc::now().timestamp() - task_stats.start;
        if duration >= MIN_RUN_SECS {
            task_stats.runs.push(RunRecord {
                duration,
                completion_date: Utc::now(),
            });
        }
        task_stats.start = 0;

        self.save(&doc)
    }

    /// Average durations per basemap, in name order.
    pub fn summary(&self) -> Vec<StatsSummary> {
        let doc = self.load();
        doc.basemaps
            .iter()
            .map(|(basemap, stats)| StatsSummary {
                basemap: basemap.clone(),
                cache_average: average(&stats.task(Task::Cache).runs),
                upload_average: average(&stats.task(Task::Upload).runs),
            })
            .collect()
    }

    /// Number of recorded runs for one basemap and task.
    pub fn run_count(&self, basemap: &str, task: Task) -> usize {
        self.load()
            .basemaps
            .get(basemap)
            .map(|stats| stats.task(task).runs.len())
            .unwrap_or(0)
    }

    fn load(&self) -> StatsDoc {
        match fs::read_to_string(&self.path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => StatsDoc::default(),
        }
    }

    fn save(&self, doc: &StatsDoc) -> Result<(), PipelineError> {
        let contents = serde_json::to_string_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn average(runs: &[RunRecord]) -> Option<Duration> {
    if runs.is_empty() {
        return None;
    }

    let total: i64 = runs.iter().map(|run| run.duration).sum();
    Some(Duration::from_secs((total / runs.len() as i64) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_finish_without_start_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = StatsStore::new(dir.path());

        store.record_finish("Terrain", Task::Cache).unwrap();

        assert_eq!(store.run_count("Terrain", Task::Cache), 0);
    }

    #[test]
    fn test_short_run_discarded() {
        let dir = TempDir::new().unwrap();
        let store = StatsStore::new(dir.path());

        store.record_start("Terrain", Task::Cache).unwrap();
        store.record_finish("Terrain", Task::Cache).unwrap();

        // Started and finished within the same second - below the floor.
        assert_eq!(store.run_count("Terrain", Task::Cache), 0);
    }

    #[test]
    fn test_long_run_recorded() {
        let dir = TempDir::new().unwrap();
        let store = StatsStore::new(dir.path());

        store.record_start("Terrain", Task::Upload).unwrap();

        // Backdate the start past the floor, as a crash-resumed clock would.
        let mut doc = store.load();
        doc.basemaps.get_mut("Terrain").unwrap().upload.start = Utc::now().timestamp() - 3600;
        store.save(&doc).unwrap();

        store.record_finish("Terrain", Task::Upload).unwrap();

        assert_eq!(store.run_count("Terrain", Task::Upload), 1);
        let summary = store.summary();
        assert_eq!(summary.len(), 1);
        let upload_average = summary[0].upload_average.unwrap();
        assert!(upload_average >= Duration::from_secs(3600));
    }

    #[test]
    fn test_summary_empty_runs() {
        let dir = TempDir::new().unwrap();
        let store = StatsStore::new(dir.path());

        store.record_start("Lite", Task::Cache).unwrap();

        let summary = store.summary();
        assert_eq!(summary[0].basemap, "Lite");
        assert!(summary[0].cache_average.is_none());
        assert!(summary[0].upload_average.is_none());
    }

    #[test]
    fn test_average() {
        let runs = vec![
            RunRecord {
                duration: 100,
                completion_date: Utc::now(),
            },
            RunRecord {
                duration: 200,
                completion_date: Utc::now(),
            },
        ];
        assert_eq!(average(&runs), Some(Duration::from_secs(150)));
        assert_eq!(average(&[]), None);
    }
}
