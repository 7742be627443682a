//! Configuration management for the honeycomb tool.
//!
//! One human-readable JSON document at `<config dir>/config.json` holds
//! the basemap table and every deployment setting. Writes go through a
//! temp file and an atomic rename, same as the job and stats files.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use honeycomb_pipeline::{Basemap, ImageType, TileScheme};

/// Required env var pointing at the shared data root.
pub const SHARE_ENV: &str = "HONEYCOMB_SHARE";

/// One registered basemap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasemapEntry {
    pub bucket: String,
    pub image_type: ImageType,
    #[serde(default)]
    pub loop_eligible: bool,
    #[serde(default)]
    pub map_name: Option<String>,
    #[serde(default)]
    pub group_layers: Vec<String>,
}

impl BasemapEntry {
    fn to_basemap(&self, name: &str) -> Basemap {
        Basemap {
            name: name.to_string(),
            bucket: self.bucket.clone(),
            image_type: self.image_type,
            loop_eligible: self.loop_eligible,
            map_name: self.map_name.clone(),
            group_layers: self.group_layers.clone(),
        }
    }
}

/// The whole configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Master switch for outgoing mail.
    pub send_emails: bool,
    /// Notification recipients.
    pub notify: Vec<String>,
    /// Local data root; `HONEYCOMB_SHARE` is the fallback.
    pub base_folder: Option<PathBuf>,
    /// Where caches are built; defaults to `<base folder>/caches`.
    pub caches_dir: Option<PathBuf>,
    /// Discover instance whose tile cache is reset after uploads.
    pub discover_url: Option<String>,
    /// Base URL for preview links in notifications.
    pub preview_url: Option<String>,
    /// Journal endpoints.
    pub changelog_url: Option<String>,
    pub status_url: Option<String>,
    /// Local hour the data refresh waits for.
    pub nightly_hour: Option<u32>,
    /// Concurrent upload workers.
    pub upload_pool_size: usize,
    /// External tool command lines: program followed by base arguments.
    pub renderer_command: Vec<String>,
    pub etl_command: Vec<String>,
    pub vector_command: Vec<String>,
    /// The shared map project file.
    pub project_path: Option<PathBuf>,
    /// Geodatabase holding extent and grid feature classes.
    pub extents_db: Option<PathBuf>,
    /// Parallel-processing factor handed to the tile tool.
    pub parallel_factor: String,
    /// Vector basemaps published through the tile-package path.
    pub vector_basemaps: Vec<String>,
    /// Tiling-scheme override; the built-in table when absent.
    pub scheme: Option<TileScheme>,
    /// The basemap table.
    pub basemaps: BTreeMap<String, BasemapEntry>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            send_emails: false,
            notify: Vec::new(),
            base_folder: None,
            caches_dir: None,
            discover_url: None,
            preview_url: None,
            changelog_url: None,
            status_url: None,
            nightly_hour: None,
            upload_pool_size: 100,
            renderer_command: Vec::new(),
            etl_command: Vec::new(),
            vector_command: Vec::new(),
            project_path: None,
            extents_db: None,
            parallel_factor: "85%".to_string(),
            vector_basemaps: Vec::new(),
            scheme: None,
            basemaps: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// The per-user configuration directory.
    pub fn default_dir() -> anyhow::Result<PathBuf> {
        let dirs = ProjectDirs::from("gov", "utah", "honeycomb")
            .context("could not determine a configuration directory")?;
        Ok(dirs.config_dir().to_path_buf())
    }

    /// Path of the config file inside a directory.
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join("config.json")
    }

    /// Write a default config file, creating the directory. Returns the
    /// file's path.
    pub fn init(dir: &Path) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        AppConfig::default().save(dir)?;
        Ok(Self::path_in(dir))
    }

    /// Load the config, writing a default file first if none exists.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let path = Self::path_in(dir);
        if !path.exists() {
            Self::init(dir)?;
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("could not read {}", path.display()))?;
        let config = serde_json::from_str(&contents)
            .with_context(|| format!("could not parse {}", path.display()))?;
        Ok(config)
    }

    /// Persist atomically.
    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        let path = Self::path_in(dir);
        let contents = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Update one top-level field by key, parsing the value as JSON where
    /// possible and as a bare string otherwise.
    pub fn set_value(dir: &Path, key: &str, value: &str) -> anyhow::Result<String> {
        let path = Self::path_in(dir);
        if !path.exists() {
            Self::init(dir)?;
        }

        let contents = fs::read_to_string(&path)?;
        let mut doc: serde_json::Value = serde_json::from_str(&contents)?;

        let map = doc
            .as_object_mut()
            .context("config file is not a JSON object")?;
        if !map.contains_key(key) {
            bail!("{} not found in config", key);
        }

        let parsed: serde_json::Value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        map.insert(key.to_string(), parsed);

        // Round-trip through the typed struct so a bad value fails here,
        // not on the next load.
        let config: AppConfig = serde_json::from_value(doc)?;
        config.save(dir)?;

        Ok(format!("Set {} to {}", key, value))
    }

    /// Register a basemap.
    pub fn add_basemap(
        dir: &Path,
        name: &str,
        bucket: Option<String>,
        loop_eligible: bool,
    ) -> anyhow::Result<String> {
        let mut config = Self::load(dir)?;
        config.basemaps.insert(
            name.to_string(),
            BasemapEntry {
                bucket: bucket.unwrap_or_else(|| name.to_lowercase()),
                image_type: ImageType::Jpeg,
                loop_eligible,
                map_name: None,
                group_layers: Vec::new(),
            },
        );
        config.save(dir)?;

        Ok(format!(
            "Added \"{}\" basemap. Current basemaps: {}",
            name,
            config.basemap_names().join(", ")
        ))
    }

    /// Unregister a basemap.
    pub fn remove_basemap(dir: &Path, name: &str) -> anyhow::Result<String> {
        let mut config = Self::load(dir)?;
        if config.basemaps.remove(name).is_none() {
            bail!(
                "\"{}\" is not a registered basemap. Current basemaps: {}",
                name,
                config.basemap_names().join(", ")
            );
        }
        config.save(dir)?;

        Ok(format!(
            "Removed \"{}\" basemap. Current basemaps: {}",
            name,
            config.basemap_names().join(", ")
        ))
    }

    /// Registered basemap names, in order.
    pub fn basemap_names(&self) -> Vec<String> {
        self.basemaps.keys().cloned().collect()
    }

    /// Resolve a registered basemap by name.
    pub fn basemap(&self, name: &str) -> anyhow::Result<Basemap> {
        let entry = self
            .basemaps
            .get(name)
            .with_context(|| format!("unknown basemap: {}", name))?;
        Ok(entry.to_basemap(name))
    }

    /// The basemaps included in the interactive loop, in order.
    pub fn loop_basemaps(&self) -> Vec<Basemap> {
        self.basemaps
            .iter()
            .filter(|(_, entry)| entry.loop_eligible)
            .map(|(name, entry)| entry.to_basemap(name))
            .collect()
    }

    /// The data root: `base_folder` or the `HONEYCOMB_SHARE` env var.
    pub fn share_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(base) = &self.base_folder {
            return Ok(base.clone());
        }
        std::env::var(SHARE_ENV)
            .map(PathBuf::from)
            .with_context(|| format!("set the \"{}\" environment variable", SHARE_ENV))
    }

    /// Where caches live on disk.
    pub fn resolve_caches_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.caches_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self.share_dir()?.join("caches")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_writes_default_file() {
        let dir = TempDir::new().unwrap();
        let path = AppConfig::init(dir.path()).unwrap();
        assert!(path.exists());

        let config = AppConfig::load(dir.path()).unwrap();
        assert!(!config.send_emails);
        assert!(config.basemaps.is_empty());
        assert_eq!(config.upload_pool_size, 100);
    }

    #[test]
    fn test_load_creates_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::load(dir.path()).unwrap();
        assert!(AppConfig::path_in(dir.path()).exists());
        assert_eq!(config.parallel_factor, "85%");
    }

    #[test]
    fn test_set_value_known_key() {
        let dir = TempDir::new().unwrap();
        AppConfig::init(dir.path()).unwrap();

        let message = AppConfig::set_value(dir.path(), "send_emails", "true").unwrap();
        assert_eq!(message, "Set send_emails to true");

        let config = AppConfig::load(dir.path()).unwrap();
        assert!(config.send_emails);
    }

    #[test]
    fn test_set_value_unknown_key() {
        let dir = TempDir::new().unwrap();
        AppConfig::init(dir.path()).unwrap();

        let result = AppConfig::set_value(dir.path(), "bogus", "true");
        assert!(result.is_err());
    }

    #[test]
    fn test_set_value_string_fallback() {
        let dir = TempDir::new().unwrap();
        AppConfig::init(dir.path()).unwrap();

        AppConfig::set_value(dir.path(), "discover_url", "https://discover.example.com").unwrap();

        let config = AppConfig::load(dir.path()).unwrap();
        assert_eq!(
            config.discover_url.as_deref(),
            Some("https://discover.example.com")
        );
    }

    #[test]
    fn test_add_and_remove_basemap() {
        let dir = TempDir::new().unwrap();

        let message =
            AppConfig::add_basemap(dir.path(), "Night", Some("state-night-tiles".to_string()), true)
                .unwrap();
        assert!(message.contains("Added \"Night\""));

        let config = AppConfig::load(dir.path()).unwrap();
        let basemap = config.basemap("Night").unwrap();
        assert_eq!(basemap.bucket, "state-night-tiles");
        assert!(basemap.loop_eligible);
        assert_eq!(config.loop_basemaps().len(), 1);

        let message = AppConfig::remove_basemap(dir.path(), "Night").unwrap();
        assert!(message.contains("Removed \"Night\""));
        assert!(AppConfig::remove_basemap(dir.path(), "Night").is_err());
    }

    #[test]
    fn test_unknown_basemap_errors() {
        let config = AppConfig::default();
        assert!(config.basemap("Nope").is_err());
    }

    #[test]
    fn test_caches_dir_from_base_folder() {
        let config = AppConfig {
            base_folder: Some(PathBuf::from("/data/honeycomb")),
            ..AppConfig::default()
        };
        assert_eq!(
            config.resolve_caches_dir().unwrap(),
            PathBuf::from("/data/honeycomb/caches")
        );
    }
}
