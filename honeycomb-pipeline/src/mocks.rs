//! In-memory collaborators for testing the pipeline without a renderer,
//! an object store, or a mail relay.
//!
//! These mirror the real traits closely enough to drive the orchestrator
//! end to end: the mock renderer writes real files into a scratch caches
//! directory, so the catalog and uploader exercise their actual disk
//! paths.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::catalog::{encode_column, encode_row};
use crate::error::PipelineError;
use crate::journal::Journal;
use crate::notify::Notifier;
use crate::refresh::DataRefresher;
use crate::renderer::Renderer;
use crate::store::ObjectStore;
use crate::types::{Basemap, BuildMode, GridCell, MapHandle, RefreshOptions};

/// In-memory object store recording every write.
#[derive(Debug, Default)]
pub struct MockObjectStore {
    /// (bucket, key) -> (crc32c, content type).
    objects: Mutex<HashMap<(String, String), (u32, String)>>,
    writes: AtomicU64,
    /// Keys that fail with a transient error once, then succeed.
    flaky_keys: Mutex<HashSet<String>>,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate an object, as if a previous run uploaded it.
    pub fn seed(&self, bucket: &str, key: &str, data: &[u8], content_type: &str) {
        self.objects.lock().unwrap().insert(
            (bucket.to_string(), key.to_string()),
            (crc32c::crc32c(data), content_type.to_string()),
        );
    }

    /// Make the next put for `key` fail with a transient error.
    pub fn fail_once(&self, key: &str) {
        self.flaky_keys.lock().unwrap().insert(key.to_string());
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// The stored checksum for a key, if present.
    pub fn stored_crc32c(&self, bucket: &str, key: &str) -> Option<u32> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|(crc, _)| *crc)
    }

    /// The stored content type for a key, if present.
    pub fn stored_content_type(&self, bucket: &str, key: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|(_, content_type)| content_type.clone())
    }

    /// All stored keys for a bucket, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, key)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn crc32c(&self, bucket: &str, key: &str) -> Result<Option<u32>, PipelineError> {
        Ok(self.stored_crc32c(bucket, key))
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), PipelineError> {
        if self.flaky_keys.lock().unwrap().remove(key) {
            return Err(PipelineError::transient(format!("injected failure for {}", key)));
        }

        self.objects.lock().unwrap().insert(
            (bucket.to_string(), key.to_string()),
            (crc32c::crc32c(&data), content_type.to_string()),
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One recorded renderer call.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderCall {
    Validate(String),
    Build {
        basemap: String,
        scales: Vec<f64>,
        aoi: String,
        mode: BuildMode,
    },
    Explode(String),
    Intersect(String, String),
}

/// A tile the mock renderer writes when exploding.
#[derive(Debug, Clone)]
pub struct MockTile {
    pub level: u32,
    pub row: u64,
    pub column: u64,
    pub ext: String,
    pub bytes: Vec<u8>,
}

impl MockTile {
    pub fn new(level: u32, row: u64, column: u64, ext: &str, bytes: &[u8]) -> Self {
        Self {
            level,
            row,
            column,
            ext: ext.to_string(),
            bytes: bytes.to_vec(),
        }
    }
}

/// Renderer double that records calls and writes real files under a
/// scratch caches directory.
pub struct MockRenderer {
    caches_dir: PathBuf,
    calls: Mutex<Vec<RenderCall>>,
    grids: Mutex<HashMap<String, Vec<GridCell>>>,
    /// Phase names (aoi file stems) that fail once, then succeed.
    failing_aois: Mutex<HashSet<String>>,
    /// Bundles written into the compact cache per successful build call.
    bundles_per_build: u64,
    /// Tiles written into the exploded tree on explode.
    exploded_tiles: Mutex<Vec<MockTile>>,
}

impl MockRenderer {
    pub fn new(caches_dir: impl Into<PathBuf>) -> Self {
        Self {
            caches_dir: caches_dir.into(),
            calls: Mutex::new(Vec::new()),
            grids: Mutex::new(HashMap::new()),
            failing_aois: Mutex::new(HashSet::new()),
            bundles_per_build: 2,
            exploded_tiles: Mutex::new(Vec::new()),
        }
    }

    /// Register the cells a grid collection should report.
    pub fn set_grid_cells(&self, grid: &str, cells: Vec<GridCell>) {
        self.grids.lock().unwrap().insert(grid.to_string(), cells);
    }

    /// Make builds against this aoi stem fail once with a render error.
    pub fn fail_once(&self, aoi_stem: &str) {
        self.failing_aois.lock().unwrap().insert(aoi_stem.to_string());
    }

    /// Set the tiles `explode` writes into the exploded tree.
    pub fn set_exploded_tiles(&self, tiles: Vec<MockTile>) {
        *self.exploded_tiles.lock().unwrap() = tiles;
    }

    /// Every recorded call, in order.
    pub fn calls(&self) -> Vec<RenderCall> {
        self.calls.lock().unwrap().clone()
    }

    /// The recorded build calls only.
    pub fn build_calls(&self) -> Vec<RenderCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, RenderCall::Build { .. }))
            .collect()
    }

    fn record(&self, call: RenderCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn aoi_stem(aoi: &Path) -> String {
        aoi.file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Renderer for MockRenderer {
    async fn get_map(&self, basemap: &Basemap) -> Result<MapHandle, PipelineError> {
        Ok(MapHandle {
            path: self.caches_dir.join(format!("Maps_{}.aprx", basemap.name)),
        })
    }

    async fn validate_layers(&self, basemap: &Basemap) -> Result<(), PipelineError> {
        self.record(RenderCall::Validate(basemap.name.clone()));
        Ok(())
    }

    async fn build_tiles(
        &self,
        basemap: &Basemap,
        scales: &[f64],
        aoi: &Path,
        mode: BuildMode,
    ) -> Result<(), PipelineError> {
        let stem = Self::aoi_stem(aoi);
        self.record(RenderCall::Build {
            basemap: basemap.name.clone(),
            scales: scales.to_vec(),
            aoi: stem.clone(),
            mode,
        });

        if self.failing_aois.lock().unwrap().remove(&stem) {
            return Err(PipelineError::render(vec![format!(
                "failed to build tiles for {}",
                stem
            )]));
        }

        // Drop bundle files into the compact cache so progress counting has
        // something to find. One level folder per call keeps counts simple.
        let build_index = self.calls.lock().unwrap().len();
        let level_dir = self
            .caches_dir
            .join(&basemap.name)
            .join(&basemap.name)
            .join("_alllayers")
            .join(format!("L{:02}", build_index % 20));
        fs::create_dir_all(&level_dir)?;
        for bundle in 0..self.bundles_per_build {
            fs::write(
                level_dir.join(format!("R{:04x}C{:04x}.bundle", build_index, bundle)),
                b"bundle",
            )?;
        }

        Ok(())
    }

    async fn explode(&self, basemap: &Basemap) -> Result<(), PipelineError> {
        self.record(RenderCall::Explode(basemap.name.clone()));

        let root = self
            .caches_dir
            .join(format!("{}_Exploded", basemap.name))
            .join("_alllayers");
        if root.exists() {
            fs::remove_dir_all(&root)?;
        }

        for tile in self.exploded_tiles.lock().unwrap().iter() {
            let row_dir = root
                .join(format!("{:02}", tile.level))
                .join(encode_row(tile.row, 8));
            fs::create_dir_all(&row_dir)?;
            fs::write(
                row_dir.join(encode_column(tile.column, 8, &tile.ext)),
                &tile.bytes,
            )?;
        }

        Ok(())
    }

    async fn grid_cells(&self, grid: &str) -> Result<Vec<GridCell>, PipelineError> {
        let mut cells = self
            .grids
            .lock()
            .unwrap()
            .get(grid)
            .cloned()
            .unwrap_or_default();
        cells.sort_by_key(|cell| cell.oid);
        Ok(cells)
    }

    async fn intersect(&self, a: &Path, b: &Path) -> Result<PathBuf, PipelineError> {
        self.record(RenderCall::Intersect(
            Self::aoi_stem(a),
            Self::aoi_stem(b),
        ));
        Ok(self.caches_dir.join("spot_intersect.geojson"))
    }
}

/// Notifier recording every message.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    messages: Mutex<Vec<(String, String)>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.messages()
            .into_iter()
            .map(|(subject, _)| subject)
            .collect()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((subject.to_string(), body.to_string()));
    }
}

/// Journal recording calls; can be told to fail.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    entries: Mutex<Vec<String>>,
    failing: Mutex<bool>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self) {
        *self.failing.lock().unwrap() = true;
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    fn record(&self, entry: String) -> Result<(), PipelineError> {
        if *self.failing.lock().unwrap() {
            return Err(PipelineError::http("journal unavailable"));
        }
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn append_changelog(&self, basemap: &str) -> Result<(), PipelineError> {
        self.record(format!("changelog:{}", basemap))
    }

    async fn touch_last_updated(&self, basemap: &str) -> Result<(), PipelineError> {
        self.record(format!("status:{}", basemap))
    }
}

/// Data refresher counting invocations.
#[derive(Debug, Default)]
pub struct MockRefresher {
    calls: AtomicU64,
}

impl MockRefresher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataRefresher for MockRefresher {
    async fn refresh(&self, _options: &RefreshOptions) -> Result<(), PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_store_records_writes() {
        let store = MockObjectStore::new();

        store
            .put("bucket", "Terrain/5/12/9", b"tile".to_vec(), "image/jpeg")
            .await
            .unwrap();

        assert_eq!(store.write_count(), 1);
        assert_eq!(
            store.crc32c("bucket", "Terrain/5/12/9").await.unwrap(),
            Some(crc32c::crc32c(b"tile"))
        );
        assert_eq!(store.crc32c("bucket", "absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mock_store_flaky_key() {
        let store = MockObjectStore::new();
        store.fail_once("Terrain/5/12/9");

        let first = store
            .put("bucket", "Terrain/5/12/9", b"tile".to_vec(), "image/jpeg")
            .await;
        assert!(matches!(first, Err(PipelineError::Transient(_))));

        store
            .put("bucket", "Terrain/5/12/9", b"tile".to_vec(), "image/jpeg")
            .await
            .unwrap();
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_renderer_explode_writes_tiles() {
        let dir = tempfile::TempDir::new().unwrap();
        let renderer = MockRenderer::new(dir.path());
        renderer.set_exploded_tiles(vec![MockTile::new(5, 2748, 15, "png", b"png bytes")]);

        let basemap = Basemap::new("Terrain", "bucket", crate::types::ImageType::Png);
        renderer.explode(&basemap).await.unwrap();

        let tile = dir
            .path()
            .join("Terrain_Exploded")
            .join("_alllayers")
            .join("05")
            .join("R00000abc")
            .join("C0000000f.png");
        assert!(tile.exists());
    }

    #[tokio::test]
    async fn test_mock_renderer_fail_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let renderer = MockRenderer::new(dir.path());
        renderer.fail_once("CacheExtent_0_7");

        let basemap = Basemap::new("Terrain", "bucket", crate::types::ImageType::Png);
        let aoi = Path::new("/extents/CacheExtent_0_7.geojson");

        let first = renderer
            .build_tiles(&basemap, &[1.0], aoi, BuildMode::RecreateEmpty)
            .await;
        assert!(matches!(first, Err(PipelineError::Render(_))));

        renderer
            .build_tiles(&basemap, &[1.0], aoi, BuildMode::RecreateEmpty)
            .await
            .unwrap();
        assert_eq!(renderer.build_calls().len(), 2);
    }
}
