//! Locating tiles on disk: bundle counting, exploded-tree enumeration, and
//! the hex token codecs shared with the uploader.
//!
//! # Cache layouts
//!
//! The compact cache produced by the tile tool lives at
//! `<caches>/<basemap>/<basemap>/_alllayers/L<level>/<bundle files>`.
//! Exploding converts it to one file per tile at
//! `<caches>/<basemap>_Exploded/_alllayers/<paddedLevel>/R<hexRow>/C<hexCol>.<ext>`.

use std::fs;
use std::path::{Path, PathBuf};

use tokio_stream::Stream;
use walkdir::WalkDir;

use crate::error::PipelineError;

/// Placeholder file the tile tool drops inside `_alllayers`; never a bundle.
const MISSING_TILE_FILE: &str = "missing.jpg";

/// One row directory of the exploded tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ExplodedRow {
    /// Decimal zoom level.
    pub level: u32,
    /// Decimal row number decoded from the folder name.
    pub row: u64,
    /// Path of the row directory.
    pub path: PathBuf,
}

/// Finds caches on disk for every basemap under one caches directory.
#[derive(Debug, Clone)]
pub struct TileCatalog {
    caches_dir: PathBuf,
}

impl TileCatalog {
    pub fn new(caches_dir: impl Into<PathBuf>) -> Self {
        Self {
            caches_dir: caches_dir.into(),
        }
    }

    /// Root of the compact cache's tile tree.
    pub fn compact_root(&self, basemap: &str) -> PathBuf {
        self.caches_dir.join(basemap).join(basemap).join("_alllayers")
    }

    /// Root of the exploded tile tree.
    pub fn exploded_root(&self, basemap: &str) -> PathBuf {
        self.caches_dir
            .join(format!("{}_Exploded", basemap))
            .join("_alllayers")
    }

    /// Count bundle entries in the compact cache as a progress estimate:
    /// the entries inside each level folder, skipping the placeholder file.
    pub fn count_bundles(&self, basemap: &str) -> Result<u64, PipelineError> {
        let root = self.compact_root(basemap);
        if !root.exists() {
            return Ok(0);
        }

        let mut total = 0;
        for level_entry in fs::read_dir(&root)? {
            let level_entry = level_entry?;
            if level_entry.file_name() == MISSING_TILE_FILE {
                continue;
            }
            if !level_entry.file_type()?.is_dir() {
                continue;
            }

            total += fs::read_dir(level_entry.path())?.count() as u64;
        }

        Ok(total)
    }

    /// Lazily yield the exploded tree's row directories, levels ascending
    /// then rows in name order. Restartable: each call re-walks the tree,
    /// so rows deleted by an earlier pass are simply not yielded again.
    pub fn exploded_rows(
        &self,
        basemap: &str,
    ) -> impl Stream<Item = Result<ExplodedRow, PipelineError>> {
        let root = self.exploded_root(basemap);

        async_stream::try_stream! {
            let mut levels: Vec<(u32, PathBuf)> = Vec::new();
            for entry in fs::read_dir(&root)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                let level = decode_level(&name)?;
                levels.push((level, entry.path()));
            }
            levels.sort_by_key(|(level, _)| *level);

            for (level, level_path) in levels {
                let mut rows: Vec<PathBuf> = fs::read_dir(&level_path)?
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.path().is_dir())
                    .map(|entry| entry.path())
                    .collect();
                rows.sort();

                for path in rows {
                    let name = path
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let row = decode_row(&name)?;
                    yield ExplodedRow { level, row, path };
                }
            }
        }
    }

    /// Count tile files left in the exploded tree.
    pub fn exploded_tile_count(&self, basemap: &str) -> u64 {
        let root = self.exploded_root(basemap);
        WalkDir::new(root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .count() as u64
    }

    /// Remove the compact cache for a basemap, if present.
    pub fn delete_compact(&self, basemap: &str) -> Result<(), PipelineError> {
        remove_tree(&self.caches_dir.join(basemap))
    }

    /// Remove the exploded tree for a basemap, if present.
    pub fn delete_exploded(&self, basemap: &str) -> Result<(), PipelineError> {
        remove_tree(&self.caches_dir.join(format!("{}_Exploded", basemap)))
    }

    /// The level directories of the compact cache, for cleanup.
    pub fn compact_level_dirs(&self, basemap: &str) -> Result<Vec<PathBuf>, PipelineError> {
        let root = self.compact_root(basemap);
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut dirs: Vec<PathBuf> = fs::read_dir(&root)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.path())
            .collect();
        dirs.sort();
        Ok(dirs)
    }
}

fn remove_tree(path: &Path) -> Result<(), PipelineError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Decode a level folder name. Compact levels look like `L05`, exploded
/// levels like `05`; both are decimal.
pub fn decode_level(name: &str) -> Result<u32, PipelineError> {
    let digits = name.strip_prefix('L').unwrap_or(name);
    digits
        .parse()
        .map_err(|_| PipelineError::filesystem(format!("unexpected level folder: {}", name)))
}

/// Decode a row folder name like `R00abc` into its decimal row number.
pub fn decode_row(name: &str) -> Result<u64, PipelineError> {
    let hex = name
        .strip_prefix('R')
        .ok_or_else(|| PipelineError::filesystem(format!("unexpected row folder: {}", name)))?;
    u64::from_str_radix(hex, 16)
        .map_err(|_| PipelineError::filesystem(format!("unexpected row folder: {}", name)))
}

/// Decode a tile file name like `C000f.png` into its decimal column number
/// and extension.
pub fn decode_column(name: &str) -> Result<(u64, String), PipelineError> {
    let bad = || PipelineError::filesystem(format!("unexpected tile file: {}", name));

    let (stem, ext) = name.rsplit_once('.').ok_or_else(bad)?;
    let hex = stem.strip_prefix('C').ok_or_else(bad)?;
    let column = u64::from_str_radix(hex, 16).map_err(|_| bad())?;

    Ok((column, ext.to_ascii_lowercase()))
}

/// Encode a decimal row back into its folder name at a given hex width.
pub fn encode_row(row: u64, width: usize) -> String {
    format!("R{:0width$x}", row, width = width)
}

/// Encode a decimal column back into a tile file name at a given hex width.
pub fn encode_column(column: u64, width: usize, ext: &str) -> String {
    format!("C{:0width$x}.{}", column, ext, width = width)
}
