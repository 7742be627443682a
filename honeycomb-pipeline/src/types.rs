//! Types for the honeycomb pipeline.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Tile image format for a basemap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Png,
    Jpeg,
}

/// A named basemap: the unit of work for a cache build.
///
/// Defined in configuration and immutable during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Basemap {
    /// Unique name (e.g., "Terrain").
    pub name: String,
    /// Destination object-store bucket.
    pub bucket: String,
    /// Tile image format.
    pub image_type: ImageType,
    /// Whether this basemap is included in the interactive loop command.
    #[serde(default)]
    pub loop_eligible: bool,
    /// Map document name, when it differs from the basemap name.
    #[serde(default)]
    pub map_name: Option<String>,
    /// Group layers passed through to the renderer.
    #[serde(default)]
    pub group_layers: Vec<String>,
}

impl Basemap {
    /// Create a new basemap with the given name and bucket.
    pub fn new(name: impl Into<String>, bucket: impl Into<String>, image_type: ImageType) -> Self {
        Self {
            name: name.into(),
            bucket: bucket.into(),
            image_type,
            loop_eligible: false,
            map_name: None,
            group_layers: Vec::new(),
        }
    }

    /// The map document name: `map_name` if set, otherwise the basemap name.
    pub fn map_name(&self) -> &str {
        self.map_name.as_deref().unwrap_or(&self.name)
    }
}

/// Tile-build mode for one renderer call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Only generate tiles that do not exist yet.
    RecreateEmpty,
    /// Regenerate every tile in the area of interest.
    RecreateAll,
}

impl BuildMode {
    /// The token the external tile tool expects for this mode.
    pub fn as_tool_arg(&self) -> &'static str {
        match self {
            BuildMode::RecreateEmpty => "RECREATE_EMPTY_TILES",
            BuildMode::RecreateAll => "RECREATE_ALL_TILES",
        }
    }
}

/// One polygon feature of a grid collection, identified by object id.
#[derive(Debug, Clone, PartialEq)]
pub struct GridCell {
    /// Object identifier, unique within the grid.
    pub oid: i64,
    /// Path to the cell's polygon geometry.
    pub aoi: PathBuf,
}

/// Opaque handle to an opened map document.
///
/// Cheap to obtain and reusable across renderer calls; points at the
/// throwaway copy of the project file, never the original.
#[derive(Debug, Clone, PartialEq)]
pub struct MapHandle {
    pub path: PathBuf,
}

/// Options forwarded to the external data-refresh collaborator.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshOptions {
    pub static_only: bool,
    pub sgid_only: bool,
    pub external_only: bool,
}

/// Summary of one uploader run.
#[derive(Debug, Clone, Default)]
pub struct UploadReport {
    /// Tiles written to the object store (new or overwritten).
    pub uploaded: u64,
    /// Tiles skipped because the remote checksum matched.
    pub skipped: u64,
    /// Per-tile errors that did not stop the run.
    pub errors: Vec<String>,
}

impl UploadReport {
    /// Fold another report into this one.
    pub fn merge(&mut self, other: UploadReport) {
        self.uploaded += other.uploaded;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
    }
}
