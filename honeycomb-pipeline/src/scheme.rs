//! The fixed tiling scheme: scales, cache extents, and grid collections.
//!
//! Twenty scales (index 0 = lowest zoom) are partitioned between three
//! cache-extent polygons that bound the statewide levels and two grid
//! collections whose cells are cached one feature at a time. The whole
//! table lives in [`TileScheme`] so a deployment can override it without
//! code changes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// The ordered scale denominators, lowest zoom first.
pub const SCALES: [f64; 20] = [
    591657527.591555,   // 0
    295828763.795777,   // 1
    147914381.897889,   // 2
    73957190.948944,    // 3
    36978595.474472,    // 4
    18489297.737236,    // 5
    9244648.868618,     // 6
    4622324.434309,     // 7
    2311162.217155,     // 8
    1155581.108577,     // 9
    577790.554289,      // 10
    288895.277144,      // 11
    144447.638572,      // 12
    72223.819286,       // 13
    36111.909643,       // 14
    18055.954822,       // 15
    9027.977411,        // 16
    4513.988705,        // 17
    2256.994353,        // 18
    1128.497176,        // 19
];

/// An extent phase: one polygon bounding a contiguous run of levels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentPhase {
    /// Feature-class name of the bounding polygon.
    pub name: String,
    /// Inclusive level range covered by this extent.
    pub levels: (usize, usize),
}

/// A grid phase: one polygon collection cached cell-by-cell at a single level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridPhase {
    /// Feature-class name of the grid collection.
    pub name: String,
    /// The level this grid covers.
    pub level: usize,
}

/// Process-wide tiling constants for one deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileScheme {
    /// Scale denominators, index = level.
    pub scales: Vec<f64>,
    /// Extent phases in build order.
    pub extents: Vec<ExtentPhase>,
    /// Grid phases in build order.
    pub grids: Vec<GridPhase>,
    /// Polygon intersected with spot-cache geometries for the grid levels.
    pub high_level_extent: String,
    /// Small polygon used for test caches.
    pub test_extent: String,
    /// Expected bundle counts per basemap, for progress and completeness.
    pub expected_bundles: BTreeMap<String, u64>,
}

impl Default for TileScheme {
    fn default() -> Self {
        let expected_bundles = BTreeMap::from([
            ("Lite".to_string(), 20509),
            ("Terrain".to_string(), 20511),
            ("Overlay".to_string(), 20511),
            ("AddressPoints".to_string(), 18924),
        ]);

        Self {
            scales: SCALES.to_vec(),
            extents: vec![
                ExtentPhase {
                    name: "CacheExtent_0_7".to_string(),
                    levels: (0, 7),
                },
                ExtentPhase {
                    name: "CacheExtent_8_9".to_string(),
                    levels: (8, 9),
                },
                ExtentPhase {
                    name: "CacheExtent_10_17".to_string(),
                    levels: (10, 17),
                },
            ],
            grids: vec![
                GridPhase {
                    name: "CacheGrids_18".to_string(),
                    level: 18,
                },
                GridPhase {
                    name: "CacheGrids_19".to_string(),
                    level: 19,
                },
            ],
            high_level_extent: "CacheExtent_18_19".to_string(),
            test_extent: "test_extent".to_string(),
            expected_bundles,
        }
    }
}

impl TileScheme {
    /// All level indices in the scheme.
    pub fn all_levels(&self) -> Vec<usize> {
        (0..self.scales.len()).collect()
    }

    /// Resolve level indices to scale denominators.
    pub fn scale_values(&self, levels: &[usize]) -> Vec<f64> {
        levels.iter().map(|&i| self.scales[i]).collect()
    }

    /// The expected bundle count for a basemap, if one is known.
    pub fn expected_bundles(&self, basemap: &str) -> Option<u64> {
        self.expected_bundles.get(basemap).copied()
    }
}

/// An inclusive level range parsed from a `--levels N-M` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelRange {
    pub min: usize,
    pub max: usize,
}

impl LevelRange {
    /// Parse `"N-M"` into a range. Fails on bad syntax, inverted bounds, or
    /// levels outside the scheme.
    pub fn parse(text: &str) -> Result<Self, PipelineError> {
        let (min, max) = text
            .split_once('-')
            .ok_or_else(|| PipelineError::config(format!("invalid levels argument: {}", text)))?;

        let min: usize = min
            .trim()
            .parse()
            .map_err(|_| PipelineError::config(format!("invalid levels argument: {}", text)))?;
        let max: usize = max
            .trim()
            .parse()
            .map_err(|_| PipelineError::config(format!("invalid levels argument: {}", text)))?;

        if min > max || max >= SCALES.len() {
            return Err(PipelineError::config(format!(
                "levels must satisfy 0 <= N <= M <= {}: {}",
                SCALES.len() - 1,
                text
            )));
        }

        Ok(Self { min, max })
    }

    /// The level indices covered by this range.
    pub fn levels(&self) -> Vec<usize> {
        (self.min..=self.max).collect()
    }
}

/// Intersect a declared level set with a restriction, preserving ascending
/// order. With no restriction the declared set is returned unchanged.
pub fn intersect_levels(declared: &[usize], restrict: Option<&[usize]>) -> Vec<usize> {
    match restrict {
        None => declared.to_vec(),
        Some(restrict) => {
            let mut levels: Vec<usize> = declared
                .iter()
                .copied()
                .filter(|level| restrict.contains(level))
                .collect();
            levels.sort_unstable();
            levels
        }
    }
}
