//! End-to-end scenarios driving the orchestrator against in-memory
//! collaborators. The mock renderer writes real files into a scratch
//! caches directory, so the catalog, job store, and uploader all exercise
//! their actual disk paths.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use honeycomb_pipeline::mocks::{
    MemoryJournal, MemoryNotifier, MockObjectStore, MockRefresher, MockRenderer, MockTile,
    RenderCall,
};
use honeycomb_pipeline::{
    Basemap, BuildMode, CacheArgs, CacheOptions, GridCell, ImageType, JobStore, LevelRange,
    Notifier, Orchestrator, OrchestratorSettings, RetryConfig, StatsStore, TileCatalog,
    TileScheme, UploadConfig, Uploader, SCALES,
};

struct Harness {
    dir: TempDir,
    store: Arc<MockObjectStore>,
    renderer: Arc<MockRenderer>,
    notifier: Arc<MemoryNotifier>,
    journal: Arc<MemoryJournal>,
    refresher: Arc<MockRefresher>,
    jobs: JobStore,
    catalog: TileCatalog,
    orchestrator: Orchestrator,
}

impl Harness {
    fn caches_dir(&self) -> PathBuf {
        self.dir.path().join("caches")
    }

    fn build_scales(&self) -> Vec<Vec<f64>> {
        self.renderer
            .build_calls()
            .into_iter()
            .filter_map(|call| match call {
                RenderCall::Build { scales, .. } => Some(scales),
                _ => None,
            })
            .collect()
    }
}

fn terrain() -> Basemap {
    Basemap::new("Terrain", "state-terrain-tiles", ImageType::Png)
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

/// Wire an orchestrator over mocks. `expected_bundles` drives the
/// completeness check; an empty map disables it.
fn harness_with(scheme: TileScheme, notifier: Arc<dyn Notifier>) -> Harness {
    let dir = TempDir::new().expect("scratch dir");
    let caches = dir.path().join("caches");
    let config_dir = dir.path().join("config");
    fs::create_dir_all(&caches).unwrap();
    fs::create_dir_all(&config_dir).unwrap();

    let extents_db = dir.path().join("Extents.gdb");
    let store = Arc::new(MockObjectStore::new());
    let renderer = Arc::new(MockRenderer::new(&caches));
    let memory_notifier = Arc::new(MemoryNotifier::new());
    let journal = Arc::new(MemoryJournal::new());
    let refresher = Arc::new(MockRefresher::new());
    let catalog = TileCatalog::new(&caches);
    let jobs = JobStore::new(&config_dir);
    let stats = StatsStore::new(&config_dir);

    // Two cells per grid collection, object ids out of order to prove the
    // orchestrator processes them ascending.
    for grid in &scheme.grids {
        renderer.set_grid_cells(
            &grid.name,
            vec![
                GridCell {
                    oid: 7,
                    aoi: extents_db.join(format!("{}_cell_7", grid.name)),
                },
                GridCell {
                    oid: 3,
                    aoi: extents_db.join(format!("{}_cell_3", grid.name)),
                },
            ],
        );
    }

    renderer.set_exploded_tiles(vec![
        MockTile::new(5, 2748, 15, "png", b"tile one"),
        MockTile::new(5, 2748, 16, "png", b"tile two"),
        MockTile::new(12, 40, 9, "png", b"tile three"),
    ]);

    let uploader = Uploader::new(
        store.clone(),
        notifier.clone(),
        catalog.clone(),
        UploadConfig {
            pool_size: 8,
            retry: fast_retry(),
            discover_url: None,
        },
    );

    let orchestrator = Orchestrator::new(
        renderer.clone(),
        refresher.clone(),
        notifier,
        journal.clone(),
        uploader,
        jobs.clone(),
        stats,
        catalog.clone(),
        scheme,
        OrchestratorSettings {
            extents_db,
            preview_url: Some("https://discover.example.com/preview".to_string()),
            nightly_hour: None,
        },
    );

    Harness {
        dir,
        store,
        renderer,
        notifier: memory_notifier,
        journal,
        refresher,
        jobs,
        catalog,
        orchestrator,
    }
}

fn harness() -> Harness {
    let scheme = TileScheme {
        expected_bundles: Default::default(),
        ..TileScheme::default()
    };
    let notifier = Arc::new(MemoryNotifier::new());
    let mut harness = harness_with(scheme, notifier.clone());
    harness.notifier = notifier;
    harness
}

/// Scenario: a fresh full run builds the test cache, all extent and grid
/// phases, explodes, uploads, journals, and deletes the job file.
#[tokio::test]
async fn fresh_cache_runs_every_phase_and_cleans_up() {
    let harness = harness();
    let basemap = terrain();

    harness
        .orchestrator
        .cache(&basemap, CacheOptions::default())
        .await
        .expect("cache run");

    let calls = harness.renderer.calls();
    assert!(matches!(calls[0], RenderCall::Validate(ref name) if name == "Terrain"));

    // 1 test build + 3 extent phases + 2 cells x 2 grids.
    assert_eq!(harness.build_scales().len(), 8);
    assert_eq!(harness.refresher.call_count(), 1);

    // The test upload ships the tiles; the production upload re-explodes
    // identical bytes, so checksum dedup skips every write.
    assert_eq!(harness.store.write_count(), 3);
    assert!(harness
        .store
        .keys("state-terrain-tiles")
        .contains(&"Terrain/5/15/2748".to_string()));

    // The exploded tree is drained and the job file is gone.
    assert_eq!(harness.catalog.exploded_tile_count("Terrain"), 0);
    assert!(harness.jobs.load().is_none());

    // Journal rows landed.
    assert_eq!(
        harness.journal.entries(),
        vec!["changelog:Terrain", "status:Terrain"]
    );

    let subjects = harness.notifier.subjects();
    assert!(subjects.iter().any(|s| s == "Cache Update (Terrain) Finished"));
    assert!(subjects.iter().any(|s| s == "honeycomb update"));
}

/// Scenario: grid cells are processed by ascending object id.
#[tokio::test]
async fn grid_cells_processed_by_ascending_oid() {
    let harness = harness();
    let basemap = terrain();

    harness
        .orchestrator
        .cache(&basemap, CacheOptions::default())
        .await
        .unwrap();

    let grid_aois: Vec<String> = harness
        .renderer
        .build_calls()
        .into_iter()
        .filter_map(|call| match call {
            RenderCall::Build { aoi, .. } if aoi.contains("cell") => Some(aoi),
            _ => None,
        })
        .collect();

    assert_eq!(
        grid_aois,
        vec![
            "CacheGrids_18_cell_3",
            "CacheGrids_18_cell_7",
            "CacheGrids_19_cell_3",
            "CacheGrids_19_cell_7",
        ]
    );
}

/// Scenario: resume after a crash mid-grid calls the builder exactly once
/// per remaining phase key and finishes the job.
#[tokio::test]
async fn resume_mid_grid_builds_only_remaining_phases() {
    let harness = harness();
    let basemap = terrain();

    // Pre-seed the job a crashed run would have left behind: data and test
    // phases done, first extent phase checkpointed, grid keys absent.
    let mut job = harness
        .jobs
        .start(CacheArgs {
            basemap: "Terrain".to_string(),
            missing_only: false,
            skip_update: false,
            skip_test: false,
            spot: None,
            levels: None,
        })
        .unwrap();
    harness
        .jobs
        .update(&mut job, |j| {
            j.data_updated = true;
            j.test_cache_complete = true;
        })
        .unwrap();
    harness
        .jobs
        .append_phase(&mut job, "CacheExtent_0_7-[0, 1, 2, 3, 4, 5, 6, 7]")
        .unwrap();

    harness.orchestrator.resume(&basemap).await.expect("resume");

    // No data refresh, no test build; two remaining extents + four cells.
    assert_eq!(harness.refresher.call_count(), 0);
    let builds = harness.renderer.build_calls();
    assert_eq!(builds.len(), 6);
    for call in &builds {
        if let RenderCall::Build { mode, .. } = call {
            assert_eq!(*mode, BuildMode::RecreateEmpty);
        }
    }

    assert!(harness.jobs.load().is_none());
}

/// Scenario: a resumed job whose caching already completed skips straight
/// to the upload.
#[tokio::test]
async fn resume_with_caching_complete_skips_to_upload() {
    let harness = harness();
    let basemap = terrain();

    let mut job = harness
        .jobs
        .start(CacheArgs {
            basemap: "Terrain".to_string(),
            missing_only: false,
            skip_update: true,
            skip_test: true,
            spot: None,
            levels: None,
        })
        .unwrap();
    harness
        .jobs
        .update(&mut job, |j| {
            j.caching_complete = true;
            j.exploding_complete = true;
        })
        .unwrap();

    // Exploding already happened; its output has to be on disk.
    let row_dir = harness
        .caches_dir()
        .join("Terrain_Exploded")
        .join("_alllayers")
        .join("05")
        .join("R00abc");
    fs::create_dir_all(&row_dir).unwrap();
    fs::write(row_dir.join("C000f.png"), b"tile bytes").unwrap();

    harness.orchestrator.resume(&basemap).await.expect("resume");

    assert!(harness.renderer.build_calls().is_empty());
    assert_eq!(harness.store.write_count(), 1);
    assert!(harness.jobs.load().is_none());
}

/// Scenario: spot mode builds exactly two bounded phases and never touches
/// the test cache or the grid loops.
#[tokio::test]
async fn spot_cache_builds_two_bounded_phases() {
    let harness = harness();
    let basemap = terrain();

    let spot = harness.dir.path().join("poly.geojson");
    fs::write(&spot, b"{}").unwrap();

    harness
        .orchestrator
        .cache(
            &basemap,
            CacheOptions {
                spot: Some(spot),
                skip_update: true,
                ..CacheOptions::default()
            },
        )
        .await
        .expect("spot cache");

    let builds = harness.renderer.build_calls();
    assert_eq!(builds.len(), 2);

    // Statewide levels against the polygon itself.
    if let RenderCall::Build { scales, aoi, mode, .. } = &builds[0] {
        assert_eq!(scales.len(), 18);
        assert_eq!(aoi, "poly");
        assert_eq!(*mode, BuildMode::RecreateAll);
    }
    // Grid levels against the intersection with the high-level extent.
    if let RenderCall::Build { scales, aoi, .. } = &builds[1] {
        assert_eq!(scales, &vec![SCALES[18], SCALES[19]]);
        assert_eq!(aoi, "spot_intersect");
    }

    let calls = harness.renderer.calls();
    assert!(calls
        .iter()
        .any(|call| matches!(call, RenderCall::Intersect(a, b) if a == "poly" && b == "CacheExtent_18_19")));

    assert!(harness.jobs.load().is_none());
}

/// Scenario: a spot polygon restricted below the grid levels never reaches
/// the intersection step.
#[tokio::test]
async fn spot_cache_restricted_levels_skips_intersection() {
    let harness = harness();
    let basemap = terrain();

    let spot = harness.dir.path().join("poly.geojson");
    fs::write(&spot, b"{}").unwrap();

    harness
        .orchestrator
        .cache(
            &basemap,
            CacheOptions {
                spot: Some(spot),
                skip_update: true,
                levels: Some(LevelRange::parse("0-17").unwrap()),
                ..CacheOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(harness.renderer.build_calls().len(), 1);
    assert!(!harness
        .renderer
        .calls()
        .iter()
        .any(|call| matches!(call, RenderCall::Intersect(_, _))));
}

/// Scenario: `--levels 5-7` restricts every build to that scale subset and
/// disables the completeness re-entry.
#[tokio::test]
async fn levels_restriction_bounds_every_build() {
    // An absurd expected count would trigger completeness re-entry if the
    // restriction failed to disable it.
    let mut scheme = TileScheme::default();
    scheme
        .expected_bundles
        .insert("Terrain".to_string(), u64::MAX);
    let notifier = Arc::new(MemoryNotifier::new());
    let harness = harness_with(scheme, notifier);
    let basemap = terrain();

    harness
        .orchestrator
        .cache(
            &basemap,
            CacheOptions {
                skip_update: true,
                levels: Some(LevelRange::parse("5-7").unwrap()),
                ..CacheOptions::default()
            },
        )
        .await
        .expect("restricted cache");

    let allowed = [SCALES[5], SCALES[6], SCALES[7]];
    let builds = harness.build_scales();
    // Test cache + the one extent with a non-empty intersection.
    assert_eq!(builds.len(), 2);
    for scales in builds {
        for scale in scales {
            assert!(allowed.contains(&scale), "scale {} outside 5-7", scale);
        }
    }
}

/// Scenario: a failed phase is queued and drained; the run completes and
/// the phase key is recorded exactly once.
#[tokio::test]
async fn render_failure_retried_until_drained() {
    let harness = harness();
    let basemap = terrain();

    harness.renderer.fail_once("CacheExtent_8_9");

    harness
        .orchestrator
        .cache(
            &basemap,
            CacheOptions {
                skip_update: true,
                skip_test: true,
                ..CacheOptions::default()
            },
        )
        .await
        .expect("cache run");

    // 3 extents + 4 cells + 1 retry of the failed extent.
    assert_eq!(harness.build_scales().len(), 8);

    let subjects = harness.notifier.subjects();
    assert!(subjects
        .iter()
        .any(|s| s == "Cache Update (Terrain) - render error"));
    assert!(harness
        .notifier
        .messages()
        .iter()
        .any(|(_, body)| body.starts_with("Recaching errors")));

    assert!(harness.jobs.load().is_none());
}

/// Scenario: the completeness check re-enters the production build a
/// bounded number of times when bundles come up short.
#[tokio::test]
async fn completeness_shortfall_recaches_a_bounded_number_of_times() {
    let mut scheme = TileScheme::default();
    scheme
        .expected_bundles
        .insert("Terrain".to_string(), u64::MAX);
    let notifier = Arc::new(MemoryNotifier::new());
    let harness = harness_with(scheme, notifier.clone());
    let basemap = terrain();

    harness
        .orchestrator
        .cache(
            &basemap,
            CacheOptions {
                skip_update: true,
                skip_test: true,
                ..CacheOptions::default()
            },
        )
        .await
        .expect("cache run");

    let recache_notices = notifier
        .messages()
        .iter()
        .filter(|(_, body)| body.contains("bundles completed. Recaching"))
        .count();
    assert_eq!(recache_notices, 3);

    // 1 initial pass + 3 re-entries, each building 3 extents + 4 cells.
    assert_eq!(harness.build_scales().len(), 28);
    assert!(harness.jobs.load().is_none());
}

/// Scenario: an immediate re-upload of an unchanged tree writes nothing.
#[tokio::test]
async fn repeat_upload_is_idempotent() {
    let harness = harness();
    let basemap = terrain();

    let seed_tree = |bytes: &[u8]| {
        let row_dir = harness
            .caches_dir()
            .join("Terrain_Exploded")
            .join("_alllayers")
            .join("05")
            .join("R00abc");
        fs::create_dir_all(&row_dir).unwrap();
        fs::write(row_dir.join("C000f.png"), bytes).unwrap();
    };

    seed_tree(b"tile bytes");
    harness.orchestrator.upload_only(&basemap).await.unwrap();
    assert_eq!(harness.store.write_count(), 1);

    // Same bytes back on disk: checksum dedup skips the write.
    seed_tree(b"tile bytes");
    let report = harness.orchestrator.upload_only(&basemap).await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(harness.store.write_count(), 1);

    // Changed bytes: exactly one overwrite.
    seed_tree(b"different bytes");
    harness.orchestrator.upload_only(&basemap).await.unwrap();
    assert_eq!(harness.store.write_count(), 2);
}

/// A notifier whose channel is down: delivery fails internally, the
/// pipeline never notices.
#[derive(Default)]
struct OutageNotifier {
    attempts: AtomicU64,
}

#[async_trait]
impl Notifier for OutageNotifier {
    async fn notify(&self, subject: &str, _body: &str) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        // Mirrors the SMTP notifier's policy: log and swallow.
        tracing::warn!("notification failed for {}: connection refused", subject);
    }
}

/// Scenario: a notifier outage never fails the build.
#[tokio::test]
async fn notifier_outage_does_not_fail_the_run() {
    let scheme = TileScheme {
        expected_bundles: Default::default(),
        ..TileScheme::default()
    };
    let outage = Arc::new(OutageNotifier::default());
    let harness = harness_with(scheme, outage.clone());
    let basemap = terrain();

    harness
        .orchestrator
        .cache(&basemap, CacheOptions::default())
        .await
        .expect("run survives notifier outage");

    assert!(outage.attempts.load(Ordering::SeqCst) > 0);
    assert!(harness.jobs.load().is_none());
}

/// Scenario: journal failures are logged, never propagated.
#[tokio::test]
async fn journal_outage_does_not_fail_the_run() {
    let harness = harness();
    harness.journal.fail();

    harness
        .orchestrator
        .cache(&terrain(), CacheOptions::default())
        .await
        .expect("run survives journal outage");

    assert!(harness.journal.entries().is_empty());
    assert!(harness.jobs.load().is_none());
}

/// Scenario: starting a second job while one is live fails fast with a
/// job-state error and leaves the live job untouched.
#[tokio::test]
async fn second_cache_start_fails_while_job_is_live() {
    let harness = harness();

    harness
        .jobs
        .start(CacheArgs {
            basemap: "Terrain".to_string(),
            missing_only: false,
            skip_update: true,
            skip_test: true,
            spot: None,
            levels: None,
        })
        .unwrap();

    let result = harness
        .orchestrator
        .cache(&terrain(), CacheOptions::default())
        .await;

    assert!(result.is_err());
    assert!(harness.jobs.load().is_some());
}
