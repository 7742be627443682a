//! honeycomb-pipeline - cache build and upload pipeline for the state
//! basemap tile caches.
//!
//! This crate coordinates a basemap through its lifecycle: optional source
//! data refresh, an optional test cache, the phase-keyed production build,
//! exploding the compact cache into a flat tile tree, and a parallel
//! content-addressed upload to the object store. The job file checkpoints
//! every phase so crashed or killed runs resume without repeating work.
//!
//! # Key pieces
//!
//! - [`Orchestrator`] drives the whole lifecycle
//! - [`Uploader`] ships exploded tiles with checksum dedup and retries
//! - [`JobStore`] / [`StatsStore`] persist resume state and timing history
//! - [`Renderer`] wraps the external tile-building toolbox
//!
//! # Example
//!
//! ```rust
//! use honeycomb_pipeline::{LevelRange, TileScheme};
//!
//! let scheme = TileScheme::default();
//! let restrict = LevelRange::parse("5-7").unwrap();
//! assert_eq!(restrict.levels(), vec![5, 6, 7]);
//! assert_eq!(scheme.scales.len(), 20);
//! ```

// Modules
mod catalog;
mod convert;
mod error;
mod job;
mod journal;
pub mod mocks;
mod notify;
mod orchestrator;
mod refresh;
mod renderer;
mod retry;
mod scheme;
mod stats;
mod store;
mod types;
mod uploader;

// Public exports
pub use catalog::{
    decode_column, decode_level, decode_row, encode_column, encode_row, ExplodedRow, TileCatalog,
};
pub use convert::png_to_jpeg;
pub use error::PipelineError;
pub use job::{CacheArgs, Job, JobStore};
pub use journal::{HttpJournal, Journal};
pub use notify::{Notifier, SmtpNotifier};
pub use orchestrator::{CacheOptions, Orchestrator, OrchestratorSettings};
pub use refresh::{wait_until_hour, DataRefresher, ProcessRefresher};
pub use renderer::{ProcessRenderer, Renderer, RendererConfig, JOB_STATUS_LOST};
pub use retry::RetryConfig;
pub use scheme::{intersect_levels, ExtentPhase, GridPhase, LevelRange, TileScheme, SCALES};
pub use stats::{StatsStore, StatsSummary, Task};
pub use store::{encode_crc32c, HttpObjectStore, ObjectStore};
pub use types::{
    Basemap, BuildMode, GridCell, ImageType, MapHandle, RefreshOptions, UploadReport,
};
pub use uploader::{UploadConfig, Uploader};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use super::{
        Basemap, BuildMode, CacheArgs, CacheOptions, DataRefresher, GridCell, HttpJournal,
        HttpObjectStore, ImageType, Job, JobStore, Journal, LevelRange, Notifier, ObjectStore,
        Orchestrator, OrchestratorSettings, PipelineError, ProcessRefresher, ProcessRenderer,
        Renderer, RendererConfig, RetryConfig, SmtpNotifier, StatsStore, Task, TileCatalog,
        TileScheme, UploadConfig, UploadReport, Uploader,
    };
}
