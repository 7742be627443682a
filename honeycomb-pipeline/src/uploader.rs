//! Ships an exploded tile tree to the object store.
//!
//! The unit of parallelism is a row folder: every tile under one row
//! shares a remote prefix and no two rows ever touch the same local path,
//! so rows fan out across a fixed-size worker pool with no coordination
//! beyond a semaphore. The unit of atomicity is the individual tile (one
//! remote write, one local delete), which makes a crashed upload safe to
//! re-run: matching tiles are skipped by checksum, deleted tiles are
//! simply not visited again.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::catalog::{decode_column, ExplodedRow, TileCatalog};
use crate::convert;
use crate::error::PipelineError;
use crate::notify::Notifier;
use crate::retry::RetryConfig;
use crate::store::ObjectStore;
use crate::types::{Basemap, ImageType, UploadReport};

/// Env vars holding the discover credentials for the cache-bust hook.
const GIZA_USERNAME_ENV: &str = "HONEYCOMB_GIZA_USERNAME";
const GIZA_PASSWORD_ENV: &str = "HONEYCOMB_GIZA_PASSWORD";

/// Configuration for the uploader.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Concurrent row workers.
    pub pool_size: usize,
    /// Per-request retry policy.
    pub retry: RetryConfig,
    /// Base URL of the discover instance whose tile cache is reset after
    /// an upload. None skips the hook.
    pub discover_url: Option<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            pool_size: 100,
            retry: RetryConfig::default(),
            discover_url: None,
        }
    }
}

/// Concurrent, checksum-dedup, retrying object-store writer.
pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    notifier: Arc<dyn Notifier>,
    catalog: TileCatalog,
    http: reqwest::Client,
    config: UploadConfig,
}

/// Shared per-run context handed to every row worker.
struct RowContext {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    basemap: String,
    image_type: ImageType,
    retry: RetryConfig,
}

enum TileAction {
    Uploaded,
    Skipped,
}

impl Uploader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        notifier: Arc<dyn Notifier>,
        catalog: TileCatalog,
        config: UploadConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            catalog,
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Upload every tile of the basemap's exploded tree, delete local
    /// copies as they land, then fire the cache-bust hook and the
    /// completion notification. Per-tile failures are collected in the
    /// report; only infrastructure problems fail the call.
    pub async fn upload(
        &self,
        basemap: &Basemap,
        is_test: bool,
        preview_url: Option<&str>,
    ) -> Result<UploadReport, PipelineError> {
        let root = self.catalog.exploded_root(&basemap.name);
        if !root.exists() {
            return Err(PipelineError::filesystem(format!(
                "no exploded cache at {}",
                root.display()
            )));
        }

        info!("uploading {} to {}", basemap.name, basemap.bucket);

        let context = Arc::new(RowContext {
            store: self.store.clone(),
            bucket: basemap.bucket.clone(),
            basemap: basemap.name.clone(),
            image_type: basemap.image_type,
            retry: self.config.retry.clone(),
        });

        let semaphore = Arc::new(Semaphore::new(self.config.pool_size));
        let mut workers: JoinSet<UploadReport> = JoinSet::new();
        let mut report = UploadReport::default();

        let mut rows = Box::pin(self.catalog.exploded_rows(&basemap.name));
        while let Some(row) = rows.next().await {
            let row = row?;
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|err| PipelineError::internal(err.to_string()))?;
            let context = context.clone();

            workers.spawn(async move {
                let _permit = permit;
                process_row(context, row).await
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(outcome) => report.merge(outcome),
                Err(err) => report.errors.push(format!("row worker failed: {}", err)),
            }
        }

        info!(
            "{}: {} uploaded, {} skipped, {} errors",
            basemap.name,
            report.uploaded,
            report.skipped,
            report.errors.len()
        );

        self.bust_discover_cache().await;

        let message = if is_test {
            format!("{}-Test is ready for review", basemap.name)
        } else {
            format!("{} has been pushed to production", basemap.name)
        };
        let body = match preview_url {
            Some(url) => format!("{}\n{}", message, url),
            None => message,
        };
        self.notifier.notify("honeycomb update", &body).await;

        if !report.errors.is_empty() {
            self.notifier
                .notify("Uploading errors", &report.errors.join("\n\n"))
                .await;
        }

        Ok(report)
    }

    /// Reset the discover instance's tile cache. Any failure here is
    /// logged; an upload never fails because the hook did.
    async fn bust_discover_cache(&self) {
        let Some(base) = &self.config.discover_url else {
            debug!("no discover instance configured; skipping cache bust");
            return;
        };

        match self.run_cache_bust(base).await {
            Ok(()) => info!("discover cache reset"),
            Err(err) => warn!("cache-bust hook failed: {}", err),
        }
    }

    async fn run_cache_bust(&self, base: &str) -> Result<(), PipelineError> {
        let username = std::env::var(GIZA_USERNAME_ENV)
            .map_err(|_| PipelineError::config(format!("{} is not set", GIZA_USERNAME_ENV)))?;
        let password = std::env::var(GIZA_PASSWORD_ENV)
            .map_err(|_| PipelineError::config(format!("{} is not set", GIZA_PASSWORD_ENV)))?;

        let response = self
            .http
            .post(format!("{}/login", base))
            .form(&[("user", username.as_str()), ("password", password.as_str())])
            .send()
            .await?;

        if response.status().as_u16() != 200 {
            return Err(PipelineError::http(format!(
                "discover login returned {}",
                response.status()
            )));
        }

        self.http.get(format!("{}/reset", base)).send().await?;
        Ok(())
    }
}

/// Upload every tile in one row folder, then remove the emptied folder.
async fn process_row(context: Arc<RowContext>, row: ExplodedRow) -> UploadReport {
    let mut report = UploadReport::default();

    let entries = match fs::read_dir(&row.path) {
        Ok(entries) => entries,
        Err(err) => {
            report
                .errors
                .push(format!("could not read row folder {}: {}", row.path.display(), err));
            return report;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();

        match process_tile(&context, &row, path, &name).await {
            Ok(TileAction::Uploaded) => report.uploaded += 1,
            Ok(TileAction::Skipped) => report.skipped += 1,
            Err(err) => report.errors.push(format!(
                "Uploading error. Level: {}, row: {}, file: {}\n\n{}",
                row.level, row.row, name, err
            )),
        }
    }

    if let Err(err) = fs::remove_dir(&row.path) {
        warn!("could not remove row folder {}: {}", row.path.display(), err);
    }

    report
}

async fn process_tile(
    context: &RowContext,
    row: &ExplodedRow,
    path: PathBuf,
    name: &str,
) -> Result<TileAction, PipelineError> {
    let (column, ext) = decode_column(name)?;

    let mut path = path;
    let content_type = if context.image_type == ImageType::Jpeg && ext == "png" {
        // JPEG caches still get PNGs from the tool wherever a tile has
        // transparency; flatten those before they ship.
        path = convert::png_to_jpeg(&path)?;
        "image/jpeg"
    } else if ext == "png" {
        "image/png"
    } else {
        "image/jpeg"
    };

    let data = fs::read(&path)?;
    let checksum = crc32c::crc32c(&data);
    let key = format!("{}/{}/{}/{}", context.basemap, row.level, column, row.row);

    let action = context
        .retry
        .run(|| {
            let data = data.clone();
            let key = key.clone();
            async move {
                match context.store.crc32c(&context.bucket, &key).await? {
                    Some(remote) if remote == checksum => {
                        debug!("checksum match, skipping {}", key);
                        Ok(TileAction::Skipped)
                    }
                    _ => {
                        context
                            .store
                            .put(&context.bucket, &key, data, content_type)
                            .await?;
                        Ok(TileAction::Uploaded)
                    }
                }
            }
        })
        .await?;

    fs::remove_file(&path)?;
    Ok(action)
}
