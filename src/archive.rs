//! Daily version-download archive: fetch one day's CSV and load it.
//!
//! crates.io publishes one file per calendar date at
//! `<base_url>/archive/version-downloads/<YYYY-MM-DD>.csv` with columns
//! `version_id,downloads`. [`ArchiveFetcher`] downloads that file to the
//! staging directory, appends its rows into `stg_version_downloads` with
//! the date injected as a constant column, checkpoints the database and
//! removes the staged file.
//!
//! The per-day unit is exposed through the [`DayLoader`] trait so the
//! backfill driver can be run against other sources.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::ArchiveConfig;
use crate::db::Warehouse;
use crate::error::IngestError;

const ARCHIVE_PATH: &str = "/archive/version-downloads";

/// Rows per multi-row INSERT statement (3 bound parameters each).
const INSERT_BATCH: usize = 300;

/// One row of a daily archive file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DownloadRow {
    pub version_id: i64,
    pub downloads: i64,
}

/// Loads a single day of download records into the warehouse.
#[async_trait]
pub trait DayLoader: Send + Sync {
    /// Load `date` and return `(true, bytes_downloaded)` once the rows are
    /// durable. Raises on any I/O or database failure.
    async fn load_day(
        &self,
        warehouse: &Warehouse,
        date: NaiveDate,
    ) -> Result<(bool, u64), IngestError>;
}

/// URL of the archive file for `date`.
pub fn archive_url(base_url: &str, date: NaiveDate) -> String {
    format!(
        "{}{}/{}.csv",
        base_url.trim_end_matches('/'),
        ARCHIVE_PATH,
        date.format("%Y-%m-%d")
    )
}

/// Downloads archive files over HTTP.
pub struct ArchiveFetcher {
    client: reqwest::Client,
    base_url: String,
    staging_dir: PathBuf,
}

impl ArchiveFetcher {
    pub fn new(config: &ArchiveConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("crates-warehouse/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            staging_dir: config.staging_dir.clone(),
        })
    }

    pub fn staging_path(&self, date: NaiveDate) -> PathBuf {
        self.staging_dir
            .join(format!("{}.csv", date.format("%Y-%m-%d")))
    }

    /// Stream `url` into `path`, replacing any previous partial file.
    async fn download(&self, url: &str, path: &Path) -> Result<u64, IngestError> {
        let mut response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(IngestError::HttpStatus {
                status: response.status(),
                url: url.to_string(),
            });
        }

        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| IngestError::io(path, e))?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk)
                .await
                .map_err(|e| IngestError::io(path, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| IngestError::io(path, e))?;

        Ok(written)
    }
}

#[async_trait]
impl DayLoader for ArchiveFetcher {
    async fn load_day(
        &self,
        warehouse: &Warehouse,
        date: NaiveDate,
    ) -> Result<(bool, u64), IngestError> {
        let url = archive_url(&self.base_url, date);
        let csv_path = self.staging_path(date);

        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| IngestError::io(&self.staging_dir, e))?;

        info!(%date, %url, "downloading");
        let bytes = self.download(&url, &csv_path).await?;
        debug!(%date, bytes, "downloaded, ingesting");

        let rows = insert_day_csv(warehouse.pool(), date, &csv_path).await?;
        warehouse.checkpoint().await?;
        info!(%date, rows, "inserted");

        discard_staged(&csv_path).await;

        Ok((true, bytes))
    }
}

/// Remove a staged file once its rows are durable. Failure is logged only.
pub async fn discard_staged(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), "could not remove staged file: {}", e);
    }
}

/// Parse an archive CSV file.
pub fn read_download_rows(path: &Path) -> Result<Vec<DownloadRow>, IngestError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| IngestError::csv(path, e))?;
    reader
        .deserialize()
        .collect::<Result<Vec<DownloadRow>, _>>()
        .map_err(|e| IngestError::csv(path, e))
}

/// Replace the rows for `date` with the contents of `csv_path`.
///
/// Existing rows for the date are deleted in the same transaction, so
/// loading a date twice leaves a single copy.
pub async fn insert_day_csv(
    pool: &SqlitePool,
    date: NaiveDate,
    csv_path: &Path,
) -> Result<u64, IngestError> {
    let rows = read_download_rows(csv_path)?;
    insert_day_rows(pool, date, &rows).await?;
    Ok(rows.len() as u64)
}

pub async fn insert_day_rows(
    pool: &SqlitePool,
    date: NaiveDate,
    rows: &[DownloadRow],
) -> Result<(), sqlx::Error> {
    let date_str = date.format("%Y-%m-%d").to_string();
    let mut tx = pool.begin().await?;

    let replaced = sqlx::query("DELETE FROM stg_version_downloads WHERE date = ?")
        .bind(&date_str)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if replaced > 0 {
        warn!(%date, replaced, "replacing previously loaded rows");
    }

    for batch in rows.chunks(INSERT_BATCH) {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("INSERT INTO stg_version_downloads (version_id, downloads, date) ");
        builder.push_values(batch, |mut b, row| {
            b.push_bind(row.version_id)
                .push_bind(row.downloads)
                .push_bind(date_str.clone());
        });
        builder.build().execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(())
}
