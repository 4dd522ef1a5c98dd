//! Full database dump: download and extraction.
//!
//! crates.io publishes a nightly `db-dump.tar.gz` containing one dated
//! directory (`YYYY-MM-DD-HHMMSS/`) with a `data/` folder of CSV files,
//! one per table. `cwh dump` fetches the tarball and unpacks it; `cwh load`
//! takes it from there.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::info;
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::IngestError;
use crate::progress::{ProgressEvent, ProgressReporter, Throttle};
use crate::retry::{RetryOutcome, RetryPolicy};

/// Bytes between two download progress events.
const PROGRESS_STEP: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct DumpOptions {
    pub skip_download: bool,
    pub dump_file: Option<PathBuf>,
    pub extract_dir: Option<PathBuf>,
}

/// Summary of one completed download.
#[derive(Debug, Clone, Copy)]
pub struct DownloadStats {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl DownloadStats {
    /// Average speed in MB/s.
    pub fn speed_mb(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes as f64 / secs / (1024.0 * 1024.0)
    }
}

/// `cwh dump`: download (unless skipped) then always extract.
pub async fn run_dump(
    config: &Config,
    options: &DumpOptions,
    progress: &dyn ProgressReporter,
) -> Result<PathBuf> {
    let dump_file = options
        .dump_file
        .clone()
        .unwrap_or_else(|| config.dump.file.clone());
    let extract_dir = options
        .extract_dir
        .clone()
        .unwrap_or_else(|| config.dump.extract_dir.clone());

    if !options.skip_download {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.dump.timeout_secs))
            .user_agent(concat!("crates-warehouse/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let policy =
            RetryPolicy::from_secs(config.archive.max_attempts, config.archive.backoff_secs);

        println!("Downloading: {}", config.dump.url);
        println!("Output: {}", dump_file.display());

        let (client, url, output) = (&client, config.dump.url.as_str(), dump_file.as_path());
        let outcome = policy
            .run("db-dump", move |_| download_dump(client, url, output, progress))
            .await;

        let stats = match outcome {
            RetryOutcome::Succeeded { value, .. } => value,
            RetryOutcome::Declined(_) => anyhow::bail!("dump download was declined"),
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => anyhow::bail!(
                "dump download failed after {} attempts: {}",
                attempts,
                last_error
            ),
            RetryOutcome::Fatal { error, .. } => anyhow::bail!("dump download failed: {}", error),
        };

        println!("Download complete");
        println!("  Size: {:.2} GB", stats.bytes as f64 / (1024.0 * 1024.0 * 1024.0));
        println!("  Time: {:.1} minutes", stats.elapsed.as_secs_f64() / 60.0);
        println!("  Avg speed: {:.2} MB/s", stats.speed_mb());
    } else if !dump_file.exists() {
        anyhow::bail!(
            "--skip-download given but {} does not exist",
            dump_file.display()
        );
    }

    println!("Extracting {}...", dump_file.display());
    println!("Output: {}", extract_dir.display());

    let (file, dir) = (dump_file.clone(), extract_dir.clone());
    tokio::task::spawn_blocking(move || extract_dump(&file, &dir))
        .await
        .context("extraction task panicked")??;

    println!("Extraction complete");
    println!("Files extracted:");
    for (path, size) in list_csv_files(&extract_dir) {
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        println!(
            "  {}: {:.1} MB",
            name.unwrap_or_default(),
            size as f64 / (1024.0 * 1024.0)
        );
    }

    Ok(extract_dir)
}

/// Stream `url` into `output`, overwriting any partial file from an earlier
/// attempt.
pub async fn download_dump(
    client: &reqwest::Client,
    url: &str,
    output: &Path,
    progress: &dyn ProgressReporter,
) -> Result<(bool, DownloadStats), IngestError> {
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| IngestError::io(parent, e))?;
    }

    let started = Instant::now();
    let mut response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(IngestError::HttpStatus {
            status: response.status(),
            url: url.to_string(),
        });
    }
    let total = response.content_length();

    let label = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| url.to_string());

    let mut file = tokio::fs::File::create(output)
        .await
        .map_err(|e| IngestError::io(output, e))?;
    let mut bytes = 0u64;
    let mut throttle = Throttle::new(PROGRESS_STEP);
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk)
            .await
            .map_err(|e| IngestError::io(output, e))?;
        bytes += chunk.len() as u64;
        if throttle.due(bytes) {
            progress.report(ProgressEvent::Downloading {
                label: label.clone(),
                bytes,
                total,
            });
        }
    }
    file.flush().await.map_err(|e| IngestError::io(output, e))?;

    progress.report(ProgressEvent::Downloading {
        label,
        bytes,
        total,
    });
    info!(bytes, "dump downloaded");

    Ok((
        true,
        DownloadStats {
            bytes,
            elapsed: started.elapsed(),
        },
    ))
}

/// Unpack a `.tar.gz` into `extract_dir`, creating it if needed.
pub fn extract_dump(dump_file: &Path, extract_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(extract_dir)
        .with_context(|| format!("failed to create {}", extract_dir.display()))?;

    let file = File::open(dump_file)
        .with_context(|| format!("failed to open {}", dump_file.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    archive
        .unpack(extract_dir)
        .with_context(|| format!("failed to extract {}", dump_file.display()))?;

    Ok(())
}

/// Every `*.csv` below `dir` with its size, sorted by path.
pub fn list_csv_files(dir: &Path) -> Vec<(PathBuf, u64)> {
    let mut files: Vec<(PathBuf, u64)> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "csv"))
        .map(|e| {
            let size = e.metadata().map(|m| m.len()).unwrap_or(0);
            (e.into_path(), size)
        })
        .collect();
    files.sort();
    files
}
