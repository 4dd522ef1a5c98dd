//! Bulk load of an extracted dump into `raw_*` tables.
//!
//! The extraction directory must contain exactly one dated directory with a
//! `data/` folder. Every CSV in that folder becomes `raw_<stem>`, dropped and
//! recreated on each run. Column types are inferred from a sample of rows:
//! a column is `INTEGER` when every non-empty sampled value parses as an
//! integer, `TEXT` otherwise. Empty fields load as NULL.

use anyhow::{Context, Result};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::Config;
use crate::db::{Namespace, Warehouse};
use crate::error::IngestError;
use crate::progress::{ProgressEvent, ProgressReporter, Throttle};

/// Rows read to infer column affinity.
const SAMPLE_ROWS: usize = 10_000;

/// Upper bound on bound parameters per INSERT statement.
const MAX_PARAMS: usize = 999;

const PROGRESS_STEP: u64 = 250_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Integer,
    Text,
}

impl Affinity {
    fn sql(&self) -> &'static str {
        match self {
            Affinity::Integer => "INTEGER",
            Affinity::Text => "TEXT",
        }
    }
}

/// Row count of one loaded table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedTable {
    pub table: String,
    pub rows: u64,
}

/// `cwh load`: recreate every raw table from the extracted dump.
pub async fn run_load(
    config: &Config,
    extract_dir: Option<&Path>,
    keep_extracted: bool,
    progress: &dyn ProgressReporter,
) -> Result<Vec<LoadedTable>> {
    let extract_dir = extract_dir.unwrap_or(&config.dump.extract_dir);
    let data_dir = find_data_dir(extract_dir)?;

    let mut csv_files: Vec<PathBuf> = std::fs::read_dir(&data_dir)
        .with_context(|| format!("failed to read {}", data_dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "csv"))
        .collect();
    csv_files.sort();

    println!("Found {} CSV files in {}", csv_files.len(), data_dir.display());

    let warehouse = Warehouse::open(config).await?;
    let mut loaded = Vec::with_capacity(csv_files.len());
    for csv_file in &csv_files {
        let table = raw_table_name(csv_file);
        println!("Creating table {} from {}...", table, csv_file.display());

        match load_csv_table(warehouse.pool(), &table, csv_file, progress).await {
            Ok(rows) => {
                println!("  {} rows", rows);
                loaded.push(LoadedTable { table, rows });
            }
            Err(e) => {
                warehouse.close().await;
                return Err(e).with_context(|| format!("failed to load {}", table));
            }
        }
    }
    warehouse.checkpoint().await?;
    warehouse.close().await;

    if !keep_extracted {
        std::fs::remove_dir_all(extract_dir)
            .with_context(|| format!("failed to remove {}", extract_dir.display()))?;
        println!("Cleaned up {}", extract_dir.display());
    }

    Ok(loaded)
}

/// The `data/` folder of the single dated directory in `extract_dir`.
pub fn find_data_dir(extract_dir: &Path) -> Result<PathBuf, IngestError> {
    let entries =
        std::fs::read_dir(extract_dir).map_err(|e| IngestError::io(extract_dir, e))?;
    let dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();

    match dirs.as_slice() {
        [single] => {
            let data = single.join("data");
            if data.is_dir() {
                Ok(data)
            } else {
                Err(IngestError::Layout(format!(
                    "{} has no data/ directory",
                    single.display()
                )))
            }
        }
        [] => Err(IngestError::Layout(format!(
            "no dump directory found in {}",
            extract_dir.display()
        ))),
        many => Err(IngestError::Layout(format!(
            "expected one dump directory in {}, found {}",
            extract_dir.display(),
            many.len()
        ))),
    }
}

/// `raw_<stem>` with anything outside `[A-Za-z0-9_]` replaced.
pub fn raw_table_name(csv_file: &Path) -> String {
    let stem = csv_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cleaned: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    Namespace::Raw.qualify(&cleaned)
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Infer one affinity per column from up to `SAMPLE_ROWS` records.
pub fn infer_affinities(path: &Path) -> Result<(Vec<String>, Vec<Affinity>), IngestError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| IngestError::csv(path, e))?;
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| IngestError::csv(path, e))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut integer = vec![true; headers.len()];
    let mut seen = vec![false; headers.len()];
    for record in reader.records().take(SAMPLE_ROWS) {
        let record = record.map_err(|e| IngestError::csv(path, e))?;
        for (i, value) in record.iter().enumerate().take(headers.len()) {
            if value.is_empty() {
                continue;
            }
            seen[i] = true;
            if integer[i] && value.parse::<i64>().is_err() {
                integer[i] = false;
            }
        }
    }

    let affinities = integer
        .iter()
        .zip(&seen)
        .map(|(int, seen)| {
            if *int && *seen {
                Affinity::Integer
            } else {
                Affinity::Text
            }
        })
        .collect();
    Ok((headers, affinities))
}

/// Drop and recreate `table` from `path` in a single transaction.
pub async fn load_csv_table(
    pool: &SqlitePool,
    table: &str,
    path: &Path,
    progress: &dyn ProgressReporter,
) -> Result<u64, IngestError> {
    let (headers, affinities) = infer_affinities(path)?;
    if headers.is_empty() {
        return Err(IngestError::Layout(format!(
            "{} has no header row",
            path.display()
        )));
    }

    let columns: Vec<String> = headers
        .iter()
        .zip(&affinities)
        .map(|(name, aff)| format!("{} {}", quote_ident(name), aff.sql()))
        .collect();
    let column_list: Vec<String> = headers.iter().map(|h| quote_ident(h)).collect();
    let insert_prefix = format!(
        "INSERT INTO {} ({}) ",
        quote_ident(table),
        column_list.join(", ")
    );
    let batch_rows = (MAX_PARAMS / headers.len()).max(1);

    let mut tx = pool.begin().await?;
    sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))
        .execute(&mut *tx)
        .await?;
    sqlx::query(&format!(
        "CREATE TABLE {} ({})",
        quote_ident(table),
        columns.join(", ")
    ))
    .execute(&mut *tx)
    .await?;

    let mut reader = csv::Reader::from_path(path).map_err(|e| IngestError::csv(path, e))?;
    let mut batch: Vec<Vec<Option<String>>> = Vec::with_capacity(batch_rows);
    let mut rows = 0u64;
    let mut throttle = Throttle::new(PROGRESS_STEP);

    for record in reader.records() {
        let record = record.map_err(|e| IngestError::csv(path, e))?;
        let values = (0..headers.len())
            .map(|i| match record.get(i) {
                Some("") | None => None,
                Some(v) => Some(v.to_string()),
            })
            .collect();
        batch.push(values);

        if batch.len() == batch_rows {
            insert_batch(&mut tx, &insert_prefix, &batch).await?;
            rows += batch.len() as u64;
            batch.clear();
            if throttle.due(rows) {
                progress.report(ProgressEvent::Loading {
                    table: table.to_string(),
                    rows,
                });
            }
        }
    }
    if !batch.is_empty() {
        insert_batch(&mut tx, &insert_prefix, &batch).await?;
        rows += batch.len() as u64;
    }

    tx.commit().await?;
    info!(table, rows, "raw table loaded");
    Ok(rows)
}

async fn insert_batch(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    insert_prefix: &str,
    batch: &[Vec<Option<String>>],
) -> Result<(), sqlx::Error> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(insert_prefix);
    builder.push_values(batch, |mut b, row| {
        for value in row {
            b.push_bind(value.clone());
        }
    });
    builder.build().execute(&mut **tx).await?;
    Ok(())
}
