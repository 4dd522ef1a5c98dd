//! Staging layer: `stg_*` tables built from the raw dump tables.
//!
//! Dimension tables are fully refreshed on every run. The download fact
//! table is incremental: only raw rows newer than the latest staged date are
//! appended, so dates filled in by the archive backfill are left alone.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::config::Config;
use crate::db::{Namespace, Warehouse, VERSION_DOWNLOADS_TABLE};
use crate::load::quote_ident;
use crate::migrate::create_schema;

/// Dump tables copied as-is into the staging namespace.
pub const FULL_REFRESH_TABLES: &[&str] = &[
    "crates",
    "versions",
    "dependencies",
    "categories",
    "keywords",
    "crates_categories",
    "crates_keywords",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    /// `(stg table, row count)` for every refreshed table.
    pub refreshed: Vec<(String, u64)>,
    /// Raw tables that were expected but absent.
    pub missing: Vec<String>,
    /// Rows appended to the download fact table.
    pub appended_downloads: u64,
}

pub async fn run_stage(config: &Config) -> Result<StageReport> {
    let warehouse = Warehouse::open(config).await?;
    let result = stage(warehouse.pool()).await;
    if result.is_ok() {
        warehouse.checkpoint().await?;
    }
    warehouse.close().await;

    let report = result?;
    for (table, rows) in &report.refreshed {
        println!("  {:<24} {:>12} rows", table, rows);
    }
    for table in &report.missing {
        println!("  {:<24} skipped (not loaded)", table);
    }
    println!(
        "  {:<24} {:>12} rows appended",
        VERSION_DOWNLOADS_TABLE, report.appended_downloads
    );
    Ok(report)
}

pub async fn stage(pool: &SqlitePool) -> Result<StageReport> {
    create_schema(pool).await?;
    let mut report = StageReport::default();

    for name in FULL_REFRESH_TABLES {
        let raw = Namespace::Raw.qualify(name);
        let stg = Namespace::Staging.qualify(name);
        if !table_exists(pool, &raw).await? {
            debug!(table = %raw, "raw table missing, skipping");
            report.missing.push(raw);
            continue;
        }

        let mut tx = pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(&stg)))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "CREATE TABLE {} AS SELECT * FROM {}",
            quote_ident(&stg),
            quote_ident(&raw)
        ))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let rows = count_rows(pool, &stg).await?;
        info!(table = %stg, rows, "refreshed");
        report.refreshed.push((stg, rows));
    }

    let raw_downloads = Namespace::Raw.qualify("version_downloads");
    if table_exists(pool, &raw_downloads).await? {
        report.appended_downloads = append_new_downloads(pool).await?;
    } else {
        report.missing.push(raw_downloads);
    }

    Ok(report)
}

/// Append raw download rows dated after the newest staged date.
async fn append_new_downloads(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        r#"
        INSERT INTO stg_version_downloads (version_id, downloads, date)
        SELECT version_id, downloads, date
        FROM raw_version_downloads
        WHERE date > COALESCE((SELECT MAX(date) FROM stg_version_downloads), '')
        "#,
    )
    .execute(pool)
    .await?;

    let appended = result.rows_affected();
    info!(appended, "incremental download rows");
    Ok(appended)
}

pub async fn table_exists(pool: &SqlitePool, table: &str) -> Result<bool> {
    let found: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_one(pool)
            .await?;
    Ok(found > 0)
}

pub async fn count_rows(pool: &SqlitePool, table: &str) -> Result<u64> {
    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)))
        .fetch_one(pool)
        .await?;
    Ok(count as u64)
}
