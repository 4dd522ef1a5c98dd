//! Warehouse statistics and coverage overview.
//!
//! Provides a quick summary of what is loaded: file size, row counts per
//! namespaced table and the date coverage of the download fact table. Used
//! by `cwh stats` to check that dump loads and backfills landed.

use anyhow::Result;
use chrono::NaiveDate;

use crate::config::Config;
use crate::db::{self, VERSION_DOWNLOADS_TABLE};
use crate::staging::{count_rows, table_exists};

/// Date coverage of `stg_version_downloads`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coverage {
    pub min_date: Option<NaiveDate>,
    pub max_date: Option<NaiveDate>,
    pub distinct_days: i64,
}

impl Coverage {
    /// Calendar days between min and max that have no rows.
    pub fn gaps(&self) -> i64 {
        match (self.min_date, self.max_date) {
            (Some(min), Some(max)) => (max - min).num_days() + 1 - self.distinct_days,
            _ => 0,
        }
    }
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect_read_only(config).await?;
    let db_size = db::file_size(&config.db.path);

    println!("Crates Warehouse Database Stats");
    println!("===============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));

    let tables = db::warehouse_tables(&pool).await?;
    if !tables.is_empty() {
        println!();
        println!("  {:<10} {:<32} {:>14}", "SCHEMA", "TABLE", "ROWS");
        println!("  {}", "-".repeat(58));
        for (ns, table) in &tables {
            let rows = count_rows(&pool, table).await?;
            println!("  {:<10} {:<32} {:>14}", ns.name(), table, rows);
        }
    }

    if table_exists(&pool, VERSION_DOWNLOADS_TABLE).await? {
        let coverage = download_coverage(&pool).await?;
        println!();
        println!("  Download coverage:");
        match (coverage.min_date, coverage.max_date) {
            (Some(min), Some(max)) => {
                println!("    Earliest:  {}", min);
                println!("    Latest:    {} ({})", max, format_days_ago(max));
                println!("    Days:      {}", coverage.distinct_days);
                if coverage.gaps() > 0 {
                    println!("    Missing:   {} days inside the range", coverage.gaps());
                }
            }
            _ => println!("    (empty)"),
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

pub async fn download_coverage(pool: &sqlx::SqlitePool) -> Result<Coverage> {
    let (min, max, days): (Option<String>, Option<String>, i64) = sqlx::query_as(
        "SELECT MIN(date), MAX(date), COUNT(DISTINCT date) FROM stg_version_downloads",
    )
    .fetch_one(pool)
    .await?;

    let parse = |s: Option<String>| -> Result<Option<NaiveDate>> {
        Ok(s.map(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d"))
            .transpose()?)
    };

    Ok(Coverage {
        min_date: parse(min)?,
        max_date: parse(max)?,
        distinct_days: days,
    })
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_days_ago(date: NaiveDate) -> String {
    let today = chrono::Utc::now().date_naive();
    let delta = (today - date).num_days();
    match delta {
        d if d < 0 => "in the future".to_string(),
        0 => "today".to_string(),
        1 => "1 day ago".to_string(),
        d => format!("{} days ago", d),
    }
}
