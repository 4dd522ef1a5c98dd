//! Orphan-version diagnostics (`cwh report orphans`).
//!
//! An orphan is a download record whose `version_id` has no row in
//! `stg_versions`, usually because the version was deleted upstream after
//! its downloads were archived. The report runs a fixed set of aggregate
//! queries on a read-only connection and renders them as text with
//! proportional bars.

use anyhow::Result;
use chrono::NaiveDate;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::progress::format_number;
use crate::staging::table_exists;

/// Rows in the top-orphans table.
pub const TOP_ORPHANS: i64 = 30;

const BAR_WIDTH: usize = 40;

/// `println!` into a `String`.
macro_rules! emit {
    ($out:expr) => {
        $out.push('\n')
    };
    ($out:expr, $($arg:tt)*) => {{
        $out.push_str(&format!($($arg)*));
        $out.push('\n');
    }};
}

const ORPHAN_JOIN: &str = "FROM stg_version_downloads vd \
     LEFT JOIN stg_versions v ON vd.version_id = v.id";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    pub total_crates: i64,
    pub total_versions: i64,
    pub orphan_versions: i64,
    pub total_downloads: i64,
    pub orphan_downloads: i64,
    pub total_records: i64,
    pub orphan_records: i64,
    pub orphan_first: Option<String>,
    pub orphan_last: Option<String>,
    pub avg_orphan_downloads: Option<f64>,
    pub avg_all_downloads: Option<f64>,
}

impl Summary {
    /// Days between the first and last orphan record.
    pub fn orphan_span_days(&self) -> i64 {
        let parse = |s: &Option<String>| {
            s.as_deref()
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        };
        match (parse(&self.orphan_first), parse(&self.orphan_last)) {
            (Some(first), Some(last)) => (last - first).num_days(),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct MonthlyDownloads {
    pub month: String,
    pub orphan_downloads: i64,
    pub valid_downloads: i64,
    pub total_downloads: i64,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct MonthlyOrphanIds {
    pub month: String,
    pub distinct_orphan_ids: i64,
    pub orphan_records: i64,
    pub orphan_downloads: i64,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TopOrphan {
    pub version_id: i64,
    pub record_count: i64,
    pub total_downloads: i64,
    pub first_seen: String,
    pub last_seen: String,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct MonthlyRate {
    pub month: String,
    pub total_records: i64,
    pub orphan_records: i64,
    pub orphan_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct YearlyComparison {
    pub year: String,
    pub total_version_ids: i64,
    pub orphan_records: i64,
    pub orphan_version_ids: i64,
    pub orphan_downloads: i64,
    pub total_downloads: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrphanReport {
    pub summary: Summary,
    pub monthly_downloads: Vec<MonthlyDownloads>,
    pub monthly_orphan_ids: Vec<MonthlyOrphanIds>,
    pub top_orphans: Vec<TopOrphan>,
    pub monthly_rate: Vec<MonthlyRate>,
    pub yearly: Vec<YearlyComparison>,
}

pub async fn run_orphan_report(config: &Config) -> Result<()> {
    let pool = db::connect_read_only(config).await?;
    let result = orphan_report(&pool).await;
    pool.close().await;

    print!("{}", render(&result?));
    Ok(())
}

pub async fn orphan_report(pool: &SqlitePool) -> Result<OrphanReport> {
    for table in ["stg_crates", "stg_versions", "stg_version_downloads"] {
        if !table_exists(pool, table).await? {
            anyhow::bail!("{} not found (run `cwh load` and `cwh stage` first)", table);
        }
    }

    Ok(OrphanReport {
        summary: summary(pool).await?,
        monthly_downloads: sqlx::query_as(&format!(
            "SELECT substr(vd.date, 1, 7) AS month, \
                 COALESCE(SUM(CASE WHEN v.id IS NULL THEN vd.downloads ELSE 0 END), 0) AS orphan_downloads, \
                 COALESCE(SUM(CASE WHEN v.id IS NOT NULL THEN vd.downloads ELSE 0 END), 0) AS valid_downloads, \
                 COALESCE(SUM(vd.downloads), 0) AS total_downloads \
             {ORPHAN_JOIN} GROUP BY month ORDER BY month"
        ))
        .fetch_all(pool)
        .await?,
        monthly_orphan_ids: sqlx::query_as(&format!(
            "SELECT substr(vd.date, 1, 7) AS month, \
                 COUNT(DISTINCT vd.version_id) AS distinct_orphan_ids, \
                 COUNT(*) AS orphan_records, \
                 COALESCE(SUM(vd.downloads), 0) AS orphan_downloads \
             {ORPHAN_JOIN} WHERE v.id IS NULL GROUP BY month ORDER BY month"
        ))
        .fetch_all(pool)
        .await?,
        top_orphans: sqlx::query_as(&format!(
            "SELECT vd.version_id AS version_id, \
                 COUNT(*) AS record_count, \
                 COALESCE(SUM(vd.downloads), 0) AS total_downloads, \
                 MIN(vd.date) AS first_seen, \
                 MAX(vd.date) AS last_seen \
             {ORPHAN_JOIN} WHERE v.id IS NULL \
             GROUP BY vd.version_id ORDER BY total_downloads DESC, vd.version_id LIMIT ?"
        ))
        .bind(TOP_ORPHANS)
        .fetch_all(pool)
        .await?,
        monthly_rate: sqlx::query_as(&format!(
            "SELECT substr(vd.date, 1, 7) AS month, \
                 COUNT(*) AS total_records, \
                 SUM(CASE WHEN v.id IS NULL THEN 1 ELSE 0 END) AS orphan_records, \
                 SUM(CASE WHEN v.id IS NULL THEN 1 ELSE 0 END) * 100.0 / COUNT(*) AS orphan_percentage \
             {ORPHAN_JOIN} GROUP BY month ORDER BY month"
        ))
        .fetch_all(pool)
        .await?,
        yearly: sqlx::query_as(&format!(
            "SELECT substr(vd.date, 1, 4) AS year, \
                 COUNT(DISTINCT vd.version_id) AS total_version_ids, \
                 SUM(CASE WHEN v.id IS NULL THEN 1 ELSE 0 END) AS orphan_records, \
                 COUNT(DISTINCT CASE WHEN v.id IS NULL THEN vd.version_id END) AS orphan_version_ids, \
                 COALESCE(SUM(CASE WHEN v.id IS NULL THEN vd.downloads ELSE 0 END), 0) AS orphan_downloads, \
                 COALESCE(SUM(vd.downloads), 0) AS total_downloads \
             {ORPHAN_JOIN} GROUP BY year ORDER BY year"
        ))
        .fetch_all(pool)
        .await?,
    })
}

async fn summary(pool: &SqlitePool) -> Result<Summary> {
    let total_crates: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stg_crates")
        .fetch_one(pool)
        .await?;
    let total_versions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stg_versions")
        .fetch_one(pool)
        .await?;

    let (total_records, total_downloads, avg_all_downloads): (i64, Option<i64>, Option<f64>) =
        sqlx::query_as(
            "SELECT COUNT(*), SUM(downloads), AVG(downloads) FROM stg_version_downloads",
        )
        .fetch_one(pool)
        .await?;

    #[allow(clippy::type_complexity)]
    let (orphan_versions, orphan_records, orphan_downloads, orphan_first, orphan_last, avg_orphan): (
        i64,
        i64,
        Option<i64>,
        Option<String>,
        Option<String>,
        Option<f64>,
    ) = sqlx::query_as(&format!(
        "SELECT COUNT(DISTINCT vd.version_id), COUNT(*), SUM(vd.downloads), \
             MIN(vd.date), MAX(vd.date), AVG(vd.downloads) \
         {ORPHAN_JOIN} WHERE v.id IS NULL"
    ))
    .fetch_one(pool)
    .await?;

    Ok(Summary {
        total_crates,
        total_versions,
        orphan_versions,
        total_downloads: total_downloads.unwrap_or(0),
        orphan_downloads: orphan_downloads.unwrap_or(0),
        total_records,
        orphan_records,
        orphan_first,
        orphan_last,
        avg_orphan_downloads: avg_orphan,
        avg_all_downloads,
    })
}

fn pct(part: i64, whole: i64) -> f64 {
    if whole > 0 {
        part as f64 * 100.0 / whole as f64
    } else {
        0.0
    }
}

/// `value` scaled against `max` as a row of `#`.
pub fn bar(value: f64, max: f64, width: usize) -> String {
    if max <= 0.0 || value <= 0.0 {
        return String::new();
    }
    let len = ((value / max) * width as f64).round() as usize;
    "#".repeat(len.clamp(1, width))
}

fn n(v: i64) -> String {
    format_number(v.max(0) as u64)
}

pub fn render(report: &OrphanReport) -> String {
    let mut out = String::new();
    let s = &report.summary;

    emit!(out, "Orphan Version Diagnostics");
    emit!(out, "==========================");
    emit!(out);
    emit!(out, "Summary");
    emit!(out, "  Total crates:            {}", n(s.total_crates));
    emit!(out, "  Total versions:          {}", n(s.total_versions));
    emit!(
        out,
        "  Orphan version IDs:      {} ({:.2}% of versions)",
        n(s.orphan_versions),
        pct(s.orphan_versions, s.total_versions)
    );
    emit!(
        out,
        "  Total downloads:         {:.2}B",
        s.total_downloads as f64 / 1e9
    );
    emit!(
        out,
        "  Orphan downloads:        {} ({:.4}% of downloads)",
        n(s.orphan_downloads),
        pct(s.orphan_downloads, s.total_downloads)
    );
    emit!(
        out,
        "  Orphan records:          {} ({:.2}% of records)",
        n(s.orphan_records),
        pct(s.orphan_records, s.total_records)
    );
    out.push_str(&format!(
        "  Orphan date range:       {} days",
        s.orphan_span_days()
    ));
    if let (Some(first), Some(last)) = (&s.orphan_first, &s.orphan_last) {
        out.push_str(&format!(" ({} to {})", first, last));
    }
    out.push('\n');
    match (s.avg_orphan_downloads, s.avg_all_downloads) {
        (Some(orphan), Some(all)) if all > 0.0 => {
            emit!(
                out,
                "  Avg downloads/orphan:    {:.1} ({:+.1}% vs all records)",
                orphan,
                (orphan - all) / all * 100.0
            );
        }
        (Some(orphan), _) => {
            emit!(out, "  Avg downloads/orphan:    {:.1}", orphan);
        }
        _ => {
            emit!(out, "  Avg downloads/orphan:    0");
        }
    }

    emit!(out);
    emit!(out, "Monthly downloads: valid vs orphan");
    if report.monthly_downloads.is_empty() {
        emit!(out, "  (no data)");
    }
    let max_valid = report
        .monthly_downloads
        .iter()
        .map(|m| m.valid_downloads)
        .max()
        .unwrap_or(0) as f64;
    let max_orphan = report
        .monthly_downloads
        .iter()
        .map(|m| m.orphan_downloads)
        .max()
        .unwrap_or(0) as f64;
    for m in &report.monthly_downloads {
        emit!(
            out,
            "  {}  valid  {:>16} {}",
            m.month,
            n(m.valid_downloads),
            bar(m.valid_downloads as f64, max_valid, BAR_WIDTH)
        );
        emit!(
            out,
            "           orphan {:>16} {}",
            n(m.orphan_downloads),
            bar(m.orphan_downloads as f64, max_orphan, BAR_WIDTH)
        );
    }

    emit!(out);
    emit!(out, "Monthly distinct orphan version IDs");
    if report.monthly_orphan_ids.is_empty() {
        emit!(out, "  (no orphans)");
    } else {
        let max = report
            .monthly_orphan_ids
            .iter()
            .map(|m| m.distinct_orphan_ids)
            .max()
            .unwrap_or(0);
        for m in &report.monthly_orphan_ids {
            emit!(
                out,
                "  {}  {:>10} ids {:>10} records  {}",
                m.month,
                n(m.distinct_orphan_ids),
                n(m.orphan_records),
                bar(m.distinct_orphan_ids as f64, max as f64, BAR_WIDTH)
            );
        }
        let months = report.monthly_orphan_ids.len() as f64;
        let total_ids: i64 = report
            .monthly_orphan_ids
            .iter()
            .map(|m| m.distinct_orphan_ids)
            .sum();
        let total_records: i64 = report
            .monthly_orphan_ids
            .iter()
            .map(|m| m.orphan_records)
            .sum();
        emit!(out, "  Peak IDs in one month:   {}", n(max));
        emit!(out, "  Avg IDs per month:       {:.0}", total_ids as f64 / months);
        if total_ids > 0 {
            emit!(
                out,
                "  Avg records per ID:      {:.1}",
                total_records as f64 / total_ids as f64
            );
        }
    }

    emit!(out);
    emit!(out, "Top orphan version IDs by downloads");
    if report.top_orphans.is_empty() {
        emit!(out, "  (no orphans)");
    } else {
        emit!(
            out,
            "  {:>12} {:>8} {:>16}  {:<10}  {:<10}",
            "VERSION_ID", "RECORDS", "DOWNLOADS", "FIRST", "LAST"
        );
        for o in &report.top_orphans {
            emit!(
                out,
                "  {:>12} {:>8} {:>16}  {:<10}  {:<10}",
                o.version_id,
                n(o.record_count),
                n(o.total_downloads),
                o.first_seen,
                o.last_seen
            );
        }
    }

    emit!(out);
    emit!(out, "Orphan rate over time");
    let max_rate = report
        .monthly_rate
        .iter()
        .map(|m| m.orphan_percentage)
        .fold(0.0, f64::max);
    for m in &report.monthly_rate {
        emit!(
            out,
            "  {}  {:>8.3}%  {}",
            m.month,
            m.orphan_percentage,
            bar(m.orphan_percentage, max_rate, BAR_WIDTH)
        );
    }
    if let Some(last) = report.monthly_rate.last() {
        let avg = report
            .monthly_rate
            .iter()
            .map(|m| m.orphan_percentage)
            .sum::<f64>()
            / report.monthly_rate.len() as f64;
        emit!(out, "  Current month:  {:.3}%", last.orphan_percentage);
        emit!(out, "  Average:        {:.3}%", avg);
        emit!(out, "  Peak:           {:.3}%", max_rate);
    }

    emit!(out);
    emit!(out, "Yearly comparison");
    if report.yearly.is_empty() {
        emit!(out, "  (no data)");
    } else {
        emit!(
            out,
            "  {:<6} {:>12} {:>12} {:>9} {:>16} {:>10}",
            "YEAR", "VERSION_IDS", "ORPHAN_IDS", "ID_PCT", "ORPHAN_DL", "DL_PCT"
        );
        for y in &report.yearly {
            emit!(
                out,
                "  {:<6} {:>12} {:>12} {:>8.2}% {:>16} {:>9.4}%",
                y.year,
                n(y.total_version_ids),
                n(y.orphan_version_ids),
                pct(y.orphan_version_ids, y.total_version_ids),
                n(y.orphan_downloads),
                pct(y.orphan_downloads, y.total_downloads)
            );
        }
    }

    out
}
