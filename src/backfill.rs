//! Backfill of daily download archives, newest to oldest.
//!
//! A run starts the day before the earliest date already present in
//! `stg_version_downloads` and walks backwards one day at a time:
//!
//! ```text
//! compute range ──▶ for date in start..=end (descending)
//!                      ├─ exception date  → skip
//!                      ├─ load_day ok     → record stats, next date
//!                      └─ load_day failed → abort run
//! ```
//!
//! Each date is checkpointed by the loader before the next one starts, so
//! an aborted run keeps every date it finished. Re-running resumes from the
//! new earliest date.

use anyhow::Result;
use chrono::{Days, NaiveDate};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::archive::{ArchiveFetcher, DayLoader};
use crate::config::Config;
use crate::db::{Warehouse, VERSION_DOWNLOADS_TABLE};
use crate::staging::table_exists;
use crate::retry::{RetryOutcome, RetryPolicy};

/// Dates with no upstream archive file.
pub const EXCEPTION_DATES: &[&str] = &["2014-11-15"];

pub fn is_exception_date(date: NaiveDate) -> bool {
    let formatted = date.format("%Y-%m-%d").to_string();
    EXCEPTION_DATES.contains(&formatted.as_str())
}

/// How far back a run should go. At most one of the two may be set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillOptions {
    /// Number of dates to process, counting the start date.
    pub days: Option<u32>,
    /// Oldest date to process, inclusive.
    pub to_date: Option<NaiveDate>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("cannot use both --backfill-days and --backfill-to-date")]
    ConflictingBounds,

    #[error("--backfill-to-date ({end}) must be before the backfill start date ({start})")]
    EndNotBeforeStart { start: NaiveDate, end: NaiveDate },

    #[error("stg_version_downloads is empty; load the database dump before backfilling")]
    NoExistingData,

    #[error("date out of range")]
    OutOfRange,
}

impl BackfillOptions {
    /// Reject option combinations before anything else is touched.
    pub fn validate(&self) -> Result<(), RangeError> {
        if self.days.is_some() && self.to_date.is_some() {
            return Err(RangeError::ConflictingBounds);
        }
        Ok(())
    }
}

/// Inclusive range of dates, processed from `start` down to `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl BackfillRange {
    /// Range for a table whose earliest date is `min_existing`.
    ///
    /// `days = N` covers exactly N dates; `days = 0` is an empty range.
    pub fn compute(
        min_existing: NaiveDate,
        options: &BackfillOptions,
        default_days: u32,
    ) -> Result<Self, RangeError> {
        options.validate()?;

        let start = min_existing
            .checked_sub_days(Days::new(1))
            .ok_or(RangeError::OutOfRange)?;

        let end = match (options.days, options.to_date) {
            (_, Some(end)) => {
                if end >= start {
                    return Err(RangeError::EndNotBeforeStart { start, end });
                }
                end
            }
            (days, None) => {
                let days = days.unwrap_or(default_days);
                if days == 0 {
                    start.checked_add_days(Days::new(1)).ok_or(RangeError::OutOfRange)?
                } else {
                    start
                        .checked_sub_days(Days::new(u64::from(days) - 1))
                        .ok_or(RangeError::OutOfRange)?
                }
            }
        };

        Ok(Self { start, end })
    }

    pub fn is_empty(&self) -> bool {
        self.end > self.start
    }

    /// Number of dates in the range, exception dates included.
    pub fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            (self.start - self.end).num_days() as u64 + 1
        }
    }

    /// Dates from `start` down to `end`, inclusive.
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        let first = if self.is_empty() { None } else { Some(self.start) };
        std::iter::successors(first, move |d| {
            d.checked_sub_days(Days::new(1)).filter(|prev| *prev >= end)
        })
    }
}

/// Observed totals for a run. Never affects control flow.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub dates_loaded: u64,
    pub dates_skipped: u64,
    pub bytes_downloaded: u64,
    pub db_size_before: u64,
    pub db_size_after: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub enum BackfillOutcome {
    /// Every date in the range was loaded or skipped.
    Completed {
        range: BackfillRange,
        stats: RunStats,
    },
    /// `failed_date` could not be loaded; older dates were not attempted.
    Aborted {
        range: BackfillRange,
        failed_date: NaiveDate,
        reason: String,
        stats: RunStats,
    },
}

impl BackfillOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BackfillOutcome::Completed { .. })
    }

    pub fn stats(&self) -> &RunStats {
        match self {
            BackfillOutcome::Completed { stats, .. } | BackfillOutcome::Aborted { stats, .. } => {
                stats
            }
        }
    }
}

/// Earliest date present in the fact table, if any.
pub async fn min_loaded_date(warehouse: &Warehouse) -> Result<Option<NaiveDate>> {
    let min: Option<String> = sqlx::query_scalar("SELECT MIN(date) FROM stg_version_downloads")
        .fetch_one(warehouse.pool())
        .await?;

    min.map(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d"))
        .transpose()
        .map_err(Into::into)
}

/// `cwh backfill`: open the warehouse, fetch from the configured archive
/// host and print a summary.
pub async fn run_backfill(config: &Config, options: BackfillOptions) -> Result<BackfillOutcome> {
    options.validate()?;

    let fetcher = ArchiveFetcher::new(&config.archive)?;
    let policy = RetryPolicy::from_secs(config.archive.max_attempts, config.archive.backoff_secs);

    let warehouse = Warehouse::open_existing(config).await?;
    let result = backfill(&warehouse, &fetcher, &policy, &options, config.archive.default_days).await;
    warehouse.close().await;

    let outcome = result?;
    print_summary(&outcome);
    Ok(outcome)
}

/// Drive a backfill against an already-open warehouse.
///
/// The fact table must already exist. Range errors are returned before any
/// date is attempted and before anything is written. The warehouse is left
/// open; closing it is the caller's job.
pub async fn backfill(
    warehouse: &Warehouse,
    loader: &dyn DayLoader,
    policy: &RetryPolicy,
    options: &BackfillOptions,
    default_days: u32,
) -> Result<BackfillOutcome> {
    if !table_exists(warehouse.pool(), VERSION_DOWNLOADS_TABLE).await? {
        return Err(RangeError::NoExistingData.into());
    }

    let min_existing = min_loaded_date(warehouse)
        .await?
        .ok_or(RangeError::NoExistingData)?;
    let range = BackfillRange::compute(min_existing, options, default_days)?;

    println!(
        "Backfilling from {} to {} ({} days)...",
        range.start,
        range.end,
        range.len()
    );

    let started = Instant::now();
    let mut stats = RunStats {
        db_size_before: warehouse.file_size(),
        ..Default::default()
    };
    let mut prev_size = stats.db_size_before;

    for date in range.dates() {
        if is_exception_date(date) {
            info!(%date, "skipping date with no upstream archive");
            stats.dates_skipped += 1;
            continue;
        }

        let label = date.to_string();
        let outcome = policy
            .run(&label, move |_| loader.load_day(warehouse, date))
            .await;

        match outcome {
            RetryOutcome::Succeeded { value: bytes, .. } => {
                stats.dates_loaded += 1;
                stats.bytes_downloaded += bytes;

                let db_size = warehouse.file_size();
                info!(
                    %date,
                    total_downloaded_mb = mb(stats.bytes_downloaded),
                    db_size_mb = mb(db_size),
                    prev_db_size_mb = mb(prev_size),
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "date loaded"
                );
                prev_size = db_size;
            }
            other => {
                let reason = failure_reason(&other);
                warn!(%date, "backfill aborted: {}", reason);
                stats.db_size_after = warehouse.file_size();
                stats.elapsed = started.elapsed();
                return Ok(BackfillOutcome::Aborted {
                    range,
                    failed_date: date,
                    reason,
                    stats,
                });
            }
        }
    }

    stats.db_size_after = warehouse.file_size();
    stats.elapsed = started.elapsed();
    Ok(BackfillOutcome::Completed { range, stats })
}

fn failure_reason<T>(outcome: &RetryOutcome<T>) -> String {
    match outcome {
        RetryOutcome::Succeeded { .. } => "succeeded".to_string(),
        RetryOutcome::Declined(_) => "loader reported failure".to_string(),
        RetryOutcome::Exhausted {
            attempts,
            last_error,
        } => format!("failed after {} attempts: {}", attempts, last_error),
        RetryOutcome::Fatal { error, .. } => format!("unexpected error: {}", error),
    }
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

fn print_summary(outcome: &BackfillOutcome) {
    let stats = outcome.stats();
    match outcome {
        BackfillOutcome::Completed { range, .. } => {
            println!("backfill {} -> {}", range.start, range.end);
        }
        BackfillOutcome::Aborted {
            failed_date,
            reason,
            ..
        } => {
            println!("BACKFILL ABORTED: failed to process {}: {}", failed_date, reason);
        }
    }
    println!("  dates loaded: {}", stats.dates_loaded);
    println!("  dates skipped: {}", stats.dates_skipped);
    println!("  downloaded: {:.1} MB", mb(stats.bytes_downloaded));
    println!(
        "  database size: {:.1} MB -> {:.1} MB",
        mb(stats.db_size_before),
        mb(stats.db_size_after)
    );
    println!("  elapsed: {:.1}s", stats.elapsed.as_secs_f64());
    if outcome.is_success() {
        println!("ok");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{insert_day_rows, DownloadRow};
    use crate::error::IngestError;
    use crate::migrate::create_schema;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    /// Inserts one row per date and fails on `fail_on`.
    struct FakeLoader {
        seen: Mutex<Vec<NaiveDate>>,
        fail_on: Option<NaiveDate>,
    }

    impl FakeLoader {
        fn new(fail_on: Option<NaiveDate>) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                fail_on,
            }
        }

        fn seen(&self) -> Vec<NaiveDate> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DayLoader for FakeLoader {
        async fn load_day(
            &self,
            warehouse: &Warehouse,
            date: NaiveDate,
        ) -> Result<(bool, u64), IngestError> {
            self.seen.lock().unwrap().push(date);
            if Some(date) == self.fail_on {
                return Err(IngestError::HttpStatus {
                    status: reqwest::StatusCode::NOT_FOUND,
                    url: format!("fake://{}", date),
                });
            }
            let row = DownloadRow {
                version_id: 1,
                downloads: 5,
            };
            insert_day_rows(warehouse.pool(), date, &[row]).await?;
            warehouse.checkpoint().await?;
            Ok((true, 100))
        }
    }

    async fn seeded_warehouse(tmp: &TempDir, min_date: &str) -> Warehouse {
        let config = Config::with_db_path(tmp.path().join("w.sqlite"));
        let warehouse = Warehouse::open(&config).await.unwrap();
        create_schema(warehouse.pool()).await.unwrap();
        let row = DownloadRow {
            version_id: 1,
            downloads: 1,
        };
        insert_day_rows(warehouse.pool(), date(min_date), &[row])
            .await
            .unwrap();
        warehouse
    }

    fn instant(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::ZERO)
    }

    #[test]
    fn default_range_is_thirty_dates_descending() {
        let range =
            BackfillRange::compute(date("2020-03-10"), &BackfillOptions::default(), 30).unwrap();
        let dates: Vec<_> = range.dates().collect();

        assert_eq!(dates.len(), 30);
        assert_eq!(range.len(), 30);
        assert_eq!(dates.first(), Some(&date("2020-03-09")));
        assert_eq!(dates.last(), Some(&date("2020-02-09")));
        assert!(dates.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn explicit_day_count() {
        let options = BackfillOptions {
            days: Some(3),
            to_date: None,
        };
        let range = BackfillRange::compute(date("2021-01-01"), &options, 30).unwrap();
        let dates: Vec<_> = range.dates().collect();
        assert_eq!(
            dates,
            vec![date("2020-12-31"), date("2020-12-30"), date("2020-12-29")]
        );
    }

    #[test]
    fn zero_days_is_empty() {
        let options = BackfillOptions {
            days: Some(0),
            to_date: None,
        };
        let range = BackfillRange::compute(date("2021-01-01"), &options, 30).unwrap();
        assert!(range.is_empty());
        assert_eq!(range.len(), 0);
        assert_eq!(range.dates().count(), 0);
    }

    #[test]
    fn to_date_is_inclusive() {
        let options = BackfillOptions {
            days: None,
            to_date: Some(date("2020-03-07")),
        };
        let range = BackfillRange::compute(date("2020-03-10"), &options, 30).unwrap();
        let dates: Vec<_> = range.dates().collect();
        assert_eq!(
            dates,
            vec![date("2020-03-09"), date("2020-03-08"), date("2020-03-07")]
        );
    }

    #[test]
    fn to_date_not_before_start_is_rejected() {
        for end in ["2020-03-09", "2020-03-10", "2021-01-01"] {
            let options = BackfillOptions {
                days: None,
                to_date: Some(date(end)),
            };
            let err = BackfillRange::compute(date("2020-03-10"), &options, 30).unwrap_err();
            assert_eq!(
                err,
                RangeError::EndNotBeforeStart {
                    start: date("2020-03-09"),
                    end: date(end),
                }
            );
        }
    }

    #[test]
    fn both_bounds_conflict() {
        let options = BackfillOptions {
            days: Some(5),
            to_date: Some(date("2019-01-01")),
        };
        assert_eq!(options.validate(), Err(RangeError::ConflictingBounds));
        assert_eq!(
            BackfillRange::compute(date("2020-03-10"), &options, 30),
            Err(RangeError::ConflictingBounds)
        );
    }

    #[tokio::test]
    async fn exception_date_is_never_loaded() {
        let tmp = TempDir::new().unwrap();
        let warehouse = seeded_warehouse(&tmp, "2014-11-18").await;
        let loader = FakeLoader::new(None);
        let options = BackfillOptions {
            days: Some(5),
            to_date: None,
        };

        let outcome = backfill(&warehouse, &loader, &instant(1), &options, 30)
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(
            loader.seen(),
            vec![
                date("2014-11-17"),
                date("2014-11-16"),
                date("2014-11-14"),
                date("2014-11-13")
            ]
        );
        assert_eq!(outcome.stats().dates_loaded, 4);
        assert_eq!(outcome.stats().dates_skipped, 1);
        assert_eq!(outcome.stats().bytes_downloaded, 400);

        warehouse.close().await;
    }

    #[tokio::test]
    async fn failure_stops_run_and_keeps_newer_dates() {
        let tmp = TempDir::new().unwrap();
        let warehouse = seeded_warehouse(&tmp, "2020-03-10").await;
        let loader = FakeLoader::new(Some(date("2020-03-06")));

        let outcome = backfill(
            &warehouse,
            &loader,
            &instant(3),
            &BackfillOptions::default(),
            30,
        )
        .await
        .unwrap();

        match &outcome {
            BackfillOutcome::Aborted {
                failed_date,
                reason,
                ..
            } => {
                assert_eq!(*failed_date, date("2020-03-06"));
                assert!(reason.contains("3 attempts"), "reason: {}", reason);
            }
            other => panic!("expected abort, got {:?}", other),
        }

        let seen = loader.seen();
        assert!(seen.iter().all(|d| *d >= date("2020-03-06")));
        assert_eq!(
            seen.iter().filter(|d| **d == date("2020-03-06")).count(),
            3
        );

        let min = min_loaded_date(&warehouse).await.unwrap();
        assert_eq!(min, Some(date("2020-03-07")));

        warehouse.close().await;
    }

    #[tokio::test]
    async fn empty_table_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("w.sqlite"));
        let warehouse = Warehouse::open(&config).await.unwrap();
        let loader = FakeLoader::new(None);

        let err = backfill(
            &warehouse,
            &loader,
            &instant(1),
            &BackfillOptions::default(),
            30,
        )
        .await
        .unwrap_err();

        assert_eq!(
            err.downcast_ref::<RangeError>(),
            Some(&RangeError::NoExistingData)
        );
        assert!(loader.seen().is_empty());

        warehouse.close().await;
    }

    #[tokio::test]
    async fn missing_database_is_not_created() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("typo/crates.sqlite"));

        let err = run_backfill(&config, BackfillOptions::default())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("database not found"), "{}", err);
        assert!(!tmp.path().join("typo").exists());
    }

    #[tokio::test]
    async fn missing_fact_table_is_left_missing() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("w.sqlite"));
        Warehouse::open(&config).await.unwrap().close().await;

        let err = run_backfill(&config, BackfillOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<RangeError>(),
            Some(&RangeError::NoExistingData)
        );

        let warehouse = Warehouse::open(&config).await.unwrap();
        assert!(!table_exists(warehouse.pool(), VERSION_DOWNLOADS_TABLE)
            .await
            .unwrap());
        warehouse.close().await;
    }

    #[tokio::test]
    async fn rerun_resumes_from_new_minimum() {
        let tmp = TempDir::new().unwrap();
        let warehouse = seeded_warehouse(&tmp, "2020-03-10").await;
        let options = BackfillOptions {
            days: Some(2),
            to_date: None,
        };

        let first = FakeLoader::new(None);
        backfill(&warehouse, &first, &instant(1), &options, 30)
            .await
            .unwrap();
        let second = FakeLoader::new(None);
        backfill(&warehouse, &second, &instant(1), &options, 30)
            .await
            .unwrap();

        assert_eq!(first.seen(), vec![date("2020-03-09"), date("2020-03-08")]);
        assert_eq!(second.seen(), vec![date("2020-03-07"), date("2020-03-06")]);

        warehouse.close().await;
    }
}
