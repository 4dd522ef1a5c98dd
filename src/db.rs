//! SQLite connection management.
//!
//! The warehouse is a single SQLite file in WAL mode. Ingestion commands
//! hold exactly one writer connection; the query server and the report
//! open separate read-only connections to the same file, which WAL allows
//! while the writer is active.
//!
//! Namespaces are encoded as table-name prefixes (see [`Namespace`]) so
//! that the whole warehouse lives in one file.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, warn};

use crate::config::Config;

/// The fact table every backfill appends into.
pub const VERSION_DOWNLOADS_TABLE: &str = "stg_version_downloads";

/// Logical schema of a warehouse table, derived from its name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Raw,
    Staging,
    Marts,
}

impl Namespace {
    pub const ALL: [Namespace; 3] = [Namespace::Raw, Namespace::Staging, Namespace::Marts];

    pub fn name(&self) -> &'static str {
        match self {
            Namespace::Raw => "raw",
            Namespace::Staging => "staging",
            Namespace::Marts => "marts",
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Namespace::Raw => "raw_",
            Namespace::Staging => "stg_",
            Namespace::Marts => "mart_",
        }
    }

    /// Table name for `table` inside this namespace.
    pub fn qualify(&self, table: &str) -> String {
        format!("{}{}", self.prefix(), table)
    }

    /// Namespace of an existing table, or `None` for tables outside the warehouse.
    pub fn of_table(table: &str) -> Option<Namespace> {
        Self::ALL.into_iter().find(|ns| table.starts_with(ns.prefix()))
    }
}

/// Create the single-writer pool for ingestion.
///
/// Creates the database file and its parent directory if missing.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Writer pool on an existing database file. Nothing is created.
pub async fn connect_existing(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;
    ensure_exists(db_path)?;

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(false)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    Ok(pool)
}

fn ensure_exists(db_path: &Path) -> Result<()> {
    if !db_path.is_file() {
        anyhow::bail!(
            "database not found at {} (run `cwh init` first)",
            db_path.display()
        );
    }
    Ok(())
}

/// Open the database read-only. Fails if the file does not exist.
pub async fn connect_read_only(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;
    ensure_exists(db_path)?;

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .read_only(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Flush the WAL into the main database file and truncate it.
///
/// A checkpoint blocked by an open reader still returns `Ok`; the
/// `busy` flag is logged.
pub async fn checkpoint(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let (busy, log_frames, checkpointed): (i64, i64, i64) =
        sqlx::query_as("PRAGMA wal_checkpoint(TRUNCATE)")
            .fetch_one(pool)
            .await?;
    if busy != 0 {
        warn!(log_frames, checkpointed, "checkpoint blocked by a concurrent reader");
    } else {
        debug!(log_frames, checkpointed, "checkpoint complete");
    }
    Ok(())
}

/// Every namespaced table, ordered by namespace then name.
pub async fn warehouse_tables(pool: &SqlitePool) -> Result<Vec<(Namespace, String)>, sqlx::Error> {
    let names: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
    )
    .fetch_all(pool)
    .await?;

    let mut tables: Vec<(Namespace, String)> = names
        .into_iter()
        .filter_map(|name| Namespace::of_table(&name).map(|ns| (ns, name)))
        .collect();
    tables.sort_by_key(|(ns, name)| (Namespace::ALL.iter().position(|n| n == ns), name.clone()));
    Ok(tables)
}

/// Size in bytes of the database file, or 0 if it cannot be read.
pub fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// The writer connection held by an ingestion run.
///
/// Owned by the run for its whole duration. Callers must invoke
/// [`Warehouse::close`] on every exit path; `run_*` entry points do this
/// before returning their outcome.
pub struct Warehouse {
    pool: SqlitePool,
    path: PathBuf,
}

impl Warehouse {
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = connect(config)
            .await
            .with_context(|| format!("failed to open {}", config.db.path.display()))?;
        Ok(Self {
            pool,
            path: config.db.path.clone(),
        })
    }

    /// Open a database that must already exist, for runs that only add to
    /// it. A wrong path fails here instead of creating an empty file.
    pub async fn open_existing(config: &Config) -> Result<Self> {
        let pool = connect_existing(config).await?;
        Ok(Self {
            pool,
            path: config.db.path.clone(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        file_size(&self.path)
    }

    pub async fn checkpoint(&self) -> Result<(), sqlx::Error> {
        checkpoint(&self.pool).await
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_round_trip() {
        assert_eq!(Namespace::Raw.qualify("crates"), "raw_crates");
        assert_eq!(Namespace::of_table("stg_versions"), Some(Namespace::Staging));
        assert_eq!(Namespace::of_table("mart_daily"), Some(Namespace::Marts));
        assert_eq!(Namespace::of_table("sqlite_sequence"), None);
    }

    #[tokio::test]
    async fn read_only_requires_existing_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("missing.sqlite"));
        let err = connect_read_only(&config).await.unwrap_err();
        assert!(err.to_string().contains("database not found"));
    }

    #[tokio::test]
    async fn open_existing_never_creates_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("typo/crates.sqlite"));

        let err = Warehouse::open_existing(&config).await.err().unwrap();
        assert!(err.to_string().contains("database not found"));
        assert!(!tmp.path().join("typo").exists());

        let config = Config::with_db_path(tmp.path().join("w.sqlite"));
        Warehouse::open(&config).await.unwrap().close().await;
        let warehouse = Warehouse::open_existing(&config).await.unwrap();
        warehouse.checkpoint().await.unwrap();
        warehouse.close().await;
    }

    #[tokio::test]
    async fn checkpoint_with_open_reader_succeeds() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("w.sqlite"));
        let writer = Warehouse::open(&config).await.unwrap();
        sqlx::query("CREATE TABLE stg_t (x INTEGER)")
            .execute(writer.pool())
            .await
            .unwrap();

        let reader = connect_read_only(&config).await.unwrap();
        let mut tx = reader.begin().await.unwrap();
        let _: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stg_t")
            .fetch_one(&mut *tx)
            .await
            .unwrap();

        sqlx::query("INSERT INTO stg_t VALUES (1)")
            .execute(writer.pool())
            .await
            .unwrap();
        writer.checkpoint().await.unwrap();

        tx.rollback().await.unwrap();
        reader.close().await;
        writer.close().await;
    }

    #[tokio::test]
    async fn read_only_rejects_writes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("w.sqlite"));

        let writer = Warehouse::open(&config).await.unwrap();
        sqlx::query("CREATE TABLE stg_t (x INTEGER)")
            .execute(writer.pool())
            .await
            .unwrap();

        let reader = connect_read_only(&config).await.unwrap();
        let result = sqlx::query("INSERT INTO stg_t VALUES (1)")
            .execute(&reader)
            .await;
        assert!(result.is_err());

        reader.close().await;
        writer.close().await;
    }
}
