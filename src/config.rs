//! TOML configuration parsing and validation.
//!
//! Every command reads the same file (default `./config/cwh.toml`). Only
//! `[db].path` is required; the archive, dump and server sections fall back
//! to the public crates.io endpoints and local `data/` directories.
//!
//! ```toml
//! [db]
//! path = "data/crates.sqlite"
//!
//! [archive]
//! base_url = "https://static.crates.io"
//! max_attempts = 3
//! backoff_secs = 5
//!
//! [server]
//! bind = "127.0.0.1:7331"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub dump: DumpConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Settings for the daily version-download archives.
#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    /// Host serving `/archive/version-downloads/<YYYY-MM-DD>.csv`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Local directory where each day's CSV is staged before loading.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    #[serde(default = "default_archive_timeout_secs")]
    pub timeout_secs: u64,
    /// Number of days processed by `cwh backfill` when no flag is given.
    #[serde(default = "default_days")]
    pub default_days: u32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            staging_dir: default_staging_dir(),
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
            timeout_secs: default_archive_timeout_secs(),
            default_days: default_days(),
        }
    }
}

fn default_base_url() -> String {
    "https://static.crates.io".to_string()
}
fn default_staging_dir() -> PathBuf {
    PathBuf::from("data/temp")
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_secs() -> u64 {
    5
}
fn default_archive_timeout_secs() -> u64 {
    300
}
fn default_days() -> u32 {
    30
}

/// Settings for the full database dump tarball.
#[derive(Debug, Deserialize, Clone)]
pub struct DumpConfig {
    #[serde(default = "default_dump_url")]
    pub url: String,
    #[serde(default = "default_dump_file")]
    pub file: PathBuf,
    #[serde(default = "default_extract_dir")]
    pub extract_dir: PathBuf,
    #[serde(default = "default_dump_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            url: default_dump_url(),
            file: default_dump_file(),
            extract_dir: default_extract_dir(),
            timeout_secs: default_dump_timeout_secs(),
        }
    }
}

fn default_dump_url() -> String {
    "https://static.crates.io/db-dump.tar.gz".to_string()
}
fn default_dump_file() -> PathBuf {
    PathBuf::from("data/raw/db-dump.tar.gz")
}
fn default_extract_dir() -> PathBuf {
    PathBuf::from("data/raw/extracted")
}
fn default_dump_timeout_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Directory of `*.yml` files served as the staging schema resource.
    #[serde(default)]
    pub schema_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            schema_dir: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7331".to_string()
}

impl Config {
    /// A config pointing at `path` with every other section defaulted.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            archive: ArchiveConfig::default(),
            dump: DumpConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;

    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.archive.base_url.trim().is_empty() {
        anyhow::bail!("archive.base_url must not be empty");
    }
    if config.archive.max_attempts == 0 {
        anyhow::bail!("archive.max_attempts must be >= 1");
    }
    if config.archive.timeout_secs == 0 {
        anyhow::bail!("archive.timeout_secs must be > 0");
    }
    if config.archive.default_days == 0 {
        anyhow::bail!("archive.default_days must be >= 1");
    }
    if config.dump.timeout_secs == 0 {
        anyhow::bail!("dump.timeout_secs must be > 0");
    }
    Ok(())
}
