//! # Crates Warehouse CLI (`cwh`)
//!
//! The `cwh` binary builds and serves a local analytical database of the
//! crates.io registry: the full database dump plus the daily
//! version-download archives.
//!
//! ## Usage
//!
//! ```bash
//! cwh --config ./config/cwh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cwh init` | Create the database and the download fact table |
//! | `cwh dump` | Download and extract the crates.io database dump |
//! | `cwh load` | Recreate `raw_*` tables from the extracted dump |
//! | `cwh stage` | Refresh `stg_*` tables from the raw tables |
//! | `cwh update` | dump → load → stage in one go |
//! | `cwh backfill` | Load older daily download archives, newest first |
//! | `cwh stats` | Table sizes and download date coverage |
//! | `cwh report orphans` | Orphan-version diagnostics |
//! | `cwh serve mcp` | Start the MCP query server |
//!
//! ## Examples
//!
//! ```bash
//! # First run
//! cwh init
//! cwh update
//!
//! # Extend download history by 90 days
//! cwh backfill --backfill-days 90
//!
//! # Backfill down to a given date
//! cwh backfill --backfill-to-date 2014-11-10
//!
//! # Serve the warehouse to a desktop MCP client
//! cwh serve mcp --transport stdio
//! ```

use anyhow::Context;
use chrono::NaiveDate;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crates_warehouse::backfill::{self, BackfillOptions, BackfillOutcome};
use crates_warehouse::config;
use crates_warehouse::dump::{self, DumpOptions};
use crates_warehouse::load;
use crates_warehouse::migrate;
use crates_warehouse::progress::ProgressMode;
use crates_warehouse::report;
use crates_warehouse::server::{self, Transport};
use crates_warehouse::staging;
use crates_warehouse::stats;
use crates_warehouse::update;

/// Crates Warehouse CLI: crates.io dump and download-archive ingestion.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/cwh.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "cwh",
    about = "Crates Warehouse: ingest crates.io data into a local analytical database",
    version,
    long_about = "Crates Warehouse downloads the crates.io database dump and the daily \
    version-download archives, loads them into a local SQLite warehouse with raw, staging \
    and marts namespaces, and serves the result to MCP clients for conversational analysis."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/cwh.toml`. Database, archive, dump and server
    /// settings are read from this file.
    #[arg(long, global = true, default_value = "./config/cwh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the `stg_version_downloads`
    /// fact table with its indexes. Running it multiple times is safe.
    Init,

    /// Download and extract the crates.io database dump.
    Dump {
        /// Skip the download and only extract an existing dump file.
        #[arg(long)]
        skip_download: bool,

        /// Dump tarball location (defaults to `[dump].file`).
        #[arg(long)]
        dump_file: Option<PathBuf>,

        /// Extraction directory (defaults to `[dump].extract_dir`).
        #[arg(long)]
        extract_dir: Option<PathBuf>,

        /// Progress output on stderr (defaults to human on a TTY, off otherwise).
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Recreate every `raw_*` table from the extracted dump.
    ///
    /// Each CSV in the dump's `data/` folder replaces its table. The
    /// extraction directory is removed afterwards.
    Load {
        /// Extraction directory (defaults to `[dump].extract_dir`).
        #[arg(long)]
        extract_dir: Option<PathBuf>,

        /// Keep the extracted CSV files.
        #[arg(long)]
        keep_extracted: bool,

        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Refresh `stg_*` tables from the raw tables.
    ///
    /// Dimension tables are rebuilt; version downloads newer than the latest
    /// staged date are appended.
    Stage,

    /// Download, load and stage the latest dump in one run.
    Update {
        #[arg(long)]
        keep_extracted: bool,

        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Load daily download archives older than the earliest loaded date.
    ///
    /// Starts the day before the earliest date in `stg_version_downloads`
    /// and works backwards one day at a time. The run stops at the first
    /// date that cannot be loaded; every newer date stays committed, so
    /// re-running resumes where it stopped.
    Backfill {
        /// Number of days to load (defaults to `[archive].default_days`).
        #[arg(long, conflicts_with = "backfill_to_date")]
        backfill_days: Option<u32>,

        /// Oldest date to load, inclusive (YYYY-MM-DD).
        #[arg(long, value_parser = parse_date)]
        backfill_to_date: Option<NaiveDate>,
    },

    /// Show table sizes and download date coverage.
    Stats,

    /// Diagnostic reports.
    Report {
        #[command(subcommand)]
        report: ReportKind,
    },

    /// Start a server.
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },

    /// Generate shell completion scripts.
    ///
    /// Prints a completion script for the given shell to stdout.
    /// Example: `cwh completions zsh > ~/.zfunc/_cwh`
    Completions {
        /// Target shell.
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ReportKind {
    /// Download records whose version no longer exists.
    Orphans,
}

/// Server subcommands.
#[derive(Subcommand)]
enum ServeService {
    /// Start the MCP query server.
    ///
    /// Opens the database read-only and exposes `list_tables`, `read_query`,
    /// the staging schema resource and the analytics setup prompt.
    Mcp {
        /// `http` binds to `[server].bind`; `stdio` talks JSON-RPC on stdin/stdout.
        #[arg(long, value_enum, default_value = "http")]
        transport: Transport,
    },
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| format!("invalid date '{}' (expected YYYY-MM-DD): {}", s, e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays clean for the stdio transport.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("crates_warehouse=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "cwh", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    let reporter = |mode: Option<ProgressMode>| {
        mode.unwrap_or_else(ProgressMode::default_for_tty)
            .reporter()
    };

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Dump {
            skip_download,
            dump_file,
            extract_dir,
            progress,
        } => {
            let options = DumpOptions {
                skip_download,
                dump_file,
                extract_dir,
            };
            dump::run_dump(&cfg, &options, reporter(progress).as_ref()).await?;
        }
        Commands::Load {
            extract_dir,
            keep_extracted,
            progress,
        } => {
            load::run_load(
                &cfg,
                extract_dir.as_deref(),
                keep_extracted,
                reporter(progress).as_ref(),
            )
            .await?;
        }
        Commands::Stage => {
            staging::run_stage(&cfg).await?;
        }
        Commands::Update {
            keep_extracted,
            progress,
        } => {
            update::run_update(&cfg, keep_extracted, reporter(progress).as_ref()).await?;
        }
        Commands::Backfill {
            backfill_days,
            backfill_to_date,
        } => {
            let options = BackfillOptions {
                days: backfill_days,
                to_date: backfill_to_date,
            };
            let outcome = backfill::run_backfill(&cfg, options)
                .await
                .context("backfill not started")?;
            if let BackfillOutcome::Aborted { failed_date, .. } = outcome {
                anyhow::bail!("backfill aborted at {}", failed_date);
            }
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Report { report } => match report {
            ReportKind::Orphans => report::run_orphan_report(&cfg).await?,
        },
        Commands::Serve { service } => match service {
            ServeService::Mcp { transport } => {
                server::run_server(&cfg, transport).await?;
            }
        },
        Commands::Completions { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
