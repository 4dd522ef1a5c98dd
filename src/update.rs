//! `cwh update`: refresh the warehouse from the latest dump.
//!
//! Runs dump → load → stage in order and stops at the first failing step.
//! Archive backfills are separate (`cwh backfill`) because they extend the
//! history backwards rather than refreshing it.

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use crate::dump::{run_dump, DumpOptions};
use crate::load::run_load;
use crate::progress::ProgressReporter;
use crate::staging::run_stage;

pub async fn run_update(
    config: &Config,
    keep_extracted: bool,
    progress: &dyn ProgressReporter,
) -> Result<()> {
    println!("Crates warehouse update");
    println!("  1. download the latest crates.io database dump");
    println!("  2. recreate every raw table from the dump");
    println!("  3. refresh staging (incremental for version downloads)");
    println!();

    println!("[1/3] Downloading latest crates.io database dump...");
    let extract_dir = run_dump(config, &DumpOptions::default(), progress)
        .await
        .context("update failed at step 1 (dump)")?;

    println!();
    println!("[2/3] Recreating raw tables...");
    let loaded = run_load(config, Some(&extract_dir), keep_extracted, progress)
        .await
        .context("update failed at step 2 (load)")?;
    info!(tables = loaded.len(), "raw tables loaded");

    println!();
    println!("[3/3] Refreshing staging tables...");
    run_stage(config)
        .await
        .context("update failed at step 3 (stage)")?;

    println!();
    println!("Update complete. Database: {}", config.db.path.display());
    Ok(())
}
