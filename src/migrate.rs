use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the staging fact table and its index. Idempotent.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stg_version_downloads (
            version_id INTEGER NOT NULL,
            downloads INTEGER NOT NULL CHECK (downloads >= 0),
            date TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_stg_version_downloads_date ON stg_version_downloads(date)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_stg_version_downloads_version ON stg_version_downloads(version_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
