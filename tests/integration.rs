use axum::{extract::Path as UrlPath, http::StatusCode, routing::get, Router};
use chrono::NaiveDate;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

use crates_warehouse::archive::{insert_day_rows, DownloadRow};
use crates_warehouse::backfill::min_loaded_date;
use crates_warehouse::config::Config;
use crates_warehouse::db::Warehouse;
use crates_warehouse::migrate::create_schema;

fn cwh_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("cwh");
    path
}

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

/// Serve `/archive/version-downloads/<date>.csv` for the given dates; every
/// other path is a 404. Returns the base URL.
fn spawn_archive_server(days: &[&str]) -> String {
    let files: HashMap<String, String> = days
        .iter()
        .map(|d| {
            (
                format!("{}.csv", d),
                "version_id,downloads\n1,10\n2,20\n3,30\n".to_string(),
            )
        })
        .collect();
    let files = Arc::new(files);

    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let app = Router::new().route(
                "/archive/version-downloads/{file}",
                get(move |UrlPath(file): UrlPath<String>| {
                    let files = files.clone();
                    async move {
                        match files.get(&file) {
                            Some(body) => (StatusCode::OK, body.clone()),
                            None => (StatusCode::NOT_FOUND, String::new()),
                        }
                    }
                }),
            );
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            tx.send(listener.local_addr().unwrap()).unwrap();
            axum::serve(listener, app).await.unwrap();
        });
    });

    format!("http://{}", rx.recv().unwrap())
}

fn setup_test_env(base_url: &str) -> (TempDir, PathBuf) {
    setup_test_env_with_timeout(base_url, 10)
}

fn setup_test_env_with_timeout(base_url: &str, timeout_secs: u64) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/crates.sqlite"

[archive]
base_url = "{base_url}"
staging_dir = "{root}/data/temp"
max_attempts = 2
backoff_secs = 0
timeout_secs = {timeout_secs}
default_days = 3

[dump]
file = "{root}/data/raw/db-dump.tar.gz"
extract_dir = "{root}/data/raw/extracted"

[server]
bind = "127.0.0.1:0"
"#,
        root = root.display(),
        base_url = base_url,
        timeout_secs = timeout_secs
    );

    let config_path = config_dir.join("cwh.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn db_config(tmp: &TempDir) -> Config {
    Config::with_db_path(tmp.path().join("data/crates.sqlite"))
}

/// Put one row dated `day` into the fact table.
fn seed(tmp: &TempDir, day: &str) {
    let config = db_config(tmp);
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let warehouse = Warehouse::open(&config).await.unwrap();
        create_schema(warehouse.pool()).await.unwrap();
        let row = DownloadRow {
            version_id: 1,
            downloads: 1,
        };
        insert_day_rows(warehouse.pool(), date(day), &[row])
            .await
            .unwrap();
        warehouse.close().await;
    });
}

fn min_date(tmp: &TempDir) -> Option<NaiveDate> {
    let config = db_config(tmp);
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let warehouse = Warehouse::open(&config).await.unwrap();
        let min = min_loaded_date(&warehouse).await.unwrap();
        warehouse.close().await;
        min
    })
}

/// Accepts connections and never answers them.
fn spawn_silent_server() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming().flatten() {
            held.push(stream);
        }
    });
    format!("http://{}", addr)
}

fn rows_on(tmp: &TempDir, day: &str) -> i64 {
    let config = db_config(tmp);
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let warehouse = Warehouse::open(&config).await.unwrap();
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM stg_version_downloads WHERE date = ?")
                .bind(day)
                .fetch_one(warehouse.pool())
                .await
                .unwrap();
        warehouse.close().await;
        count
    })
}

fn run_cwh(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = cwh_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run cwh binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

/// A base URL nothing listens on; any request fails fast.
const NO_SERVER: &str = "http://127.0.0.1:9";

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env(NO_SERVER);

    let (stdout, stderr, success) = run_cwh(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/crates.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env(NO_SERVER);

    let (_, _, success1) = run_cwh(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_cwh(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_cwh(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_backfill_conflicting_flags_rejected() {
    let (tmp, config_path) = setup_test_env(NO_SERVER);
    seed(&tmp, "2020-03-10");

    let (_, stderr, success) = run_cwh(
        &config_path,
        &[
            "backfill",
            "--backfill-days",
            "5",
            "--backfill-to-date",
            "2020-01-01",
        ],
    );
    assert!(!success);
    assert!(stderr.contains("cannot be used with"), "stderr: {}", stderr);
    assert_eq!(min_date(&tmp), Some(date("2020-03-10")));
}

#[test]
fn test_backfill_to_date_not_before_start_rejected() {
    let (tmp, config_path) = setup_test_env(NO_SERVER);
    seed(&tmp, "2020-03-10");

    for end in ["2020-03-09", "2020-03-15"] {
        let (_, stderr, success) =
            run_cwh(&config_path, &["backfill", "--backfill-to-date", end]);
        assert!(!success, "to-date {} should be rejected", end);
        assert!(stderr.contains("must be before"), "stderr: {}", stderr);
    }
    assert!(!tmp.path().join("data/temp").exists());
}

#[test]
fn test_backfill_invalid_date_rejected() {
    let (_tmp, config_path) = setup_test_env(NO_SERVER);
    let (_, stderr, success) =
        run_cwh(&config_path, &["backfill", "--backfill-to-date", "03/01/2020"]);
    assert!(!success);
    assert!(stderr.contains("expected YYYY-MM-DD"));
}

#[test]
fn test_backfill_requires_existing_data() {
    let (_tmp, config_path) = setup_test_env(NO_SERVER);
    run_cwh(&config_path, &["init"]);

    let (_, stderr, success) = run_cwh(&config_path, &["backfill"]);
    assert!(!success);
    assert!(stderr.contains("load the database dump"), "stderr: {}", stderr);
}

#[test]
fn test_backfill_loads_days_newest_first() {
    let base = spawn_archive_server(&["2020-03-09", "2020-03-08", "2020-03-07", "2020-03-06"]);
    let (tmp, config_path) = setup_test_env(&base);
    seed(&tmp, "2020-03-10");

    let (stdout, stderr, success) = run_cwh(&config_path, &["backfill"]);
    assert!(success, "backfill failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Backfilling from 2020-03-09 to 2020-03-07 (3 days)"));
    assert!(stdout.contains("dates loaded: 3"));
    assert!(stdout.contains("ok"));
    assert_eq!(min_date(&tmp), Some(date("2020-03-07")));

    // Staged files are removed after each day.
    let leftovers = fs::read_dir(tmp.path().join("data/temp")).unwrap().count();
    assert_eq!(leftovers, 0);

    // A second run resumes below the new minimum.
    let (stdout, _, success) = run_cwh(&config_path, &["backfill", "--backfill-days", "1"]);
    assert!(success);
    assert!(stdout.contains("Backfilling from 2020-03-06 to 2020-03-06 (1 days)"));
    assert_eq!(min_date(&tmp), Some(date("2020-03-06")));
}

#[test]
fn test_backfill_aborts_on_missing_archive() {
    let base = spawn_archive_server(&["2020-03-09", "2020-03-08"]);
    let (tmp, config_path) = setup_test_env(&base);
    seed(&tmp, "2020-03-10");

    let (stdout, stderr, success) =
        run_cwh(&config_path, &["backfill", "--backfill-days", "5"]);
    assert!(!success, "backfill should fail: stdout={}", stdout);
    assert!(stdout.contains("BACKFILL ABORTED"));
    assert!(stdout.contains("2020-03-07"));
    assert!(stderr.contains("backfill aborted at 2020-03-07"));

    // Everything newer than the failing date stays committed.
    assert_eq!(min_date(&tmp), Some(date("2020-03-08")));
}

#[test]
fn test_backfill_times_out_unresponsive_host() {
    let base = spawn_silent_server();
    let (tmp, config_path) = setup_test_env_with_timeout(&base, 1);
    seed(&tmp, "2020-03-10");

    let started = std::time::Instant::now();
    let (stdout, stderr, success) = run_cwh(&config_path, &["backfill"]);
    assert!(!success, "backfill should fail: stdout={}", stdout);
    assert!(
        stdout.contains("failed to process 2020-03-09: failed after 2 attempts"),
        "stdout: {}",
        stdout
    );
    assert!(stderr.contains("backfill aborted at 2020-03-09"));
    assert!(started.elapsed() < std::time::Duration::from_secs(30));
    assert_eq!(min_date(&tmp), Some(date("2020-03-10")));
}

#[test]
fn test_backfill_overwrites_stale_staged_file() {
    let base = spawn_archive_server(&["2020-03-09"]);
    let (tmp, config_path) = setup_test_env(&base);
    seed(&tmp, "2020-03-10");

    // Leftover from an interrupted download, with more rows than the real file.
    let staging = tmp.path().join("data/temp");
    fs::create_dir_all(&staging).unwrap();
    let mut junk = String::from("version_id,downloads\n");
    for id in 100..150 {
        junk.push_str(&format!("{},1\n", id));
    }
    fs::write(staging.join("2020-03-09.csv"), junk).unwrap();

    let (stdout, stderr, success) =
        run_cwh(&config_path, &["backfill", "--backfill-days", "1"]);
    assert!(success, "backfill failed: stdout={}, stderr={}", stdout, stderr);
    assert_eq!(rows_on(&tmp, "2020-03-09"), 3);
    assert!(!staging.join("2020-03-09.csv").exists());
}

#[test]
fn test_backfill_missing_database_is_not_created() {
    let (tmp, config_path) = setup_test_env(NO_SERVER);

    let (_, stderr, success) = run_cwh(&config_path, &["backfill"]);
    assert!(!success);
    assert!(stderr.contains("database not found"), "stderr: {}", stderr);
    assert!(!tmp.path().join("data").exists());
}

#[test]
fn test_backfill_skips_exception_date() {
    // No file for 2014-11-15; the run must still succeed.
    let base = spawn_archive_server(&["2014-11-16", "2014-11-14"]);
    let (tmp, config_path) = setup_test_env(&base);
    seed(&tmp, "2014-11-17");

    let (stdout, stderr, success) =
        run_cwh(&config_path, &["backfill", "--backfill-to-date", "2014-11-14"]);
    assert!(success, "backfill failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("dates skipped: 1"));
    assert_eq!(min_date(&tmp), Some(date("2014-11-14")));
}

#[test]
fn test_backfill_zero_days_is_a_no_op() {
    let (tmp, config_path) = setup_test_env(NO_SERVER);
    seed(&tmp, "2020-03-10");

    let (stdout, stderr, success) =
        run_cwh(&config_path, &["backfill", "--backfill-days", "0"]);
    assert!(success, "stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("(0 days)"));
    assert_eq!(min_date(&tmp), Some(date("2020-03-10")));
}

#[test]
fn test_stats_reports_coverage() {
    let (tmp, config_path) = setup_test_env(NO_SERVER);
    seed(&tmp, "2020-03-10");
    seed(&tmp, "2020-03-12");

    let (stdout, stderr, success) = run_cwh(&config_path, &["stats"]);
    assert!(success, "stats failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("stg_version_downloads"));
    assert!(stdout.contains("Earliest:  2020-03-10"));
    assert!(stdout.contains("Missing:   1 days"));
}

#[test]
fn test_stats_without_database_fails() {
    let (_tmp, config_path) = setup_test_env(NO_SERVER);
    let (_, stderr, success) = run_cwh(&config_path, &["stats"]);
    assert!(!success);
    assert!(stderr.contains("database not found"));
}

#[test]
fn test_completions_bash() {
    let (_tmp, config_path) = setup_test_env(NO_SERVER);
    let (stdout, _, success) = run_cwh(&config_path, &["completions", "bash"]);
    assert!(success);
    assert!(stdout.contains("cwh"));
    assert!(stdout.contains("backfill"));
}
