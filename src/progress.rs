//! Transfer and load progress reporting.
//!
//! Reports observable progress during `cwh dump` and `cwh load` so users see
//! how much of the tarball has arrived and which raw table is being filled.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// `bytes` of `total` received so far. `total` is unknown when the
    /// server sends no content length.
    Downloading {
        label: String,
        bytes: u64,
        total: Option<u64>,
    },
    /// `rows` inserted so far into `table`.
    Loading { table: String, rows: u64 },
}

/// Reports progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "download db-dump.tar.gz  12.0 MB / 400.0 MB (3.0%)".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Downloading {
                label,
                bytes,
                total: Some(total),
            } if *total > 0 => {
                format!(
                    "download {}  {} / {} ({:.1}%)\n",
                    label,
                    format_mb(*bytes),
                    format_mb(*total),
                    *bytes as f64 * 100.0 / *total as f64
                )
            }
            ProgressEvent::Downloading { label, bytes, .. } => {
                format!("download {}  {}\n", label, format_mb(*bytes))
            }
            ProgressEvent::Loading { table, rows } => {
                format!("load {}  {} rows\n", table, format_number(*rows))
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Downloading {
                label,
                bytes,
                total,
            } => serde_json::json!({
                "event": "progress",
                "phase": "downloading",
                "file": label,
                "bytes": bytes,
                "total": total
            }),
            ProgressEvent::Loading { table, rows } => serde_json::json!({
                "event": "progress",
                "phase": "loading",
                "table": table,
                "rows": rows
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

fn format_mb(bytes: u64) -> String {
    format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

/// Emits an event only when the value crosses the next `step`.
pub struct Throttle {
    step: u64,
    next: u64,
}

impl Throttle {
    pub fn new(step: u64) -> Self {
        let step = step.max(1);
        Self { step, next: step }
    }

    pub fn due(&mut self, value: u64) -> bool {
        if value >= self.next {
            self.next = (value / self.step + 1) * self.step;
            true
        } else {
            false
        }
    }
}
