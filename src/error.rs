//! Typed errors for the ingestion path.
//!
//! Everything above the ingestion layer uses `anyhow`; the fetch-and-load
//! operations return [`IngestError`] so the retry policy can decide whether
//! a failure is worth another attempt.

use std::path::PathBuf;

use crate::retry::Transient;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Connection, TLS, body or timeout failure from the HTTP client.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        status: reqwest::StatusCode,
        url: String,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("CSV error in {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected archive layout: {0}")]
    Layout(String),
}

impl IngestError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn csv(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        Self::Csv {
            path: path.into(),
            source,
        }
    }
}

impl Transient for IngestError {
    /// Network and storage-engine faults are retried. A CSV fault is retried
    /// too because the next attempt downloads a fresh copy of the file.
    fn is_transient(&self) -> bool {
        matches!(
            self,
            IngestError::Network(_)
                | IngestError::HttpStatus { .. }
                | IngestError::Database(_)
                | IngestError::Csv { .. }
        )
    }
}
