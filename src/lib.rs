//! # Crates Warehouse
//!
//! Ingests the crates.io public database dump and the daily version-download
//! archives into a local SQLite warehouse, and serves it to MCP clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────┐   ┌──────────────┐
//! │ db-dump      │──▶│ raw_*     │──▶│ stg_*        │
//! │ .tar.gz      │   │ (load)    │   │ (stage)      │
//! └──────────────┘   └───────────┘   └──────┬───────┘
//!                                           ▲
//! ┌──────────────┐   ┌───────────┐          │
//! │ archive/     │──▶│ backfill  │──────────┘
//! │ <date>.csv   │   │ + retry   │   stg_version_downloads
//! └──────────────┘   └───────────┘
//!                                    ┌──────────┐  ┌──────────┐
//!                  read-only  ──────▶│   MCP    │  │  report  │
//!                                    └──────────┘  └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Connections, namespaces, checkpoints |
//! | [`migrate`] | Fact table schema |
//! | [`error`] | Typed ingestion errors |
//! | [`retry`] | Bounded retry with linear backoff |
//! | [`archive`] | Per-day archive fetch-and-load |
//! | [`backfill`] | Backwards day-by-day backfill driver |
//! | [`dump`] | Dump download and extraction |
//! | [`load`] | Raw table loader |
//! | [`staging`] | Staging refresh |
//! | [`update`] | dump → load → stage |
//! | [`stats`] | Table and coverage summary |
//! | [`report`] | Orphan-version diagnostics |
//! | [`mcp`] | MCP tools, resource and prompt |
//! | [`server`] | HTTP and stdio transports |
//! | [`progress`] | Progress reporting on stderr |

pub mod archive;
pub mod backfill;
pub mod config;
pub mod db;
pub mod dump;
pub mod error;
pub mod load;
pub mod mcp;
pub mod migrate;
pub mod progress;
pub mod report;
pub mod retry;
pub mod server;
pub mod staging;
pub mod stats;
pub mod update;
