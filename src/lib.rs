//! Symfetch - dSYM acquisition for crash reports
//!
//! Finds the debug symbol bundles a crash report needs by running a
//! user-supplied fetch script, following its progress and collecting the
//! dSYMs it reports.
//!
//! # Features
//!
//! - Apple crash log header and binary image parsing
//! - One in-flight fetch per build UUID, with retry after completion
//! - Live progress scraped from curl's progress meter
//! - Cancelable tasks with observable status
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use symfetch::{CrashReport, DsymDownloader, FetchConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let downloader = DsymDownloader::new(FetchConfig::default())?;
//!     let crash = CrashReport::parse(&std::fs::read_to_string("MyApp.crash")?);
//!
//!     if let Some(task) = downloader.request(Arc::new(crash), None) {
//!         task.settled().await;
//!         println!("{:?}", task.dsym_files());
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crash;
pub mod dsym;

pub use config::{resolve_download_dir, FetchConfig};
pub use crash::{normalize_uuid, BinaryImage, CrashReport};
pub use dsym::{
    crash_env, parse_dsym_output, DownloadTask, DsymDownloader, DsymFile, FetchError,
    FetchProgress, FetchStatus, TaskSnapshot,
};
