//! dSYM acquisition pipeline.
//!
//! Symbols are fetched by an external, user-replaceable script. This module
//! runs that script for a crash report, follows its progress and collects the
//! dSYM bundles it reports.
//!
//! # Pipeline
//!
//! 1. [`DsymDownloader::request`] looks up or creates the [`DownloadTask`]
//!    for the report's build UUID. At most one fetch per UUID is in flight.
//! 2. [`DownloadTask::run`] saves the crash log, spawns
//!    `script <crash-file> <dsym-dir>` with the environment from
//!    [`crash_env`], and streams stderr through [`FetchProgress`].
//! 3. When the script exits, its stdout goes through [`parse_dsym_output`]
//!    and the task settles on [`FetchStatus::Success`] or
//!    [`FetchStatus::Failed`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use symfetch::dsym::DsymDownloader;
//! use symfetch::{CrashReport, FetchConfig};
//!
//! let downloader = DsymDownloader::new(FetchConfig::default())?;
//! let crash = Arc::new(CrashReport::parse(&std::fs::read_to_string("MyApp.crash")?));
//!
//! if let Some(task) = downloader.request(crash, None) {
//!     let mut status = task.subscribe_status();
//!     while status.changed().await.is_ok() {
//!         println!("{:?}", *status.borrow());
//!     }
//! }
//! ```

mod downloader;
mod env;
mod output;
mod progress;
mod script;
mod task;

pub use downloader::DsymDownloader;
pub use env::{crash_env, legacy_app_version};
pub use output::{parse_dsym_output, DsymFile, DSYM_SUFFIX};
pub use progress::{FetchProgress, CURL_PROGRESS_HEADER};
pub use script::{can_download, install_script, prepare_download_script, DEFAULT_SCRIPT};
pub use task::{DownloadTask, FetchStatus, TaskSnapshot};

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// The crash log could not be written to disk; no script was started.
pub const SAVE_FAILED_CODE: i32 = -1001;
/// The fetch script could not be started.
pub const SPAWN_FAILED_CODE: i32 = -1002;
/// The script ended without an exit code, e.g. killed after a cancel.
pub const TERMINATED_CODE: i32 = -1;

/// Errors raised inside the pipeline.
///
/// They never escape a task or the downloader; tasks turn them into
/// [`FetchStatus::Failed`] and the downloader into an absent task.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fetch script {} is missing, empty or not executable", .0.display())]
    ScriptUnavailable(PathBuf),

    #[error("Failed to spawn {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("No async runtime available to run fetch tasks")]
    NoRuntime,
}

/// Locks `mutex`, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
