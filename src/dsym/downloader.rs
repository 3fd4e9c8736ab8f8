//! Registry of dSYM fetches keyed by build UUID.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::script::{can_download, prepare_download_script};
use super::task::DownloadTask;
use super::{lock, FetchError};
use crate::config::FetchConfig;
use crate::crash::CrashReport;

/// Hands out [`DownloadTask`]s, one in flight per build UUID.
///
/// Build one at startup and share it by reference. Tasks are kept for the
/// lifetime of the downloader so their last result stays observable; a
/// finished, failed or canceled task is replaced by the next request for the
/// same UUID.
#[derive(Debug)]
pub struct DsymDownloader {
    config: FetchConfig,
    runtime: Handle,
    tasks: Mutex<HashMap<String, Arc<DownloadTask>>>,
}

impl DsymDownloader {
    /// Creates a downloader that runs tasks on the current tokio runtime.
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let runtime = Handle::try_current().map_err(|_| FetchError::NoRuntime)?;
        Ok(Self::with_runtime(config, runtime))
    }

    /// Creates a downloader that runs tasks on `runtime`.
    ///
    /// Installs the default fetch script if none is present and creates the
    /// download directory. Failures are logged; requests are refused later
    /// while the script stays unusable.
    pub fn with_runtime(config: FetchConfig, runtime: Handle) -> Self {
        if let Err(err) = prepare_download_script(&config.script_path) {
            warn!(
                path = %config.script_path.display(),
                error = %err,
                "could not prepare fetch script"
            );
        }
        if let Err(err) = config.prepare_download_dir() {
            warn!(
                path = %config.download_dir.display(),
                error = %err,
                "could not create dSYM download directory"
            );
        }

        Self {
            config,
            runtime,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Whether the fetch script is present, non-empty and executable.
    pub fn can_download(&self) -> bool {
        can_download(&self.config.script_path)
    }

    /// Returns the fetch for `crash`, starting a new one if needed.
    ///
    /// A waiting or running task for the same UUID is returned as is.
    /// Otherwise a new task replaces any previous one and is dispatched to
    /// the runtime. Returns `None` when the report has no UUID or the fetch
    /// script is unusable.
    pub fn request(
        &self,
        crash: Arc<CrashReport>,
        file_path: Option<PathBuf>,
    ) -> Option<Arc<DownloadTask>> {
        let Some(uuid) = crash.uuid.clone() else {
            debug!("crash report has no UUID; nothing to fetch");
            return None;
        };
        if !self.can_download() {
            warn!(
                path = %self.config.script_path.display(),
                "{}",
                FetchError::ScriptUnavailable(self.config.script_path.clone())
            );
            return None;
        }

        let task = {
            let mut tasks = lock(&self.tasks);
            if let Some(task) = tasks.get(&uuid) {
                if !task.status().should_retry() {
                    debug!(uuid = %uuid, "fetch already in flight");
                    return Some(task.clone());
                }
            }

            let task = Arc::new(DownloadTask::new(
                crash,
                &self.config.script_path,
                &self.config.download_dir,
                file_path,
            ));
            tasks.insert(uuid.clone(), task.clone());
            task
        };

        let worker = task.clone();
        self.runtime.spawn(async move {
            worker.run().await;
        });
        info!(uuid = %uuid, "dSYM fetch dispatched");

        Some(task)
    }

    /// The latest task for `uuid`, whatever its state.
    pub fn task(&self, uuid: &str) -> Option<Arc<DownloadTask>> {
        lock(&self.tasks).get(uuid).cloned()
    }

    /// Snapshot of every known task.
    pub fn tasks(&self) -> HashMap<String, Arc<DownloadTask>> {
        lock(&self.tasks).clone()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::dsym::{FetchStatus, DEFAULT_SCRIPT};

    const APP_UUID: &str = "4C4C44E5-555A-3C5B-A1A6-F1C2F9B0C4D1";

    fn config(dir: &TempDir) -> FetchConfig {
        FetchConfig {
            script_path: dir.path().join("support").join("download.sh"),
            download_dir: dir.path().join("dsyms"),
        }
    }

    fn downloader_with_script(dir: &TempDir, body: &str) -> DsymDownloader {
        let config = config(dir);
        fs::create_dir_all(config.script_path.parent().unwrap()).unwrap();
        fs::write(&config.script_path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        DsymDownloader::new(config).unwrap()
    }

    fn crash() -> Arc<CrashReport> {
        Arc::new(CrashReport {
            uuid: Some(APP_UUID.to_string()),
            app_name: Some("MyApp".to_string()),
            content: "crash".to_string(),
            ..Default::default()
        })
    }

    async fn settle(task: &DownloadTask) -> FetchStatus {
        tokio::time::timeout(Duration::from_secs(10), task.settled())
            .await
            .expect("task did not finish")
    }

    #[tokio::test]
    async fn test_installs_default_script_on_startup() {
        let dir = TempDir::new().unwrap();
        let downloader = DsymDownloader::new(config(&dir)).unwrap();

        let config = downloader.config();
        assert_eq!(
            fs::read_to_string(&config.script_path).unwrap(),
            DEFAULT_SCRIPT
        );
        assert!(config.download_dir.is_dir());
        assert!(downloader.can_download());
    }

    #[tokio::test]
    async fn test_in_flight_request_is_deduplicated() {
        let dir = TempDir::new().unwrap();
        let counter = dir.path().join("spawns");
        let downloader = downloader_with_script(
            &dir,
            &format!("echo run >> {}\nexec sleep 30", counter.display()),
        );

        let first = downloader.request(crash(), None).unwrap();
        first
            .subscribe_status()
            .wait_for(|status| *status == FetchStatus::Running)
            .await
            .unwrap();

        let second = downloader.request(crash(), None).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(downloader.tasks().len(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fs::read_to_string(&counter).unwrap().lines().count(), 1);

        first.cancel();
    }

    #[tokio::test]
    async fn test_waiting_task_is_reused() {
        let dir = TempDir::new().unwrap();
        let downloader = downloader_with_script(&dir, "exec sleep 30");

        // Nothing has been polled yet, so the first task is still waiting.
        let first = downloader.request(crash(), None).unwrap();
        assert_eq!(first.status(), FetchStatus::Waiting);
        let second = downloader.request(crash(), None).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        first.cancel();
    }

    #[tokio::test]
    async fn test_finished_task_is_replaced() {
        let dir = TempDir::new().unwrap();
        let downloader = downloader_with_script(
            &dir,
            r#"echo "UUID: $UUID (arm64) $2/MyApp.app.dSYM/Contents/Resources/DWARF/MyApp""#,
        );

        let first = downloader.request(crash(), None).unwrap();
        assert_eq!(settle(&first).await, FetchStatus::Success);
        assert_eq!(first.dsym_files().unwrap().len(), 1);

        let second = downloader.request(crash(), None).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&downloader.task(APP_UUID).unwrap(), &second));
        assert_eq!(settle(&second).await, FetchStatus::Success);
        assert_eq!(downloader.tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_and_canceled_tasks_are_replaced() {
        let dir = TempDir::new().unwrap();
        let downloader = downloader_with_script(&dir, "printf 'disk full'\nexit 2");

        let failed = downloader.request(crash(), None).unwrap();
        assert_eq!(
            settle(&failed).await,
            FetchStatus::Failed {
                code: 2,
                message: Some("disk full".to_string())
            }
        );

        let canceled = downloader.request(crash(), None).unwrap();
        assert!(!Arc::ptr_eq(&failed, &canceled));
        canceled.cancel();
        assert_eq!(canceled.status(), FetchStatus::Canceled);

        let retried = downloader.request(crash(), None).unwrap();
        assert!(!Arc::ptr_eq(&canceled, &retried));
        settle(&retried).await;
    }

    #[tokio::test]
    async fn test_report_without_uuid_is_refused() {
        let dir = TempDir::new().unwrap();
        let downloader = downloader_with_script(&dir, "exit 0");

        let crash = Arc::new(CrashReport::default());
        assert!(downloader.request(crash, None).is_none());
        assert!(downloader.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_unusable_script_is_refused() {
        let dir = TempDir::new().unwrap();
        let downloader = DsymDownloader::new(config(&dir)).unwrap();
        fs::write(&downloader.config().script_path, "").unwrap();

        assert!(!downloader.can_download());
        assert!(downloader.request(crash(), None).is_none());
        assert!(downloader.task(APP_UUID).is_none());
    }

    #[test]
    fn test_new_requires_runtime() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            DsymDownloader::new(config(&dir)),
            Err(FetchError::NoRuntime)
        ));
    }
}
