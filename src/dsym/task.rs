//! A single dSYM fetch: one script run for one crash report.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tempfile::NamedTempFile;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use super::env::crash_env;
use super::output::{parse_dsym_output, DsymFile};
use super::progress::FetchProgress;
use super::{lock, FetchError, SAVE_FAILED_CODE, SPAWN_FAILED_CODE, TERMINATED_CODE};
use crate::crash::CrashReport;

/// Lifecycle of a fetch.
///
/// `Waiting -> Running -> {Success, Failed, Canceled}`. `Canceled` is sticky:
/// a script that finishes after a cancel does not overwrite it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FetchStatus {
    Waiting,
    Running,
    Canceled,
    Failed { code: i32, message: Option<String> },
    Success,
}

impl FetchStatus {
    /// Whether a new fetch may replace this one. False while in flight.
    pub fn should_retry(&self) -> bool {
        !matches!(self, FetchStatus::Waiting | FetchStatus::Running)
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, FetchStatus::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::Waiting => "waiting",
            FetchStatus::Running => "running",
            FetchStatus::Canceled => "canceled",
            FetchStatus::Failed { .. } => "failed",
            FetchStatus::Success => "success",
        }
    }
}

#[derive(Debug, Default)]
struct Outcome {
    status_code: i32,
    message: Option<String>,
    dsym_files: Option<Vec<DsymFile>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// Serializable view of a task at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub uuid: Option<String>,
    pub status: FetchStatus,
    pub progress: FetchProgress,
    pub status_code: i32,
    pub message: Option<String>,
    pub dsym_files: Option<Vec<DsymFile>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Fetches the dSYMs of one crash report by running the fetch script.
///
/// Status and progress are published on `watch` channels; any number of
/// observers can subscribe. The task is driven by [`run`](Self::run) on a
/// worker and may be canceled from anywhere with [`cancel`](Self::cancel).
#[derive(Debug)]
pub struct DownloadTask {
    crash: Arc<CrashReport>,
    script_path: PathBuf,
    dsym_dir: PathBuf,
    file_path: Option<PathBuf>,
    status: watch::Sender<FetchStatus>,
    progress: watch::Sender<FetchProgress>,
    /// Kill switch of the script currently running, if any.
    process: Mutex<Option<Arc<Notify>>>,
    outcome: Mutex<Outcome>,
}

impl DownloadTask {
    /// Creates a waiting task.
    ///
    /// `file_path` is where the crash log is saved for the script; a
    /// temporary file is used when `None`.
    pub fn new(
        crash: Arc<CrashReport>,
        script_path: impl Into<PathBuf>,
        dsym_dir: impl Into<PathBuf>,
        file_path: Option<PathBuf>,
    ) -> Self {
        Self {
            crash,
            script_path: script_path.into(),
            dsym_dir: dsym_dir.into(),
            file_path,
            status: watch::Sender::new(FetchStatus::Waiting),
            progress: watch::Sender::new(FetchProgress::default()),
            process: Mutex::new(None),
            outcome: Mutex::new(Outcome::default()),
        }
    }

    pub fn crash(&self) -> &Arc<CrashReport> {
        &self.crash
    }

    pub fn uuid(&self) -> Option<&str> {
        self.crash.uuid.as_deref()
    }

    pub fn status(&self) -> FetchStatus {
        self.status.borrow().clone()
    }

    pub fn progress(&self) -> FetchProgress {
        self.progress.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<FetchStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<FetchProgress> {
        self.progress.subscribe()
    }

    /// Resolves with the first status that allows a retry.
    ///
    /// Checks the current status before waiting, so a task that settled
    /// before the call resolves immediately.
    pub async fn settled(&self) -> FetchStatus {
        let mut status = self.subscribe_status();
        let settled = match status.wait_for(FetchStatus::should_retry).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        };
        settled
    }

    /// Exit code of the last run, or one of the reserved internal codes.
    pub fn status_code(&self) -> i32 {
        lock(&self.outcome).status_code
    }

    /// Raw script output of the last run.
    pub fn message(&self) -> Option<String> {
        lock(&self.outcome).message.clone()
    }

    /// dSYM bundles found by the last completed run.
    pub fn dsym_files(&self) -> Option<Vec<DsymFile>> {
        lock(&self.outcome).dsym_files.clone()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let outcome = lock(&self.outcome);
        TaskSnapshot {
            uuid: self.crash.uuid.clone(),
            status: self.status(),
            progress: self.progress(),
            status_code: outcome.status_code,
            message: outcome.message.clone(),
            dsym_files: outcome.dsym_files.clone(),
            started_at: outcome.started_at,
            finished_at: outcome.finished_at,
        }
    }

    /// Runs the fetch script to completion.
    ///
    /// Never fails: every problem ends up in the task status. Returns
    /// immediately if the task was canceled before it started.
    pub async fn run(&self) {
        let process = self.attach_process();
        if self.status().is_canceled() {
            debug!(uuid = self.uuid(), "task canceled before start");
            return;
        }

        {
            let mut outcome = lock(&self.outcome);
            *outcome = Outcome {
                started_at: Some(Utc::now()),
                ..Outcome::default()
            };
        }

        let crash_file = match self.save_crash() {
            Ok(file) => file,
            Err(err) => {
                warn!(uuid = self.uuid(), error = %err, "failed to save crash log");
                self.finish(
                    &process,
                    SAVE_FAILED_CODE,
                    Some("Failed to save file".to_string()),
                    None,
                );
                return;
            }
        };

        let mut command = Command::new(&self.script_path);
        command
            .arg(crash_file.path())
            .arg(&self.dsym_dir)
            .envs(crash_env(&self.crash))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The script and everything it starts share one group, killed as a whole.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = FetchError::Spawn {
                    path: self.script_path.clone(),
                    source,
                };
                warn!(uuid = self.uuid(), error = %err, "fetch script did not start");
                self.finish(&process, SPAWN_FAILED_CODE, Some(err.to_string()), None);
                return;
            }
        };
        info!(
            uuid = self.uuid(),
            pid = child.id(),
            script = %self.script_path.display(),
            "fetch script started"
        );

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        self.transition(FetchStatus::Running);

        let (exit, output, ()) = tokio::join!(
            wait_or_kill(&mut child, &process.kill),
            read_output(stdout),
            self.stream_progress(stderr),
        );

        let code = match exit {
            Ok(status) => status.code().unwrap_or(TERMINATED_CODE),
            Err(err) => {
                warn!(uuid = self.uuid(), error = %err, "failed to wait for fetch script");
                TERMINATED_CODE
            }
        };
        info!(uuid = self.uuid(), code, "fetch script exited");

        let files = parse_dsym_output(&output, &self.crash);
        self.finish(&process, code, Some(output), Some(files));
    }

    /// Asks the running script to terminate and marks the task canceled.
    ///
    /// Does not wait for the script to exit.
    pub fn cancel(&self) {
        self.status.send_replace(FetchStatus::Canceled);
        if let Some(kill) = lock(&self.process).as_ref() {
            kill.notify_one();
        }
        info!(uuid = self.uuid(), "fetch canceled");
    }

    /// Publishes `next` unless the task was canceled.
    fn transition(&self, next: FetchStatus) -> bool {
        self.status.send_if_modified(|current| {
            if current.is_canceled() {
                return false;
            }
            *current = next;
            true
        })
    }

    fn finish(
        &self,
        process: &AttachedProcess<'_>,
        code: i32,
        message: Option<String>,
        files: Option<Vec<DsymFile>>,
    ) {
        if !process.is_current() {
            debug!(uuid = self.uuid(), code, "run superseded; result dropped");
            return;
        }

        {
            let mut outcome = lock(&self.outcome);
            outcome.status_code = code;
            outcome.message = message.clone();
            outcome.dsym_files = files;
            outcome.finished_at = Some(Utc::now());
        }

        let next = if code == 0 {
            FetchStatus::Success
        } else {
            FetchStatus::Failed { code, message }
        };
        if !self.transition(next) {
            debug!(uuid = self.uuid(), code, "result arrived after cancel");
        }
    }

    /// Registers a fresh kill switch, terminating any script a previous run
    /// left behind.
    fn attach_process(&self) -> AttachedProcess<'_> {
        let kill = Arc::new(Notify::new());
        if let Some(previous) = lock(&self.process).replace(kill.clone()) {
            debug!(uuid = self.uuid(), "terminating previous fetch script");
            previous.notify_one();
        }
        AttachedProcess {
            slot: &self.process,
            kill,
        }
    }

    fn save_crash(&self) -> Result<CrashFile, FetchError> {
        match &self.file_path {
            Some(path) => {
                std::fs::write(path, &self.crash.content)?;
                Ok(CrashFile::Kept(path.clone()))
            }
            None => {
                let mut file = tempfile::Builder::new()
                    .prefix("symfetch-")
                    .suffix(".crash")
                    .tempfile()?;
                file.write_all(self.crash.content.as_bytes())?;
                file.flush()?;
                Ok(CrashFile::Temp(file))
            }
        }
    }

    /// Re-parses everything the script wrote to stderr on every chunk.
    async fn stream_progress(&self, stderr: Option<ChildStderr>) {
        let Some(mut stderr) = stderr else {
            return;
        };

        let mut console = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    console.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&console);
                    self.progress
                        .send_if_modified(|progress| progress.update_from_console_output(&text));
                }
                Err(err) => {
                    debug!(uuid = self.uuid(), error = %err, "stderr closed");
                    break;
                }
            }
        }
    }
}

/// Clears the task's kill switch when a run ends, whichever way it ends.
struct AttachedProcess<'a> {
    slot: &'a Mutex<Option<Arc<Notify>>>,
    kill: Arc<Notify>,
}

impl AttachedProcess<'_> {
    /// False once a later run has taken over the task.
    fn is_current(&self) -> bool {
        lock(self.slot)
            .as_ref()
            .is_some_and(|kill| Arc::ptr_eq(kill, &self.kill))
    }
}

impl Drop for AttachedProcess<'_> {
    fn drop(&mut self) {
        let mut slot = lock(self.slot);
        if slot.as_ref().is_some_and(|kill| Arc::ptr_eq(kill, &self.kill)) {
            *slot = None;
        }
    }
}

enum CrashFile {
    Kept(PathBuf),
    /// Removed when the run ends.
    Temp(NamedTempFile),
}

impl CrashFile {
    fn path(&self) -> &Path {
        match self {
            CrashFile::Kept(path) => path,
            CrashFile::Temp(file) => file.path(),
        }
    }
}

async fn wait_or_kill(child: &mut Child, kill: &Notify) -> std::io::Result<ExitStatus> {
    tokio::select! {
        status = child.wait() => status,
        () = kill.notified() => {
            kill_process_group(child);
            if let Err(err) = child.start_kill() {
                debug!(error = %err, "fetch script already gone");
            }
            child.wait().await
        }
    }
}

/// Kills whatever the script started, so no descendant keeps its pipes open.
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        debug!(pid, error = %err, "could not kill fetch script group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

async fn read_output(stdout: Option<ChildStdout>) -> String {
    let Some(mut stdout) = stdout else {
        return String::new();
    };
    let mut buf = Vec::new();
    if let Err(err) = stdout.read_to_end(&mut buf).await {
        debug!(error = %err, "stdout closed early");
    }
    String::from_utf8_lossy(&buf).into_owned()
}
