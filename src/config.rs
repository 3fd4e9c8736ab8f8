//! Host configuration: where the fetch script lives and where dSYMs go.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Name of the script file inside the support directory.
pub const SCRIPT_FILE_NAME: &str = "download.sh";

const APP_DIR_NAME: &str = "symfetch";

/// Paths the dSYM pipeline works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    /// Executable run for every fetch.
    pub script_path: PathBuf,
    /// Directory the script downloads dSYMs into.
    pub download_dir: PathBuf,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            script_path: default_script_path(),
            download_dir: resolve_download_dir(None),
        }
    }
}

impl FetchConfig {
    /// Default configuration with the download directory taken from a
    /// user-stored setting, which may start with `~/`.
    pub fn with_stored_download_dir(stored: &str) -> Self {
        Self {
            script_path: default_script_path(),
            download_dir: resolve_download_dir(Some(stored)),
        }
    }

    /// Creates the download directory if it does not exist yet.
    pub fn prepare_download_dir(&self) -> io::Result<()> {
        if !self.download_dir.exists() {
            fs::create_dir_all(&self.download_dir)?;
        }
        Ok(())
    }
}

/// `download.sh` in the per-user application data directory
/// (`~/Library/Application Support/symfetch` on macOS).
fn default_script_path() -> PathBuf {
    script_path_in(dirs::data_dir())
}

fn script_path_in(data_dir: Option<PathBuf>) -> PathBuf {
    data_dir
        .map(|dir| dir.join(APP_DIR_NAME))
        .unwrap_or_else(env::temp_dir)
        .join(SCRIPT_FILE_NAME)
}

/// Resolves the dSYM download directory.
///
/// A stored path wins, with a leading `~/` expanded to the home directory.
/// Without one, the user's download directory is used, then `~/Downloads`,
/// then the system temp directory.
pub fn resolve_download_dir(stored: Option<&str>) -> PathBuf {
    resolve_dir(stored, dirs::home_dir().as_deref(), dirs::download_dir())
}

fn resolve_dir(stored: Option<&str>, home: Option<&Path>, downloads: Option<PathBuf>) -> PathBuf {
    if let Some(stored) = stored.filter(|stored| !stored.is_empty()) {
        return match (stored.strip_prefix("~/"), home) {
            (Some(rest), Some(home)) => home.join(rest),
            _ => PathBuf::from(stored),
        };
    }

    downloads
        .or_else(|| home.map(|home| home.join("Downloads")))
        .unwrap_or_else(env::temp_dir)
}
