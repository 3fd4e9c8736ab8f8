//! Installation of the fetch script.
//!
//! A script the user put in place is never overwritten by
//! [`prepare_download_script`]; the bundled default only fills an empty slot.

use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, info};

use super::FetchError;

/// Script installed when the user has not provided one.
pub const DEFAULT_SCRIPT: &str = include_str!("../../scripts/download.sh");

/// Ensures a non-empty, executable script exists at `path`.
pub fn prepare_download_script(path: &Path) -> io::Result<()> {
    if has_content(path) {
        debug!(path = %path.display(), "keeping existing fetch script");
    } else {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, DEFAULT_SCRIPT)?;
        info!(path = %path.display(), "installed default fetch script");
    }
    make_executable(path)
}

/// Installs `source` (or the bundled default) at `path`, replacing whatever
/// is there.
pub fn install_script(path: &Path, source: Option<&Path>) -> Result<(), FetchError> {
    let script = match source {
        Some(source) => fs::read_to_string(source)?,
        None => DEFAULT_SCRIPT.to_string(),
    };
    if script.is_empty() {
        return Err(FetchError::ScriptUnavailable(path.to_path_buf()));
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, script)?;
    make_executable(path)?;
    info!(path = %path.display(), "installed fetch script");
    Ok(())
}

/// Whether the script at `path` can be used for a fetch.
pub fn can_download(path: &Path) -> bool {
    has_content(path) && make_executable(path).is_ok()
}

fn has_content(path: &Path) -> bool {
    fs::read_to_string(path).is_ok_and(|script| !script.is_empty())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    fs::set_permissions(path, permissions)
}

#[cfg(not(unix))]
fn make_executable(path: &Path) -> io::Result<()> {
    fs::metadata(path).map(|_| ())
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tempfile::TempDir;

    use super::*;

    fn mode(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn test_installs_default_when_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("support").join("download.sh");

        prepare_download_script(&path).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), DEFAULT_SCRIPT);
        assert_eq!(mode(&path) & 0o111, 0o111);
        assert!(can_download(&path));
    }

    #[test]
    fn test_keeps_user_script() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("download.sh");
        fs::write(&path, "#!/bin/sh\necho mine\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        prepare_download_script(&path).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "#!/bin/sh\necho mine\n");
        assert_eq!(mode(&path), 0o755);
    }

    #[test]
    fn test_replaces_empty_script() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("download.sh");
        fs::write(&path, "").unwrap();
        assert!(!can_download(&path));

        prepare_download_script(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), DEFAULT_SCRIPT);
    }

    #[test]
    fn test_can_download_missing_script() {
        let dir = TempDir::new().unwrap();
        assert!(!can_download(&dir.path().join("download.sh")));
    }

    #[test]
    fn test_install_user_script_overwrites() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("download.sh");
        let source = dir.path().join("mine.sh");
        fs::write(&path, DEFAULT_SCRIPT).unwrap();
        fs::write(&source, "#!/bin/sh\nexit 0\n").unwrap();

        install_script(&path, Some(&source)).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "#!/bin/sh\nexit 0\n");
        assert!(can_download(&path));

        let empty = dir.path().join("empty.sh");
        fs::write(&empty, "").unwrap();
        assert!(matches!(
            install_script(&path, Some(&empty)),
            Err(FetchError::ScriptUnavailable(_))
        ));
    }
}
