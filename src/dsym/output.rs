//! Discovery of dSYM bundles in the fetch script's standard output.
//!
//! The script reports what it produced in `dwarfdump --uuid` form:
//!
//! ```text
//! UUID: 4C4C44E5-555A-3C5B-A1A6-F1C2F9B0C4D1 (arm64) /tmp/dsyms/MyApp.app.dSYM/Contents/Resources/DWARF/MyApp
//! ```
//!
//! Lines naming UUIDs the crash report does not reference are dropped, so
//! unrelated bundles mentioned by the tool never reach the caller.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::crash::{normalize_uuid, CrashReport};

/// Path component suffix that marks a symbol bundle directory.
pub const DSYM_SUFFIX: &str = ".dSYM";

static DWARFDUMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*UUID:?\s+([0-9A-Fa-f-]+)\s+\([^)]*\)\s+(.+?)\s*$").unwrap()
});

/// A symbol bundle produced by the fetch script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DsymFile {
    /// Bundle directory name, e.g. `MyApp.app.dSYM`; empty when the path has none.
    pub name: String,
    pub path: String,
    pub binary_path: String,
    pub uuids: Vec<String>,
    /// The bundle covers the crashed application binary itself.
    pub is_app: bool,
}

/// Extracts the dSYM bundles relevant to `crash` from the script output.
pub fn parse_dsym_output(output: &str, crash: &CrashReport) -> Vec<DsymFile> {
    let targets: HashSet<String> = crash.target_uuids().into_iter().collect();
    let app_uuid = crash.uuid.as_deref().map(normalize_uuid);

    DWARFDUMP_RE
        .captures_iter(output)
        .filter_map(|caps| {
            let uuid = normalize_uuid(&caps[1]);
            if !targets.contains(&uuid) {
                return None;
            }
            let path = caps[2].to_string();
            Some(DsymFile {
                name: bundle_name(&path).to_string(),
                binary_path: path.clone(),
                path,
                is_app: app_uuid.as_deref() == Some(uuid.as_str()),
                uuids: vec![uuid],
            })
        })
        .collect()
}

fn bundle_name(path: &str) -> &str {
    path.split('/')
        .find(|component| component.ends_with(DSYM_SUFFIX))
        .unwrap_or_default()
}
