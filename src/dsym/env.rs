//! Environment handed to the fetch script.

use std::collections::BTreeMap;

use crate::crash::CrashReport;

pub const APP_NAME: &str = "APP_NAME";
pub const UUID: &str = "UUID";
pub const BUNDLE_ID: &str = "BUNDLE_ID";
pub const APP_VERSION: &str = "APP_VERSION";

/// Maps the identifying fields of a crash report to script environment
/// variables. Missing fields become empty strings.
pub fn crash_env(crash: &CrashReport) -> BTreeMap<String, String> {
    let field = |value: &Option<String>| value.clone().unwrap_or_default();

    let mut env = BTreeMap::new();
    env.insert(APP_NAME.to_string(), field(&crash.app_name));
    env.insert(UUID.to_string(), field(&crash.uuid));
    env.insert(BUNDLE_ID.to_string(), field(&crash.bundle_id));
    env.insert(
        APP_VERSION.to_string(),
        legacy_app_version(crash.app_version.as_deref().unwrap_or_default()),
    );
    env
}

/// Rewrites `1.1.1 (123)` to `123 (1.1.1)`, the order older scripts expect.
///
/// Any other shape is passed through unchanged.
pub fn legacy_app_version(version: &str) -> String {
    let components: Vec<&str> = version.split(' ').collect();
    if let [short_version, build] = components.as_slice() {
        let build = build.replace(['(', ')'], "");
        if short_version.contains('.') && !build.contains('.') {
            return format!("{} ({})", build, short_version);
        }
    }
    version.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crash_with_version(version: &str) -> CrashReport {
        CrashReport {
            uuid: Some("4C4C44E5-555A-3C5B-A1A6-F1C2F9B0C4D1".to_string()),
            app_name: Some("MyApp".to_string()),
            bundle_id: Some("com.example.MyApp".to_string()),
            app_version: Some(version.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_env_swaps_version_and_build() {
        let env = crash_env(&crash_with_version("1.2.3 (45)"));
        assert_eq!(env[APP_VERSION], "45 (1.2.3)");
        assert_eq!(env[APP_NAME], "MyApp");
        assert_eq!(env[UUID], "4C4C44E5-555A-3C5B-A1A6-F1C2F9B0C4D1");
        assert_eq!(env[BUNDLE_ID], "com.example.MyApp");
        assert_eq!(env.len(), 4);
    }

    #[test]
    fn test_already_swapped_version_is_kept() {
        let env = crash_env(&crash_with_version("45 (1.2.3)"));
        assert_eq!(env[APP_VERSION], "45 (1.2.3)");
    }

    #[test]
    fn test_other_version_shapes_pass_through() {
        assert_eq!(legacy_app_version("1.2.3"), "1.2.3");
        assert_eq!(legacy_app_version("1.2.3 (4.5)"), "1.2.3 (4.5)");
        assert_eq!(legacy_app_version("1.2.3  (45)"), "1.2.3  (45)");
        assert_eq!(legacy_app_version(""), "");
    }

    #[test]
    fn test_missing_fields_are_empty() {
        let env = crash_env(&CrashReport::default());
        assert_eq!(env.len(), 4);
        assert!(env.values().all(String::is_empty));
    }
}
