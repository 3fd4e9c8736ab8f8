//! Crash report model consumed by the dSYM pipeline.
//!
//! Only the identifying fields of a crash log are modelled here: enough to
//! tell the fetch script which build it is looking for and to decide which
//! discovered symbol bundles belong to the report.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// A binary image listed in the crash log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BinaryImage {
    pub name: String,
    pub arch: Option<String>,
    pub uuid: Option<String>,
    pub path: String,
}

/// A parsed crash report.
///
/// Immutable once built; tasks share it through an `Arc`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CrashReport {
    /// Build UUID of the crashed application binary.
    pub uuid: Option<String>,
    pub app_name: Option<String>,
    pub bundle_id: Option<String>,
    /// Free-form version, e.g. `1.2.3 (45)`.
    pub app_version: Option<String>,
    /// Images that live inside the application bundle, main binary included.
    pub embedded_binaries: Vec<BinaryImage>,
    /// Raw crash log text.
    #[serde(skip)]
    pub content: String,
}

// 0x104a4c000 - 0x104d2bfff MyApp arm64  <4c4c44e5555a3c5ba1a6f1c2f9b0c4d1> /private/var/.../MyApp.app/MyApp
static IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*0x[0-9a-fA-F]+\s+-\s+0x[0-9a-fA-F]+\s+\+?(.+?)\s+(\S+)\s+<([0-9a-fA-F-]{32,36})>\s+(.+?)\s*$",
    )
    .unwrap()
});

impl CrashReport {
    /// Parses the header and `Binary Images:` section of an Apple crash log.
    ///
    /// Unknown or missing fields are left as `None`; parsing never fails.
    pub fn parse(content: &str) -> Self {
        let mut app_name = None;
        let mut bundle_id = None;
        let mut app_version = None;
        let mut images = Vec::new();
        let mut in_images = false;

        for line in content.lines() {
            if in_images {
                if let Some(caps) = IMAGE_RE.captures(line) {
                    images.push(BinaryImage {
                        name: caps[1].trim().to_string(),
                        arch: Some(caps[2].to_string()),
                        uuid: Some(normalize_uuid(&caps[3])),
                        path: caps[4].to_string(),
                    });
                    continue;
                }
                if line.trim().is_empty() && !images.is_empty() {
                    in_images = false;
                }
                continue;
            }

            if line.starts_with("Binary Images:") {
                in_images = true;
            } else if let Some(value) = header_value(line, "Process:") {
                // "MyApp [1234]"
                let name = value.split(" [").next().unwrap_or(value).trim();
                app_name = non_empty(name);
            } else if let Some(value) = header_value(line, "Identifier:") {
                bundle_id = non_empty(value);
            } else if let Some(value) = header_value(line, "Version:") {
                app_version = non_empty(value);
            }
        }

        let uuid = images
            .iter()
            .find(|image| Some(image.name.as_str()) == app_name.as_deref())
            .or_else(|| images.first())
            .and_then(|image| image.uuid.clone());

        let embedded_binaries = images
            .into_iter()
            .filter(|image| image.path.contains(".app/"))
            .collect();

        Self {
            uuid,
            app_name,
            bundle_id,
            app_version,
            embedded_binaries,
            content: content.to_string(),
        }
    }

    /// UUIDs a symbol bundle must cover to be relevant to this report.
    ///
    /// The embedded binaries when the report lists any, otherwise the
    /// primary UUID alone.
    pub fn target_uuids(&self) -> Vec<String> {
        if self.embedded_binaries.is_empty() {
            return self.uuid.iter().map(|uuid| normalize_uuid(uuid)).collect();
        }
        self.embedded_binaries
            .iter()
            .filter_map(|binary| binary.uuid.as_deref())
            .map(normalize_uuid)
            .collect()
    }
}

fn header_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.strip_prefix(key).map(str::trim)
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Normalises a build UUID to upper-case `8-4-4-4-12` form.
///
/// Input without the expected 32 hex digits is only upper-cased.
pub fn normalize_uuid(raw: &str) -> String {
    let hex: String = raw.chars().filter(|c| *c != '-').collect::<String>().to_uppercase();
    if hex.len() != 32 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return raw.trim().to_uppercase();
    }
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const CRASH_LOG: &str = "Incident Identifier: 6F5D2C1A-0000-4000-8000-000000000000
Process:               MyApp [4242]
Path:                  /private/var/containers/Bundle/Application/ABC/MyApp.app/MyApp
Identifier:            com.example.MyApp
Version:               1.2.3 (45)
Code Type:             ARM-64 (Native)

Thread 0 Crashed:
0   MyApp                         0x0000000104a5c1f4 0x104a4c000 + 66036

Binary Images:
0x104a4c000 - 0x104d2bfff MyApp arm64  <4c4c44e5555a3c5ba1a6f1c2f9b0c4d1> /private/var/containers/Bundle/Application/ABC/MyApp.app/MyApp
0x105000000 - 0x10500ffff Kit arm64  <0123456789abcdef0123456789abcdef> /private/var/containers/Bundle/Application/ABC/MyApp.app/Frameworks/Kit.framework/Kit
0x1a0000000 - 0x1a00fffff libsystem_kernel.dylib arm64e  <fedcba9876543210fedcba9876543210> /usr/lib/system/libsystem_kernel.dylib
";

    #[test]
    fn test_parse_header_fields() {
        let report = CrashReport::parse(CRASH_LOG);
        assert_eq!(report.app_name.as_deref(), Some("MyApp"));
        assert_eq!(report.bundle_id.as_deref(), Some("com.example.MyApp"));
        assert_eq!(report.app_version.as_deref(), Some("1.2.3 (45)"));
        assert_eq!(
            report.uuid.as_deref(),
            Some("4C4C44E5-555A-3C5B-A1A6-F1C2F9B0C4D1")
        );
        assert_eq!(report.content, CRASH_LOG);
    }

    #[test]
    fn test_embedded_binaries_stay_inside_app_bundle() {
        let report = CrashReport::parse(CRASH_LOG);
        let names: Vec<_> = report
            .embedded_binaries
            .iter()
            .map(|b| b.name.as_str())
            .collect();
        assert_eq!(names, vec!["MyApp", "Kit"]);
        assert_eq!(
            report.target_uuids(),
            vec![
                "4C4C44E5-555A-3C5B-A1A6-F1C2F9B0C4D1".to_string(),
                "01234567-89AB-CDEF-0123-456789ABCDEF".to_string(),
            ]
        );
    }

    #[test]
    fn test_target_uuids_fall_back_to_primary() {
        let report = CrashReport {
            uuid: Some("aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee".to_string()),
            ..Default::default()
        };
        assert_eq!(
            report.target_uuids(),
            vec!["AAAAAAAA-BBBB-CCCC-DDDD-EEEEEEEEEEEE".to_string()]
        );

        assert!(CrashReport::default().target_uuids().is_empty());
    }

    #[test]
    fn test_parse_garbage() {
        let report = CrashReport::parse("not a crash log");
        assert!(report.uuid.is_none());
        assert!(report.app_name.is_none());
        assert!(report.embedded_binaries.is_empty());
    }

    #[test]
    fn test_normalize_uuid() {
        assert_eq!(
            normalize_uuid("4c4c44e5555a3c5ba1a6f1c2f9b0c4d1"),
            "4C4C44E5-555A-3C5B-A1A6-F1C2F9B0C4D1"
        );
        assert_eq!(
            normalize_uuid("4C4C44E5-555A-3C5B-A1A6-F1C2F9B0C4D1"),
            "4C4C44E5-555A-3C5B-A1A6-F1C2F9B0C4D1"
        );
        assert_eq!(normalize_uuid(" short "), "SHORT");
    }
}
