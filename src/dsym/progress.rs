//! Download progress scraped from curl's progress meter.
//!
//! curl redraws its meter in place with carriage returns, so the diagnostic
//! stream of a running script holds many snapshots glued together:
//!
//! ```text
//!   % Total    % Received % Xferd  Average Speed   Time    Time     Time  Current
//!                                  Dload  Upload   Total   Spent    Left  Speed
//!  10  286M   10 30.2M    0     0   830k      0  0:05:53  0:00:37  0:05:16 1660k
//! ```
//!
//! Parsing is best-effort telemetry. Anything that does not look like a
//! complete meter row leaves the previous snapshot untouched.

use serde::Serialize;

/// Header line of curl's progress meter, used as the search anchor.
pub const CURL_PROGRESS_HEADER: &str =
    "% Total    % Received % Xferd  Average Speed   Time    Time     Time  Current";

const ROW_COLUMNS: usize = 12;
const PERCENTAGE: usize = 0;
const TOTAL_SIZE: usize = 1;
const DOWNLOADED_SIZE: usize = 3;
const TIME_LEFT: usize = 10;
const SPEED: usize = 11;

/// Latest progress snapshot of a fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchProgress {
    /// 0..=100, where 0 means unknown.
    pub percentage: u32,
    pub total_size: String,
    pub downloaded_size: String,
    pub time_left: String,
    pub speed: String,
}

impl Default for FetchProgress {
    fn default() -> Self {
        Self {
            percentage: 0,
            total_size: "0".to_string(),
            downloaded_size: "0".to_string(),
            time_left: "Unknown".to_string(),
            speed: "0".to_string(),
        }
    }
}

impl FetchProgress {
    /// Updates the snapshot from the whole diagnostic output seen so far.
    ///
    /// Returns `true` when a meter row was accepted and the snapshot changed.
    pub fn update_from_console_output(&mut self, output: &str) -> bool {
        let Some(row) = last_meter_row(output) else {
            return false;
        };

        let next = Self {
            percentage: row[PERCENTAGE].parse().unwrap_or(0),
            total_size: row[TOTAL_SIZE].to_string(),
            downloaded_size: row[DOWNLOADED_SIZE].to_string(),
            time_left: row[TIME_LEFT].to_string(),
            speed: row[SPEED].to_string(),
        };

        if *self == next {
            return false;
        }
        *self = next;
        true
    }

    /// Whether the percentage is known.
    pub fn is_determinate(&self) -> bool {
        self.percentage > 0
    }
}

/// Finds the last complete meter row after the header.
///
/// Only the last two carriage-return segments are examined: the final one is
/// often a row curl is still in the middle of writing. A single row after the
/// column headings is enough; text not split off by `\r` never has exactly
/// twelve columns.
fn last_meter_row(output: &str) -> Option<Vec<&str>> {
    let start = output.find(CURL_PROGRESS_HEADER)? + CURL_PROGRESS_HEADER.len();
    let segments: Vec<&str> = output[start..].split('\r').collect();

    let mut tokens = Vec::new();
    for segment in segments.iter().rev().take(2) {
        tokens = segment.split_whitespace().collect();
        if tokens.len() >= ROW_COLUMNS {
            break;
        }
    }

    if tokens.len() != ROW_COLUMNS || !tokens[TIME_LEFT].contains(':') {
        return None;
    }
    Some(tokens)
}
