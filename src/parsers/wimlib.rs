//! Parsers for `wimlib-imagex` output.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::models::WimInfo;

static PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)%").expect("percent regex"));

/// First `NN%` in a chunk of split output, as a fraction in `[0, 1]`.
pub fn parse_split_progress(output: &str) -> Option<f64> {
    let percent: f64 = PERCENT.captures(output)?.get(1)?.as_str().parse().ok()?;
    Some((percent / 100.0).clamp(0.0, 1.0))
}

/// Read `Image Count:` and `Total Bytes:` from `wimlib-imagex info`. Missing or
/// unparsable values read as zero.
pub fn parse_wim_info(output: &str, path: &Path) -> WimInfo {
    let mut image_count = 0;
    let mut total_bytes = 0;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "Image Count" => image_count = value.trim().parse().unwrap_or(0),
            "Total Bytes" => total_bytes = value.trim().parse().unwrap_or(0),
            _ => {}
        }
    }

    WimInfo {
        path: path.to_path_buf(),
        image_count,
        total_bytes,
    }
}
