//! Parsers for `rsync` output.

use std::sync::LazyLock;

use regex::Regex;

static TOTAL_FILE_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Total file size:\s*([\d,]+)").expect("total file size regex"));

/// What one fragment of `rsync --progress` output revealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferUpdate {
    /// Bytes transferred so far for the file in flight.
    Bytes(u64),
    /// Name of a file rsync started on; no byte count in this fragment.
    File(String),
}

/// Best-effort scan of a streamed fragment, newest line first.
///
/// A line holding `%` yields its leading byte count. Failing that, the first non-empty
/// line without `sending` or `total` is taken as a file name. Status lines that match
/// neither keyword are misread as file names.
pub fn parse_transfer_progress(output: &str) -> Option<TransferUpdate> {
    for line in output.split(['\n', '\r']).rev() {
        let trimmed = line.trim();

        if trimmed.contains('%') {
            let bytes = trimmed
                .split_whitespace()
                .next()
                .and_then(|field| field.replace(',', "").parse::<u64>().ok());
            if let Some(bytes) = bytes {
                return Some(TransferUpdate::Bytes(bytes));
            }
            continue;
        }

        if !trimmed.is_empty() && !trimmed.contains("sending") && !trimmed.contains("total") {
            return Some(TransferUpdate::File(trimmed.to_string()));
        }
    }

    None
}

/// `Total file size:` from `rsync --stats`, commas stripped.
pub fn parse_total_file_size(stats: &str) -> Option<u64> {
    let digits = TOTAL_FILE_SIZE.captures(stats)?.get(1)?.as_str().replace(',', "");
    digits.parse().ok()
}

const BENIGN_PERMISSION_WARNING: &str = "failed to set permissions";
const PARTIAL_TRANSFER_SUMMARY: &str = "some files/attrs were not transferred";

/// The part of rsync's stderr that makes a nonzero exit a real failure.
///
/// FAT32 cannot store POSIX permissions, so rsync warns for every file and then exits
/// with the partial-transfer code. Those lines alone are not an error; `None` means only
/// such lines (or nothing) were printed.
pub fn fatal_copy_errors(stderr: &str) -> Option<String> {
    let remaining: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| !l.contains(BENIGN_PERMISSION_WARNING) && !l.contains(PARTIAL_TRANSFER_SUMMARY))
        .collect();

    (!remaining.is_empty()).then(|| remaining.join("\n"))
}
