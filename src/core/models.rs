use std::path::PathBuf;

use serde::Serialize;

const GIB: u64 = 1024 * 1024 * 1024;

/// Smallest drive that can hold a Windows installation image.
pub const MIN_DRIVE_SIZE: u64 = 8 * GIB;

/// Largest payload copied to FAT32 in one piece; anything above is split.
pub const FAT32_MAX_FILE_SIZE: u64 = 4 * GIB;

/// A removable disk as reported by one enumeration. Never updated in place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RemovableDrive {
    /// Disk identifier, e.g. `disk4`
    pub id: String,
    /// Device node, e.g. `/dev/disk4`
    pub device_node: String,
    pub name: String,
    pub size: u64,
    pub is_external: bool,
    pub is_removable: bool,
}

impl RemovableDrive {
    pub fn size_formatted(&self) -> String {
        format_bytes(self.size)
    }

    pub fn display_name(&self) -> String {
        format!("{} ({})", self.name, self.size_formatted())
    }

    pub fn is_valid_for_windows(&self) -> bool {
        self.size >= MIN_DRIVE_SIZE
    }
}

/// A source installation image, optionally mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub mount_point: Option<PathBuf>,
    /// `sources/install.wim` or `sources/install.esd` exists in the mounted tree
    pub has_install_payload: bool,
    pub payload_size: u64,
    pub payload_path: Option<PathBuf>,
}

impl ImageInfo {
    pub fn size_formatted(&self) -> String {
        format_bytes(self.size)
    }

    pub fn payload_size_formatted(&self) -> String {
        format_bytes(self.payload_size)
    }

    /// The payload does not fit on FAT32 in one piece.
    pub fn needs_wim_split(&self) -> bool {
        self.payload_size > FAT32_MAX_FILE_SIZE
    }
}

/// Metadata reported by `wimlib-imagex info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WimInfo {
    pub path: PathBuf,
    pub image_count: u32,
    pub total_bytes: u64,
}

impl WimInfo {
    pub fn size_formatted(&self) -> String {
        format_bytes(self.total_bytes)
    }
}

/// Decimal units, one fractional digit: `16.0 GB`, `512 bytes`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];

    if bytes < 1000 {
        return format!("{} bytes", bytes);
    }

    let mut value = bytes as f64 / 1000.0;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }

    format!("{:.1} {}", value, UNITS[unit])
}
