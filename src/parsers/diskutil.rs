//! Parsers for `diskutil` output.
//!
//! `diskutil list -plist` is scanned line by line rather than through a full XML parser:
//! the tool always emits one element per line, and only a handful of scalar keys matter.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::models::RemovableDrive;
use crate::error::{Error, Result};

static BYTE_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((\d+) Bytes\)").expect("byte count regex"));

static WHOLE_DISK_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^r?disk\d+$").expect("whole disk regex"));

const UNTITLED: &str = "Untitled";

/// `disk4` -> `/dev/disk4`; already-qualified paths pass through.
pub fn device_path(device: &str) -> String {
    if device.starts_with("/dev/") {
        device.to_string()
    } else {
        format!("/dev/{}", device)
    }
}

/// `/dev/disk4` -> `disk4`.
pub fn disk_identifier(device: &str) -> &str {
    device.strip_prefix("/dev/").unwrap_or(device)
}

/// Whole disks have no `sN` partition suffix.
pub fn is_whole_disk_name(device: &str) -> bool {
    WHOLE_DISK_NAME.is_match(disk_identifier(device))
}

/// Parse `diskutil list -plist external` into one drive per whole-disk entry.
///
/// Entries without a `DeviceIdentifier` or `Size` are skipped. The name falls back from
/// `VolumeName` to `Content` to "Untitled". Every drive is marked external and removable
/// because the listing itself is scoped to external disks.
pub fn parse_external_disks(plist: &str) -> Result<Vec<RemovableDrive>> {
    let mut lines = plist.lines().map(str::trim).filter(|l| !l.is_empty());

    if !lines
        .by_ref()
        .any(|l| l == "<key>AllDisksAndPartitions</key>")
    {
        return Err(Error::InvalidFormat(
            "diskutil output has no AllDisksAndPartitions list".to_string(),
        ));
    }

    match lines.next() {
        Some("<array>") => {}
        Some("<array/>") => return Ok(Vec::new()),
        other => {
            return Err(Error::InvalidFormat(format!(
                "expected an array after AllDisksAndPartitions, found {:?}",
                other.unwrap_or("end of input")
            )));
        }
    }

    let mut drives = Vec::new();
    // 1 = inside the disk array, 2 = inside one whole-disk dict, deeper = nested partitions
    let mut depth = 1usize;
    let mut record: HashMap<String, String> = HashMap::new();
    let mut current_key: Option<String> = None;

    for line in lines {
        match line {
            "<dict>" | "<array>" => {
                depth += 1;
                current_key = None;
                if depth == 2 {
                    record.clear();
                }
            }
            "</dict>" | "</array>" => {
                if depth == 2 {
                    if let Some(drive) = drive_from_record(&record) {
                        drives.push(drive);
                    }
                }
                depth -= 1;
                if depth == 0 {
                    return Ok(drives);
                }
            }
            _ if depth == 2 => {
                if let Some(key) = plist_key(line) {
                    current_key = Some(key.to_string());
                } else if let Some(key) = current_key.take() {
                    if let Some(value) = plist_scalar(line) {
                        record.insert(key, value);
                    }
                }
            }
            _ => {}
        }
    }

    Err(Error::InvalidFormat(
        "diskutil output ended inside the disk list".to_string(),
    ))
}

fn drive_from_record(record: &HashMap<String, String>) -> Option<RemovableDrive> {
    let id = record.get("DeviceIdentifier")?;
    let size = record.get("Size")?.parse::<u64>().ok()?;

    let name = ["VolumeName", "Content"]
        .iter()
        .filter_map(|k| record.get(*k))
        .find(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| UNTITLED.to_string());

    Some(RemovableDrive {
        id: id.clone(),
        device_node: device_path(id),
        name,
        size,
        is_external: true,
        is_removable: true,
    })
}

fn plist_key(line: &str) -> Option<&str> {
    line.strip_prefix("<key>")?.strip_suffix("</key>")
}

fn plist_scalar(line: &str) -> Option<String> {
    let value = match line {
        "<true/>" => "true",
        "<false/>" => "false",
        "<string/>" => "",
        _ => line
            .strip_prefix("<string>")
            .and_then(|v| v.strip_suffix("</string>"))
            .or_else(|| {
                line.strip_prefix("<integer>")
                    .and_then(|v| v.strip_suffix("</integer>"))
            })?,
    };
    Some(unescape_xml(value))
}

fn unescape_xml(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// One disk described by the free-text `diskutil info` format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInfo {
    pub device_node: String,
    pub volume_name: String,
    pub size: u64,
    pub is_external: bool,
    pub is_removable: bool,
    pub is_whole_disk: bool,
    pub media_type: String,
}

impl DiskInfo {
    pub fn into_drive(self) -> RemovableDrive {
        RemovableDrive {
            id: disk_identifier(&self.device_node).to_string(),
            device_node: device_path(&self.device_node),
            name: self.volume_name,
            size: self.size,
            is_external: self.is_external,
            is_removable: self.is_removable,
        }
    }
}

/// Parse free-text disk descriptions, keeping external whole disks only.
///
/// A record starts at a line beginning with `/dev/disk` or at a `*****` separator (the
/// `diskutil info -all` layout); the remaining lines are `Key: Value` pairs. Records that
/// name no device through either the header or `Device Node:` are dropped.
pub fn parse_disk_info_text(output: &str) -> Vec<DiskInfo> {
    let mut disks = Vec::new();
    let mut header: Option<String> = None;
    let mut fields: HashMap<String, String> = HashMap::new();

    let mut flush = |header: &mut Option<String>, fields: &mut HashMap<String, String>| {
        let device = header.take().or_else(|| fields.get("Device Node").cloned());
        if let Some(device) = device {
            disks.push(disk_info_from_fields(device, fields));
        }
        fields.clear();
    };

    for line in output.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with("/dev/disk") {
            flush(&mut header, &mut fields);
            header = Some(
                trimmed
                    .split_whitespace()
                    .next()
                    .unwrap_or(trimmed)
                    .trim_end_matches(':')
                    .to_string(),
            );
        } else if !trimmed.is_empty() && trimmed.chars().all(|c| c == '*') {
            flush(&mut header, &mut fields);
        } else if let Some((key, value)) = trimmed.split_once(':') {
            fields.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    flush(&mut header, &mut fields);

    disks
        .into_iter()
        .filter(|d| d.is_external && d.is_whole_disk)
        .collect()
}

fn disk_info_from_fields(device: String, fields: &HashMap<String, String>) -> DiskInfo {
    let field = |key: &str| fields.get(key).map(String::as_str);
    let protocol = field("Protocol");

    let is_external = matches!(protocol, Some("USB") | Some("Thunderbolt"))
        || field("Removable Media") == Some("Removable")
        || field("Location") == Some("External");

    let is_removable =
        field("Removable Media") == Some("Removable") || field("Ejectable") == Some("Yes");

    let is_whole_disk = field("Whole") == Some("Yes") || is_whole_disk_name(&device);

    let size = ["Disk Size", "Total Size"]
        .iter()
        .filter_map(|k| field(k))
        .find_map(|v| {
            BYTE_COUNT
                .captures(v)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<u64>().ok())
        })
        .unwrap_or(0);

    let volume_name = ["Volume Name", "Media Name", "Device / Media Name"]
        .iter()
        .filter_map(|k| field(k))
        .find(|v| !v.is_empty() && !v.starts_with("Not applicable"))
        .unwrap_or(UNTITLED)
        .to_string();

    DiskInfo {
        device_node: device,
        volume_name,
        size,
        is_external,
        is_removable,
        is_whole_disk,
        media_type: protocol.unwrap_or("Unknown").to_string(),
    }
}

/// Value of the `Mount Point:` field in `diskutil info` output, if non-blank.
pub fn parse_mount_point_field(info: &str) -> Option<String> {
    info.lines()
        .filter_map(|line| line.split_once("Mount Point:"))
        .map(|(_, value)| value.trim())
        .next()
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Find `<disk>s1` among the entries of a `diskutil list <disk>` listing.
pub fn find_first_partition(listing: &str, disk: &str) -> Option<String> {
    let target = format!("{}s1", disk_identifier(disk));
    listing
        .lines()
        .flat_map(str::split_whitespace)
        .any(|token| token == target)
        .then(|| device_path(&target))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXTERNAL_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>AllDisks</key>
	<array>
		<string>disk4</string>
		<string>disk4s1</string>
		<string>disk6</string>
	</array>
	<key>AllDisksAndPartitions</key>
	<array>
		<dict>
			<key>Content</key>
			<string>FDisk_partition_scheme</string>
			<key>DeviceIdentifier</key>
			<string>disk4</string>
			<key>OSInternal</key>
			<false/>
			<key>Partitions</key>
			<array>
				<dict>
					<key>Content</key>
					<string>DOS_FAT_32</string>
					<key>DeviceIdentifier</key>
					<string>disk4s1</string>
					<key>MountPoint</key>
					<string>/Volumes/SANDISK</string>
					<key>Size</key>
					<integer>31453470720</integer>
					<key>VolumeName</key>
					<string>SANDISK</string>
				</dict>
			</array>
			<key>Size</key>
			<integer>31457280000</integer>
		</dict>
		<dict>
			<key>DeviceIdentifier</key>
			<string>disk6</string>
			<key>Size</key>
			<integer>8589934592</integer>
			<key>VolumeName</key>
			<string>Tom &amp; Jerry</string>
		</dict>
		<dict>
			<key>DeviceIdentifier</key>
			<string>disk7</string>
		</dict>
	</array>
	<key>VolumesFromDisks</key>
	<array>
		<string>SANDISK</string>
	</array>
</dict>
</plist>
"#;

    #[test]
    fn test_parse_external_disks() {
        let drives = parse_external_disks(EXTERNAL_PLIST).unwrap();
        assert_eq!(drives.len(), 2);

        assert_eq!(drives[0].id, "disk4");
        assert_eq!(drives[0].device_node, "/dev/disk4");
        assert_eq!(drives[0].name, "FDisk_partition_scheme");
        assert_eq!(drives[0].size, 31_457_280_000);
        assert!(drives[0].is_external);
        assert!(drives[0].is_removable);

        assert_eq!(drives[1].id, "disk6");
        assert_eq!(drives[1].name, "Tom & Jerry");
        assert_eq!(drives[1].size, 8_589_934_592);
    }

    #[test]
    fn test_parse_external_disks_is_idempotent() {
        let first = parse_external_disks(EXTERNAL_PLIST).unwrap();
        let second = parse_external_disks(EXTERNAL_PLIST).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_parse_external_disks_untitled_fallback() {
        let plist = r#"<plist version="1.0">
<dict>
	<key>AllDisksAndPartitions</key>
	<array>
		<dict>
			<key>DeviceIdentifier</key>
			<string>disk5</string>
			<key>Size</key>
			<integer>16000000000</integer>
		</dict>
	</array>
</dict>
</plist>"#;
        let drives = parse_external_disks(plist).unwrap();
        assert_eq!(drives.len(), 1);
        assert_eq!(drives[0].name, "Untitled");
    }

    #[test]
    fn test_parse_external_disks_empty_array() {
        let plist = r#"<plist version="1.0">
<dict>
	<key>AllDisks</key>
	<array/>
	<key>AllDisksAndPartitions</key>
	<array/>
	<key>VolumesFromDisks</key>
	<array>
		<string>Macintosh HD</string>
	</array>
</dict>
</plist>"#;
        assert!(parse_external_disks(plist).unwrap().is_empty());
    }

    #[test]
    fn test_parse_external_disks_rejects_garbage() {
        assert!(matches!(
            parse_external_disks("Could not find disk"),
            Err(Error::InvalidFormat(_))
        ));
        assert!(matches!(
            parse_external_disks("<key>AllDisksAndPartitions</key>\n<array>\n<dict>\n"),
            Err(Error::InvalidFormat(_))
        ));
    }

    const INFO_TEXT: &str = "\
/dev/disk0 (internal, physical):
   Device Identifier:         disk0
   Whole:                     Yes
   Protocol:                  Apple Fabric
   Disk Size:                 500.3 GB (500277792768 Bytes) (exactly 977105064 512-Byte-Units)
   Removable Media:           Fixed

/dev/disk4 (external, physical):
   Device Identifier:         disk4
   Whole:                     Yes
   Device / Media Name:       SanDisk Ultra
   Protocol:                  USB
   Disk Size:                 31.5 GB (31457280000 Bytes) (exactly 61440000 512-Byte-Units)
   Removable Media:           Removable
   Ejectable:                 Yes

/dev/disk4s1 (external, physical):
   Device Identifier:         disk4s1
   Whole:                     No
   Volume Name:               SANDISK
   Protocol:                  USB
   Total Size:                31.5 GB (31453470720 Bytes) (exactly 61432560 512-Byte-Units)
   Removable Media:           Removable

/dev/disk5 (external, physical):
   Device Identifier:         disk5
   Media Name:                Thunderbolt SSD
   Protocol:                  Thunderbolt
   Total Size:                1.0 TB (1000204886016 Bytes)
";

    #[test]
    fn test_parse_disk_info_text_keeps_external_whole_disks() {
        let disks = parse_disk_info_text(INFO_TEXT);
        assert_eq!(disks.len(), 2);

        assert_eq!(disks[0].device_node, "/dev/disk4");
        assert_eq!(disks[0].volume_name, "SanDisk Ultra");
        assert_eq!(disks[0].size, 31_457_280_000);
        assert!(disks[0].is_removable);
        assert_eq!(disks[0].media_type, "USB");

        // No "Whole" field: classified by the absence of a partition suffix.
        assert_eq!(disks[1].device_node, "/dev/disk5");
        assert_eq!(disks[1].volume_name, "Thunderbolt SSD");
        assert_eq!(disks[1].size, 1_000_204_886_016);
        assert!(!disks[1].is_removable);
    }

    #[test]
    fn test_disk_info_into_drive() {
        let drive = parse_disk_info_text(INFO_TEXT).remove(0).into_drive();
        assert_eq!(drive.id, "disk4");
        assert_eq!(drive.device_node, "/dev/disk4");
        assert!(drive.is_valid_for_windows());
    }

    #[test]
    fn test_parse_disk_info_all_layout() {
        let text = "\
   Device Identifier:         disk0
   Device Node:               /dev/disk0
   Whole:                     Yes
   Protocol:                  Apple Fabric
**********

   Device Identifier:         disk4
   Device Node:               /dev/disk4
   Whole:                     Yes
   Media Name:                Flash Disk
   Protocol:                  USB
   Disk Size:                 16.0 GB (16008609792 Bytes) (exactly 31266816 512-Byte-Units)
**********

   Device Identifier:         disk4s1
   Device Node:               /dev/disk4s1
   Whole:                     No
   Protocol:                  USB
**********
";
        let disks = parse_disk_info_text(text);
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].device_node, "/dev/disk4");
        assert_eq!(disks[0].volume_name, "Flash Disk");
        assert_eq!(disks[0].size, 16_008_609_792);
    }

    #[test]
    fn test_parse_disk_info_text_unparsable_size_defaults_to_zero() {
        let text = "/dev/disk9\n   Protocol: USB\n   Disk Size: 8 GB\n";
        let disks = parse_disk_info_text(text);
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].size, 0);
        assert_eq!(disks[0].volume_name, "Untitled");
    }

    #[test]
    fn test_parse_mount_point_field() {
        let info = "   Device Node:               /dev/disk4s1\n   Mount Point:               /Volumes/WININSTALL\n";
        assert_eq!(
            parse_mount_point_field(info),
            Some("/Volumes/WININSTALL".to_string())
        );

        let spaced = "   Mount Point:               /Volumes/MY USB\n";
        assert_eq!(
            parse_mount_point_field(spaced),
            Some("/Volumes/MY USB".to_string())
        );

        assert_eq!(parse_mount_point_field("   Mount Point:   \n"), None);
        assert_eq!(parse_mount_point_field("   Mounted: No\n"), None);
    }

    #[test]
    fn test_find_first_partition() {
        let listing = "\
/dev/disk4 (external, physical):
   #:                       TYPE NAME                    SIZE       IDENTIFIER
   0:     FDisk_partition_scheme                        *31.5 GB    disk4
   1:                 DOS_FAT_32 WININSTALL              31.5 GB    disk4s1
";
        assert_eq!(
            find_first_partition(listing, "/dev/disk4"),
            Some("/dev/disk4s1".to_string())
        );
        assert_eq!(find_first_partition(listing, "disk14"), None);
        assert_eq!(find_first_partition("", "disk4"), None);
    }

    #[test]
    fn test_device_helpers() {
        assert_eq!(device_path("disk4"), "/dev/disk4");
        assert_eq!(device_path("/dev/disk4"), "/dev/disk4");
        assert_eq!(disk_identifier("/dev/disk4s1"), "disk4s1");
        assert!(is_whole_disk_name("/dev/disk4"));
        assert!(is_whole_disk_name("rdisk12"));
        assert!(!is_whole_disk_name("disk4s1"));
    }
}
