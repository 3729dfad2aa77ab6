#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use winboot::adapters::{Reply, ScriptedRunner};
use winboot::config::AppConfig;
use winboot::context::AppContext;
use winboot::core::RemovableDrive;

pub const GIB: u64 = 1024 * 1024 * 1024;

const EXTERNAL_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
	<key>AllDisksAndPartitions</key>
	<array>
		<dict>
			<key>Content</key>
			<string>FDisk_partition_scheme</string>
			<key>DeviceIdentifier</key>
			<string>disk4</string>
			<key>Partitions</key>
			<array>
				<dict>
					<key>DeviceIdentifier</key>
					<string>disk4s1</string>
					<key>Size</key>
					<integer>16005464064</integer>
				</dict>
			</array>
			<key>Size</key>
			<integer>16008609792</integer>
			<key>VolumeName</key>
			<string>KINGSTON</string>
		</dict>
	</array>
</dict>
</plist>
"#;

/// A fake host: an image file, the tree it "mounts" as, and the target volume.
pub struct Rig {
    pub dir: TempDir,
    pub iso: PathBuf,
    pub image_root: PathBuf,
    pub usb_root: PathBuf,
    pub temp_root: PathBuf,
}

impl Rig {
    /// `payload_size` bytes of sparse `sources/install.wim`.
    pub fn new(payload_size: u64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join("Win11_23H2_English_x64.iso");
        fs::write(&iso, b"not really an iso").unwrap();

        let image_root = dir.path().join("Volumes").join("CCCOMA_X64FRE_EN-US_DV9");
        fs::create_dir_all(image_root.join("sources")).unwrap();
        fs::create_dir_all(image_root.join("boot")).unwrap();
        fs::write(image_root.join("setup.exe"), vec![0u8; 600]).unwrap();
        fs::write(image_root.join("boot").join("bcd"), vec![0u8; 200]).unwrap();
        fs::write(image_root.join("sources").join("boot.wim"), vec![0u8; 200]).unwrap();
        let payload = fs::File::create(image_root.join("sources").join("install.wim")).unwrap();
        payload.set_len(payload_size).unwrap();

        let usb_root = dir.path().join("usb");
        fs::create_dir_all(&usb_root).unwrap();
        let temp_root = dir.path().join("tmp");
        fs::create_dir_all(&temp_root).unwrap();

        Self {
            dir,
            iso,
            image_root,
            usb_root,
            temp_root,
        }
    }

    pub fn config(&self) -> AppConfig {
        AppConfig {
            format_settle_ms: 0,
            temp_root: Some(self.temp_root.clone()),
            volumes_root: self.dir.path().join("Volumes"),
            ..AppConfig::default()
        }
    }

    pub fn drive(&self) -> RemovableDrive {
        RemovableDrive {
            id: "disk4".to_string(),
            device_node: "/dev/disk4".to_string(),
            name: "KINGSTON".to_string(),
            size: 16 * GIB,
            is_external: true,
            is_removable: true,
        }
    }

    /// Handlers behaving like a healthy macOS host.
    pub fn runner(&self) -> ScriptedRunner {
        let usb_root = self.usb_root.clone();
        let image_root = self.image_root.clone();

        ScriptedRunner::new()
            .on("diskutil", move |cmd| match cmd.args[0].as_str() {
                "list" if cmd.args.get(1).map(String::as_str) == Some("-plist") => {
                    Reply::ok(EXTERNAL_PLIST)
                }
                "list" => Reply::ok(
                    "/dev/disk4 (external, physical):\n   0:  FDisk_partition_scheme  *16.0 GB  disk4\n   1:  DOS_FAT_32 WININSTALL  16.0 GB  disk4s1\n",
                ),
                "eraseDisk" => Reply::ok("Started erase on disk4\nFinished erase on disk4"),
                "info" => Reply::ok(format!(
                    "   Device Node:   /dev/disk4s1\n   Mount Point:   {}\n",
                    usb_root.display()
                )),
                _ => Reply::ok(""),
            })
            .on("hdiutil", move |cmd| match cmd.args[0].as_str() {
                "attach" => Reply::ok(format!(
                    "/dev/disk6          \tGUID_partition_scheme\t\n/dev/disk6s1        \tMicrosoft Basic Data\t{}\n",
                    image_root.display()
                )),
                _ => Reply::ok("\"disk6\" ejected."),
            })
            .on("rsync", |cmd| {
                if cmd.args[0] == "-an" {
                    return Reply::ok("Number of files: 4\nTotal file size: 1,000 bytes\n");
                }
                let source = Path::new(&cmd.args[cmd.args.len() - 2]);
                let target = Path::new(&cmd.args[cmd.args.len() - 1]);
                if source.extension().is_some_and(|e| e == "swm") {
                    let size = fs::metadata(source).unwrap().len();
                    fs::copy(source, target).unwrap();
                    return Reply::streamed([format!("  {} 100%  10.00MB/s    0:00:00\r", size)]);
                }
                Reply::streamed([
                    "sending incremental file list\n",
                    "setup.exe\n",
                    "    600 100%   10.00MB/s    0:00:00\n",
                    "boot/bcd\n",
                    "    200 100%   10.00MB/s    0:00:00\n",
                ])
            })
            .on("wimlib-imagex", |cmd| split_reply(cmd))
    }

    pub fn context(&self, runner: &Arc<ScriptedRunner>) -> AppContext {
        AppContext::with_runner(self.config(), runner.clone())
    }

    pub fn scratch_entries(&self) -> usize {
        fs::read_dir(&self.temp_root).unwrap().count()
    }
}

/// Writes two parts next to the requested pattern and reports progress.
pub fn split_reply(cmd: &winboot::core::CommandSpec) -> Reply {
    if cmd.args[0] != "split" {
        return Reply::ok("Image Count:  1\nTotal Bytes:  5368709120\n");
    }
    let pattern = PathBuf::from(&cmd.args[2]);
    let dir = pattern.parent().unwrap();
    fs::write(&pattern, vec![0u8; 300]).unwrap();
    fs::write(dir.join("install2.swm"), vec![0u8; 200]).unwrap();
    Reply::streamed([
        "Splitting WIM: 2000 MiB of 5120 MiB (39%) written, part 1 of 2\r",
        "Splitting WIM: 5120 MiB of 5120 MiB (100%) written, part 2 of 2\n",
    ])
}
