use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::core::models::RemovableDrive;
use crate::core::runner::{CommandRunner, CommandSpec};
use crate::error::{Error, Result};
use crate::parsers::diskutil;

/// Disk enumeration and the destructive disk operations, all through `diskutil`.
pub struct DeviceService {
    runner: Arc<dyn CommandRunner>,
    diskutil: String,
}

impl DeviceService {
    pub fn new(runner: Arc<dyn CommandRunner>, diskutil: impl Into<String>) -> Self {
        Self {
            runner,
            diskutil: diskutil.into(),
        }
    }

    fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.diskutil)
    }

    /// External whole disks currently attached.
    ///
    /// Falls back to the free-text `info -all` listing when the structured listing
    /// cannot be read.
    pub async fn list(&self) -> Result<Vec<RemovableDrive>> {
        let result = self
            .runner
            .run(&self.command().args(["list", "-plist", "external"]))
            .await?;

        if !result.succeeded() {
            if result.stderr.contains("No disks") || result.stdout.is_empty() {
                debug!("No external disks attached");
                return Ok(Vec::new());
            }
            return Err(Error::DiskListFailed(result.stderr));
        }

        match diskutil::parse_external_disks(&result.stdout) {
            Ok(drives) => {
                debug!(count = drives.len(), "Enumerated external disks");
                Ok(drives)
            }
            Err(Error::InvalidFormat(reason)) => {
                warn!(%reason, "Structured disk listing unreadable, falling back to text info");
                self.list_from_text_info().await
            }
            Err(e) => Err(e),
        }
    }

    async fn list_from_text_info(&self) -> Result<Vec<RemovableDrive>> {
        let result = self.runner.run(&self.command().args(["info", "-all"])).await?;
        if !result.succeeded() {
            return Err(Error::DiskListFailed(result.stderr));
        }
        Ok(diskutil::parse_disk_info_text(&result.stdout)
            .into_iter()
            .map(diskutil::DiskInfo::into_drive)
            .collect())
    }

    /// Erase `device` and create a single FAT32 volume on an MBR scheme. Requires privileges.
    pub async fn format(&self, device: &str, volume_label: &str) -> Result<()> {
        let device = diskutil::device_path(device);
        info!(%device, label = volume_label, "Formatting drive as FAT32");

        let command = self
            .command()
            .args(["eraseDisk", "FAT32", volume_label, "MBRFormat"])
            .arg(&device);

        let result = match self.runner.run_privileged(&command).await {
            Ok(result) => result,
            Err(e @ Error::PermissionDenied(_)) => return Err(e),
            Err(e) => return Err(Error::FormatFailed(e.to_string())),
        };

        if !result.succeeded() {
            return Err(Error::FormatFailed(result.stderr));
        }
        Ok(())
    }

    /// Unmount every volume on `device`. A disk that is not mounted is fine.
    pub async fn unmount(&self, device: &str) -> Result<()> {
        let device = diskutil::device_path(device);
        let result = self
            .runner
            .run(&self.command().arg("unmountDisk").arg(&device))
            .await?;

        if !result.succeeded() && !result.stderr.contains("not mounted") {
            return Err(Error::UnmountFailed(result.stderr));
        }
        Ok(())
    }

    /// Where `device` is mounted, if anywhere. Unknown devices read as unmounted.
    pub async fn mount_point_of(&self, device: &str) -> Result<Option<PathBuf>> {
        let result = self.runner.run(&self.command().arg("info").arg(device)).await?;
        if !result.succeeded() {
            debug!(device, stderr = %result.stderr, "diskutil info failed");
            return Ok(None);
        }
        Ok(diskutil::parse_mount_point_field(&result.stdout).map(PathBuf::from))
    }

    /// The first partition of a whole disk, e.g. `/dev/disk4s1`.
    ///
    /// If the listing does not show it the conventional name is assumed.
    pub async fn first_partition_of(&self, disk: &str) -> Result<String> {
        let result = self.runner.run(&self.command().arg("list").arg(disk)).await?;
        if !result.succeeded() {
            return Err(Error::DiskListFailed(result.stderr));
        }

        Ok(diskutil::find_first_partition(&result.stdout, disk)
            .unwrap_or_else(|| format!("{}s1", diskutil::device_path(disk))))
    }

    pub async fn eject(&self, device: &str) -> Result<()> {
        let device = diskutil::device_path(device);
        info!(%device, "Ejecting drive");
        let result = self.runner.run(&self.command().arg("eject").arg(&device)).await?;
        if !result.succeeded() {
            return Err(Error::EjectFailed(result.stderr));
        }
        Ok(())
    }
}
