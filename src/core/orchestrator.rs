use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::core::device::DeviceService;
use crate::core::image::ImageService;
use crate::core::models::{ImageInfo, MIN_DRIVE_SIZE, RemovableDrive};
use crate::core::progress::{CreationProgress, CreationStage, ProgressTracker};
use crate::core::split::SplitService;
use crate::core::transfer::TransferService;
use crate::error::{Error, Result};

/// Settings a run reads from the configuration.
#[derive(Debug, Clone)]
pub struct CreationOptions {
    pub volume_label: String,
    pub split_size_mb: u32,
    pub format_settle: Duration,
    pub temp_root: PathBuf,
}

impl From<&AppConfig> for CreationOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            volume_label: config.volume_label.clone(),
            split_size_mb: config.split_size_mb,
            format_settle: config.format_settle(),
            temp_root: config.temp_root(),
        }
    }
}

#[derive(Debug, Default)]
struct Selection {
    image: Option<ImageInfo>,
    drive: Option<RemovableDrive>,
}

/// Drives a creation run through its stages, one run at a time.
///
/// Share it behind an `Arc`: `start` runs on one task while `cancel` and the progress
/// accessors are called from others.
pub struct Orchestrator {
    devices: Arc<DeviceService>,
    images: Arc<ImageService>,
    splitter: Arc<SplitService>,
    transfers: Arc<TransferService>,
    options: CreationOptions,
    progress: ProgressTracker,
    selection: Mutex<Selection>,
    /// Some while a run is in flight
    active: Mutex<Option<CancellationToken>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Clears the single-flight slot when the run ends, however it ends.
struct ActiveRun<'a>(&'a Mutex<Option<CancellationToken>>);

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        lock(self.0).take();
    }
}

impl Orchestrator {
    pub fn new(
        devices: Arc<DeviceService>,
        images: Arc<ImageService>,
        splitter: Arc<SplitService>,
        transfers: Arc<TransferService>,
        options: CreationOptions,
    ) -> Self {
        Self {
            devices,
            images,
            splitter,
            transfers,
            options,
            progress: ProgressTracker::new(),
            selection: Mutex::new(Selection::default()),
            active: Mutex::new(None),
        }
    }

    pub fn progress(&self) -> CreationProgress {
        self.progress.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<CreationProgress> {
        self.progress.subscribe()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.active).is_some()
    }

    pub fn selected_image(&self) -> Option<ImageInfo> {
        lock(&self.selection).image.clone()
    }

    pub fn selected_drive(&self) -> Option<RemovableDrive> {
        lock(&self.selection).drive.clone()
    }

    /// Validate and remember the source image.
    pub async fn select_image(&self, path: &Path) -> Result<ImageInfo> {
        let image = self.images.validate(path).await?;
        lock(&self.selection).image = Some(image.clone());
        info!(image = %image.name, size = %image.size_formatted(), "Image selected");
        Ok(image)
    }

    /// Remember the target drive. Drives too small for Windows are refused.
    pub fn select_drive(&self, drive: RemovableDrive) -> Result<()> {
        if !drive.is_valid_for_windows() {
            return Err(Error::DriveTooSmall {
                device: drive.device_node,
                size: drive.size,
                minimum: MIN_DRIVE_SIZE,
            });
        }
        info!(drive = %drive.display_name(), device = %drive.device_node, "Drive selected");
        lock(&self.selection).drive = Some(drive);
        Ok(())
    }

    /// Enumerate drives again. The selected drive is replaced by its fresh entry, or
    /// cleared if it is gone.
    pub async fn refresh_drives(&self) -> Result<Vec<RemovableDrive>> {
        let drives = self.devices.list().await?;

        let mut selection = lock(&self.selection);
        if let Some(selected) = selection.drive.take() {
            match drives.iter().find(|d| d.device_node == selected.device_node) {
                Some(fresh) => selection.drive = Some(fresh.clone()),
                None => warn!(device = %selected.device_node, "Selected drive disappeared"),
            }
        }

        Ok(drives)
    }

    /// Run the whole pipeline for the current selection.
    ///
    /// Fails with [`Error::AlreadyRunning`] if a run is in flight. On any failure the
    /// image is unmounted and the scratch directory removed before returning; a
    /// cancelled run returns [`Error::Cancelled`].
    pub async fn start(&self) -> Result<()> {
        let (image, drive) = {
            let selection = lock(&self.selection);
            match (&selection.image, &selection.drive) {
                (Some(image), Some(drive)) => (image.clone(), drive.clone()),
                _ => {
                    return Err(Error::MissingSelection(
                        "Please select both an ISO and a USB drive".to_string(),
                    ));
                }
            }
        };

        let token = {
            let mut active = lock(&self.active);
            if active.is_some() {
                return Err(Error::AlreadyRunning);
            }
            let token = CancellationToken::new();
            *active = Some(token.clone());
            token
        };
        let _active = ActiveRun(&self.active);

        self.progress.reset();

        let span = info_span!(
            "creation",
            image = %image.path.display(),
            device = %drive.device_node
        );

        async {
            info!("Starting creation run");
            let mut scratch = None;
            let outcome = match self.run(&image.path, &drive, &token, &mut scratch).await {
                // Cancelled after the last checkpoint: the progress already reports failure.
                Ok(()) if token.is_cancelled() => Err(Error::Cancelled),
                outcome => outcome,
            };

            match outcome {
                Ok(()) => {
                    self.progress.update(|p| p.complete());
                    info!("Creation run complete");
                    Ok(())
                }
                Err(e) => {
                    if let Err(unmount) = self.images.unmount(&image.path).await {
                        warn!(error = %unmount, "Failed to unmount image during cleanup");
                    }
                    if let Some(dir) = scratch.take() {
                        ScratchDir::remove(dir).await;
                    }

                    let e = if token.is_cancelled() { Error::Cancelled } else { e };
                    error!(error = %e, "Creation run failed");
                    self.progress.fail(e.to_string());
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        image_path: &Path,
        drive: &RemovableDrive,
        token: &CancellationToken,
        scratch: &mut Option<ScratchDir>,
    ) -> Result<()> {
        self.progress.enter_stage(CreationStage::Formatting);
        self.devices
            .format(&drive.device_node, &self.options.volume_label)
            .await?;

        // The new volume needs a moment to appear.
        tokio::select! {
            _ = tokio::time::sleep(self.options.format_settle) => {}
            _ = token.cancelled() => {}
        }
        ensure_active(token)?;

        self.progress.enter_stage(CreationStage::MountingImage);
        let image = self.images.mount(image_path).await?;
        let image_root = image
            .mount_point
            .clone()
            .ok_or_else(|| Error::ImageMountFailed("Could not determine mount point".to_string()))?;
        ensure_active(token)?;

        let partition = self.devices.first_partition_of(&drive.device_node).await?;
        let usb_root = self
            .devices
            .mount_point_of(&partition)
            .await?
            .ok_or(Error::UsbNotMounted)?;
        debug!(partition = %partition, usb = %usb_root.display(), "Target volume resolved");

        self.progress.enter_stage(CreationStage::CopyingBootFiles);
        let split = image.needs_wim_split();
        self.transfers
            .copy_tree(&image_root, &usb_root, split, token, &mut |done, total, file: &str| {
                self.progress.update(|p| p.update_transfer(done, total, file))
            })
            .await?;

        if split {
            ensure_active(token)?;
            let payload = image
                .payload_path
                .clone()
                .ok_or_else(|| Error::SourceNotFound(image_root.join("sources/install.wim")))?;

            self.progress.enter_stage(CreationStage::SplittingPayload);
            let dir = scratch.insert(ScratchDir::create(&self.options.temp_root).await?);
            let split_dir = dir.path().to_path_buf();

            self.splitter
                .split(&payload, &split_dir, self.options.split_size_mb, &mut |fraction, status: &str| {
                    self.progress.update(|p| {
                        p.set_stage_progress(fraction);
                        p.set_status(status);
                    })
                })
                .await?;
            ensure_active(token)?;

            self.progress.enter_stage(CreationStage::CopyingPayload);
            self.transfers
                .copy_chunks(&split_dir, &usb_root, token, &mut |done, total, file: &str| {
                    self.progress.update(|p| p.update_transfer(done, total, file))
                })
                .await?;

            if let Some(dir) = scratch.take() {
                ScratchDir::remove(dir).await;
            }
        }
        ensure_active(token)?;

        self.progress.enter_stage(CreationStage::Finalizing);
        self.images.unmount(image_path).await?;

        Ok(())
    }

    /// Request cancellation of the run in flight. Returns false if nothing is running.
    ///
    /// The progress fails right away; `start` returns once the current tool invocation
    /// has finished and cleanup is done.
    pub fn cancel(&self) -> bool {
        let active = lock(&self.active);
        let Some(token) = active.as_ref() else {
            return false;
        };
        info!("Cancelling creation run");
        token.cancel();
        self.progress.fail(Error::Cancelled.to_string());
        true
    }

    /// Forget the selection and progress. Refused while a run is in flight.
    pub fn reset(&self) -> Result<()> {
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }
        *lock(&self.selection) = Selection::default();
        self.progress.reset();
        Ok(())
    }

    /// Eject the selected drive.
    pub async fn eject(&self) -> Result<()> {
        let drive = self
            .selected_drive()
            .ok_or_else(|| Error::MissingSelection("No USB drive selected".to_string()))?;
        self.devices.eject(&drive.device_node).await
    }
}

fn ensure_active(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Private directory for split parts. Removed explicitly, or on drop as a fallback.
struct ScratchDir {
    path: PathBuf,
    removed: bool,
}

impl ScratchDir {
    async fn create(root: &Path) -> Result<Self> {
        let path = root.join(format!("winboot_{}", Uuid::now_v7()));
        tokio::fs::create_dir_all(&path).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700)).await?;
        }

        debug!(path = %path.display(), "Created scratch directory");
        Ok(Self {
            path,
            removed: false,
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn remove(mut self) {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "Removed scratch directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove scratch directory"),
        }
        self.removed = true;
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if !self.removed {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}
