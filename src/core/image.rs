use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::models::ImageInfo;
use crate::core::runner::{CommandRunner, CommandSpec};
use crate::error::{Error, Result};
use crate::parsers::hdiutil;

const IMAGE_EXTENSION: &str = "iso";

/// Candidate payload files, in order of preference, relative to the image root.
pub const PAYLOAD_CANDIDATES: [&str; 2] = ["sources/install.wim", "sources/install.esd"];

/// Present on install media even when the payload is absent.
const BOOT_PAYLOAD: &str = "sources/boot.wim";

/// Attaches installation images and remembers where each one is mounted.
pub struct ImageService {
    runner: Arc<dyn CommandRunner>,
    hdiutil: String,
    volumes_root: PathBuf,
    /// image path -> mount point
    mounts: Mutex<HashMap<PathBuf, PathBuf>>,
}

impl ImageService {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        hdiutil: impl Into<String>,
        volumes_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            hdiutil: hdiutil.into(),
            volumes_root: volumes_root.into(),
            mounts: Mutex::new(HashMap::new()),
        }
    }

    /// Check that `path` is an existing `.iso` and read its size. Does not mount.
    pub async fn validate(&self, path: &Path) -> Result<ImageInfo> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(Error::NotFound(path.to_path_buf()));
        }

        let is_iso = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(IMAGE_EXTENSION));
        if !is_iso {
            return Err(Error::InvalidFormat(format!(
                "{} is not an .iso file",
                path.display()
            )));
        }

        let size = tokio::fs::metadata(path).await?.len();
        Ok(ImageInfo {
            path: path.to_path_buf(),
            name: display_name(path),
            size,
            mount_point: None,
            has_install_payload: false,
            payload_size: 0,
            payload_path: None,
        })
    }

    /// Attach `path` read-only and inspect it. Mounting an already mounted image returns
    /// the cached mount without attaching again.
    pub async fn mount(&self, path: &Path) -> Result<ImageInfo> {
        let image = self.validate(path).await?;
        let mut mounts = self.mounts.lock().await;

        if let Some(mount_point) = mounts.get(path) {
            debug!(image = %path.display(), mount = %mount_point.display(), "Image already mounted");
            return inspect(image, mount_point.clone()).await;
        }

        let command = CommandSpec::new(&self.hdiutil)
            .arg("attach")
            .arg(path.to_string_lossy())
            .args(["-readonly", "-nobrowse"]);
        let result = self.runner.run(&command).await?;

        if !result.succeeded() {
            return Err(Error::ImageMountFailed(result.stderr));
        }

        let root = self.volumes_root.to_string_lossy();
        let mount_point = hdiutil::parse_attach_mount_point(&result.stdout, &root)
            .map(PathBuf::from)
            .ok_or_else(|| Error::ImageMountFailed("Could not determine mount point".to_string()))?;

        info!(image = %path.display(), mount = %mount_point.display(), "Image mounted");
        mounts.insert(path.to_path_buf(), mount_point.clone());
        drop(mounts);

        inspect(image, mount_point).await
    }

    /// Detach `path` if it is mounted. A failed detach keeps the entry so it can be retried.
    pub async fn unmount(&self, path: &Path) -> Result<()> {
        let mut mounts = self.mounts.lock().await;
        let Some(mount_point) = mounts.get(path).cloned() else {
            return Ok(());
        };

        let command = CommandSpec::new(&self.hdiutil)
            .arg("detach")
            .arg(mount_point.to_string_lossy())
            .arg("-force");
        let result = self.runner.run(&command).await?;

        if result.succeeded() || hdiutil::is_detach_acknowledged(&result.stdout) {
            mounts.remove(path);
            info!(image = %path.display(), "Image unmounted");
            Ok(())
        } else {
            Err(Error::ImageUnmountFailed(result.stderr))
        }
    }

    /// Best-effort detach of every tracked image.
    pub async fn unmount_all(&self) {
        let paths: Vec<PathBuf> = self.mounts.lock().await.keys().cloned().collect();
        for path in paths {
            if let Err(e) = self.unmount(&path).await {
                warn!(image = %path.display(), error = %e, "Failed to unmount image");
            }
        }
    }

    pub async fn mount_point(&self, path: &Path) -> Option<PathBuf> {
        self.mounts.lock().await.get(path).cloned()
    }

    pub async fn is_mounted(&self, path: &Path) -> bool {
        self.mounts.lock().await.contains_key(path)
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Fill in the payload fields from the mounted tree.
async fn inspect(mut image: ImageInfo, mount_point: PathBuf) -> Result<ImageInfo> {
    for candidate in PAYLOAD_CANDIDATES {
        let payload = mount_point.join(candidate);
        if let Ok(meta) = tokio::fs::metadata(&payload).await {
            image.has_install_payload = true;
            image.payload_size = meta.len();
            image.payload_path = Some(payload);
            break;
        }
    }

    if !image.has_install_payload
        && !tokio::fs::try_exists(mount_point.join(BOOT_PAYLOAD))
            .await
            .unwrap_or(false)
    {
        return Err(Error::NotAValidImage);
    }

    image.mount_point = Some(mount_point);
    Ok(image)
}
