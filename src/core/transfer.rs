use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::image::PAYLOAD_CANDIDATES;
use crate::core::runner::{CommandRunner, CommandSpec};
use crate::error::{Error, Result};
use crate::logging::LogThrottle;
use crate::parsers::TransferUpdate;
use crate::parsers::rsync;

/// Extension of the parts produced by a WIM split.
pub const CHUNK_EXTENSION: &str = "swm";

/// `(bytes transferred, total bytes, current file)`
pub type TransferProgress<'a> = dyn FnMut(u64, u64, &str) + Send + 'a;

/// Copies the image tree and split payload parts onto the target volume with `rsync`.
pub struct TransferService {
    runner: Arc<dyn CommandRunner>,
    rsync: String,
}

impl TransferService {
    pub fn new(runner: Arc<dyn CommandRunner>, rsync: impl Into<String>) -> Self {
        Self {
            runner,
            rsync: rsync.into(),
        }
    }

    fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.rsync)
    }

    /// Copy the contents of `source` into `destination`, optionally leaving out the
    /// install payload.
    ///
    /// Progress is "latest observed": a fragment naming a file keeps the last byte count.
    /// Once `cancel` fires, further output is ignored and the call ends with
    /// [`Error::Cancelled`] after rsync exits.
    pub async fn copy_tree(
        &self,
        source: &Path,
        destination: &Path,
        exclude_payload: bool,
        cancel: &CancellationToken,
        on_progress: &mut TransferProgress<'_>,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let total = self.total_size(source, exclude_payload).await;
        info!(
            source = %source.display(),
            destination = %destination.display(),
            total_bytes = total,
            exclude_payload,
            "Copying image tree"
        );
        on_progress(0, total, "Starting file copy...");

        let command = self
            .command()
            .args(["-av", "--progress"])
            .args(exclude_args(exclude_payload))
            .arg(with_trailing_slash(source))
            .arg(with_trailing_slash(destination));

        let throttle = LogThrottle::new(std::time::Duration::from_secs(5));
        let mut bytes = 0u64;
        let mut file = String::new();

        let result = self
            .runner
            .run_streaming(&command, &mut |chunk: &str| {
                if cancel.is_cancelled() {
                    return;
                }
                match rsync::parse_transfer_progress(chunk) {
                    Some(TransferUpdate::Bytes(b)) => bytes = b.min(total),
                    Some(TransferUpdate::File(name)) => file = name,
                    None => return,
                }
                if throttle.should_log() {
                    debug!(bytes, total, file = %file, "Copy progress");
                }
                on_progress(bytes, total, &file);
            })
            .await
            .map_err(|e| self.tool_error(e))?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if !result.succeeded() {
            match rsync::fatal_copy_errors(&result.stderr) {
                Some(errors) => return Err(Error::CopyFailed(errors)),
                None => warn!(
                    exit_code = result.exit_code,
                    "rsync reported only permission warnings, continuing"
                ),
            }
        }

        on_progress(total, total, "Copy complete");
        Ok(())
    }

    /// Copy every `*.swm` part in `split_dir` into `<destination>/sources`, in name order.
    ///
    /// Progress covers the whole job: each file's bytes are added to the running total of
    /// the files before it.
    pub async fn copy_chunks(
        &self,
        split_dir: &Path,
        destination: &Path,
        cancel: &CancellationToken,
        on_progress: &mut TransferProgress<'_>,
    ) -> Result<()> {
        let sources_dir = destination.join("sources");
        tokio::fs::create_dir_all(&sources_dir).await?;

        let chunks = list_chunks(split_dir).await?;
        if chunks.is_empty() {
            return Err(Error::NoFilesToCopy);
        }

        let total: u64 = chunks.iter().map(|(_, size)| size).sum();
        info!(parts = chunks.len(), total_bytes = total, "Copying split payload");

        let mut copied = 0u64;
        for (chunk, size) in &chunks {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let name = chunk
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            on_progress(copied, total, &name);

            let command = self
                .command()
                .args(["-av", "--progress"])
                .arg(chunk.to_string_lossy())
                .arg(sources_dir.join(&name).to_string_lossy());

            let baseline = copied;
            let result = self
                .runner
                .run_streaming(&command, &mut |output: &str| {
                    if cancel.is_cancelled() {
                        return;
                    }
                    if let Some(TransferUpdate::Bytes(b)) = rsync::parse_transfer_progress(output) {
                        on_progress(baseline + b.min(*size), total, &name);
                    }
                })
                .await
                .map_err(|e| self.tool_error(e))?;

            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            // Any nonzero exit is fatal for a part, warnings included.
            if !result.succeeded() {
                let reason = rsync::fatal_copy_errors(&result.stderr)
                    .or_else(|| (!result.stderr.is_empty()).then(|| result.stderr.clone()))
                    .unwrap_or_else(|| format!("rsync exited with status {}", result.exit_code));
                return Err(Error::CopyFailed(format!("Failed to copy {}: {}", name, reason)));
            }

            copied += size;
            debug!(part = %name, copied, total, "Part copied");
        }

        on_progress(total, total, "SWM files copied");
        Ok(())
    }

    /// Bytes the copy will move, from a dry run when possible, else by walking the tree.
    pub async fn total_size(&self, source: &Path, exclude_payload: bool) -> u64 {
        let command = self
            .command()
            .args(["-an", "--stats"])
            .args(exclude_args(exclude_payload))
            .arg(with_trailing_slash(source))
            .arg("/dev/null");

        match self.runner.run(&command).await {
            Ok(result) if result.succeeded() => {
                if let Some(size) = rsync::parse_total_file_size(&result.stdout) {
                    return size;
                }
                debug!("rsync stats unparsable, summing file sizes");
            }
            Ok(result) => debug!(stderr = %result.stderr, "rsync dry run failed, summing file sizes"),
            Err(e) => debug!(error = %e, "rsync dry run could not start, summing file sizes"),
        }

        match directory_size(source, exclude_payload).await {
            Ok(size) => size,
            Err(e) => {
                warn!(error = %e, "Failed to size source tree");
                0
            }
        }
    }

    fn tool_error(&self, e: Error) -> Error {
        if e.is_missing_program() {
            Error::ToolMissing(self.rsync.clone())
        } else {
            e
        }
    }
}

fn exclude_args(exclude_payload: bool) -> Vec<String> {
    if !exclude_payload {
        return Vec::new();
    }
    PAYLOAD_CANDIDATES
        .iter()
        .map(|p| format!("--exclude={}", p))
        .collect()
}

/// rsync copies the contents of a directory, not the directory, when it ends in `/`.
fn with_trailing_slash(path: &Path) -> String {
    let s = path.to_string_lossy();
    if s.ends_with('/') {
        s.into_owned()
    } else {
        format!("{}/", s)
    }
}

async fn list_chunks(split_dir: &Path) -> Result<Vec<(PathBuf, u64)>> {
    let mut entries = tokio::fs::read_dir(split_dir).await?;
    let mut chunks = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(CHUNK_EXTENSION) {
            continue;
        }
        let meta = entry.metadata().await?;
        if meta.is_file() {
            chunks.push((path, meta.len()));
        }
    }

    chunks.sort_by(|a, b| a.0.file_name().cmp(&b.0.file_name()));
    Ok(chunks)
}

/// Sum of regular file sizes under `root`. Symlinks are not followed.
pub async fn directory_size(root: &Path, exclude_payload: bool) -> Result<u64> {
    let root = root.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let mut total = 0;
        sum_directory(&root, &root, exclude_payload, &mut total)?;
        Ok(total)
    })
    .await
    .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

fn sum_directory(base: &Path, current: &Path, exclude_payload: bool, total: &mut u64) -> Result<()> {
    for entry in fs::read_dir(current)? {
        let path = entry?.path();

        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if metadata.is_dir() {
            sum_directory(base, &path, exclude_payload, total)?;
        } else if metadata.is_file() {
            let excluded = exclude_payload
                && path
                    .strip_prefix(base)
                    .is_ok_and(|rel| PAYLOAD_CANDIDATES.iter().any(|p| rel == Path::new(p)));
            if !excluded {
                *total += metadata.len();
            }
        }
    }

    Ok(())
}
